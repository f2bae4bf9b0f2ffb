//! The assembled Pigeon Optics node.
//!
//! [`PigeonOptics::open`] takes a data root and the external [`Sandbox`]
//! collaborator and wires every subsystem together: the shared lock
//! manager and hold table, the file store, the attachment store, both
//! dataset collections, the read-path resolver (also installed as the
//! attachment GC's link source), the update bus, the codec registry, and
//! the lens engine.
//!
//! Persisted state layout under the data root:
//!
//! ```text
//! datasets/<user>/<name>/meta.cbor
//! datasets/<user>/<name>/objects/<hh>/<rest>.cbor
//! lenses/<user>/<name>/meta.cbor
//! lenses/<user>/<name>/objects/<hh>/<rest>.cbor
//! attachments/blobs/<hh>/<rest>.data
//! attachments/meta/<hh>/<rest>.cbor
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use optics_attach::{AttachError, AttachmentStore};
use optics_bus::UpdateBus;
use optics_codec::CodecRegistry;
use optics_dataset::{Collection, DatasetError};
use optics_lens::{LensEngine, Sandbox};
use optics_resolve::ReadPath;
use optics_store::{FileStore, HoldTable, LockManager, StoreError};
use optics_types::{Clock, Source, SystemClock};

/// Errors from assembling a node.
#[derive(Debug, thiserror::Error)]
pub enum OpticsError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// One Pigeon Optics node over one data root. Cheap to clone.
#[derive(Clone)]
pub struct PigeonOptics {
    data_root: PathBuf,
    datasets: Collection,
    lenses: Collection,
    attachments: AttachmentStore,
    resolver: ReadPath,
    bus: UpdateBus,
    engine: Arc<LensEngine>,
    codecs: CodecRegistry,
}

impl PigeonOptics {
    /// Open a node with the system clock.
    pub fn open(
        data_root: impl AsRef<Path>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Result<Self, OpticsError> {
        Self::open_with_clock(data_root, sandbox, Arc::new(SystemClock))
    }

    /// Open a node with an explicit clock (tests pin time through this).
    pub fn open_with_clock(
        data_root: impl AsRef<Path>,
        sandbox: Arc<dyn Sandbox>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OpticsError> {
        let data_root = data_root.as_ref().to_path_buf();
        let locks = Arc::new(LockManager::new());
        let holds = HoldTable::new();
        let bus = UpdateBus::default();

        let files = Arc::new(FileStore::open(&data_root, Arc::clone(&locks))?);
        let attachments = AttachmentStore::open(
            data_root.join("attachments"),
            holds.clone(),
            Arc::clone(&locks),
            Arc::clone(&clock),
        )?;
        let datasets = Collection::new(
            Source::Datasets,
            Arc::clone(&files),
            attachments.clone(),
            holds.clone(),
            bus.clone(),
            Arc::clone(&clock),
        )?;
        let lenses = Collection::new(
            Source::Lenses,
            files,
            attachments.clone(),
            holds,
            bus.clone(),
            Arc::clone(&clock),
        )?;

        let resolver = ReadPath::new(datasets.clone(), lenses.clone());
        attachments.set_link_source(Arc::new(resolver.clone()));

        let engine = Arc::new(LensEngine::new(
            lenses.clone(),
            resolver.clone(),
            sandbox,
            clock,
        ));

        info!(data_root = %data_root.display(), "pigeon optics node opened");
        Ok(Self {
            data_root,
            datasets,
            lenses,
            attachments,
            resolver,
            bus,
            engine,
            codecs: CodecRegistry::standard(),
        })
    }

    /// Spawn the lens engine's event loop onto the current tokio runtime.
    pub fn start_engine(&self) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let events = self.bus.subscribe();
        tokio::spawn(engine.run(events))
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn datasets(&self) -> &Collection {
        &self.datasets
    }

    pub fn lenses(&self) -> &Collection {
        &self.lenses
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    pub fn resolver(&self) -> &ReadPath {
        &self.resolver
    }

    pub fn bus(&self) -> &UpdateBus {
        &self.bus
    }

    pub fn engine(&self) -> &Arc<LensEngine> {
        &self.engine
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }
}

impl std::fmt::Debug for PigeonOptics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PigeonOptics")
            .field("data_root", &self.data_root)
            .finish()
    }
}
