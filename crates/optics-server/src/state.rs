use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use optics_api::PigeonOptics;
use optics_attach::AttachmentHold;
use optics_types::StructuredValue;

/// Shared request state: the node plus the holds for uploaded-but-not-
/// yet-linked attachments.
///
/// An attachment uploaded through `POST /attachments/` has no linkers
/// yet; its hold lives here so GC cannot collect it before a record
/// write references it. The first successful write naming the hash
/// settles (releases) the hold.
#[derive(Clone)]
pub struct AppState {
    pub node: PigeonOptics,
    pending: Arc<Mutex<HashMap<String, AttachmentHold>>>,
}

impl AppState {
    pub fn new(node: PigeonOptics) -> Self {
        Self {
            node,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Park the hold for a fresh upload.
    pub fn park_upload(&self, hold: AttachmentHold) {
        let hex = hold.hash().to_hex();
        debug!(hash = %hex, "attachment upload parked");
        // A re-upload of the same bytes replaces (and thus releases) the
        // previous hold.
        self.pending.lock().insert(hex, hold);
    }

    /// Release parked holds for every attachment the given payloads now
    /// reference; their linkers keep them alive from here on.
    pub fn settle_uploads<'a>(&self, payloads: impl Iterator<Item = &'a StructuredValue>) {
        let mut parked = self.pending.lock();
        if parked.is_empty() {
            return;
        }
        for payload in payloads {
            for url in payload.hash_urls() {
                if let Some(hold) = parked.remove(&url.hash().to_hex()) {
                    let _ = hold.release();
                }
            }
        }
    }

    /// Number of uploads awaiting a linking record write.
    pub fn pending_uploads(&self) -> usize {
        self.pending.lock().len()
    }
}
