use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use optics_bus::{EventStream, PathEvent};
use optics_dataset::{BuildLogEntry, Collection, DatasetMeta, LensSpec, SandboxFault};
use optics_resolve::ReadPath;
use optics_types::{Clock, DatasetPath, Hash, StructuredValue};

use crate::error::{LensError, LensResult};
use crate::sandbox::{DependencyReader, Sandbox};

/// Declaration of a new lens.
#[derive(Clone, Debug, Default)]
pub struct NewLens {
    /// Source code of the map function, handed verbatim to the sandbox.
    pub map_source: String,
    /// Input dataset paths whose changes drive rebuilds.
    pub inputs: Vec<DatasetPath>,
    /// Extra datasets the map function may read.
    pub dependencies: Vec<DatasetPath>,
    /// Lens dataset configuration (memo, ...).
    pub config: BTreeMap<String, StructuredValue>,
}

#[derive(Default)]
struct BuildState {
    running: bool,
    dirty: bool,
}

/// The change-driven derivation engine.
///
/// At most one build per lens runs at a time; events arriving during a
/// build coalesce into a dirty flag and trigger one follow-up run.
/// Events at or below a lens input's `last_processed` version are
/// ignored, giving at-most-once recomputation per input version.
pub struct LensEngine {
    lenses: Collection,
    resolver: ReadPath,
    sandbox: Arc<dyn Sandbox>,
    clock: Arc<dyn Clock>,
    builds: Mutex<HashMap<String, BuildState>>,
}

impl LensEngine {
    pub fn new(
        lenses: Collection,
        resolver: ReadPath,
        sandbox: Arc<dyn Sandbox>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lenses,
            resolver,
            sandbox,
            clock,
            builds: Mutex::new(HashMap::new()),
        }
    }

    /// Create a lens dataset and run its initial build.
    pub fn create(&self, user: &str, name: &str, new: NewLens) -> LensResult<DatasetMeta> {
        let mut spec = LensSpec::new(new.map_source, new.inputs);
        spec.dependencies = new.dependencies;
        self.lenses.create(user, name, new.config, Some(spec))?;
        self.build(user, name)?;
        Ok(self.lenses.read_meta(user, name)?)
    }

    /// Build a lens: re-map every input record whose payload changed
    /// since the last completed build and commit the derived records.
    ///
    /// Concurrent calls for the same lens coalesce: the running build
    /// picks the work up in a follow-up pass.
    pub fn build(&self, user: &str, name: &str) -> LensResult<()> {
        let key = format!("{user}/{name}");
        {
            let mut builds = self.builds.lock();
            let state = builds.entry(key.clone()).or_default();
            if state.running {
                state.dirty = true;
                return Ok(());
            }
            state.running = true;
        }

        loop {
            let result = self.build_once(user, name);
            let mut builds = self.builds.lock();
            let state = builds.get_mut(&key).expect("state inserted above");
            if result.is_ok() && state.dirty {
                state.dirty = false;
                drop(builds);
                continue;
            }
            builds.remove(&key);
            return result;
        }
    }

    fn build_once(&self, user: &str, name: &str) -> LensResult<()> {
        let lens_path = self.lenses.path(user, name);
        let meta = self.lenses.read_meta(user, name)?;
        let spec = meta
            .lens
            .clone()
            .ok_or_else(|| LensError::NotALens(lens_path.to_string()))?;

        let deps = EngineDeps {
            resolver: &self.resolver,
            allowed: &spec.dependencies,
        };

        let mut fingerprints = spec.fingerprints.clone();
        let mut last_processed = spec.last_processed.clone();
        let mut reverse = spec.reverse_index.clone();
        let mut outputs: BTreeMap<String, StructuredValue> = BTreeMap::new();
        let mut log: Vec<BuildLogEntry> = Vec::new();
        let mut changed_anything = false;

        for input in &spec.inputs {
            let input_key = input.to_string();
            let input_meta = match self.resolver.dataset_meta(input) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(lens = %lens_path, input = %input_key, %err, "lens input unreadable");
                    continue;
                }
            };
            let last = spec.last_processed.get(&input_key).copied().unwrap_or(0);
            if input_meta.version <= last {
                continue;
            }

            let previous = spec.fingerprints.get(&input_key).cloned().unwrap_or_default();
            let current: BTreeMap<String, Hash> = input_meta
                .records
                .iter()
                .map(|(id, record)| (id.clone(), record.hash))
                .collect();

            // Changed or new records: re-map.
            for (id, hash) in &current {
                if previous.get(id) == Some(hash) {
                    continue;
                }
                changed_anything = true;
                let record_path =
                    DatasetPath::record(input.source, input.user.clone(), input.name.clone(), id.clone());
                let record_key = record_path.to_string();
                let mapped_at = self.clock.now_ms();

                let value = match self.resolver.read(&record_path) {
                    Ok(value) => value,
                    Err(err) => {
                        log.push(BuildLogEntry {
                            input: record_key,
                            mapped_at,
                            logs: Vec::new(),
                            error: Some(SandboxFault {
                                message: format!("input unreadable: {err}"),
                                stack: String::new(),
                            }),
                        });
                        continue;
                    }
                };

                match self.sandbox.map(&spec.map_source, id, &value, &deps) {
                    Ok(outcome) => {
                        // This record's previous productions are superseded.
                        for producers in reverse.values_mut() {
                            producers.remove(&record_key);
                        }
                        for (out_id, out_value) in outcome.entries {
                            reverse
                                .entry(out_id.clone())
                                .or_default()
                                .insert(record_key.clone());
                            outputs.insert(out_id, out_value);
                        }
                        log.push(BuildLogEntry {
                            input: record_key,
                            mapped_at,
                            logs: outcome.logs,
                            error: None,
                        });
                    }
                    Err(fault) => {
                        log.push(BuildLogEntry {
                            input: record_key,
                            mapped_at,
                            logs: Vec::new(),
                            error: Some(SandboxFault {
                                message: fault.message,
                                stack: fault.stack,
                            }),
                        });
                    }
                }
            }

            // Disappeared records: their productions lose a producer.
            for id in previous.keys() {
                if current.contains_key(id) {
                    continue;
                }
                changed_anything = true;
                let record_key =
                    DatasetPath::record(input.source, input.user.clone(), input.name.clone(), id.clone())
                        .to_string();
                for producers in reverse.values_mut() {
                    producers.remove(&record_key);
                }
            }

            fingerprints.insert(input_key.clone(), current);
            last_processed.insert(input_key, input_meta.version);
        }

        if !changed_anything {
            debug!(lens = %lens_path, "build found no changes");
            return Ok(());
        }

        // Outputs with no surviving producer are dropped from the lens.
        let mut entries: Vec<(String, Option<StructuredValue>)> = outputs
            .into_iter()
            .map(|(id, value)| (id, Some(value)))
            .collect();
        let dead: Vec<String> = reverse
            .iter()
            .filter(|(_, producers)| producers.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        for id in dead {
            reverse.remove(&id);
            entries.push((id, None));
        }

        let mut updated = spec;
        updated.fingerprints = fingerprints;
        updated.last_processed = last_processed;
        updated.reverse_index = reverse;
        updated.build_log = log;

        let written = entries.len();
        self.lenses
            .write_entries_with(user, name, entries, false, move |draft| {
                draft.lens = Some(updated);
                Ok(())
            })?;
        info!(lens = %lens_path, entries = written, "lens build committed");
        Ok(())
    }

    /// React to one update event: rebuild every lens that declares the
    /// changed path as an input and has not yet processed this version.
    pub fn handle_event(&self, event: &PathEvent) -> LensResult<()> {
        let target = event.path.without_record();
        for user in self.lenses.users()? {
            for name in self.lenses.list(&user)? {
                let Ok(meta) = self.lenses.read_meta(&user, &name) else {
                    continue;
                };
                let Some(spec) = meta.lens else { continue };
                if !spec.inputs.iter().any(|input| input.without_record() == target) {
                    continue;
                }
                let last = spec
                    .last_processed
                    .get(&target.to_string())
                    .copied()
                    .unwrap_or(0);
                if event.version > 0 && event.version <= last {
                    continue;
                }
                if let Err(err) = self.build(&user, &name) {
                    warn!(lens = %self.lenses.path(&user, &name), %err, "lens build failed");
                }
            }
        }
        Ok(())
    }

    /// Consume the update bus until it closes. Builds run on blocking
    /// threads; a lagged receiver only costs missed wake-ups, which the
    /// next event makes up for.
    pub async fn run(self: Arc<Self>, mut events: EventStream) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let engine = Arc::clone(&self);
                    let outcome =
                        tokio::task::spawn_blocking(move || engine.handle_event(&event)).await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!(%err, "lens event handling failed"),
                        Err(err) => warn!(%err, "lens event task panicked"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "lens engine lagged behind the update bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

impl std::fmt::Debug for LensEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LensEngine").finish()
    }
}

/// Dependency reader scoped to the lens's declared dependency datasets.
struct EngineDeps<'a> {
    resolver: &'a ReadPath,
    allowed: &'a [DatasetPath],
}

impl DependencyReader for EngineDeps<'_> {
    fn read(&self, path: &DatasetPath) -> Option<StructuredValue> {
        let dataset = path.without_record();
        if !self.allowed.contains(&dataset) {
            return None;
        }
        self.resolver.read(path).ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use optics_attach::AttachmentStore;
    use optics_bus::UpdateBus;
    use optics_store::{FileStore, HoldTable, LockManager};
    use optics_types::{Source, SystemClock};

    use super::*;
    use crate::sandbox::{FnSandbox, MapOutcome, SandboxError};

    struct Fixture {
        _dir: tempfile::TempDir,
        datasets: Collection,
        lenses: Collection,
        bus: UpdateBus,
        engine: Arc<LensEngine>,
    }

    fn fixture_with(sandbox: Arc<dyn Sandbox>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(LockManager::new());
        let holds = HoldTable::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let files = Arc::new(FileStore::open(dir.path(), Arc::clone(&locks)).unwrap());
        let attachments = AttachmentStore::open(
            dir.path().join("attachments"),
            holds.clone(),
            Arc::clone(&locks),
            Arc::clone(&clock),
        )
        .unwrap();
        let bus = UpdateBus::default();
        let datasets = Collection::new(
            Source::Datasets,
            Arc::clone(&files),
            attachments.clone(),
            holds.clone(),
            bus.clone(),
            Arc::clone(&clock),
        )
        .unwrap();
        let lenses = Collection::new(
            Source::Lenses,
            files,
            attachments.clone(),
            holds,
            bus.clone(),
            Arc::clone(&clock),
        )
        .unwrap();
        let resolver = ReadPath::new(datasets.clone(), lenses.clone());
        attachments.set_link_source(Arc::new(resolver.clone()));
        let engine = Arc::new(LensEngine::new(
            lenses.clone(),
            resolver,
            sandbox,
            clock,
        ));
        Fixture {
            _dir: dir,
            datasets,
            lenses,
            bus,
            engine,
        }
    }

    fn doubling_sandbox() -> Arc<dyn Sandbox> {
        Arc::new(FnSandbox(|id: &str, value: &StructuredValue| {
            let n = value.as_i64().ok_or_else(|| SandboxError {
                message: format!("expected an integer, got {}", value.type_name()),
                stack: String::new(),
            })?;
            Ok(vec![(id.to_string(), StructuredValue::Integer(n * 2))])
        }))
    }

    fn input_path() -> DatasetPath {
        DatasetPath::dataset(Source::Datasets, "u", "in")
    }

    fn seed_input(fx: &Fixture, entries: &[(&str, i64)]) {
        fx.datasets.create("u", "in", BTreeMap::new(), None).unwrap();
        let records = entries
            .iter()
            .map(|(id, n)| (id.to_string(), StructuredValue::Integer(*n)))
            .collect();
        fx.datasets.merge("u", "in", records).unwrap();
    }

    fn create_double(fx: &Fixture) -> DatasetMeta {
        fx.engine
            .create(
                "u",
                "double",
                NewLens {
                    map_source: "(id, value) => [[id, value * 2]]".into(),
                    inputs: vec![input_path()],
                    ..NewLens::default()
                },
            )
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // Derivation (scenario S6)
    // -----------------------------------------------------------------------

    #[test]
    fn initial_build_maps_every_record() {
        let fx = fixture_with(doubling_sandbox());
        seed_input(&fx, &[("1", 2), ("2", 3)]);
        create_double(&fx);

        assert_eq!(
            fx.lenses.read("u", "double", "1").unwrap().unwrap(),
            StructuredValue::Integer(4)
        );
        assert_eq!(
            fx.lenses.read("u", "double", "2").unwrap().unwrap(),
            StructuredValue::Integer(6)
        );
    }

    #[test]
    fn incremental_build_touches_only_changed_records() {
        let fx = fixture_with(doubling_sandbox());
        seed_input(&fx, &[("1", 2), ("2", 3)]);
        create_double(&fx);
        let before = fx.lenses.read_meta("u", "double").unwrap();

        fx.datasets
            .write("u", "in", "1", StructuredValue::Integer(5))
            .unwrap();
        fx.engine.build("u", "double").unwrap();

        let after = fx.lenses.read_meta("u", "double").unwrap();
        assert_eq!(
            fx.lenses.read("u", "double", "1").unwrap().unwrap(),
            StructuredValue::Integer(10)
        );
        assert_eq!(
            fx.lenses.read("u", "double", "2").unwrap().unwrap(),
            StructuredValue::Integer(6)
        );
        // Record 2 was not re-mapped: its record version is unchanged.
        assert_eq!(
            after.records["2"].version,
            before.records["2"].version
        );
    }

    #[test]
    fn build_is_idempotent_on_unchanged_inputs() {
        let fx = fixture_with(doubling_sandbox());
        seed_input(&fx, &[("1", 2)]);
        create_double(&fx);
        let before = fx.lenses.read_meta("u", "double").unwrap().version;

        fx.engine.build("u", "double").unwrap();
        fx.engine.build("u", "double").unwrap();

        assert_eq!(fx.lenses.read_meta("u", "double").unwrap().version, before);
    }

    #[test]
    fn deleted_input_record_drops_its_output() {
        let fx = fixture_with(doubling_sandbox());
        seed_input(&fx, &[("1", 2), ("2", 3)]);
        create_double(&fx);

        fx.datasets.delete_record("u", "in", "1").unwrap();
        fx.engine.build("u", "double").unwrap();

        assert!(fx.lenses.read("u", "double", "1").unwrap().is_none());
        assert!(fx.lenses.read("u", "double", "2").unwrap().is_some());
    }

    #[test]
    fn output_shared_by_two_inputs_survives_one_deletion() {
        // Both input records emit the same output id.
        let fx = fixture_with(Arc::new(FnSandbox(
            |_id: &str, value: &StructuredValue| -> Result<Vec<(String, StructuredValue)>, SandboxError> {
                Ok(vec![("total".to_string(), value.clone())])
            },
        )));
        seed_input(&fx, &[("1", 10), ("2", 20)]);
        fx.engine
            .create(
                "u",
                "latest",
                NewLens {
                    map_source: "emit shared".into(),
                    inputs: vec![input_path()],
                    ..NewLens::default()
                },
            )
            .unwrap();
        assert!(fx.lenses.read("u", "latest", "total").unwrap().is_some());

        fx.datasets.delete_record("u", "in", "1").unwrap();
        fx.engine.build("u", "latest").unwrap();
        // Record 2 still produces "total".
        assert!(fx.lenses.read("u", "latest", "total").unwrap().is_some());

        fx.datasets.delete_record("u", "in", "2").unwrap();
        fx.engine.build("u", "latest").unwrap();
        assert!(fx.lenses.read("u", "latest", "total").unwrap().is_none());
    }

    // -----------------------------------------------------------------------
    // Faults
    // -----------------------------------------------------------------------

    #[test]
    fn sandbox_faults_land_in_build_log_not_errors() {
        let fx = fixture_with(doubling_sandbox());
        fx.datasets.create("u", "in", BTreeMap::new(), None).unwrap();
        fx.datasets
            .merge(
                "u",
                "in",
                BTreeMap::from([
                    ("good".to_string(), StructuredValue::Integer(1)),
                    ("bad".to_string(), StructuredValue::Text("nope".into())),
                ]),
            )
            .unwrap();
        create_double(&fx);

        // The good record mapped; the bad one logged a fault.
        assert!(fx.lenses.read("u", "double", "good").unwrap().is_some());
        assert!(fx.lenses.read("u", "double", "bad").unwrap().is_none());

        let spec = fx.lenses.read_meta("u", "double").unwrap().lens.unwrap();
        let fault = spec
            .build_log
            .iter()
            .find(|entry| entry.error.is_some())
            .expect("a fault was logged");
        assert!(fault.input.ends_with("/bad"));
        assert!(fault
            .error
            .as_ref()
            .unwrap()
            .message
            .contains("expected an integer"));
    }

    #[test]
    fn faulted_input_keeps_its_previous_output() {
        let fx = fixture_with(doubling_sandbox());
        seed_input(&fx, &[("1", 2)]);
        create_double(&fx);

        // Turn the record into something the map function rejects.
        fx.datasets
            .write("u", "in", "1", StructuredValue::Text("broken".into()))
            .unwrap();
        fx.engine.build("u", "double").unwrap();

        // The previous derivation is retained until a successful re-map.
        assert_eq!(
            fx.lenses.read("u", "double", "1").unwrap().unwrap(),
            StructuredValue::Integer(4)
        );
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    #[test]
    fn handle_event_rebuilds_matching_lenses() {
        let fx = fixture_with(doubling_sandbox());
        seed_input(&fx, &[("1", 2)]);
        create_double(&fx);

        fx.datasets
            .write("u", "in", "1", StructuredValue::Integer(7))
            .unwrap();
        let version = fx.datasets.read_meta("u", "in").unwrap().version;
        fx.engine
            .handle_event(&PathEvent {
                path: input_path(),
                version,
            })
            .unwrap();

        assert_eq!(
            fx.lenses.read("u", "double", "1").unwrap().unwrap(),
            StructuredValue::Integer(14)
        );
    }

    #[test]
    fn stale_events_are_ignored() {
        let fx = fixture_with(doubling_sandbox());
        seed_input(&fx, &[("1", 2)]);
        create_double(&fx);
        let before = fx.lenses.read_meta("u", "double").unwrap().version;

        // The initial build already covered this input version.
        let version = fx.datasets.read_meta("u", "in").unwrap().version;
        fx.engine
            .handle_event(&PathEvent {
                path: input_path(),
                version,
            })
            .unwrap();

        assert_eq!(fx.lenses.read_meta("u", "double").unwrap().version, before);
    }

    #[test]
    fn events_for_unrelated_paths_do_nothing() {
        let fx = fixture_with(doubling_sandbox());
        seed_input(&fx, &[("1", 2)]);
        create_double(&fx);
        let before = fx.lenses.read_meta("u", "double").unwrap().version;

        fx.engine
            .handle_event(&PathEvent {
                path: DatasetPath::dataset(Source::Datasets, "u", "other"),
                version: 9,
            })
            .unwrap();
        assert_eq!(fx.lenses.read_meta("u", "double").unwrap().version, before);
    }

    #[tokio::test]
    async fn run_loop_consumes_bus_events() {
        let fx = fixture_with(doubling_sandbox());
        seed_input(&fx, &[("1", 2)]);
        create_double(&fx);

        let events = fx.bus.subscribe();
        let engine = Arc::clone(&fx.engine);
        let task = tokio::spawn(engine.run(events));

        fx.datasets
            .write("u", "in", "1", StructuredValue::Integer(21))
            .unwrap();

        // Wait for the derived record to catch up.
        for _ in 0..100 {
            if fx.lenses.read("u", "double", "1").unwrap()
                == Some(StructuredValue::Integer(42))
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            fx.lenses.read("u", "double", "1").unwrap().unwrap(),
            StructuredValue::Integer(42)
        );
        task.abort();
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    #[test]
    fn dependency_reader_is_scoped_to_declared_datasets() {
        struct DepsProbe;
        impl Sandbox for DepsProbe {
            fn map(
                &self,
                _map_source: &str,
                id: &str,
                _value: &StructuredValue,
                deps: &dyn DependencyReader,
            ) -> Result<MapOutcome, SandboxError> {
                let allowed = deps.read(&DatasetPath::record(
                    Source::Datasets,
                    "u",
                    "side",
                    "k",
                ));
                let denied = deps.read(&DatasetPath::record(
                    Source::Datasets,
                    "u",
                    "secret",
                    "k",
                ));
                let mut entries = Vec::new();
                if let Some(value) = allowed {
                    entries.push((format!("{id}-side"), value));
                }
                if denied.is_some() {
                    entries.push((format!("{id}-leak"), StructuredValue::Null));
                }
                Ok(MapOutcome {
                    entries,
                    logs: Vec::new(),
                })
            }
        }

        let fx = fixture_with(Arc::new(DepsProbe));
        seed_input(&fx, &[("1", 1)]);
        for name in ["side", "secret"] {
            fx.datasets.create("u", name, BTreeMap::new(), None).unwrap();
            fx.datasets
                .write("u", name, "k", StructuredValue::Integer(99))
                .unwrap();
        }

        fx.engine
            .create(
                "u",
                "probe",
                NewLens {
                    map_source: "probe".into(),
                    inputs: vec![input_path()],
                    dependencies: vec![DatasetPath::dataset(Source::Datasets, "u", "side")],
                    ..NewLens::default()
                },
            )
            .unwrap();

        assert!(fx.lenses.read("u", "probe", "1-side").unwrap().is_some());
        assert!(fx.lenses.read("u", "probe", "1-leak").unwrap().is_none());
    }
}
