use optics_types::{DatasetPath, StructuredValue};

/// Read-only access handed to the map function for its declared
/// dependency datasets. `None` for anything outside the declaration or
/// not present.
pub trait DependencyReader: Send + Sync {
    fn read(&self, path: &DatasetPath) -> Option<StructuredValue>;
}

/// A fault thrown by user code, as reported by the sandbox host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxError {
    pub message: String,
    pub stack: String,
}

/// What one successful map invocation produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapOutcome {
    /// Emitted `(output id, value)` entries; may be empty.
    pub entries: Vec<(String, StructuredValue)>,
    /// Console output captured during the invocation.
    pub logs: Vec<String>,
}

/// The external sandbox host.
///
/// The engine assumes invocations are isolated and resource-limited,
/// produce serialisable output, and report user-code faults as
/// [`SandboxError`] values. Everything else about execution is the
/// host's business.
pub trait Sandbox: Send + Sync {
    fn map(
        &self,
        map_source: &str,
        record_id: &str,
        value: &StructuredValue,
        dependencies: &dyn DependencyReader,
    ) -> Result<MapOutcome, SandboxError>;
}

/// Sandbox stand-in for deployments without a host wired in: every map
/// invocation faults, so lens builds log the absence instead of
/// producing records.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledSandbox;

impl Sandbox for DisabledSandbox {
    fn map(
        &self,
        _map_source: &str,
        _record_id: &str,
        _value: &StructuredValue,
        _dependencies: &dyn DependencyReader,
    ) -> Result<MapOutcome, SandboxError> {
        Err(SandboxError {
            message: "no sandbox host configured".into(),
            stack: String::new(),
        })
    }
}

/// Closure-backed sandbox for tests and embedding.
pub struct FnSandbox<F>(pub F);

impl<F> Sandbox for FnSandbox<F>
where
    F: Fn(&str, &StructuredValue) -> Result<Vec<(String, StructuredValue)>, SandboxError>
        + Send
        + Sync,
{
    fn map(
        &self,
        _map_source: &str,
        record_id: &str,
        value: &StructuredValue,
        _dependencies: &dyn DependencyReader,
    ) -> Result<MapOutcome, SandboxError> {
        (self.0)(record_id, value).map(|entries| MapOutcome {
            entries,
            logs: Vec::new(),
        })
    }
}
