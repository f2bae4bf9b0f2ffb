//! The lens derivation engine.
//!
//! A lens is a dataset whose records are computed: a user-supplied map
//! function is evaluated over the records of one or more input datasets,
//! and the emitted `(output id, value)` entries become the lens's
//! records. The engine is change-driven — it listens for `path_updated`
//! events and re-maps only the input records whose payload hash changed
//! since the last completed build.
//!
//! The map function itself runs in an external [`Sandbox`]; the engine
//! treats it as opaque and confines its faults to per-input build log
//! entries. User code can never take the engine down.

mod engine;
mod error;
mod sandbox;

pub use engine::{LensEngine, NewLens};
pub use error::{LensError, LensResult};
pub use sandbox::{
    DependencyReader, DisabledSandbox, FnSandbox, MapOutcome, Sandbox, SandboxError,
};
