//! Foundation types for Pigeon Optics.
//!
//! This crate provides the identity, value, and addressing types used
//! throughout the system. Every other Pigeon Optics crate depends on
//! `optics-types`.
//!
//! # Key Types
//!
//! - [`Hash`] — Content-addressed identifier (SHA-256 digest)
//! - [`HashUrl`] — `hash://sha256/<hex>[?type=<mime>]` attachment reference
//! - [`StructuredValue`] — The canonical recursive document value
//! - [`DatasetPath`] / [`Source`] — Addressing for datasets, lenses, and
//!   the virtual system collections
//! - [`Clock`] — Timestamp seam so tests can pin time

pub mod clock;
pub mod error;
pub mod hash;
pub mod path;
pub mod url;
pub mod value;

pub use clock::{Clock, SystemClock};
pub use error::TypeError;
pub use hash::Hash;
pub use path::{DatasetPath, Source};
pub use url::HashUrl;
pub use value::StructuredValue;
