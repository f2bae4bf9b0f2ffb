//! HTTP surface over a Pigeon Optics node.
//!
//! Implements the documented route table: dataset and lens enumeration,
//! record reads (including `as/<format>` export through the codec
//! registry), record writes decoded by request content type, lens
//! creation, and attachment upload/download. Write-side protocol
//! details: record listings and reads carry an `X-Version` header; a
//! write that references absent attachments answers 400 with an
//! `X-Pigeon-Optics-Resend-With-Attachments` header naming them.
//!
//! Sessions, CORS, authentication, and the multipart ingestion edge are
//! external concerns and not part of this crate.

mod config;
mod error;
mod routes;
mod server;
mod state;

pub use config::ServerConfig;
pub use error::{ApiError, ServerError, ServerResult};
pub use routes::build_router;
pub use server::OpticsServer;
pub use state::AppState;
