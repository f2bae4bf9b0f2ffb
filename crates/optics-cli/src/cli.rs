use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pigeon-optics", about = "Versioned, content-addressed dataset service", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve the HTTP API over a data root.
    Serve {
        /// Directory holding all persisted state.
        #[arg(long, default_value = "data")]
        data_root: PathBuf,

        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:8527")]
        bind: SocketAddr,
    },
}
