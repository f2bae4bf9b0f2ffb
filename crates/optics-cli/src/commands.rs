use std::sync::Arc;

use optics_lens::DisabledSandbox;
use optics_server::{OpticsServer, ServerConfig};

use crate::cli::{Cli, Command};

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve { data_root, bind } => {
            let config = ServerConfig {
                bind_addr: bind,
                data_root,
            };
            let server = OpticsServer::open(config, Arc::new(DisabledSandbox))?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(server.serve())?;
            Ok(())
        }
    }
}
