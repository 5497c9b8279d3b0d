// agent/src/main.rs

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

mod config;
mod context;
mod error;
mod sys;

use crate::config::{AgentConfig, DEFAULT_CONFIG_PATH};
use crate::context::{Collaborators, InitOptions};
use crate::error::InitError;

#[derive(Debug, Parser)]
#[command(name = "fleet-agent", version, about = "Fleet investigation agent")]
struct Cli {
    /// Stay attached to the terminal instead of relaunching in the background.
    #[arg(long)]
    foreground: bool,

    /// Redeploy the installed service with this binary, then exit.
    #[arg(long)]
    upgrade: bool,

    #[arg(long, env = "FLEET_AGENT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ==============================================================================
    // 1. Configuration & Environment (SLA Layer)
    // ==============================================================================

    let config = match AgentConfig::load(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("fleet-agent: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let collab = match Collaborators::system(&config, &cli.config) {
        Ok(collab) => collab,
        Err(e) => {
            eprintln!("fleet-agent: cannot locate own binary: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // ==============================================================================
    // 2. Bootstrap
    // ==============================================================================

    let options = InitOptions {
        foreground: cli.foreground,
        upgrade: cli.upgrade,
        install_subscriber: true,
    };

    let ctx = match context::init(config, options, collab).await {
        Ok(ctx) => ctx,
        Err(InitError::HandedOff) => return ExitCode::SUCCESS,
        Err(e) => {
            // The subscriber may not exist yet if the failure came early.
            tracing::error!("agent bootstrap failed: {}", e);
            eprintln!("fleet-agent: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // ==============================================================================
    // 3. Status Socket & Main Wait
    // ==============================================================================

    let status = match ctx.socket.as_deref() {
        Some(addr) => match sys::status::bind(addr).await {
            Ok(listener) => {
                ctx.log.info(format!("status socket listening on {}", addr));
                Some(sys::status::serve(
                    listener,
                    ctx.agent.clone(),
                    ctx.volatile.clone(),
                    ctx.log.clone(),
                ))
            }
            Err(e) => {
                ctx.log.warn(format!("status socket disabled, bind to {} failed: {}", addr, e));
                None
            }
        },
        None => None,
    };

    if let Some(reason) = ctx.channels.terminate.recv().await {
        ctx.log.info(format!("terminating agent: {}", reason));
    }

    if let Some(status) = status {
        status.abort();
    }
    ctx.destroy().await;
    ExitCode::SUCCESS
}
