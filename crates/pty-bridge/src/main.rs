#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod commands;

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pty_bridge_common::telemetry::init_tracing;
use pty_bridge_daemon::{BridgeConfig, DaemonError, DaemonState};
use pty_bridge_ipc::{ClientError, Endpoint, LocalClient};
use serde_json::Value;
use tracing::info;

use crate::commands::{Cli, Commands};

const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

fn main() {
    if let Err(e) = run() {
        if let Some(client_error) = e.downcast_ref::<ClientError>() {
            eprintln!("Error: {}", client_error.user_message());
            if let Some(suggestion) = client_error.suggestion() {
                eprintln!("Suggestion: {}", suggestion);
            }
            std::process::exit(1);
        } else if let Some(daemon_error) = e.downcast_ref::<DaemonError>() {
            eprintln!("Error: {}", daemon_error);
            eprintln!("Suggestion: {}", daemon_error.suggestion());
            std::process::exit(74); // EX_IOERR
        } else {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Stdin reads block a worker thread, so shutdown must not wait on them.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;

    let result = match cli.into_command() {
        Commands::Serve { launch_args } => {
            let _telemetry = init_tracing("info");
            info!(
                version = env!("CARGO_PKG_VERSION"),
                launch_args = ?launch_args,
                "Starting native messaging host"
            );
            runtime
                .block_on(pty_bridge_daemon::run(BridgeConfig::from_env()))
                .map_err(anyhow::Error::from)
        }
        Commands::Call {
            method,
            params,
            socket,
            url,
            token,
            timeout,
        } => {
            let _telemetry = init_tracing("warn");
            let target = CallTarget { socket, url, token };
            runtime.block_on(call(&method, params.as_deref(), target, timeout))
        }
    };

    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

struct CallTarget {
    socket: Option<PathBuf>,
    url: Option<String>,
    token: Option<String>,
}

impl CallTarget {
    fn into_client(self) -> anyhow::Result<LocalClient> {
        if let Some(socket) = self.socket {
            return Ok(LocalClient::new(Endpoint::Unix(socket)));
        }
        if let Some(url) = self.url {
            let client = LocalClient::new(Endpoint::from_url(&url)?);
            return Ok(match self.token {
                Some(token) => client.with_token(token),
                None => client,
            });
        }

        let state_path = DaemonState::path(&BridgeConfig::from_env().runtime_dir);
        let state = DaemonState::load(&state_path).with_context(|| {
            format!(
                "no daemon state at {} (is the browser extension running? pass --socket or --url)",
                state_path.display()
            )
        })?;
        let token = self.token.unwrap_or(state.token);
        Ok(LocalClient::new(Endpoint::from_url(&state.url)?).with_token(token))
    }
}

async fn call(
    method: &str,
    params: Option<&str>,
    target: CallTarget,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let params = params
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("params must be valid JSON")?;
    let client = target
        .into_client()?
        .with_timeout(Duration::from_secs(timeout_secs.max(1)));

    let result = client.call(method, params).await?;
    let rendered = serde_json::to_string_pretty(&result)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{rendered}")?;
    Ok(())
}
