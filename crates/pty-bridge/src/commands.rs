use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

const LONG_ABOUT: &str = r#"pty-bridge connects a browser extension to terminal sessions on this machine.

The browser starts it as a native messaging host and talks to it over
stdin/stdout. Local tools reach the same methods over HTTP, and the extension
streams terminal I/O over WebSockets.

EXAMPLES:
    # What the browser runs (the default when no subcommand is given)
    pty-bridge serve

    # Call a method on a running daemon
    pty-bridge call list-sessions
    pty-bridge call resize-session '{"id":"<id>","rows":40,"cols":120}'
    pty-bridge call list-tabs --socket ~/.cache/pty-bridge/sockets/<browser>.sock"#;

#[derive(Debug, Parser)]
#[command(name = "pty-bridge")]
#[command(author, version)]
#[command(about = "Native messaging host bridging browser extensions to local terminals")]
#[command(long_about = LONG_ABOUT)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Arguments the browser appends when launching the host (origin, manifest path)
    #[arg(hide = true)]
    pub launch_args: Vec<String>,
}

impl Cli {
    /// The subcommand to run; a bare invocation is a browser launch.
    pub fn into_command(self) -> Commands {
        self.command.unwrap_or(Commands::Serve {
            launch_args: self.launch_args,
        })
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the native messaging host on stdin/stdout
    Serve {
        #[arg(hide = true)]
        launch_args: Vec<String>,
    },

    /// Call a method on a running daemon and print the JSON result
    #[command(long_about = r#"Call a method on a running daemon and print the JSON result.

Without --socket or --url the daemon's state file in the runtime directory
supplies the address and token.

EXAMPLES:
    pty-bridge call ping
    pty-bridge call create-session '{"rows":24,"cols":80}'
    pty-bridge call close-session '{"id":"<id>"}' --url http://127.0.0.1:4000 --token <token>"#)]
    Call {
        /// Method name (e.g., list-sessions, list-tabs)
        method: String,

        /// JSON parameters
        params: Option<String>,

        /// Per-browser Unix socket to connect to
        #[arg(long, conflicts_with = "url")]
        socket: Option<PathBuf>,

        /// Base URL of the daemon's TCP listener
        #[arg(long)]
        url: Option<String>,

        /// Bearer token for the TCP listener
        #[arg(long, env = "PTY_BRIDGE_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Seconds to wait for the response
        #[arg(long, default_value = "15")]
        timeout: u64,
    },
}
