//! Command-line interface for rtpscribe
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Live RTP audio to streaming speech-to-text
#[derive(Parser, Debug)]
#[command(
    name = "rtpscribe",
    version,
    about = "Live RTP audio to streaming speech-to-text"
)]
pub struct Cli {
    /// Subcommand to execute (default: serve)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon in the foreground
    Serve {
        /// Path to the bus socket (default: $XDG_RUNTIME_DIR/rtpscribe.sock)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// Ask a running daemon to start transcribing a call
    Start {
        /// Channel id of the call
        channel_id: String,

        /// Source port of the call's RTP
        port: u16,

        /// Room whose transcription topic receives the results
        room: String,

        /// Caller name included in every result
        #[arg(long, default_value = "")]
        caller: String,

        /// Path to the bus socket (default: $XDG_RUNTIME_DIR/rtpscribe.sock)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// Ask a running daemon to stop transcribing a call
    End {
        /// Channel id of the call
        channel_id: String,

        /// Source port of the call's RTP
        port: u16,

        /// Path to the bus socket (default: $XDG_RUNTIME_DIR/rtpscribe.sock)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// Print transcription results as they are published
    Follow {
        /// Only follow this room (default: every room)
        #[arg(long, value_name = "ROOM")]
        room: Option<String>,

        /// Path to the bus socket (default: $XDG_RUNTIME_DIR/rtpscribe.sock)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration inspection actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
}
