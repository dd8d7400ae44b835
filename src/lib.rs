//! rtpscribe - live RTP audio to streaming speech-to-text
//!
//! One UDP socket carries the audio of many calls. Each call's audio is
//! fanned out to every enabled provider session, sessions are restarted
//! transparently at provider limits and on errors, and results are
//! published on a topic bus keyed by room.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod bus;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod control;
pub mod daemon;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod media;
pub mod orchestrator;
pub mod provider;
pub mod publisher;
pub mod session;
pub mod stats;

// Seams
pub use bus::{LocalBus, MessageBus};
pub use provider::Provider;

// Core components
pub use media::{AudioStreamRegistry, PacketDemultiplexer};
pub use orchestrator::Orchestrator;
pub use publisher::ResultPublisher;
pub use session::{ProviderSession, SessionState, TranscriptEvent};

// Error handling
pub use error::{Result, ScribeError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }

    #[test]
    fn version_string_has_hash_suffix_only_with_git_hash() {
        let ver = version_string();
        if option_env!("GIT_HASH").is_some_and(|h| !h.is_empty()) {
            let hash_part = ver.split('+').nth(1).unwrap_or("");
            assert_eq!(hash_part.len(), 7, "unexpected hash in {}", ver);
        } else {
            assert_eq!(ver, env!("CARGO_PKG_VERSION"));
        }
    }
}
