//! Provider sessions: one per provider per call.

pub mod continuity;
pub mod provider_session;
pub mod state;

use serde_json::Value;

pub use continuity::{Continuity, Stamp};
pub use provider_session::ProviderSession;
pub use state::SessionState;

/// A provider result placed on the call timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub call_id: String,
    pub provider_id: String,
    /// Utterance ordinal; advances after every final result.
    pub session_ordinal: u64,
    /// Random id shared by all results of one utterance.
    pub utterance_id: String,
    /// Restart-corrected end of the result, non-decreasing per provider.
    pub offset_ms: u64,
    pub is_final: bool,
    /// Provider-specific result body, published as `results`.
    pub payload: Value,
}
