//! Audio continuity across provider session restarts.
//!
//! Streaming recognisers cap how long one session may run, so a call is
//! transcribed by a chain of underlying sessions. Two things keep the chain
//! looking like one session to consumers:
//!
//! * **Replay.** Audio the previous session received after its last final
//!   result is sent again at the start of the next one, so words cut by
//!   the restart are recognised whole.
//! * **Offset correction.** Result times are relative to their own
//!   session. They are shifted by the live audio delivered to earlier
//!   sessions, minus the replayed prefix, onto one call timeline.
//!
//! ```text
//! session n   |=========F---------|      F = last final result end
//!                       \_ replay _/
//! session n+1           |---------|===========...
//!                        bridging
//! ```
//!
//! The struct is pure bookkeeping; the session task decides when to call
//! it.

use crate::provider::AudioFormat;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

/// Restart-corrected position of one result on the call timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub offset_ms: u64,
    pub session_ordinal: u64,
    pub utterance_id: String,
}

/// Per provider session continuity state.
#[derive(Debug)]
pub struct Continuity {
    format: AudioFormat,
    window_bytes: usize,
    /// Replay queued ahead of the current underlying session's live audio.
    replayed: Vec<Bytes>,
    /// Live chunks delivered to the current underlying session.
    buffer: VecDeque<Bytes>,
    buffer_bytes: usize,
    /// Bytes evicted from the front of `buffer` to respect the window.
    evicted_bytes: usize,
    /// All live bytes delivered to the current underlying session.
    live_bytes: usize,
    last_final_end_ms: Option<u64>,
    bridging_ms: f64,
    elapsed_before_ms: f64,
    restart_count: u32,
    high_water_ms: u64,
    session_ordinal: u64,
    utterance_id: String,
}

impl Continuity {
    /// `window` bounds the replay buffer; use the provider's session limit.
    pub fn new(format: AudioFormat, window: Duration) -> Self {
        Self {
            format,
            window_bytes: format.bytes_for(window),
            replayed: Vec::new(),
            buffer: VecDeque::new(),
            buffer_bytes: 0,
            evicted_bytes: 0,
            live_bytes: 0,
            last_final_end_ms: None,
            bridging_ms: 0.0,
            elapsed_before_ms: 0.0,
            restart_count: 0,
            high_water_ms: 0,
            session_ordinal: 0,
            utterance_id: new_utterance_id(),
        }
    }

    /// Notes a live chunk as delivered to the current underlying session.
    ///
    /// Replayed chunks must not be recorded.
    pub fn record_live(&mut self, chunk: Bytes) {
        self.live_bytes += chunk.len();
        self.buffer_bytes += chunk.len();
        self.buffer.push_back(chunk);
        while self.buffer_bytes > self.window_bytes && self.buffer.len() > 1 {
            if let Some(old) = self.buffer.pop_front() {
                self.buffer_bytes -= old.len();
                self.evicted_bytes += old.len();
            }
        }
    }

    /// Places a result on the call timeline.
    ///
    /// Offsets never decrease. A final result closes the current utterance:
    /// the ordinal advances and a new utterance id is drawn after stamping.
    pub fn stamp(&mut self, end_ms: u64, is_final: bool) -> Stamp {
        let corrected = end_ms as f64 - self.bridging_ms + self.elapsed_before_ms;
        let offset_ms = (corrected.max(0.0).round() as u64).max(self.high_water_ms);
        self.high_water_ms = offset_ms;

        let stamp = Stamp {
            offset_ms,
            session_ordinal: self.session_ordinal,
            utterance_id: self.utterance_id.clone(),
        };
        if is_final {
            self.last_final_end_ms = Some(end_ms);
            self.session_ordinal += 1;
            self.utterance_id = new_utterance_id();
        }
        stamp
    }

    /// Closes the books on the current underlying session and returns the
    /// chunks to replay into the next one, oldest first.
    ///
    /// Replayed audio the session never finalised is carried into the next
    /// replay, whether or not it was delivered before the session died.
    pub fn begin_restart(&mut self) -> Vec<Bytes> {
        let final_request_ms = self.last_final_end_ms.unwrap_or(0) as f64;
        let bridging_ms = self.bridging_ms.clamp(0.0, final_request_ms);
        let mut replay = self.replayed_after(final_request_ms);
        replay.extend(self.replay_from(final_request_ms - bridging_ms));
        self.trim_to_window(&mut replay);

        let replay_bytes: usize = replay.iter().map(Bytes::len).sum();
        self.bridging_ms = self.format.millis_for(replay_bytes);
        self.replayed = replay.clone();
        self.elapsed_before_ms += self.format.millis_for(self.live_bytes);
        self.restart_count += 1;

        self.buffer.clear();
        self.buffer_bytes = 0;
        self.evicted_bytes = 0;
        self.live_bytes = 0;
        self.last_final_end_ms = None;
        replay
    }

    /// Replayed chunks the session had not finalised by `final_ms`.
    fn replayed_after(&self, final_ms: f64) -> Vec<Bytes> {
        if self.replayed.is_empty() || final_ms >= self.bridging_ms {
            return Vec::new();
        }
        let chunk_ms = self.bridging_ms / self.replayed.len() as f64;
        let from = (final_ms / chunk_ms).floor().max(0.0) as usize;
        self.replayed.iter().skip(from).cloned().collect()
    }

    /// Drops the oldest chunks until the replay fits one window.
    fn trim_to_window(&self, replay: &mut Vec<Bytes>) {
        let mut bytes: usize = replay.iter().map(Bytes::len).sum();
        let mut skip = 0;
        while bytes > self.window_bytes && replay.len() - skip > 1 {
            bytes -= replay[skip].len();
            skip += 1;
        }
        replay.drain(..skip);
    }

    /// Buffered chunks starting at `offset_ms` of the session's live audio.
    fn replay_from(&self, offset_ms: f64) -> Vec<Bytes> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let chunk_ms = self.format.millis_for(self.buffer_bytes) / self.buffer.len() as f64;
        if chunk_ms <= 0.0 {
            return Vec::new();
        }
        let into_buffer_ms = offset_ms - self.format.millis_for(self.evicted_bytes);
        let from = (into_buffer_ms / chunk_ms).floor().max(0.0) as usize;
        self.buffer.iter().skip(from).cloned().collect()
    }

    /// Drops buffered audio. Used when the session ends.
    pub fn release(&mut self) {
        self.replayed = Vec::new();
        self.buffer = VecDeque::new();
        self.buffer_bytes = 0;
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Duration of the replayed prefix of the current underlying session.
    pub fn bridging_ms(&self) -> f64 {
        self.bridging_ms
    }

    /// Live audio delivered to all previous underlying sessions.
    pub fn elapsed_before_ms(&self) -> f64 {
        self.elapsed_before_ms
    }

    pub fn session_ordinal(&self) -> u64 {
        self.session_ordinal
    }

    pub fn buffered_chunks(&self) -> usize {
        self.buffer.len()
    }
}

fn new_utterance_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 20 ms of 16 kHz mono PCM, tagged with `tag` so replays can be traced.
    fn frame(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 640])
    }

    fn tags(chunks: &[Bytes]) -> Vec<u8> {
        chunks.iter().map(|c| c[0]).collect()
    }

    fn continuity() -> Continuity {
        Continuity::new(AudioFormat::new(16000), Duration::from_millis(100))
    }

    fn feed(c: &mut Continuity, tags: std::ops::Range<u8>) {
        for tag in tags {
            c.record_live(frame(tag));
        }
    }

    #[test]
    fn test_offsets_pass_through_before_any_restart() {
        let mut c = continuity();
        feed(&mut c, 0..3);
        assert_eq!(c.stamp(40, false).offset_ms, 40);
        assert_eq!(c.restart_count(), 0);
    }

    #[test]
    fn test_replay_starts_after_last_final() {
        let mut c = continuity();
        feed(&mut c, 0..5);
        c.stamp(60, true);

        let replay = c.begin_restart();
        assert_eq!(tags(&replay), vec![3, 4]);
        assert_eq!(c.bridging_ms(), 40.0);
        assert_eq!(c.elapsed_before_ms(), 100.0);

        // First byte after the replay sits at 100 ms on the call timeline.
        assert_eq!(c.stamp(40, false).offset_ms, 100);
    }

    #[test]
    fn test_no_final_replays_whole_buffer() {
        let mut c = continuity();
        feed(&mut c, 0..5);
        c.stamp(70, false);

        let replay = c.begin_restart();
        assert_eq!(tags(&replay), vec![0, 1, 2, 3, 4]);
        assert_eq!(c.bridging_ms(), 100.0);
        assert_eq!(c.stamp(110, false).offset_ms, 110);
    }

    #[test]
    fn test_final_at_end_of_buffer_replays_nothing() {
        let mut c = continuity();
        feed(&mut c, 0..5);
        c.stamp(100, true);
        assert!(c.begin_restart().is_empty());
        assert_eq!(c.bridging_ms(), 0.0);
        assert_eq!(c.stamp(10, false).offset_ms, 110);
    }

    #[test]
    fn test_empty_buffer_replays_nothing() {
        let mut c = continuity();
        assert!(c.begin_restart().is_empty());
        assert_eq!(c.restart_count(), 1);
        assert_eq!(c.elapsed_before_ms(), 0.0);
    }

    #[test]
    fn test_second_restart_uses_previous_bridging() {
        let mut c = continuity();
        feed(&mut c, 0..5);
        c.stamp(60, true);
        let _ = c.begin_restart(); // bridging 40

        // Session two: 40 ms replayed, then live 5..10. Final at raw 100
        // means 60 ms into its live audio, i.e. after tag 7.
        feed(&mut c, 5..10);
        c.stamp(100, true);
        let replay = c.begin_restart();
        assert_eq!(tags(&replay), vec![8, 9]);
        assert_eq!(c.elapsed_before_ms(), 200.0);
    }

    #[test]
    fn test_unfinalised_replay_is_carried_into_next_restart() {
        let mut c = continuity();
        feed(&mut c, 0..5);
        c.stamp(40, true);
        assert_eq!(tags(&c.begin_restart()), vec![2, 3, 4]);

        // Session two dies before hearing anything new.
        let replay = c.begin_restart();
        assert_eq!(tags(&replay), vec![2, 3, 4]);
        assert_eq!(c.bridging_ms(), 60.0);
        assert_eq!(c.elapsed_before_ms(), 100.0);

        // Session three: replay, then tag 5 ends at 80 ms of its audio.
        feed(&mut c, 5..6);
        assert_eq!(c.stamp(80, false).offset_ms, 120);
    }

    #[test]
    fn test_final_inside_replay_keeps_its_tail() {
        let mut c = continuity();
        feed(&mut c, 0..5);
        c.stamp(20, true);
        assert_eq!(tags(&c.begin_restart()), vec![1, 2, 3, 4]);

        // Session two finalises the first two replayed chunks, hears tag 5
        // live, then restarts.
        feed(&mut c, 5..6);
        c.stamp(40, true);
        let replay = c.begin_restart();
        assert_eq!(tags(&replay), vec![3, 4, 5]);
    }

    #[test]
    fn test_carried_replay_is_capped_at_window() {
        let mut c = continuity();
        feed(&mut c, 0..5);
        assert_eq!(c.begin_restart().len(), 5);
        feed(&mut c, 5..8);
        let replay = c.begin_restart();
        assert_eq!(tags(&replay), vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_evicted_prefix_keeps_replay_aligned() {
        let mut c = continuity();
        feed(&mut c, 0..8); // 160 ms into a 100 ms window
        assert_eq!(c.buffered_chunks(), 5);
        c.stamp(120, true);

        let replay = c.begin_restart();
        assert_eq!(tags(&replay), vec![6, 7]);
        assert_eq!(c.elapsed_before_ms(), 160.0);
    }

    #[test]
    fn test_offsets_never_decrease() {
        let mut c = continuity();
        feed(&mut c, 0..5);
        assert_eq!(c.stamp(90, false).offset_ms, 90);
        c.stamp(60, true);
        assert_eq!(c.stamp(70, false).offset_ms, 90);
    }

    #[test]
    fn test_ordinal_and_utterance_advance_on_final_only() {
        let mut c = continuity();
        let first = c.stamp(10, false);
        let second = c.stamp(20, true);
        let third = c.stamp(30, false);

        assert_eq!(first.session_ordinal, 0);
        assert_eq!(second.session_ordinal, 0);
        assert_eq!(first.utterance_id, second.utterance_id);
        assert_eq!(third.session_ordinal, 1);
        assert_ne!(third.utterance_id, second.utterance_id);

        c.begin_restart();
        assert_eq!(c.session_ordinal(), 1, "restarts do not advance the ordinal");
    }

    #[test]
    fn test_release_drops_buffer() {
        let mut c = continuity();
        feed(&mut c, 0..3);
        c.release();
        assert_eq!(c.buffered_chunks(), 0);
    }
}
