//! Default configuration constants for rtpscribe.
//!
//! Shared by the config types, the CLI and the tests so the numbers live
//! in one place.

/// Size of the fixed RTP header stripped from every datagram.
pub const RTP_HEADER_LEN: usize = 12;

/// Default media listen host.
pub const MEDIA_HOST: &str = "127.0.0.1";

/// Default media listen port.
pub const MEDIA_PORT: u16 = 7777;

/// Asterisk external media delivers slin16 in network byte order, so the
/// default deployment swaps every 16-bit sample.
pub const SWAP16: bool = true;

/// Default topic prefix for control and result topics.
pub const BUS_PREFIX: &str = "rtpscribe";

/// Topic suffix for "start transcribing" control messages.
pub const NEW_STREAM_TOPIC: &str = "newStream";

/// Topic suffix for "stop transcribing" control messages.
pub const STREAM_ENDED_TOPIC: &str = "streamEnded";

/// Topic suffix for published transcription results.
pub const TRANSCRIPTION_TOPIC: &str = "transcription";

/// Publish attempts before an event is dropped.
pub const PUBLISH_RETRIES: u32 = 3;

/// Delay between publish attempts in milliseconds.
pub const PUBLISH_BACKOFF_MS: u64 = 200;

/// Per-consumer bound on unconsumed audio bytes.
///
/// 10 seconds of 16 kHz mono 16-bit PCM.
pub const STREAM_BUFFER_BYTES: usize = 320_000;

/// Consecutive error-driven restarts allowed before a provider session fails.
pub const MAX_RESTART_ATTEMPTS: u32 = 5;

/// Base delay between restart attempts in milliseconds (doubled per attempt).
pub const RESTART_BACKOFF_MS: u64 = 250;

/// Time allowed for a provider session to wind down on `end()`.
pub const END_TIMEOUT_MS: u64 = 5_000;

/// Capacity of the hand-off queue between provider sessions and the publisher.
pub const PUBLISH_QUEUE_CAPACITY: usize = 1024;

/// Default audio sample rate in Hz.
pub const SAMPLE_RATE: u32 = 16000;

/// Default audio encoding label passed to providers.
pub const ENCODING: &str = "LINEAR16";

/// Default recognition language.
pub const LANGUAGE: &str = "en-GB";

/// Default provider session limit in milliseconds.
///
/// Just under the five minute cap of the common streaming STT APIs.
pub const SESSION_LIMIT_MS: u64 = 290_000;

/// Interval between counter reports in the daemon log.
pub const STATS_INTERVAL_SECS: u64 = 60;

/// Loopback provider: audio between interim results.
pub const LOOPBACK_INTERIM_MS: u64 = 1_000;

/// Loopback provider: audio between final results.
pub const LOOPBACK_FINAL_MS: u64 = 5_000;
