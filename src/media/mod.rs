//! Media plane: UDP ingest and per-call audio streams.
//!
//! ```text
//! UDP socket ──▶ DatagramRouter ──▶ AudioStreamRegistry[source port]
//!                (strip header,          │
//!                 swap16)                ├──▶ AudioConsumer (provider A)
//!                                        └──▶ AudioConsumer (provider B)
//! ```

pub mod demux;
pub mod packet;
pub mod registry;
pub mod stream;

pub use demux::{DatagramRouter, Disposition, PacketDemultiplexer};
pub use registry::AudioStreamRegistry;
pub use stream::{AudioConsumer, AudioStream};
