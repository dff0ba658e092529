//! Router core - the real-time audio data plane for a networked audio
//! router: timeshift buffer, per-path DSP, per-sink mixing, wire
//! protocols, and a declarative configuration applier.
//!
//! # Architecture
//!
//! The crate is organized into one module per layer of the data plane
//! (spec section 2 "System overview"):
//!
//! - [`packet`]: the wire-agnostic `TaggedAudioPacket` and `FormatDescriptor`
//!   types every other module shares.
//! - [`protocol`]: Scream-UDP and RTP header parsing/encoding.
//! - [`receivers`]: one bound socket and worker thread per listening
//!   protocol, depositing packets into the timeshift buffer.
//! - [`timeshift`]: the process-wide bounded history and per-consumer read
//!   cursors with playback-rate control.
//! - [`dsp`]: the per-chunk processing primitives (resample, channel remap,
//!   EQ, DC-block, normalize, volume, dither) composed by [`processor`].
//! - [`processor`]: one source processor per path, owning a cursor and
//!   running the DSP chain from spec 4.3.
//! - [`sink`]: the per-sink mixer, pacing clocks, and cross-sink sync.
//! - [`senders`]: packetization and transport hand-off for the mixer's
//!   output.
//! - [`webrtc`]: per-sink WebRTC listener fan-out.
//! - [`applier`]: the declarative `DesiredState` reconciler.
//! - [`events`]: the internal event bus discovery and stats sit on top of.
//! - [`engine`]: the top-level object wiring every other module together
//!   behind the single `apply_state` entry point.
//! - [`error`]: the control-plane `RouterError`/`RouterResult` types.
//! - [`stats`]: `get_stats()` snapshot types.
//! - [`runtime`]: the stop-signal and task-spawning abstractions shared by
//!   every worker thread.

#![warn(clippy::all)]

pub mod applier;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod events;
pub mod packet;
pub mod processor;
pub mod protocol;
pub mod receivers;
pub mod runtime;
pub mod senders;
pub mod sink;
pub mod stats;
pub mod timeshift;
pub mod utils;
pub mod webrtc;

// Re-export the control-plane surface most callers need without reaching
// into submodules.
pub use applier::{ConfigApplier, DesiredState, PathDesired, ReconcilePlan, SinkDesired};
pub use engine::{Engine, EngineConfig, SyncGroupConfig};
pub use error::{ErrorCode, RouterError, RouterResult};
pub use events::{BroadcastEvent, BroadcastEventBridge, EventEmitter};
pub use packet::{FormatDescriptor, SourceTag, TaggedAudioPacket};
pub use processor::SourcePathConfig;
pub use receivers::{RtpReceiverConfig, ScreamUdpReceiverConfig};
pub use runtime::{StopSignal, TaskSpawner, TokioSpawner};
pub use sink::{SinkConfig, SinkProtocol};
pub use stats::StatsSnapshot;
pub use timeshift::{TimeshiftConfig, TimeshiftExport};
