//! Internal event system used to decouple the data plane from the
//! (out-of-scope) control-plane surface that would ultimately render these
//! to a user.
//!
//! Two things feed off this: discovery ("a tag was seen") drives the
//! applier's pending-path attachment (spec 4.6, design note "Dynamic tag
//! resolution"); the rest are diagnostic and mirror the `get_stats` surface
//! a caller would subscribe to alongside polling it.

mod bridge;
mod emitter;

pub use bridge::BroadcastEventBridge;
pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

use crate::packet::SourceTag;

/// Every event the engine can emit, tagged by category for a downstream
/// transport (out of scope here) to multiplex over a single channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum BroadcastEvent {
    /// A source tag was seen or went stale.
    Discovery(DiscoveryEvent),
    /// Stream-level health: underrun, overrun, discontinuity.
    Stream(StreamEvent),
    /// Sink lifecycle: faulted, recovered, listener joined/left.
    Sink(SinkEvent),
    /// `apply_state` outcome.
    Config(ConfigEvent),
}

/// Events about source tags appearing or disappearing.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DiscoveryEvent {
    /// A receiver saw this tag for the first time.
    TagSeen {
        tag: SourceTag,
        receiver_kind: &'static str,
        timestamp: u64,
    },
    /// A tag has produced no packets long enough that discovery UIs should
    /// consider it gone; not acted on internally.
    TagStale { tag: SourceTag, timestamp: u64 },
}

/// Stream-level health events, one per source path.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    /// The path's cursor had no data at the requested position.
    Underrun { path_id: String, timestamp: u64 },
    /// The path's cursor was clamped to the buffer tail.
    Overrun { path_id: String, timestamp: u64 },
    /// A receive-time gap forced the resampler/EQ state to be flushed.
    Discontinuity {
        path_id: String,
        gap_ms: u64,
        timestamp: u64,
    },
}

/// Sink lifecycle events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SinkEvent {
    /// A device or socket error could not be recovered locally.
    Faulted {
        sink_id: String,
        reason: String,
        timestamp: u64,
    },
    /// A previously faulted sink resumed normal operation.
    Recovered { sink_id: String, timestamp: u64 },
    /// A WebRTC listener finished negotiation and is receiving audio.
    ListenerJoined {
        sink_id: String,
        listener_id: String,
        timestamp: u64,
    },
    /// A WebRTC listener was removed (heartbeat timeout or explicit
    /// `remove_listener`).
    ListenerLeft {
        sink_id: String,
        listener_id: String,
        timestamp: u64,
    },
}

/// Outcome of a single `apply_state` call.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConfigEvent {
    Applied {
        sinks_created: usize,
        sinks_removed: usize,
        paths_created: usize,
        paths_updated: usize,
        paths_removed: usize,
        timestamp: u64,
    },
    Rejected { reason: String, timestamp: u64 },
}

impl From<DiscoveryEvent> for BroadcastEvent {
    fn from(e: DiscoveryEvent) -> Self {
        BroadcastEvent::Discovery(e)
    }
}

impl From<StreamEvent> for BroadcastEvent {
    fn from(e: StreamEvent) -> Self {
        BroadcastEvent::Stream(e)
    }
}

impl From<SinkEvent> for BroadcastEvent {
    fn from(e: SinkEvent) -> Self {
        BroadcastEvent::Sink(e)
    }
}

impl From<ConfigEvent> for BroadcastEvent {
    fn from(e: ConfigEvent) -> Self {
        BroadcastEvent::Config(e)
    }
}
