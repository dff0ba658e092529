//! Event emitter abstraction for decoupling the engine from transport.

use super::{ConfigEvent, DiscoveryEvent, SinkEvent, StreamEvent};

/// Trait for emitting domain events without knowledge of transport.
///
/// The engine depends on this trait rather than a concrete broadcast
/// channel so tests can assert on emitted events and an external control
/// plane can plug in whatever transport it wants (WebSocket, SSE, a plain
/// log sink) without the data plane knowing about it.
pub trait EventEmitter: Send + Sync {
    /// Emits a discovery event (tag seen/stale).
    fn emit_discovery(&self, event: DiscoveryEvent);
    /// Emits a stream health event.
    fn emit_stream(&self, event: StreamEvent);
    /// Emits a sink lifecycle event.
    fn emit_sink(&self, event: SinkEvent);
    /// Emits a config-apply outcome event.
    fn emit_config(&self, event: ConfigEvent);
}

/// No-op emitter for headless operation or testing.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_discovery(&self, _event: DiscoveryEvent) {}
    fn emit_stream(&self, _event: StreamEvent) {}
    fn emit_sink(&self, _event: SinkEvent) {}
    fn emit_config(&self, _event: ConfigEvent) {}
}

/// Logging emitter, useful in the standalone binary and in tests.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_discovery(&self, event: DiscoveryEvent) {
        log::info!("[discovery] {event:?}");
    }

    fn emit_stream(&self, event: StreamEvent) {
        log::debug!("[stream] {event:?}");
    }

    fn emit_sink(&self, event: SinkEvent) {
        log::warn!("[sink] {event:?}");
    }

    fn emit_config(&self, event: ConfigEvent) {
        log::info!("[config] {event:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEventEmitter {
        discovery_count: AtomicUsize,
        stream_count: AtomicUsize,
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit_discovery(&self, _event: DiscoveryEvent) {
            self.discovery_count.fetch_add(1, Ordering::SeqCst);
        }
        fn emit_stream(&self, _event: StreamEvent) {
            self.stream_count.fetch_add(1, Ordering::SeqCst);
        }
        fn emit_sink(&self, _event: SinkEvent) {}
        fn emit_config(&self, _event: ConfigEvent) {}
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = CountingEventEmitter {
            discovery_count: AtomicUsize::new(0),
            stream_count: AtomicUsize::new(0),
        };

        emitter.emit_discovery(DiscoveryEvent::TagStale {
            tag: "192.168.1.40".into(),
            timestamp: 0,
        });
        emitter.emit_stream(StreamEvent::Underrun {
            path_id: "p1".into(),
            timestamp: 0,
        });

        assert_eq!(emitter.discovery_count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.stream_count.load(Ordering::SeqCst), 1);
    }
}
