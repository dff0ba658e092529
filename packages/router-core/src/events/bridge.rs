//! Bridge implementation that fans domain events out to a broadcast
//! channel, for whatever external transport wants to subscribe.

use tokio::sync::broadcast;

use super::emitter::EventEmitter;
use super::{BroadcastEvent, ConfigEvent, DiscoveryEvent, SinkEvent, StreamEvent};

/// Bridges domain events to a `tokio::sync::broadcast` channel.
///
/// Lagging subscribers simply miss events (the channel's usual semantics);
/// the data plane never blocks waiting for a subscriber to drain, matching
/// spec 5's "no thread may spin-wait holding a mutex" and "all inter-thread
/// queues are bounded" rules extended to this diagnostic fan-out.
#[derive(Clone)]
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<BroadcastEvent>,
}

impl BroadcastEventBridge {
    /// Creates a new bridge with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns a new receiver for the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.tx.subscribe()
    }
}

macro_rules! impl_emit {
    ($method:ident, $event_ty:ty, $variant:ident) => {
        fn $method(&self, event: $event_ty) {
            if let Err(e) = self.tx.send(BroadcastEvent::$variant(event)) {
                log::trace!("[event-bridge] no subscribers: {e}");
            }
        }
    };
}

impl EventEmitter for BroadcastEventBridge {
    impl_emit!(emit_discovery, DiscoveryEvent, Discovery);
    impl_emit!(emit_stream, StreamEvent, Stream);
    impl_emit!(emit_sink, SinkEvent, Sink);
    impl_emit!(emit_config, ConfigEvent, Config);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bridge = BroadcastEventBridge::new(16);
        let mut rx = bridge.subscribe();

        bridge.emit_stream(StreamEvent::Underrun {
            path_id: "p1".into(),
            timestamp: 0,
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, BroadcastEvent::Stream(StreamEvent::Underrun { .. })));
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bridge = BroadcastEventBridge::new(16);
        bridge.emit_config(ConfigEvent::Rejected {
            reason: "bad sink".into(),
            timestamp: 0,
        });
    }
}
