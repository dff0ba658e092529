//! The top-level object that wires every other module together: receivers,
//! the timeshift buffer, source processors, sink mixers, and the config
//! applier, behind the single declarative [`apply_state`](Engine::apply_state)
//! entry point a control-plane binary drives (spec 3 "Engine", spec 4.6).
//!
//! Mirrors the shared-state-behind-an-`Arc` pattern used throughout this
//! crate (`TimeshiftManager`, `ConfigApplier`): `Engine` is a cheap clone
//! wrapping an `Inner`, so the background discovery task can hold its own
//! clone and call back into `attach_path` without a self-referential borrow.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::applier::{ConfigApplier, DesiredState, PathDesired, SinkDesired};
use crate::error::{RouterError, RouterResult};
use crate::events::{BroadcastEvent, BroadcastEventBridge, DiscoveryEvent, EventEmitter};
use crate::packet::{FormatDescriptor, SourceTag};
use crate::processor::{spawn_source_processor, OutputQueue, ProcessorCommand, ProcessorHandle};
use crate::receivers::{
    spawn_rtp_receiver, spawn_scream_udp_receiver, ReceiverHandle, RtpReceiverConfig, ScreamUdpReceiverConfig,
};
use crate::runtime::StopSignal;
use crate::senders::{NullSender, RtpSender, ScreamUdpSender};
use crate::sink::pacing::{SyncBarrierConfig, SyncGroup, WallClockPacing};
use crate::sink::{spawn_sink_mixer, MixerCommand, MixerHandle, SinkMixer, SinkProtocol};
use crate::stats::{GlobalStats, SinkStats, SourceStats, StatsSnapshot, StreamStats};
use crate::timeshift::{TimeshiftConfig, TimeshiftManager};
use crate::webrtc::{WebRtcListenerManager, WebRtcSideTap};

/// One statically declared cross-sink sync group (spec 4.4 "Cross-sink
/// synchronization"). Membership is fixed at engine construction rather
/// than driven by `DesiredState`: the barrier's rendezvous math needs a
/// known member count up front, so which sinks participate in which group
/// is topology, not a hot-reconciled setting.
#[derive(Debug, Clone)]
pub struct SyncGroupConfig {
    pub group_id: String,
    pub members: Vec<String>,
    pub barrier: SyncBarrierConfig,
}

/// Construction-time configuration for an [`Engine`]: everything that is
/// infrastructure rather than declarative topology (the receivers to bind,
/// the timeshift buffer's tunables, and static sync group membership). The
/// sinks and paths themselves arrive later through [`Engine::apply_state`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scream_receivers: Vec<ScreamUdpReceiverConfig>,
    pub rtp_receivers: Vec<RtpReceiverConfig>,
    pub timeshift: TimeshiftConfig,
    pub max_clock_pending_packets: usize,
    pub cleanup_interval: Duration,
    /// Upper bound on how long a source processor or sink mixer thread may
    /// sleep between loop iterations before re-checking its stop signal and
    /// command queue (spec 5 "Suspension points").
    pub loop_max_sleep: Duration,
    pub discovery_channel_capacity: usize,
    pub sync_groups: Vec<SyncGroupConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scream_receivers: Vec::new(),
            rtp_receivers: Vec::new(),
            timeshift: TimeshiftConfig::default(),
            max_clock_pending_packets: 4_096,
            cleanup_interval: Duration::from_secs(1),
            loop_max_sleep: Duration::from_millis(5),
            discovery_channel_capacity: 256,
            sync_groups: Vec::new(),
        }
    }
}

struct ReceiverEntry {
    kind: &'static str,
    description: String,
    handle: ReceiverHandle,
}

struct SinkEntry {
    handle: MixerHandle,
    protocol: SinkProtocol,
    output_format: FormatDescriptor,
    webrtc: Option<Arc<WebRtcListenerManager>>,
}

struct PathEntry {
    handle: ProcessorHandle,
    output: Arc<OutputQueue>,
    cursor: crate::timeshift::CursorHandle,
    source_tag: SourceTag,
    target_sink_id: String,
}

struct Inner {
    manager: TimeshiftManager,
    applier: Arc<ConfigApplier>,
    events: Arc<BroadcastEventBridge>,
    runtime: tokio::runtime::Handle,
    stop: StopSignal,
    loop_max_sleep: Duration,
    receivers: Mutex<Vec<ReceiverEntry>>,
    sinks: Mutex<HashMap<String, SinkEntry>>,
    paths: Mutex<HashMap<String, PathEntry>>,
    sync_groups: HashMap<String, Arc<SyncGroup>>,
    cleanup_join: Mutex<Option<JoinHandle<()>>>,
}

/// The running engine. Cloning shares the same live topology; every clone
/// can call every method.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Builds the engine: binds every configured receiver, starts the
    /// timeshift cleanup thread, and spawns the background task that
    /// attaches paths whose source tag was pending when they were declared.
    ///
    /// `runtime` must belong to a multi-thread Tokio runtime still running
    /// when this returns, since the discovery task and any WebRTC sinks
    /// spawn work onto it for the engine's lifetime.
    pub fn new(config: EngineConfig, runtime: tokio::runtime::Handle) -> RouterResult<Self> {
        let events = Arc::new(BroadcastEventBridge::new(config.discovery_channel_capacity));
        let emitter: Arc<dyn EventEmitter> = events.clone();
        let applier = Arc::new(ConfigApplier::new(emitter.clone()));
        let manager = TimeshiftManager::new(config.timeshift, config.max_clock_pending_packets);
        let stop = StopSignal::new();

        let mut receivers = Vec::new();
        for recv_cfg in &config.scream_receivers {
            let handle = spawn_scream_udp_receiver(*recv_cfg, manager.clone(), emitter.clone())?;
            receivers.push(ReceiverEntry {
                kind: crate::receivers::scream_udp::RECEIVER_KIND,
                description: recv_cfg.bind_addr.to_string(),
                handle,
            });
        }
        for recv_cfg in &config.rtp_receivers {
            let handle = spawn_rtp_receiver(*recv_cfg, manager.clone(), emitter.clone())?;
            receivers.push(ReceiverEntry {
                kind: crate::receivers::rtp::RECEIVER_KIND,
                description: recv_cfg.bind_addr.to_string(),
                handle,
            });
        }

        let sync_groups = config
            .sync_groups
            .iter()
            .map(|g| (g.group_id.clone(), Arc::new(SyncGroup::new(g.members.clone(), g.barrier))))
            .collect();

        let cleanup_join = manager.spawn_cleanup_thread(config.cleanup_interval, stop.clone());

        let inner = Arc::new(Inner {
            manager,
            applier,
            events,
            runtime: runtime.clone(),
            stop,
            loop_max_sleep: config.loop_max_sleep,
            receivers: Mutex::new(receivers),
            sinks: Mutex::new(HashMap::new()),
            paths: Mutex::new(HashMap::new()),
            sync_groups,
            cleanup_join: Mutex::new(Some(cleanup_join)),
        });

        let engine = Self { inner };
        engine.spawn_discovery_loop(&runtime);
        Ok(engine)
    }

    /// Subscribes to the discovery event stream and attaches any path the
    /// applier had parked as pending once its source tag is finally seen
    /// (spec 4.6 step 4: "re-run the apply step for the affected paths
    /// only"). Runs for the engine's lifetime; wakes at least every 500ms
    /// to notice a stop request even with no discovery traffic.
    fn spawn_discovery_loop(&self, runtime: &tokio::runtime::Handle) {
        let engine = self.clone();
        let mut rx = engine.inner.events.subscribe();
        runtime.spawn(async move {
            loop {
                match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                    Ok(Ok(BroadcastEvent::Discovery(DiscoveryEvent::TagSeen { tag, .. }))) => {
                        for path in engine.inner.applier.resolve_pending_tag(&tag) {
                            if let Err(err) = engine.attach_path(&path) {
                                log::warn!("[engine] failed to attach newly-resolved path {}: {err}", path.path_id);
                            }
                        }
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                    Ok(Err(broadcast::error::RecvError::Closed)) => break,
                    Err(_elapsed) => {
                        if engine.inner.stop.is_stopped() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Diffs `desired` against the live topology and actually instantiates
    /// or tears down receivers-independent sinks and paths accordingly.
    /// Removal happens before creation, and paths are removed/attached
    /// around their sinks (spec 4.6 "sinks before paths on create, paths
    /// before sinks on remove"). Returns one message per item that could
    /// not be applied; a fully successful call returns an empty vec.
    pub fn apply_state(&self, desired: DesiredState) -> Vec<String> {
        let plan = self.inner.applier.apply_state(desired);
        let mut errors = Vec::new();

        for path_id in &plan.paths_to_remove {
            self.remove_path(path_id);
        }
        for sink_id in &plan.sinks_to_remove {
            self.remove_sink(sink_id);
        }
        for sink in plan.sinks_to_add.iter().chain(plan.sinks_to_update.iter()) {
            if let Err(err) = self.upsert_sink(sink) {
                errors.push(format!("sink {}: {err}", sink.sink_id));
            }
        }
        for path in plan.paths_to_add.iter().chain(plan.paths_to_update.iter()) {
            if let Err(err) = self.attach_path(path) {
                errors.push(format!("path {}: {err}", path.path_id));
            }
        }

        errors
    }

    fn upsert_sink(&self, desired: &SinkDesired) -> RouterResult<()> {
        self.remove_sink(&desired.sink_id);
        let config = desired.config.clone();

        let transport: Box<dyn crate::sink::SinkTransport> = match config.protocol {
            SinkProtocol::ScreamUdp => {
                let dest = config
                    .destination
                    .ok_or_else(|| RouterError::Configuration("scream-udp sink requires a destination".into()))?;
                Box::new(ScreamUdpSender::new(dest)?)
            }
            SinkProtocol::Rtp => {
                let dest = config
                    .destination
                    .ok_or_else(|| RouterError::Configuration("rtp sink requires a destination".into()))?;
                Box::new(RtpSender::new(dest, config.rtp_ssrc)?)
            }
            // WebRTC's real distribution is the side-tap fan-out below; the
            // mixer's primary transport has nothing left to do.
            SinkProtocol::WebRtc | SinkProtocol::Alsa => Box::new(NullSender),
        };

        let pacing = Box::new(WallClockPacing::new(config.frames_per_chunk, config.output_format.sample_rate));
        let mut mixer = SinkMixer::new(config.clone(), pacing, transport, self.inner.events.clone());

        if let Some(group_name) = &config.sync_group {
            let group = self
                .inner
                .sync_groups
                .get(group_name)
                .ok_or_else(|| RouterError::Configuration(format!("unknown sync group {group_name}")))?;
            mixer.set_sync_group(group.clone());
        }

        let webrtc_manager = if config.protocol == SinkProtocol::WebRtc {
            let manager = Arc::new(WebRtcListenerManager::new(
                config.sink_id.clone(),
                self.inner.runtime.clone(),
                self.inner.events.clone(),
            ));
            mixer.set_side_tap(Box::new(WebRtcSideTap(manager.clone())));
            Some(manager)
        } else {
            None
        };

        let output_format = config.output_format;
        let protocol = config.protocol;
        let handle = spawn_sink_mixer(mixer);

        self.inner.sinks.lock().insert(
            desired.sink_id.clone(),
            SinkEntry {
                handle,
                protocol,
                output_format,
                webrtc: webrtc_manager,
            },
        );
        Ok(())
    }

    fn attach_path(&self, desired: &PathDesired) -> RouterResult<()> {
        self.remove_path(&desired.path_id);

        let (command_sender, output_format) = {
            let sinks = self.inner.sinks.lock();
            let sink = sinks
                .get(&desired.target_sink_id)
                .ok_or_else(|| RouterError::NotFound(desired.target_sink_id.clone()))?;
            (sink.handle.command_sender(), sink.output_format)
        };

        let mut config = desired.config.clone();
        config.output_format = output_format;

        let cursor = self
            .inner
            .manager
            .register_cursor(desired.source_tag.clone(), config.initial_lag_sec());
        let output = Arc::new(OutputQueue::new(config.max_ready_chunks, config.max_ready_queue_duration));
        let input_channels = config.expected_input_channels;

        let handle = spawn_source_processor(
            config,
            self.inner.manager.clone(),
            cursor,
            output.clone(),
            self.inner.events.clone(),
            input_channels,
            self.inner.loop_max_sleep,
        );

        let _ = command_sender.send(MixerCommand::AddLane(desired.path_id.clone(), output.clone()));

        self.inner.paths.lock().insert(
            desired.path_id.clone(),
            PathEntry {
                handle,
                output,
                cursor,
                source_tag: desired.source_tag.clone(),
                target_sink_id: desired.target_sink_id.clone(),
            },
        );
        Ok(())
    }

    fn remove_path(&self, path_id: &str) {
        let Some(entry) = self.inner.paths.lock().remove(path_id) else {
            return;
        };
        self.inner.manager.unregister_cursor(entry.cursor);
        if let Some(sink) = self.inner.sinks.lock().get(&entry.target_sink_id) {
            sink.handle.send(MixerCommand::RemoveLane(path_id.to_string()));
        }
        entry.handle.stop_and_join();
    }

    fn remove_sink(&self, sink_id: &str) {
        let stray_paths: Vec<String> = self
            .inner
            .paths
            .lock()
            .iter()
            .filter(|(_, entry)| entry.target_sink_id == sink_id)
            .map(|(id, _)| id.clone())
            .collect();
        for path_id in stray_paths {
            self.remove_path(&path_id);
        }
        let Some(entry) = self.inner.sinks.lock().remove(sink_id) else {
            return;
        };
        entry.handle.stop_and_join();
    }

    /// Live volume adjustment outside a full `apply_state` round-trip
    /// (design note "publish-swap"): pushes straight to the processor's
    /// command channel without touching the applier's shadow state.
    pub fn set_path_volume(&self, path_id: &str, volume: f32) -> RouterResult<()> {
        let paths = self.inner.paths.lock();
        let entry = paths.get(path_id).ok_or_else(|| RouterError::NotFound(path_id.to_string()))?;
        entry.handle.send(ProcessorCommand::SetVolume(volume));
        Ok(())
    }

    /// Live EQ adjustment; see [`Self::set_path_volume`].
    pub fn set_path_eq_gains(&self, path_id: &str, gains: crate::dsp::EqGains) -> RouterResult<()> {
        let paths = self.inner.paths.lock();
        let entry = paths.get(path_id).ok_or_else(|| RouterError::NotFound(path_id.to_string()))?;
        entry.handle.send(ProcessorCommand::SetEqGains(gains));
        Ok(())
    }

    /// Negotiates a new WebRTC listener on `sink_id` (spec 4.5).
    pub fn add_listener<F, G>(
        &self,
        sink_id: &str,
        listener_id: impl Into<String>,
        offer_sdp: String,
        on_local_description: F,
        on_ice_candidate: G,
    ) -> RouterResult<()>
    where
        F: FnOnce(String) + Send + 'static,
        G: Fn(String, Option<String>) + Send + Sync + 'static,
    {
        let manager = self.webrtc_manager(sink_id)?;
        manager.add_listener(listener_id, offer_sdp, on_local_description, on_ice_candidate)
    }

    pub fn add_remote_ice(&self, sink_id: &str, listener_id: &str, candidate: String, sdp_mid: Option<String>) -> RouterResult<()> {
        let manager = self.webrtc_manager(sink_id)?;
        manager.add_remote_ice(listener_id, candidate, sdp_mid)
    }

    pub fn remove_listener(&self, sink_id: &str, listener_id: &str) -> RouterResult<()> {
        let manager = self.webrtc_manager(sink_id)?;
        manager.remove_listener(listener_id);
        Ok(())
    }

    fn webrtc_manager(&self, sink_id: &str) -> RouterResult<Arc<WebRtcListenerManager>> {
        let sinks = self.inner.sinks.lock();
        let sink = sinks.get(sink_id).ok_or_else(|| RouterError::NotFound(sink_id.to_string()))?;
        sink.webrtc
            .clone()
            .ok_or_else(|| RouterError::Configuration(format!("sink {sink_id} is not a webrtc sink")))
    }

    #[must_use]
    pub fn list_seen_tags(&self) -> Vec<SourceTag> {
        self.inner.manager.known_tags()
    }

    #[must_use]
    pub fn export_timeshift(&self, tag: &str, lookback_sec: f64) -> Option<crate::timeshift::TimeshiftExport> {
        self.inner.manager.export_window(tag, lookback_sec)
    }

    /// Builds a full [`StatsSnapshot`] by reading every lock-free counter
    /// this module exposes; never takes a lock the data plane also holds
    /// during DSP or mixing (spec 6 "Control-plane contract").
    #[must_use]
    pub fn get_stats(&self) -> StatsSnapshot {
        let receivers = self.inner.receivers.lock();
        let mut packets_received = 0u64;
        let mut packets_dropped_malformed = 0u64;
        let streams = receivers
            .iter()
            .map(|r| {
                let received = r.handle.stats().packets_received.load(std::sync::atomic::Ordering::Relaxed);
                let malformed = r.handle.stats().malformed_dropped.load(std::sync::atomic::Ordering::Relaxed);
                packets_received += received;
                packets_dropped_malformed += malformed;
                StreamStats {
                    tag: r.description.clone(),
                    receiver_kind: r.kind,
                    malformed_dropped: malformed,
                    packets_received: received,
                }
            })
            .collect();
        drop(receivers);

        let sinks_guard = self.inner.sinks.lock();
        let sinks: Vec<SinkStats> = sinks_guard
            .iter()
            .map(|(id, entry)| {
                let rt = entry.handle.runtime_stats();
                SinkStats {
                    sink_id: id.clone(),
                    frames_emitted: rt.frames_emitted.load(std::sync::atomic::Ordering::Relaxed),
                    faulted: rt.faulted.load(std::sync::atomic::Ordering::Relaxed),
                    lane_count: rt.lane_count.load(std::sync::atomic::Ordering::Relaxed),
                    webrtc_listener_count: entry.webrtc.as_ref().map_or(0, |w| w.listener_count()),
                }
            })
            .collect();
        let active_sinks = sinks_guard.len();
        drop(sinks_guard);

        let paths_guard = self.inner.paths.lock();
        let sources: Vec<SourceStats> = paths_guard
            .iter()
            .map(|(id, entry)| {
                let snapshot = self.inner.manager.cursor_snapshot(entry.cursor);
                let resample_ratio = entry.handle.runtime_stats().resample_ratio();
                SourceStats {
                    path_id: id.clone(),
                    source_tag: entry.source_tag.clone(),
                    resample_ratio,
                    playback_rate: snapshot.as_ref().map_or(1.0, |s| s.playback_rate),
                    buffer_level_ms: snapshot.as_ref().map_or(0.0, |s| s.buffer_level_ms),
                    underrun_count: snapshot.as_ref().map_or(0, |s| s.underrun_count),
                    overrun_count: snapshot.as_ref().map_or(0, |s| s.overrun_count),
                    output_queue_depth: entry.output.len(),
                    output_queue_dropped: entry.output.dropped_overflow(),
                }
            })
            .collect();
        let active_paths = paths_guard.len();
        drop(paths_guard);

        StatsSnapshot {
            global: GlobalStats {
                packets_received,
                packets_dropped_malformed,
                packets_dropped_backpressure: self.inner.manager.packets_dropped_backpressure(),
                active_tags: self.inner.manager.known_tags().len(),
                active_sinks,
                active_paths,
            },
            sinks,
            sources,
            streams,
        }
    }

    /// Requests every receiver, processor, and mixer thread to stop and
    /// joins them, then joins the timeshift cleanup thread. The background
    /// discovery task observes the same stop signal and exits within its
    /// own 500ms poll interval.
    pub fn stop(&self) {
        self.inner.stop.stop();
        for (_, entry) in self.inner.paths.lock().drain() {
            entry.handle.stop_and_join();
        }
        for (_, entry) in self.inner.sinks.lock().drain() {
            entry.handle.stop_and_join();
        }
        for entry in self.inner.receivers.lock().drain(..) {
            entry.handle.stop_and_join();
        }
        if let Some(join) = self.inner.cleanup_join.lock().take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::{DesiredState, PathDesired, SinkDesired};
    use crate::packet::FormatDescriptor;
    use crate::processor::SourcePathConfig;
    use crate::sink::SinkConfig;

    fn fmt() -> FormatDescriptor {
        FormatDescriptor::new(48000, 16, 2, 0x0003)
    }

    fn test_engine() -> (Engine, tokio::runtime::Runtime) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let engine = rt
            .block_on(async { Engine::new(EngineConfig::default(), tokio::runtime::Handle::current()) })
            .expect("engine construction should succeed with no receivers configured");
        (engine, rt)
    }

    #[test]
    fn apply_state_with_only_a_sink_creates_it() {
        let (engine, _rt) = test_engine();
        let mut sink_config = SinkConfig::new("sink1", SinkProtocol::ScreamUdp, fmt());
        sink_config.destination = Some("93.184.216.34:4010".parse().unwrap());
        let errors = engine.apply_state(DesiredState {
            sinks: vec![SinkDesired {
                sink_id: "sink1".into(),
                config: sink_config,
            }],
            paths: vec![],
        });
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        let stats = engine.get_stats();
        assert_eq!(stats.global.active_sinks, 1);
        engine.stop();
    }

    #[test]
    fn path_targeting_unknown_sink_is_reported_as_an_error() {
        let (engine, _rt) = test_engine();
        let errors = engine.apply_state(DesiredState {
            sinks: vec![],
            paths: vec![PathDesired {
                path_id: "p1".into(),
                source_tag: "10.0.0.5".into(),
                target_sink_id: "ghost".into(),
                config: SourcePathConfig::new("p1", fmt()),
            }],
        });
        assert!(!errors.is_empty());
        engine.stop();
    }

    #[test]
    fn sink_missing_a_destination_is_rejected() {
        let (engine, _rt) = test_engine();
        let errors = engine.apply_state(DesiredState {
            sinks: vec![SinkDesired {
                sink_id: "sink1".into(),
                config: SinkConfig::new("sink1", SinkProtocol::Rtp, fmt()),
            }],
            paths: vec![],
        });
        assert!(!errors.is_empty());
        engine.stop();
    }

    #[test]
    fn removing_a_sink_also_tears_down_its_paths() {
        let (engine, _rt) = test_engine();
        let mut sink_config = SinkConfig::new("sink1", SinkProtocol::ScreamUdp, fmt());
        sink_config.destination = Some("93.184.216.34:4010".parse().unwrap());
        engine.apply_state(DesiredState {
            sinks: vec![SinkDesired {
                sink_id: "sink1".into(),
                config: sink_config,
            }],
            paths: vec![],
        });

        let stats = engine.get_stats();
        assert_eq!(stats.global.active_sinks, 1);

        engine.apply_state(DesiredState {
            sinks: vec![],
            paths: vec![],
        });
        let stats = engine.get_stats();
        assert_eq!(stats.global.active_sinks, 0);
        engine.stop();
    }
}
