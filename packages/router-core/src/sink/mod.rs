//! The per-sink mixer: sums ready chunks from its connected paths,
//! packetizes for the configured transport, and paces its own tick either
//! from the wall clock or a playback device's hardware clock (spec 4.4).

pub mod pacing;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

pub use pacing::{
    HardwareClockPacing, HardwareClockSource, PacingClock, SyncBarrierConfig, SyncGroup,
    SyncOutcome, WallClockPacing,
};

use crate::error::RouterResult;
use crate::events::{EventEmitter, SinkEvent};
use crate::packet::FormatDescriptor;
use crate::processor::OutputQueue;
use crate::runtime::StopSignal;
use crate::utils::now_millis;

/// Which wire protocol (or local device) a sink emits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinkProtocol {
    ScreamUdp,
    Rtp,
    WebRtc,
    Alsa,
}

/// Static configuration for one sink (spec 3 "Sink").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub sink_id: String,
    pub protocol: SinkProtocol,
    pub output_format: FormatDescriptor,
    pub frames_per_chunk: usize,
    pub mp3_side_tap: bool,
    pub time_sync: bool,
    pub lane_wait_deadline: Duration,
    pub underrun_hold_timeout: Duration,
    /// Destination address/port for network transports (`ScreamUdp`,
    /// `Rtp`); unused for `WebRtc` (per-listener, negotiated) and `Alsa`
    /// (local device, no network destination).
    pub destination: Option<SocketAddr>,
    /// RTP SSRC to stamp on this sink's stream; ignored for other
    /// protocols. Defaults to a fixed, recognizable value rather than a
    /// random one so config snapshots stay reproducible across restarts.
    pub rtp_ssrc: u32,
    /// Sync group this sink participates in for cross-sink alignment
    /// (spec 4.4 "Cross-sink sync"); sinks sharing a group id are
    /// barrier-synchronized by the engine.
    pub sync_group: Option<String>,
}

impl SinkConfig {
    #[must_use]
    pub fn new(sink_id: impl Into<String>, protocol: SinkProtocol, output_format: FormatDescriptor) -> Self {
        Self {
            sink_id: sink_id.into(),
            protocol,
            output_format,
            frames_per_chunk: 1152,
            mp3_side_tap: false,
            time_sync: false,
            lane_wait_deadline: Duration::from_millis(20),
            underrun_hold_timeout: Duration::from_millis(500),
            destination: None,
            rtp_ssrc: 0x5CA1_AB1E,
            sync_group: None,
        }
    }
}

/// Per-lane state machine (spec 4.4 "State machine per lane").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    Pending,
    Ready,
    Consumed,
    Stale,
}

struct Lane {
    queue: Arc<OutputQueue>,
    state: LaneState,
    last_chunk_at: Option<Instant>,
    underrun_count: u64,
}

/// Where a sink mixer hands off its mixed, packetized PCM. Implemented once
/// per transport (Scream-UDP, RTP, WebRTC, ALSA) in `senders`/`webrtc`; the
/// mixer itself is transport-agnostic.
pub trait SinkTransport: Send {
    fn send_chunk(&mut self, pcm: &[u8], format: &FormatDescriptor) -> RouterResult<()>;
}

/// Optional second consumer of the mixed PCM, e.g. an MP3 encoder feeding
/// an HTTP listener queue (spec 4.4 step 4). Out of scope to implement for
/// real; this is the trait seam a concrete encoder would plug into.
pub trait SideTapConsumer: Send {
    fn publish(&mut self, pcm: &[u8], format: &FormatDescriptor);
}

/// Lock-free mirror of a running [`SinkMixer`]'s health counters, so
/// `Engine::get_stats` can read them without taking the mixer off its own
/// thread (spec 5: "no thread may hold a lock across DSP or mixing work").
#[derive(Default)]
pub struct SinkRuntimeStats {
    pub frames_emitted: AtomicU64,
    pub faulted: AtomicBool,
    pub lane_count: AtomicUsize,
    pub webrtc_listener_count: AtomicUsize,
}

/// One sink's mixer: owns its lanes, its pacing clock, and its transport.
pub struct SinkMixer {
    config: SinkConfig,
    lanes: HashMap<String, Lane>,
    pacing: Box<dyn PacingClock>,
    transport: Box<dyn SinkTransport>,
    side_tap: Option<Box<dyn SideTapConsumer>>,
    sync_group: Option<Arc<SyncGroup>>,
    emitter: Arc<dyn EventEmitter>,
    faulted: bool,
    frames_emitted: u64,
    runtime_stats: Arc<SinkRuntimeStats>,
}

impl SinkMixer {
    #[must_use]
    pub fn new(
        config: SinkConfig,
        pacing: Box<dyn PacingClock>,
        transport: Box<dyn SinkTransport>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            config,
            lanes: HashMap::new(),
            pacing,
            transport,
            side_tap: None,
            sync_group: None,
            emitter,
            faulted: false,
            frames_emitted: 0,
            runtime_stats: Arc::new(SinkRuntimeStats::default()),
        }
    }

    /// Shared handle to this mixer's runtime counters, safe to read from
    /// any thread while the mixer ticks on its own.
    #[must_use]
    pub fn runtime_stats(&self) -> Arc<SinkRuntimeStats> {
        self.runtime_stats.clone()
    }

    pub fn set_side_tap(&mut self, side_tap: Box<dyn SideTapConsumer>) {
        self.side_tap = Some(side_tap);
    }

    pub fn set_sync_group(&mut self, group: Arc<SyncGroup>) {
        self.sync_group = Some(group);
    }

    /// Adds or replaces the input lane for `path_id`.
    pub fn add_lane(&mut self, path_id: String, queue: Arc<OutputQueue>) {
        self.lanes.insert(
            path_id,
            Lane {
                queue,
                state: LaneState::Pending,
                last_chunk_at: None,
                underrun_count: 0,
            },
        );
        self.runtime_stats.lane_count.store(self.lanes.len(), Ordering::Relaxed);
    }

    pub fn remove_lane(&mut self, path_id: &str) {
        self.lanes.remove(path_id);
        self.runtime_stats.lane_count.store(self.lanes.len(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    #[must_use]
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    #[must_use]
    pub fn sink_id(&self) -> &str {
        &self.config.sink_id
    }

    /// Runs one tick: waits for the pacing clock, sums all lanes, packetizes
    /// and sends. Returns `false` once the pacing clock reports a stop.
    pub fn tick(&mut self, stop: &StopSignal) -> bool {
        let Some(frames) = self.pacing.wait_for_tick(stop) else {
            return false;
        };
        if frames == 0 {
            return true;
        }
        self.runtime_stats.lane_count.store(self.lanes.len(), Ordering::Relaxed);

        if let Some(group) = &self.sync_group {
            match group.arrive(&self.config.sink_id) {
                SyncOutcome::Aligned { rate_multiplier } => {
                    self.pacing.apply_rate_multiplier(rate_multiplier);
                }
                SyncOutcome::Missed => {
                    self.emit_silence(frames);
                    return true;
                }
            }
        }

        let channels = self.config.output_format.channels as usize;
        let mut mix = vec![0i32; frames * channels];

        for lane in self.lanes.values_mut() {
            let chunk = lane.queue.try_pop();
            match chunk {
                Some(chunk) => {
                    lane.state = LaneState::Ready;
                    lane.last_chunk_at = Some(Instant::now());
                    mix_chunk_into(&mut mix, &chunk.payload, &chunk.format, frames, channels);
                    lane.state = LaneState::Consumed;
                }
                None => {
                    lane.underrun_count += 1;
                    let stale = lane
                        .last_chunk_at
                        .map(|t| t.elapsed() > self.config.underrun_hold_timeout)
                        .unwrap_or(true);
                    lane.state = if stale { LaneState::Stale } else { LaneState::Pending };
                }
            }
        }

        let pcm = saturate_to_output(&mix, self.config.output_format.bit_depth);
        self.frames_emitted += frames as u64;
        self.runtime_stats.frames_emitted.store(self.frames_emitted, Ordering::Relaxed);

        if let Some(side_tap) = &mut self.side_tap {
            side_tap.publish(&pcm, &self.config.output_format);
        }

        match self.transport.send_chunk(&pcm, &self.config.output_format) {
            Ok(()) => {
                if self.faulted {
                    self.faulted = false;
                    self.runtime_stats.faulted.store(false, Ordering::Relaxed);
                    self.emitter.emit_sink(SinkEvent::Recovered {
                        sink_id: self.config.sink_id.clone(),
                        timestamp: now_millis(),
                    });
                }
            }
            Err(err) => {
                self.faulted = true;
                self.runtime_stats.faulted.store(true, Ordering::Relaxed);
                self.emitter.emit_sink(SinkEvent::Faulted {
                    sink_id: self.config.sink_id.clone(),
                    reason: err.to_string(),
                    timestamp: now_millis(),
                });
            }
        }

        true
    }

    fn emit_silence(&mut self, frames: usize) {
        let channels = self.config.output_format.channels as usize;
        let mix = vec![0i32; frames * channels];
        let pcm = saturate_to_output(&mix, self.config.output_format.bit_depth);
        self.frames_emitted += frames as u64;
        self.runtime_stats.frames_emitted.store(self.frames_emitted, Ordering::Relaxed);
        let _ = self.transport.send_chunk(&pcm, &self.config.output_format);
    }
}

/// Live control messages for a running [`SinkMixer`], applied at the top of
/// each `tick` without requiring the caller to lock the mixer itself.
pub enum MixerCommand {
    AddLane(String, Arc<OutputQueue>),
    RemoveLane(String),
    SetSyncGroup(Arc<SyncGroup>),
}

/// A running [`SinkMixer`]'s thread handle, stop signal, and command
/// channel, plus the shared runtime stats handle taken before the mixer was
/// moved onto its own thread.
pub struct MixerHandle {
    stop: StopSignal,
    join: Option<JoinHandle<()>>,
    commands: Sender<MixerCommand>,
    runtime_stats: Arc<SinkRuntimeStats>,
}

impl MixerHandle {
    pub fn send(&self, command: MixerCommand) {
        let _ = self.commands.send(command);
    }

    /// A cloneable sender for this mixer's command channel, so a caller
    /// that only holds a reference to the owning sink entry (not this
    /// handle) can still push lane changes.
    #[must_use]
    pub fn command_sender(&self) -> Sender<MixerCommand> {
        self.commands.clone()
    }

    #[must_use]
    pub fn runtime_stats(&self) -> Arc<SinkRuntimeStats> {
        self.runtime_stats.clone()
    }

    pub fn stop_and_join(mut self) {
        self.stop.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for MixerHandle {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

/// Spawns a [`SinkMixer`] on its own OS thread, ticking it until `stop` is
/// requested or the pacing clock itself reports a stop (spec 5: "each sink
/// mixer owns one OS thread").
pub fn spawn_sink_mixer(mut mixer: SinkMixer) -> MixerHandle {
    let stop = StopSignal::new();
    let (tx, rx): (Sender<MixerCommand>, Receiver<MixerCommand>) = crossbeam_channel::unbounded();
    let runtime_stats = mixer.runtime_stats();
    let thread_stop = stop.clone();
    let sink_id = mixer.sink_id().to_string();

    let join = std::thread::Builder::new()
        .name(format!("sink-mixer-{sink_id}"))
        .spawn(move || {
            while !thread_stop.is_stopped() {
                while let Ok(command) = rx.try_recv() {
                    match command {
                        MixerCommand::AddLane(path_id, queue) => mixer.add_lane(path_id, queue),
                        MixerCommand::RemoveLane(path_id) => mixer.remove_lane(&path_id),
                        MixerCommand::SetSyncGroup(group) => mixer.set_sync_group(group),
                    }
                }
                if !mixer.tick(&thread_stop) {
                    break;
                }
            }
        })
        .expect("failed to spawn sink mixer thread");

    MixerHandle {
        stop,
        join: Some(join),
        commands: tx,
        runtime_stats,
    }
}

/// Adds one lane's PCM into the running 32-bit intermediate sum. The lane's
/// own format may momentarily differ from the sink's target at a path-swap
/// boundary; frames beyond either buffer's length are treated as silence.
fn mix_chunk_into(mix: &mut [i32], payload: &[u8], format: &FormatDescriptor, frames: usize, channels: usize) {
    let bytes_per_sample = format.bit_depth as usize / 8;
    let frame_bytes = format.frame_bytes();
    let available_frames = if frame_bytes == 0 { 0 } else { payload.len() / frame_bytes };

    for frame in 0..frames.min(available_frames) {
        for ch in 0..channels.min(format.channels as usize) {
            let offset = frame * frame_bytes + ch * bytes_per_sample;
            let raw = read_sample_i32(&payload[offset..offset + bytes_per_sample], format.bit_depth);
            mix[frame * channels + ch] = mix[frame * channels + ch].saturating_add(raw);
        }
    }
}

fn read_sample_i32(bytes: &[u8], bit_depth: u8) -> i32 {
    match bit_depth {
        16 => i16::from_le_bytes([bytes[0], bytes[1]]) as i32,
        24 => {
            let raw = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]);
            (raw << 8) >> 8
        }
        32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        _ => 0,
    }
}

/// Saturates the 32-bit intermediate mix down to the sink's output bit
/// depth and packs it interleaved (spec 4.4 step 2: "saturate to the sink's
/// bit depth on output").
fn saturate_to_output(mix: &[i32], bit_depth: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(mix.len() * (bit_depth as usize / 8));
    let max = (1i64 << (bit_depth - 1)) - 1;
    let min = -(1i64 << (bit_depth - 1));
    for &sample in mix {
        let clamped = (sample as i64).clamp(min, max);
        match bit_depth {
            16 => out.extend_from_slice(&(clamped as i16).to_le_bytes()),
            24 => out.extend_from_slice(&(clamped as i32).to_le_bytes()[..3]),
            32 => out.extend_from_slice(&(clamped as i32).to_le_bytes()),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::processor::OutputChunk;

    struct NullTransport {
        sent: Vec<Vec<u8>>,
        fail_next: bool,
    }

    impl SinkTransport for NullTransport {
        fn send_chunk(&mut self, pcm: &[u8], _format: &FormatDescriptor) -> RouterResult<()> {
            if self.fail_next {
                self.fail_next = false;
                return Err(crate::error::RouterError::Transport("simulated failure".into()));
            }
            self.sent.push(pcm.to_vec());
            Ok(())
        }
    }

    struct ImmediatePacing {
        frames: usize,
    }

    impl PacingClock for ImmediatePacing {
        fn wait_for_tick(&mut self, _stop: &StopSignal) -> Option<usize> {
            Some(self.frames)
        }
    }

    fn fmt() -> FormatDescriptor {
        FormatDescriptor::new(48000, 16, 2, 0x0003)
    }

    fn mixer() -> SinkMixer {
        let config = SinkConfig::new("sink1", SinkProtocol::ScreamUdp, fmt());
        SinkMixer::new(
            config,
            Box::new(ImmediatePacing { frames: 4 }),
            Box::new(NullTransport {
                sent: Vec::new(),
                fail_next: false,
            }),
            Arc::new(NoopEventEmitter),
        )
    }

    #[test]
    fn tick_with_no_lanes_still_emits_silence() {
        let mut mixer = mixer();
        let stop = StopSignal::new();
        assert!(mixer.tick(&stop));
        assert_eq!(mixer.frames_emitted(), 4);
    }

    #[test]
    fn two_lanes_sum_without_clipping_under_half_scale() {
        let mut mixer = mixer();
        let queue_a = Arc::new(OutputQueue::new(4, Duration::from_secs(1)));
        let queue_b = Arc::new(OutputQueue::new(4, Duration::from_secs(1)));
        let payload = |v: i16| -> Vec<u8> {
            let mut out = Vec::new();
            for _ in 0..4 {
                out.extend_from_slice(&v.to_le_bytes());
                out.extend_from_slice(&v.to_le_bytes());
            }
            out
        };
        queue_a.push(OutputChunk {
            payload: payload(1000),
            format: fmt(),
            frames: 4,
            produced_at: Instant::now(),
        });
        queue_b.push(OutputChunk {
            payload: payload(500),
            format: fmt(),
            frames: 4,
            produced_at: Instant::now(),
        });
        mixer.add_lane("a".into(), queue_a);
        mixer.add_lane("b".into(), queue_b);

        let stop = StopSignal::new();
        mixer.tick(&stop);
        assert_eq!(mixer.lane_count(), 2);
    }

    #[test]
    fn transport_failure_marks_sink_faulted_then_recovers() {
        let config = SinkConfig::new("sink1", SinkProtocol::ScreamUdp, fmt());
        let mut mixer = SinkMixer::new(
            config,
            Box::new(ImmediatePacing { frames: 4 }),
            Box::new(NullTransport {
                sent: Vec::new(),
                fail_next: true,
            }),
            Arc::new(NoopEventEmitter),
        );
        let stop = StopSignal::new();
        mixer.tick(&stop);
        assert!(mixer.is_faulted());
        mixer.tick(&stop);
        assert!(!mixer.is_faulted());
    }

    #[test]
    fn remove_lane_drops_it_from_future_ticks() {
        let mut mixer = mixer();
        mixer.add_lane("a".into(), Arc::new(OutputQueue::new(4, Duration::from_secs(1))));
        assert_eq!(mixer.lane_count(), 1);
        mixer.remove_lane("a");
        assert_eq!(mixer.lane_count(), 0);
    }

    #[test]
    fn saturate_to_output_clamps_overflowing_sums() {
        let mix = vec![i32::MAX, i32::MIN];
        let bytes = saturate_to_output(&mix, 16);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), i16::MIN);
    }
}
