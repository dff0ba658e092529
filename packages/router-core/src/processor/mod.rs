//! The per-path source processor: reads from its timeshift cursor and runs
//! the DSP chain described in spec 4.3, delivering fixed-size chunks onto a
//! bounded, drop-oldest output queue the sink mixer drains from.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::dsp::{
    ChannelMatrix, DcBlocker, Dither, EqChain, EqGains, NormalizeParams, Normalizer, PlanarBuffer,
    Resampler, VolumeControl,
};
use crate::events::{EventEmitter, StreamEvent};
use crate::packet::FormatDescriptor;
use crate::runtime::StopSignal;
use crate::timeshift::{CursorHandle, ReadOutcome, TimeshiftManager};
use crate::utils::now_millis;

/// Per-path tunables that together configure one [`SourceProcessor`]'s DSP
/// chain. Corresponds to the "source path" attributes in spec 3 plus the
/// tunable parameters named in spec 6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePathConfig {
    pub path_id: String,
    pub frames_per_chunk: usize,
    pub output_format: FormatDescriptor,
    /// Channel count assumed for the input stream before its first packet
    /// has been seen; the auto channel matrix is rebuilt once the first
    /// real format descriptor arrives if it differs. Defaults to the
    /// output channel count so an unconfigured path starts as identity.
    pub expected_input_channels: usize,
    pub volume: f32,
    pub volume_smoothing_factor: f32,
    pub eq_gains: EqGains,
    pub dc_filter_cutoff_hz: f32,
    pub oversampling_factor: u32,
    pub normalize: NormalizeParams,
    pub normalize_enabled: bool,
    pub dither_noise_shaping_factor: f32,
    pub discontinuity_threshold_ms: u64,
    pub underrun_hold_timeout_ms: u64,
    pub max_ready_chunks: usize,
    pub max_ready_queue_duration: Duration,
    /// Seconds behind real-time this path's cursor should start at (spec 3
    /// "timeshift offset in seconds").
    pub timeshift_offset_sec: f64,
    /// Additional fixed delay, layered on top of `timeshift_offset_sec`
    /// (spec 3 "delay in ms") - typically used to align this path in time
    /// against others converging on the same sink.
    pub delay_ms: u64,
}

impl SourcePathConfig {
    #[must_use]
    pub fn new(path_id: impl Into<String>, output_format: FormatDescriptor) -> Self {
        let expected_input_channels = output_format.channels as usize;
        Self {
            path_id: path_id.into(),
            frames_per_chunk: 1152,
            output_format,
            expected_input_channels,
            volume: 1.0,
            volume_smoothing_factor: 0.05,
            eq_gains: EqGains::default(),
            dc_filter_cutoff_hz: 20.0,
            oversampling_factor: 32,
            normalize: NormalizeParams::default(),
            normalize_enabled: false,
            dither_noise_shaping_factor: 0.5,
            discontinuity_threshold_ms: 200,
            underrun_hold_timeout_ms: 500,
            max_ready_chunks: 64,
            max_ready_queue_duration: Duration::from_millis(2_000),
            timeshift_offset_sec: 0.0,
            delay_ms: 0,
        }
    }

    /// Total lag this path's cursor should start at: the user-dialed
    /// timeshift plus the fixed alignment delay.
    #[must_use]
    pub fn initial_lag_sec(&self) -> f64 {
        self.timeshift_offset_sec + self.delay_ms as f64 / 1000.0
    }
}

/// One chunk sitting in a path's output queue, ready for the sink mixer.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub payload: Vec<u8>,
    pub format: FormatDescriptor,
    pub frames: usize,
    pub produced_at: Instant,
}

/// Bounded, drop-oldest queue between one source processor and its sink
/// mixer. Capped by both chunk count and total buffered duration (spec 4.3:
/// "the path's ready queue is capped at `max_ready_chunks_per_source` and
/// `max_ready_queue_duration_ms`").
pub struct OutputQueue {
    chunks: Mutex<VecDeque<OutputChunk>>,
    max_chunks: usize,
    max_duration: Duration,
    dropped: AtomicU64,
}

impl OutputQueue {
    #[must_use]
    pub fn new(max_chunks: usize, max_duration: Duration) -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
            max_chunks,
            max_duration,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, chunk: OutputChunk) {
        let mut guard = self.chunks.lock();
        guard.push_back(chunk);
        while guard.len() > self.max_chunks {
            guard.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        while let Some(front) = guard.front() {
            let span = guard
                .back()
                .map(|back| back.produced_at.saturating_duration_since(front.produced_at))
                .unwrap_or(Duration::ZERO);
            if span > self.max_duration && guard.len() > 1 {
                guard.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            } else {
                break;
            }
        }
    }

    /// Non-blocking dequeue, used by the sink mixer's tick.
    #[must_use]
    pub fn try_pop(&self) -> Option<OutputChunk> {
        self.chunks.lock().pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dropped_overflow(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Lock-free mirror of a running [`SourceProcessor`]'s resample ratio, read
/// by `Engine::get_stats` without touching the processor's own thread.
#[derive(Default)]
pub struct ProcessorRuntimeStats {
    resample_ratio_bits: AtomicU64,
}

impl ProcessorRuntimeStats {
    fn store_ratio(&self, ratio: f64) {
        self.resample_ratio_bits.store(ratio.to_bits(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn resample_ratio(&self) -> f64 {
        f64::from_bits(self.resample_ratio_bits.load(Ordering::Relaxed))
    }
}

/// One source path's full DSP chain, owning its cursor and publishing to
/// its output queue.
pub struct SourceProcessor {
    config: SourcePathConfig,
    manager: TimeshiftManager,
    cursor: CursorHandle,
    output: Arc<OutputQueue>,
    emitter: Arc<dyn EventEmitter>,
    runtime_stats: Arc<ProcessorRuntimeStats>,

    resampler: Option<Resampler>,
    channel_matrix: ChannelMatrix,
    eq: EqChain,
    dc_block: DcBlocker,
    normalizer: Normalizer,
    volume: VolumeControl,
    dither: Dither,

    underrun_since: Option<Instant>,
}

impl SourceProcessor {
    #[must_use]
    pub fn new(
        config: SourcePathConfig,
        manager: TimeshiftManager,
        cursor: CursorHandle,
        output: Arc<OutputQueue>,
        emitter: Arc<dyn EventEmitter>,
        input_channels: usize,
    ) -> Self {
        let out_channels = config.output_format.channels as usize;
        let out_rate = config.output_format.sample_rate;
        let out_bit_depth = config.output_format.bit_depth;

        let runtime_stats = Arc::new(ProcessorRuntimeStats::default());
        runtime_stats.store_ratio(1.0);

        Self {
            channel_matrix: ChannelMatrix::auto(input_channels, out_channels),
            eq: EqChain::new(out_rate, out_channels, config.eq_gains),
            dc_block: DcBlocker::new(out_rate, config.dc_filter_cutoff_hz, out_channels),
            normalizer: Normalizer::new(config.normalize, config.normalize_enabled),
            volume: VolumeControl::new(config.volume, config.volume_smoothing_factor),
            dither: Dither::new(out_bit_depth, config.dither_noise_shaping_factor, out_channels),
            resampler: None,
            underrun_since: None,
            config,
            manager,
            cursor,
            output,
            emitter,
            runtime_stats,
        }
    }

    /// Shared handle to this processor's runtime counters, safe to read
    /// from any thread while the processor runs on its own.
    #[must_use]
    pub fn runtime_stats(&self) -> Arc<ProcessorRuntimeStats> {
        self.runtime_stats.clone()
    }

    /// Runs one iteration: read one chunk from the cursor, push it (or a
    /// silence substitute) through the DSP chain, and enqueue the result.
    pub fn process_once(&mut self) {
        let outcome = self
            .manager
            .read_next_chunk(self.cursor, self.config.frames_per_chunk);

        let (planar, input_format) = match outcome {
            ReadOutcome::Chunk {
                payload,
                format,
                frames,
                gap_ms,
            } => {
                self.underrun_since = None;
                if let Some(gap) = gap_ms {
                    if gap >= self.config.discontinuity_threshold_ms {
                        if let Some(resampler) = &mut self.resampler {
                            resampler.reset();
                        }
                        self.emitter.emit_stream(StreamEvent::Discontinuity {
                            path_id: self.config.path_id.clone(),
                            gap_ms: gap,
                            timestamp: now_millis(),
                        });
                    }
                }
                let planar = crate::dsp::format::decode(&payload, &format);
                debug_assert_eq!(planar.frames, frames);
                (planar, format)
            }
            ReadOutcome::Underrun => {
                let first = *self.underrun_since.get_or_insert_with(Instant::now);
                let held_ms = first.elapsed().as_millis() as u64;
                if held_ms < self.config.underrun_hold_timeout_ms && !self.output.is_empty() {
                    // Give the cursor a little more time before substituting
                    // silence; the mixer still has ready chunks to consume.
                    return;
                }
                self.emitter.emit_stream(StreamEvent::Underrun {
                    path_id: self.config.path_id.clone(),
                    timestamp: now_millis(),
                });
                let silence = PlanarBuffer::silence(
                    self.config.output_format.channels as usize,
                    self.config.frames_per_chunk,
                );
                (silence, self.config.output_format)
            }
        };

        let chunk = self.run_chain(planar, &input_format);
        self.output.push(chunk);
    }

    fn run_chain(&mut self, mut planar: PlanarBuffer, input_format: &FormatDescriptor) -> OutputChunk {
        if input_format.sample_rate != self.config.output_format.sample_rate {
            let resampler = self.resampler.get_or_insert_with(|| {
                Resampler::new(
                    input_format.sample_rate,
                    self.config.output_format.sample_rate,
                    planar.channel_count(),
                    self.config.oversampling_factor,
                )
            });
            planar = resampler.process(&planar);
            self.runtime_stats.store_ratio(resampler.ratio());
        }

        planar = self.channel_matrix.apply(&planar);
        planar = self.eq.process(&planar);
        planar = self.dc_block.process(&planar);
        planar = self.normalizer.process(&planar);
        planar = self.volume.process(&planar);
        planar = self.dither.process(&planar);

        let payload = crate::dsp::format::reinterleave(&planar, self.config.output_format.bit_depth);
        OutputChunk {
            frames: planar.frames,
            payload,
            format: self.config.output_format,
            produced_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn path_id(&self) -> &str {
        &self.config.path_id
    }

    /// Current output/input rate ratio, `1.0` until the first rate mismatch
    /// is observed and a resampler is instantiated.
    #[must_use]
    pub fn resample_ratio(&self) -> f64 {
        self.resampler.as_ref().map_or(1.0, Resampler::ratio)
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume.set_volume(volume);
    }

    pub fn set_eq_gains(&mut self, gains: EqGains) {
        self.eq.set_gains(gains);
    }
}

/// Live control messages delivered to a running [`SourceProcessor`] without
/// taking a lock on the DSP state itself (design note "publish-swap"):
/// drained at the top of each `process_once` iteration on the processor's
/// own thread.
#[derive(Debug, Clone)]
pub enum ProcessorCommand {
    SetVolume(f32),
    SetEqGains(EqGains),
}

/// A running [`SourceProcessor`]'s thread handle, stop signal, and command
/// channel. Mirrors the receivers module's `ReceiverHandle`.
pub struct ProcessorHandle {
    stop: StopSignal,
    join: Option<JoinHandle<()>>,
    commands: Sender<ProcessorCommand>,
    runtime_stats: Arc<ProcessorRuntimeStats>,
}

impl ProcessorHandle {
    pub fn send(&self, command: ProcessorCommand) {
        let _ = self.commands.send(command);
    }

    #[must_use]
    pub fn runtime_stats(&self) -> Arc<ProcessorRuntimeStats> {
        self.runtime_stats.clone()
    }

    pub fn stop_and_join(mut self) {
        self.stop.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ProcessorHandle {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

/// Spawns a [`SourceProcessor`] on its own OS thread, looping
/// `process_once` and sleeping in bounded increments of `loop_max_sleep`
/// so a stop request or queued command is never held up for long (spec 5:
/// "each source processor owns one OS thread").
pub fn spawn_source_processor(
    config: SourcePathConfig,
    manager: TimeshiftManager,
    cursor: CursorHandle,
    output: Arc<OutputQueue>,
    emitter: Arc<dyn EventEmitter>,
    input_channels: usize,
    loop_max_sleep: Duration,
) -> ProcessorHandle {
    let stop = StopSignal::new();
    let (tx, rx): (Sender<ProcessorCommand>, Receiver<ProcessorCommand>) = crossbeam_channel::unbounded();
    let thread_stop = stop.clone();
    let path_id = config.path_id.clone();

    let mut processor = SourceProcessor::new(config, manager, cursor, output, emitter, input_channels);
    let runtime_stats = processor.runtime_stats();

    let join = std::thread::Builder::new()
        .name(format!("source-processor-{path_id}"))
        .spawn(move || {
            while !thread_stop.is_stopped() {
                while let Ok(command) = rx.try_recv() {
                    match command {
                        ProcessorCommand::SetVolume(v) => processor.set_volume(v),
                        ProcessorCommand::SetEqGains(gains) => processor.set_eq_gains(gains),
                    }
                }
                processor.process_once();
                if thread_stop.wait(loop_max_sleep) {
                    break;
                }
            }
        })
        .expect("failed to spawn source processor thread");

    ProcessorHandle {
        stop,
        join: Some(join),
        commands: tx,
        runtime_stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::timeshift::{TimeshiftConfig, TimeshiftManager};
    use bytes::Bytes;

    fn fmt() -> FormatDescriptor {
        FormatDescriptor::new(48000, 16, 2, 0x0003)
    }

    fn build_processor() -> (SourceProcessor, TimeshiftManager) {
        let manager = TimeshiftManager::new(TimeshiftConfig::default(), 10_000);
        let cursor = manager.register_cursor("tag".into(), 0.0);
        let queue = Arc::new(OutputQueue::new(64, Duration::from_millis(2_000)));
        let config = SourcePathConfig::new("p1", fmt());
        let processor = SourceProcessor::new(
            config,
            manager.clone(),
            cursor,
            queue,
            Arc::new(NoopEventEmitter),
            2,
        );
        (processor, manager)
    }

    #[test]
    fn underrun_with_no_prior_output_immediately_substitutes_silence() {
        let (mut processor, _manager) = build_processor();
        processor.process_once();
        assert_eq!(processor.output.len(), 1);
    }

    #[test]
    fn chunk_with_data_flows_through_to_output_queue() {
        let (mut processor, manager) = build_processor();
        let pkt = crate::packet::TaggedAudioPacket::new(
            "tag".into(),
            Bytes::from(vec![0u8; 1152 * 4]),
            fmt(),
        );
        manager.add_packet(pkt);
        processor.process_once();
        assert_eq!(processor.output.len(), 1);
    }

    #[test]
    fn output_queue_drops_oldest_past_chunk_cap() {
        let queue = OutputQueue::new(2, Duration::from_secs(10));
        for _ in 0..5 {
            queue.push(OutputChunk {
                payload: vec![],
                format: fmt(),
                frames: 1152,
                produced_at: Instant::now(),
            });
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_overflow(), 3);
    }
}
