//! Owns the global timeshift buffer, the cursor registry, and the cleanup
//! thread. This is the one type the rest of the engine talks to; receivers
//! call [`TimeshiftManager::add_packet`], source processors call
//! [`TimeshiftManager::read_next_chunk`] and [`TimeshiftManager::set_playback_rate`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::packet::{FormatDescriptor, SourceTag, TaggedAudioPacket};
use crate::runtime::StopSignal;

use super::buffer::TimeshiftBuffer;
use super::cursor::{CursorHandle, RateChangeKind, RateControlParams, ReadCursor};

/// Result of a single [`TimeshiftManager::read_next_chunk`] call.
#[derive(Debug, Clone)]
pub enum ReadOutcome {
    /// Enough frames were available; here they are.
    Chunk {
        payload: Bytes,
        format: FormatDescriptor,
        frames: usize,
        /// Largest receive-time gap, in milliseconds, between consecutive
        /// source packets crossed while assembling this chunk. `None` when
        /// the chunk came from contiguously arriving packets. The source
        /// processor compares this against `discontinuity_threshold_ms` to
        /// decide whether to flush its resampler state.
        gap_ms: Option<u64>,
    },
    /// The cursor has caught up to the newest packet; no data yet.
    Underrun,
}

/// Result of [`TimeshiftManager::export_window`]: an exact, frame-aligned
/// PCM window plus how stale its oldest and newest samples are (spec 6
/// `export_timeshift` contract: `(pcm, sample_rate, channels, bit_depth,
/// earliest_age, latest_age)` - `sample_rate`/`channels`/`bit_depth` travel
/// together as `format` rather than three separate fields).
#[derive(Debug, Clone)]
pub struct TimeshiftExport {
    pub pcm: Bytes,
    pub format: FormatDescriptor,
    /// Age of the oldest sample in the window - how far behind real-time
    /// the export's start is. Approximately `lookback_sec` (spec 8 scenario
    /// 5: "`earliest_age` ≈ 10 s").
    pub earliest_age: Duration,
    /// Age of the newest sample in the window. Bounded by roughly one chunk
    /// duration in steady state, since the export always runs up to the
    /// most recently received packet (spec 8 scenario 5: "`latest_age` ≤
    /// one chunk duration").
    pub latest_age: Duration,
}

/// A point-in-time read of one cursor's rate-control and health counters,
/// used by [`TimeshiftManager::cursor_snapshot`] to populate
/// [`crate::stats::SourceStats`] without holding a lock across the stats
/// call and the cursor's own DSP-adjacent state.
#[derive(Debug, Clone, Copy)]
pub struct CursorSnapshot {
    pub playback_rate: f32,
    pub buffer_level_ms: f64,
    pub underrun_count: u64,
    pub overrun_count: u64,
}

/// Configuration for a newly created [`TimeshiftManager`].
#[derive(Debug, Clone, Copy)]
pub struct TimeshiftConfig {
    pub history_seconds: u64,
    pub max_partition_packets: usize,
    pub cleanup_interval_ms: u64,
}

impl Default for TimeshiftConfig {
    fn default() -> Self {
        Self {
            history_seconds: 300,
            max_partition_packets: 50_000,
            cleanup_interval_ms: 1_000,
        }
    }
}

struct Inner {
    buffer: TimeshiftBuffer,
    cursors: DashMap<CursorHandle, Mutex<ReadCursor>>,
    packets_dropped_pending: AtomicU64,
    max_clock_pending_packets: usize,
    pending_packets: AtomicU64,
}

/// The timeshift buffer plus its cursor registry and cleanup thread.
///
/// Cloning shares the same underlying state (it wraps an `Arc`); receivers,
/// processors, and the cleanup thread each hold a clone.
#[derive(Clone)]
pub struct TimeshiftManager {
    inner: Arc<Inner>,
}

impl TimeshiftManager {
    #[must_use]
    pub fn new(config: TimeshiftConfig, max_clock_pending_packets: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                buffer: TimeshiftBuffer::new(config.history_seconds, config.max_partition_packets),
                cursors: DashMap::new(),
                packets_dropped_pending: AtomicU64::new(0),
                max_clock_pending_packets,
                pending_packets: AtomicU64::new(0),
            }),
        }
    }

    /// Appends a packet, applying back-pressure on the total number of
    /// in-flight inserts rather than blocking the calling receiver thread.
    /// Returns `true` if this is the first packet ever seen for this tag.
    #[must_use]
    pub fn add_packet(&self, packet: TaggedAudioPacket) -> bool {
        if self.inner.pending_packets.load(Ordering::Relaxed) as usize
            >= self.inner.max_clock_pending_packets
        {
            self.inner
                .packets_dropped_pending
                .fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.inner.pending_packets.fetch_add(1, Ordering::Relaxed);
        let first_seen = self.inner.buffer.append(packet);
        self.inner.pending_packets.fetch_sub(1, Ordering::Relaxed);
        first_seen
    }

    /// Registers a new read cursor on `tag`, starting `initial_timeshift_sec`
    /// behind real-time.
    #[must_use]
    pub fn register_cursor(&self, tag: SourceTag, initial_timeshift_sec: f64) -> CursorHandle {
        let cursor = ReadCursor::new(
            tag,
            Duration::from_secs_f64(initial_timeshift_sec.max(0.0)),
            RateControlParams::default(),
        );
        let handle = cursor.handle();
        self.inner.cursors.insert(handle, Mutex::new(cursor));
        handle
    }

    /// Destroys a cursor. Idempotent: destroying an unknown handle is a no-op.
    pub fn unregister_cursor(&self, handle: CursorHandle) {
        self.inner.cursors.remove(&handle);
    }

    /// Smoothly changes the rate at which `handle` advances relative to
    /// wall time. A step large enough to be treated as a reseek resets the
    /// controller's integral term (see `cursor::RateChangeKind`).
    pub fn set_playback_rate(&self, handle: CursorHandle, rate: f32) -> Option<RateChangeKind> {
        let entry = self.inner.cursors.get(&handle)?;
        Some(entry.lock().set_playback_rate(rate))
    }

    /// Reads up to `desired_frames` contiguous frames at the cursor's
    /// current position, advancing it by `desired_frames / playback_rate`.
    pub fn read_next_chunk(&self, handle: CursorHandle, desired_frames: usize) -> ReadOutcome {
        let Some(entry) = self.inner.cursors.get(&handle) else {
            return ReadOutcome::Underrun;
        };
        let mut cursor = entry.lock();
        cursor.tick_rate_control();

        let tag = cursor.tag.clone();
        let outcome = self.inner.buffer.with_partition(&tag, |partition| {
            if let Some(tail) = partition.tail_time() {
                if cursor.position < tail {
                    cursor.clamp_to_tail(tail);
                }
            }

            let mut collected = BytesMut::new();
            let mut frames_collected = 0usize;
            let mut format: Option<FormatDescriptor> = None;
            let mut cursor_pos = cursor.position;
            let mut previous_packet_end: Option<Instant> = None;
            let mut gap_ms: Option<u64> = None;

            for packet in partition.iter() {
                if frames_collected >= desired_frames {
                    break;
                }
                let packet_frames = packet.frame_count();
                if packet_frames == 0 {
                    continue;
                }
                let packet_duration =
                    crate::utils::frames_to_duration(packet_frames as u64, packet.format.sample_rate);
                let packet_end = packet.received_at + packet_duration;
                if packet_end <= cursor_pos {
                    previous_packet_end = Some(packet_end);
                    continue;
                }

                if let Some(prev_end) = previous_packet_end {
                    if packet.received_at > prev_end {
                        let observed = crate::utils::millis_between(prev_end, packet.received_at);
                        gap_ms = Some(gap_ms.map_or(observed, |g: u64| g.max(observed)));
                    }
                }

                let skip_duration = cursor_pos.saturating_duration_since(packet.received_at);
                let skip_frames = ((skip_duration.as_secs_f64()
                    * f64::from(packet.format.sample_rate))
                    .round() as usize)
                    .min(packet_frames);

                let frame_bytes = packet.format.frame_bytes();
                let available_frames = packet_frames - skip_frames;
                let take_frames = available_frames.min(desired_frames - frames_collected);
                let start = skip_frames * frame_bytes;
                let end = start + take_frames * frame_bytes;
                collected.extend_from_slice(&packet.payload[start..end]);

                frames_collected += take_frames;
                format = Some(packet.format);
                cursor_pos = packet.received_at
                    + crate::utils::frames_to_duration(
                        (skip_frames + take_frames) as u64,
                        packet.format.sample_rate,
                    );
                previous_packet_end = Some(packet_end);
            }

            (collected.freeze(), frames_collected, format, cursor_pos, gap_ms)
        });

        let Some((payload, frames, format, new_pos, gap_ms)) = outcome else {
            cursor.record_underrun();
            return ReadOutcome::Underrun;
        };

        if frames == 0 {
            cursor.record_underrun();
            return ReadOutcome::Underrun;
        }

        let Some(format) = format else {
            cursor.record_underrun();
            return ReadOutcome::Underrun;
        };

        cursor.position = new_pos;
        ReadOutcome::Chunk {
            payload,
            format,
            frames,
            gap_ms,
        }
    }

    /// Exports a contiguous PCM window for offline consumers, e.g. the
    /// control plane's `export_timeshift` surface (spec 6).
    ///
    /// The returned PCM is trimmed or zero-padded to exactly
    /// `lookback_sec * sample_rate * channels * bytes_per_sample` bytes
    /// (spec 8 scenario 5), never the variable length of however many whole
    /// packets happened to fall after the cutoff.
    #[must_use]
    pub fn export_window(&self, tag: &str, lookback_sec: f64) -> Option<TimeshiftExport> {
        let now = Instant::now();
        let cutoff = now.checked_sub(Duration::from_secs_f64(lookback_sec.max(0.0)))?;
        self.inner.buffer.with_partition(tag, |partition| {
            let mut out = BytesMut::new();
            let mut format: Option<FormatDescriptor> = None;
            let mut earliest: Option<Instant> = None;
            let mut latest: Option<Instant> = None;
            for packet in partition.iter() {
                if packet.received_at < cutoff {
                    continue;
                }
                if earliest.is_none() {
                    earliest = Some(packet.received_at);
                }
                latest = Some(packet.received_at);
                out.extend_from_slice(&packet.payload);
                format = Some(packet.format);
            }
            let format = format?;
            let frame_bytes = format.frame_bytes();
            let target_frames = (lookback_sec * f64::from(format.sample_rate)).round().max(0.0) as usize;
            let target_bytes = target_frames * frame_bytes;
            let collected_bytes = out.len();

            let (pcm, earliest_age) = if collected_bytes >= target_bytes {
                // Trim whole frames from the front (oldest audio) so the
                // tail - the portion closest to `now` - is preserved
                // exactly; `latest_age` is unaffected by this trim.
                let trim_frames = (collected_bytes - target_bytes) / frame_bytes;
                let shift = crate::utils::frames_to_duration(trim_frames as u64, format.sample_rate);
                let earliest_age = earliest.map_or(Duration::from_secs_f64(lookback_sec), |t| {
                    now.saturating_duration_since(t + shift)
                });
                (out.freeze().split_off(collected_bytes - target_bytes), earliest_age)
            } else {
                // Not enough history yet: pad with silence at the front so
                // the window is still exactly `target_bytes` long.
                let mut padded = BytesMut::zeroed(target_bytes - collected_bytes);
                padded.extend_from_slice(&out);
                (padded.freeze(), Duration::from_secs_f64(lookback_sec))
            };

            let latest_age = latest.map_or(Duration::from_secs_f64(lookback_sec), |t| now.saturating_duration_since(t));

            Some(TimeshiftExport {
                pcm,
                format,
                earliest_age,
                latest_age,
            })
        })?
    }

    #[must_use]
    pub fn known_tags(&self) -> Vec<SourceTag> {
        self.inner.buffer.known_tags()
    }

    #[must_use]
    pub fn cursor_count(&self) -> usize {
        self.inner.cursors.len()
    }

    /// Total packets dropped because `max_clock_pending_packets` was
    /// saturated at insert time (spec 6 `packets_dropped_backpressure`).
    #[must_use]
    pub fn packets_dropped_backpressure(&self) -> u64 {
        self.inner.packets_dropped_pending.load(Ordering::Relaxed)
    }

    /// Reads a snapshot of `handle`'s current rate-control and health
    /// counters. Returns `None` if the cursor has been unregistered.
    #[must_use]
    pub fn cursor_snapshot(&self, handle: CursorHandle) -> Option<CursorSnapshot> {
        let entry = self.inner.cursors.get(&handle)?;
        let cursor = entry.lock();
        Some(CursorSnapshot {
            playback_rate: cursor.playback_rate,
            buffer_level_ms: cursor.buffer_level_ms(),
            underrun_count: cursor.underrun_count,
            overrun_count: cursor.overrun_count,
        })
    }

    /// Runs one cleanup sweep immediately (used by tests and by the
    /// background thread started via [`Self::spawn_cleanup_thread`]).
    pub fn run_cleanup_pass(&self) {
        self.inner.buffer.run_cleanup_pass();
    }

    /// Spawns the dedicated OS thread that runs the cleanup pass every
    /// `cleanup_interval_ms` until `stop` is requested (spec 5: "the
    /// timeshift cleanup pass" owns its own thread).
    pub fn spawn_cleanup_thread(&self, interval: Duration, stop: StopSignal) -> JoinHandle<()> {
        let manager = self.clone();
        std::thread::Builder::new()
            .name("timeshift-cleanup".into())
            .spawn(move || {
                while !stop.wait(interval) {
                    manager.run_cleanup_pass();
                }
            })
            .expect("failed to spawn timeshift cleanup thread")
    }
}
