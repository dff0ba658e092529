//! Pacing: the two ways a sink mixer's tick can be driven (spec 4.4
//! "Pacing"), plus the cross-sink synchronization barrier.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::runtime::StopSignal;
use crate::utils::frames_to_duration;

/// Drives a sink mixer's tick. `wait_for_tick` blocks until the next tick is
/// due and returns how many frames should be consumed this tick, or `None`
/// if a stop was requested while waiting.
pub trait PacingClock: Send {
    fn wait_for_tick(&mut self, stop: &StopSignal) -> Option<usize>;

    /// Nudges the clock's effective tick rate by `multiplier` (near `1.0`).
    /// Used by the cross-sink sync barrier; a no-op for clocks that aren't
    /// wall-clock driven (the hardware clock is always the timing master).
    fn apply_rate_multiplier(&mut self, _multiplier: f64) {}
}

/// Monotonic scheduler firing every `frames_per_chunk / sample_rate`
/// seconds - the default pacing mode.
pub struct WallClockPacing {
    base_period: Duration,
    period: Duration,
    frames_per_chunk: usize,
    next_tick: Instant,
}

impl WallClockPacing {
    #[must_use]
    pub fn new(frames_per_chunk: usize, sample_rate: u32) -> Self {
        let period = frames_to_duration(frames_per_chunk as u64, sample_rate);
        Self {
            base_period: period,
            period,
            frames_per_chunk,
            next_tick: Instant::now() + period,
        }
    }
}

impl PacingClock for WallClockPacing {
    fn wait_for_tick(&mut self, stop: &StopSignal) -> Option<usize> {
        let now = Instant::now();
        if self.next_tick > now {
            if stop.wait(self.next_tick - now) {
                return None;
            }
        }
        let tick_target = self.next_tick;
        self.next_tick += self.period;
        // If the process stalled long enough that we're now behind by more
        // than one period, resync instead of bursting ticks to catch up.
        if self.next_tick < Instant::now().saturating_sub(self.period) {
            self.next_tick = tick_target + self.period;
        }
        Some(self.frames_per_chunk)
    }

    fn apply_rate_multiplier(&mut self, multiplier: f64) {
        self.period = self.base_period.mul_f64(multiplier.max(0.01));
    }
}

/// Seam for a local playback device's hardware clock. No real ALSA binding
/// is implemented here (out of scope per the Non-goals); this trait is
/// exercised by a single in-repo implementation sufficient to drive the
/// mixer/sender logic under test.
pub trait HardwareClockSource: Send {
    /// Blocks until the device has drained at least one period since the
    /// last call, returning the number of frames drained. `None` means the
    /// device faulted or a stop was requested.
    fn wait_for_drain(&mut self, stop: &StopSignal) -> Option<usize>;
}

/// Hardware-clock pacing: the device is the timing master, and the mixer
/// consumes exactly as many frames as it drained since the last tick.
/// Fractional frames (the device rarely drains a whole number matching the
/// chunk size) accumulate and roll into the next tick rather than being
/// dropped.
pub struct HardwareClockPacing<H: HardwareClockSource> {
    source: H,
    residual_frames: f64,
}

impl<H: HardwareClockSource> HardwareClockPacing<H> {
    #[must_use]
    pub fn new(source: H) -> Self {
        Self {
            source,
            residual_frames: 0.0,
        }
    }
}

impl<H: HardwareClockSource> PacingClock for HardwareClockPacing<H> {
    fn wait_for_tick(&mut self, stop: &StopSignal) -> Option<usize> {
        let drained = self.source.wait_for_drain(stop)?;
        self.residual_frames += drained as f64;
        let whole = self.residual_frames.floor();
        self.residual_frames -= whole;
        Some(whole as usize)
    }
}

/// Tunables for [`SyncGroup`].
#[derive(Debug, Clone, Copy)]
pub struct SyncBarrierConfig {
    pub barrier_timeout_ms: u64,
    pub max_rate_adjustment: f64,
}

impl Default for SyncBarrierConfig {
    fn default() -> Self {
        Self {
            barrier_timeout_ms: 50,
            max_rate_adjustment: 0.05,
        }
    }
}

/// Outcome of one sink's call into [`SyncGroup::arrive`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncOutcome {
    /// All members arrived within the deadline; here's the rate multiplier
    /// to apply to align phase with the group average.
    Aligned { rate_multiplier: f64 },
    /// Not every member arrived before `barrier_timeout_ms`; this sink
    /// should emit silence for the tick rather than drift out of lock.
    Missed,
}

struct Generation {
    arrivals: HashMap<String, Instant>,
}

/// Shared rendezvous point for a group of sinks with `enable_multi_sink_sync`
/// set. Each sink calls [`Self::arrive`] once per tick; the barrier releases
/// all members once every registered sink has arrived or the timeout
/// elapses, and hands back a per-sink rate nudge that a PI-style controller
/// uses to converge their effective tick phases (spec 4.4 "Cross-sink
/// synchronization").
pub struct SyncGroup {
    config: SyncBarrierConfig,
    members: Vec<String>,
    state: Mutex<Generation>,
    condvar: Condvar,
    integral: Mutex<HashMap<String, f64>>,
}

impl SyncGroup {
    #[must_use]
    pub fn new(members: Vec<String>, config: SyncBarrierConfig) -> Self {
        Self {
            config,
            members,
            state: Mutex::new(Generation {
                arrivals: HashMap::new(),
            }),
            condvar: Condvar::new(),
            integral: Mutex::new(HashMap::new()),
        }
    }

    /// Called by one sink's mixer thread at the start of its tick. Blocks
    /// (up to `barrier_timeout_ms`) until every member has arrived, then
    /// returns this sink's rate nudge for the next tick.
    pub fn arrive(&self, sink_id: &str) -> SyncOutcome {
        let deadline = Duration::from_millis(self.config.barrier_timeout_ms);
        let now = Instant::now();

        let mut guard = self.state.lock().unwrap();
        guard.arrivals.insert(sink_id.to_string(), now);

        if guard.arrivals.len() < self.members.len() {
            let (g, timeout_result) = self
                .condvar
                .wait_timeout_while(guard, deadline, |g| {
                    g.arrivals.len() < self.members.len()
                })
                .unwrap();
            guard = g;
            if timeout_result.timed_out() {
                guard.arrivals.clear();
                return SyncOutcome::Missed;
            }
        } else {
            self.condvar.notify_all();
        }

        let mean_offset = {
            let earliest = guard.arrivals.values().min().copied().unwrap_or(now);
            let mine = guard.arrivals.get(sink_id).copied().unwrap_or(now);
            mine.saturating_duration_since(earliest).as_secs_f64()
        };
        guard.arrivals.clear();
        drop(guard);

        let mut integrals = self.integral.lock().unwrap();
        let integral = integrals.entry(sink_id.to_string()).or_insert(0.0);
        *integral += mean_offset;

        const PROPORTIONAL_GAIN: f64 = 0.5;
        const INTEGRAL_GAIN: f64 = 0.05;
        let adjustment =
            (PROPORTIONAL_GAIN * mean_offset + INTEGRAL_GAIN * *integral).clamp(
                -self.config.max_rate_adjustment,
                self.config.max_rate_adjustment,
            );

        SyncOutcome::Aligned {
            rate_multiplier: 1.0 + adjustment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeHardwareClock {
        remaining_ticks: usize,
        frames_per_drain: usize,
    }

    impl HardwareClockSource for FakeHardwareClock {
        fn wait_for_drain(&mut self, _stop: &StopSignal) -> Option<usize> {
            if self.remaining_ticks == 0 {
                return None;
            }
            self.remaining_ticks -= 1;
            Some(self.frames_per_drain)
        }
    }

    #[test]
    fn wall_clock_pacing_returns_configured_frame_count() {
        let mut pacing = WallClockPacing::new(1152, 48000);
        let stop = StopSignal::new();
        assert_eq!(pacing.wait_for_tick(&stop), Some(1152));
    }

    #[test]
    fn wall_clock_pacing_honors_stop_signal() {
        let mut pacing = WallClockPacing::new(1152, 48000);
        let stop = StopSignal::new();
        stop.stop();
        assert_eq!(pacing.wait_for_tick(&stop), None);
    }

    #[test]
    fn hardware_clock_pacing_accumulates_residual_frames() {
        let mut pacing = HardwareClockPacing::new(FakeHardwareClock {
            remaining_ticks: 3,
            frames_per_drain: 100,
        });
        let stop = StopSignal::new();
        let mut total = 0;
        while let Some(frames) = pacing.wait_for_tick(&stop) {
            total += frames;
        }
        assert_eq!(total, 300);
    }

    #[test]
    fn hardware_clock_pacing_returns_none_when_device_is_done() {
        let mut pacing = HardwareClockPacing::new(FakeHardwareClock {
            remaining_ticks: 0,
            frames_per_drain: 100,
        });
        let stop = StopSignal::new();
        assert_eq!(pacing.wait_for_tick(&stop), None);
    }

    #[test]
    fn single_member_sync_group_always_aligns() {
        let group = SyncGroup::new(vec!["only".into()], SyncBarrierConfig::default());
        match group.arrive("only") {
            SyncOutcome::Aligned { rate_multiplier } => {
                assert!((rate_multiplier - 1.0).abs() < 0.2);
            }
            SyncOutcome::Missed => panic!("a lone member should never miss its own barrier"),
        }
    }

    #[test]
    fn two_members_both_align_when_both_arrive() {
        use std::sync::Arc;
        use std::thread;

        let group = Arc::new(SyncGroup::new(
            vec!["a".into(), "b".into()],
            SyncBarrierConfig::default(),
        ));
        let g2 = group.clone();
        let handle = thread::spawn(move || g2.arrive("b"));
        let outcome_a = group.arrive("a");
        let outcome_b = handle.join().unwrap();
        assert!(matches!(outcome_a, SyncOutcome::Aligned { .. }));
        assert!(matches!(outcome_b, SyncOutcome::Aligned { .. }));
    }
}
