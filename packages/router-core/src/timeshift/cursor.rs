//! Per-consumer read state: logical position in the timeshift buffer, the
//! PI-controlled playback rate that keeps it tracking its target lag, and
//! the under/overrun counters a source processor reports through stats.

use std::time::{Duration, Instant};

use uuid::Uuid;

/// Opaque handle identifying a registered cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorHandle(Uuid);

impl CursorHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Tunables for the per-cursor PI rate controller (spec 4.2 "Rate control
/// loop").
#[derive(Debug, Clone, Copy)]
pub struct RateControlParams {
    pub target_buffer_level_ms: f64,
    pub proportional_gain: f64,
    pub integral_gain: f64,
    pub max_rate_adjustment: f64,
    pub smoothing_factor: f64,
    pub max_catchup_lag_ms: f64,
}

impl Default for RateControlParams {
    fn default() -> Self {
        Self {
            target_buffer_level_ms: 150.0,
            proportional_gain: 0.0006,
            integral_gain: 0.00004,
            max_rate_adjustment: 0.05,
            smoothing_factor: 0.1,
            max_catchup_lag_ms: 1000.0,
        }
    }
}

/// PI controller nudging a cursor's playback rate toward its target lag.
///
/// Output is clamped to `[1 - max_rate_adjustment, 1 + max_rate_adjustment]`
/// and low-pass filtered by `smoothing_factor` so the rate never steps,
/// avoiding audible pitch wobble. A lag beyond `max_catchup_lag_ms` lifts the
/// clamp so the cursor can slew back into band faster.
#[derive(Debug, Clone, Copy)]
pub struct RateController {
    params: RateControlParams,
    integral: f64,
    smoothed_rate: f64,
}

impl RateController {
    #[must_use]
    pub fn new(params: RateControlParams) -> Self {
        Self {
            params,
            integral: 0.0,
            smoothed_rate: 1.0,
        }
    }

    /// Feeds the current buffer level (ms of lag behind real-time) in and
    /// returns the new playback rate to apply.
    pub fn update(&mut self, buffer_level_ms: f64) -> f64 {
        let error = buffer_level_ms - self.params.target_buffer_level_ms;
        self.integral += error;

        let catchup = error.abs() > self.params.max_catchup_lag_ms;
        let clamp = if catchup {
            self.params.max_rate_adjustment * 4.0
        } else {
            self.params.max_rate_adjustment
        };

        let raw_adjustment =
            self.params.proportional_gain * error + self.params.integral_gain * self.integral;
        let clamped_adjustment = raw_adjustment.clamp(-clamp, clamp);
        let target_rate = 1.0 + clamped_adjustment;

        self.smoothed_rate +=
            self.params.smoothing_factor * (target_rate - self.smoothed_rate);
        self.smoothed_rate
    }

    #[must_use]
    pub fn current_rate(&self) -> f64 {
        self.smoothed_rate
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.smoothed_rate = 1.0;
    }
}

/// Outcome of advancing a cursor's rate toward a new target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateChangeKind {
    /// Applied through the PI loop's normal slew limiting.
    Slewed,
    /// The requested change was large enough to treat as a discontinuity
    /// (design note: a step > 100ms is a reseek, not a controller input).
    TreatedAsReseek,
}

/// A consumer's read position into the timeshift buffer.
pub struct ReadCursor {
    handle: CursorHandle,
    pub tag: String,
    /// Logical read position, expressed as lag behind `Instant::now()`.
    pub position: Instant,
    pub desired_lag: Duration,
    pub playback_rate: f32,
    pub underrun_count: u64,
    pub overrun_count: u64,
    controller: RateController,
}

impl ReadCursor {
    #[must_use]
    pub fn new(tag: String, desired_lag: Duration, params: RateControlParams) -> Self {
        let position = Instant::now()
            .checked_sub(desired_lag)
            .unwrap_or_else(Instant::now);
        Self {
            handle: CursorHandle::new(),
            tag,
            position,
            desired_lag,
            playback_rate: 1.0,
            underrun_count: 0,
            overrun_count: 0,
            controller: RateController::new(params),
        }
    }

    #[must_use]
    pub fn handle(&self) -> CursorHandle {
        self.handle
    }

    /// Current lag behind real-time, in milliseconds.
    #[must_use]
    pub fn buffer_level_ms(&self) -> f64 {
        Instant::now()
            .saturating_duration_since(self.position)
            .as_secs_f64()
            * 1000.0
    }

    /// Runs one tick of the PI rate controller and adopts its output as the
    /// cursor's new playback rate.
    pub fn tick_rate_control(&mut self) {
        let rate = self.controller.update(self.buffer_level_ms());
        self.playback_rate = rate as f32;
    }

    /// Sets the playback rate directly, bypassing the controller (used for
    /// explicit `set_playback_rate` calls). A jump larger than 100ms worth
    /// of effective drift at the current rate is treated as a reseek per the
    /// design note on step changes, resetting the controller's integral
    /// term so it doesn't fight the jump afterward.
    pub fn set_playback_rate(&mut self, rate: f32) -> RateChangeKind {
        const RESEEK_THRESHOLD: f32 = 0.1;
        let delta = (rate - self.playback_rate).abs();
        self.playback_rate = rate;
        if delta > RESEEK_THRESHOLD {
            self.controller.reset();
            RateChangeKind::TreatedAsReseek
        } else {
            RateChangeKind::Slewed
        }
    }

    /// Advances the logical position by `frames` played back at the
    /// cursor's current rate.
    pub fn advance(&mut self, frames: u64, sample_rate: u32) {
        let wall_duration = crate::utils::frames_to_duration(frames, sample_rate);
        let scaled = wall_duration.div_f32(self.playback_rate.max(0.01));
        self.position += scaled;
    }

    pub fn record_underrun(&mut self) {
        self.underrun_count += 1;
    }

    /// Clamps the position to `tail`, recording an overrun.
    pub fn clamp_to_tail(&mut self, tail: Instant) {
        self.position = tail;
        self.overrun_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_pushes_rate_up_when_lag_exceeds_target() {
        let mut controller = RateController::new(RateControlParams::default());
        let rate = controller.update(400.0);
        assert!(rate > 1.0, "rate should speed up when lag is high, got {rate}");
    }

    #[test]
    fn controller_pushes_rate_down_when_lag_below_target() {
        let mut controller = RateController::new(RateControlParams::default());
        let rate = controller.update(10.0);
        assert!(rate < 1.0, "rate should slow down when lag is low, got {rate}");
    }

    #[test]
    fn controller_output_stays_within_clamp_absent_catchup() {
        let mut controller = RateController::new(RateControlParams::default());
        let mut rate = 1.0;
        for _ in 0..50 {
            rate = controller.update(100_000.0);
        }
        assert!(rate <= 1.0 + RateControlParams::default().max_rate_adjustment * 4.0 + 0.01);
    }

    #[test]
    fn cursor_advance_moves_position_forward() {
        let mut cursor = ReadCursor::new("a".into(), Duration::from_millis(150), RateControlParams::default());
        let before = cursor.position;
        cursor.advance(1152, 48000);
        assert!(cursor.position > before);
    }

    #[test]
    fn large_rate_jump_is_treated_as_reseek() {
        let mut cursor = ReadCursor::new("a".into(), Duration::from_millis(150), RateControlParams::default());
        assert_eq!(cursor.set_playback_rate(1.5), RateChangeKind::TreatedAsReseek);
    }

    #[test]
    fn small_rate_change_is_slewed() {
        let mut cursor = ReadCursor::new("a".into(), Duration::from_millis(150), RateControlParams::default());
        assert_eq!(cursor.set_playback_rate(1.01), RateChangeKind::Slewed);
    }

    #[test]
    fn clamp_to_tail_counts_overrun() {
        let mut cursor = ReadCursor::new("a".into(), Duration::from_millis(150), RateControlParams::default());
        let tail = Instant::now();
        cursor.clamp_to_tail(tail);
        assert_eq!(cursor.overrun_count, 1);
        assert_eq!(cursor.position, tail);
    }
}
