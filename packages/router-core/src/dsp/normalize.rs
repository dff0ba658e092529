//! Running-RMS normalization with asymmetric attack/decay (spec 4.3 step 7).
//!
//! Gain is only adjusted gradually: it reacts quickly when the signal gets
//! louder than the target (attack) and backs off slowly when it gets
//! quieter (decay), so normalization doesn't audibly pump on transients.

use super::format::PlanarBuffer;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct NormalizeParams {
    pub target_rms: f32,
    pub attack: f32,
    pub decay: f32,
}

impl Default for NormalizeParams {
    fn default() -> Self {
        Self {
            target_rms: 0.2,
            attack: 0.2,
            decay: 0.02,
        }
    }
}

/// Running normalizer. One instance per source path; state persists across
/// chunks.
#[derive(Debug, Clone)]
pub struct Normalizer {
    params: NormalizeParams,
    enabled: bool,
    current_gain: f32,
    running_rms: f32,
}

impl Normalizer {
    #[must_use]
    pub fn new(params: NormalizeParams, enabled: bool) -> Self {
        Self {
            params,
            enabled,
            current_gain: 1.0,
            running_rms: params.target_rms,
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[must_use]
    pub fn process(&mut self, input: &PlanarBuffer) -> PlanarBuffer {
        if !self.enabled {
            return input.clone();
        }

        let mut output = input.clone();
        for channel in &mut output.channels {
            for sample in channel.iter_mut() {
                let instant_power = *sample * *sample;
                let smoothing = if instant_power.sqrt() > self.running_rms {
                    self.params.attack
                } else {
                    self.params.decay
                };
                self.running_rms += smoothing * (instant_power.sqrt() - self.running_rms);

                let target_gain = if self.running_rms > 1e-6 {
                    (self.params.target_rms / self.running_rms).clamp(0.1, 4.0)
                } else {
                    1.0
                };
                self.current_gain += 0.05 * (target_gain - self.current_gain);

                *sample = (*sample * self.current_gain).clamp(-1.0, 1.0);
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_normalizer_is_passthrough() {
        let mut norm = Normalizer::new(NormalizeParams::default(), false);
        let input = PlanarBuffer {
            channels: vec![vec![0.01; 100]],
            frames: 100,
        };
        let output = norm.process(&input);
        assert_eq!(output.channels, input.channels);
    }

    #[test]
    fn quiet_signal_is_gained_up_toward_target() {
        let mut norm = Normalizer::new(NormalizeParams::default(), true);
        let input = PlanarBuffer {
            channels: vec![vec![0.01; 4000]],
            frames: 4000,
        };
        let output = norm.process(&input);
        let tail_rms: f32 = {
            let tail = &output.channels[0][3000..];
            (tail.iter().map(|s| s * s).sum::<f32>() / tail.len() as f32).sqrt()
        };
        assert!(tail_rms > 0.01, "normalizer should have raised the level, got {tail_rms}");
    }

    #[test]
    fn output_never_exceeds_unit_range() {
        let mut norm = Normalizer::new(NormalizeParams::default(), true);
        let input = PlanarBuffer {
            channels: vec![vec![1.0; 500]],
            frames: 500,
        };
        let output = norm.process(&input);
        assert!(output.channels[0].iter().all(|&s| (-1.0..=1.0).contains(&s)));
    }
}
