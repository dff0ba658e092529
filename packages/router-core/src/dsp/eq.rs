//! 18-band parametric EQ at fixed center frequencies (spec 4.3 step 5).

use std::f32::consts::PI;

use super::format::PlanarBuffer;

/// Fixed center frequencies, in Hz, for the 18 EQ bands.
pub const BAND_CENTER_FREQUENCIES_HZ: [f32; 18] = [
    65.0, 92.0, 131.0, 185.0, 262.0, 370.0, 523.0, 740.0, 1047.0, 1480.0, 2093.0, 2960.0, 4186.0,
    5920.0, 8372.0, 11840.0, 16744.0, 20000.0,
];

/// Number of bands; kept as a named constant alongside
/// [`BAND_CENTER_FREQUENCIES_HZ`] so callers don't hardcode `18` twice.
pub const BAND_COUNT: usize = 18;

const Q: f32 = 1.4;

#[derive(Debug, Clone, Copy, Default)]
struct BiquadCoeffs {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl BiquadCoeffs {
    /// RBJ audio-EQ-cookbook peaking filter.
    fn peaking(sample_rate: u32, center_hz: f32, gain_db: f32, q: f32) -> Self {
        let a = 10f32.powf(gain_db / 40.0);
        let omega = 2.0 * PI * center_hz / sample_rate as f32;
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * q);

        let b0 = 1.0 + alpha * a;
        let b1 = -2.0 * cos_w;
        let b2 = 1.0 - alpha * a;
        let a0 = 1.0 + alpha / a;
        let a1 = -2.0 * cos_w;
        let a2 = 1.0 - alpha / a;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadState {
    fn process(&mut self, coeffs: &BiquadCoeffs, x0: f32) -> f32 {
        let y0 = coeffs.b0 * x0 + coeffs.b1 * self.x1 + coeffs.b2 * self.x2
            - coeffs.a1 * self.y1
            - coeffs.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x0;
        self.y2 = self.y1;
        self.y1 = y0;
        y0
    }
}

/// Per-band gains for one source path, published by the applier and adopted
/// by the processor on its next chunk boundary (design note "publish-swap").
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct EqGains(pub [f32; BAND_COUNT]);

impl Default for EqGains {
    fn default() -> Self {
        Self([0.0; BAND_COUNT])
    }
}

/// The 18-band EQ chain's per-channel running state. Coefficients are
/// recomputed whenever gains or the sample rate change; filter state
/// (`BiquadState`) persists across chunks.
#[derive(Debug, Clone)]
pub struct EqChain {
    sample_rate: u32,
    coeffs: [BiquadCoeffs; BAND_COUNT],
    state: Vec<[BiquadState; BAND_COUNT]>,
}

impl EqChain {
    #[must_use]
    pub fn new(sample_rate: u32, channel_count: usize, gains: EqGains) -> Self {
        let mut chain = Self {
            sample_rate,
            coeffs: [BiquadCoeffs::default(); BAND_COUNT],
            state: vec![[BiquadState::default(); BAND_COUNT]; channel_count],
        };
        chain.set_gains(gains);
        chain
    }

    /// Recomputes band coefficients for new gains. Does not reset filter
    /// state, matching the publish-swap design (new coefficients, same
    /// history, adopted at the next chunk).
    pub fn set_gains(&mut self, gains: EqGains) {
        for (i, &freq) in BAND_CENTER_FREQUENCIES_HZ.iter().enumerate() {
            self.coeffs[i] = BiquadCoeffs::peaking(self.sample_rate, freq, gains.0[i], Q);
        }
    }

    #[must_use]
    pub fn process(&mut self, input: &PlanarBuffer) -> PlanarBuffer {
        let mut output = input.clone();
        for (ch_idx, channel) in output.channels.iter_mut().enumerate() {
            if ch_idx >= self.state.len() {
                self.state.push([BiquadState::default(); BAND_COUNT]);
            }
            let states = &mut self.state[ch_idx];
            for sample in channel.iter_mut() {
                let mut value = *sample;
                for band in 0..BAND_COUNT {
                    value = states[band].process(&self.coeffs[band], value);
                }
                *sample = value.clamp(-1.0, 1.0);
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_gains_leave_signal_materially_unchanged() {
        let mut chain = EqChain::new(48000, 1, EqGains::default());
        let input = PlanarBuffer {
            channels: vec![vec![0.5; 64]],
            frames: 64,
        };
        let output = chain.process(&input);
        for (a, b) in input.channels[0].iter().zip(&output.channels[0]) {
            assert!((a - b).abs() < 0.05, "flat EQ should be near-transparent");
        }
    }

    #[test]
    fn band_count_matches_center_frequency_table() {
        assert_eq!(BAND_CENTER_FREQUENCIES_HZ.len(), BAND_COUNT);
    }

    #[test]
    fn boosting_a_band_increases_energy_at_dc_adjacent_content() {
        let mut flat = EqChain::new(48000, 1, EqGains::default());
        let mut boosted_gains = EqGains::default();
        boosted_gains.0[0] = 12.0;
        let mut boosted = EqChain::new(48000, 1, boosted_gains);

        let input = PlanarBuffer {
            channels: vec![vec![0.3; 256]],
            frames: 256,
        };
        let flat_out = flat.process(&input);
        let boosted_out = boosted.process(&input);
        let flat_energy: f32 = flat_out.channels[0].iter().map(|s| s * s).sum();
        let boosted_energy: f32 = boosted_out.channels[0].iter().map(|s| s * s).sum();
        assert!(boosted_energy > flat_energy);
    }

    #[test]
    fn output_is_clamped_to_unit_range() {
        let mut boosted_gains = EqGains::default();
        boosted_gains.0[0] = 24.0;
        let mut chain = EqChain::new(48000, 1, boosted_gains);
        let input = PlanarBuffer {
            channels: vec![vec![1.0; 32]],
            frames: 32,
        };
        let output = chain.process(&input);
        assert!(output.channels[0].iter().all(|&s| (-1.0..=1.0).contains(&s)));
    }
}
