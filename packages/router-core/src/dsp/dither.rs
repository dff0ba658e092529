//! Dither and noise-shaped requantization to the sink's bit depth (spec 4.3
//! step 9). Triangular (TPDF) dither decorrelates quantization error from
//! the signal; first-order noise shaping pushes the remaining error upward
//! in frequency, feeding the previous sample's quantization error back in
//! at `noise_shaping_factor`.
//!
//! Per the design note on this: when the output bit depth equals the
//! pipeline's internal precision, dither is a bypass.

use super::format::PlanarBuffer;

/// The pipeline's internal precision, for the bypass check in
/// [`Dither::process`].
const INTERNAL_BIT_DEPTH: u8 = 32;

/// Small deterministic xorshift PRNG - no need for a CSPRNG, and a fixed
/// stream keeps dither reproducible in tests.
#[derive(Debug, Clone, Copy)]
struct Xorshift32(u32);

impl Xorshift32 {
    fn next_unit(&mut self) -> f32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        (x as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

#[derive(Debug, Clone)]
pub struct Dither {
    bit_depth: u8,
    noise_shaping_factor: f32,
    rng: Vec<Xorshift32>,
    error_feedback: Vec<f32>,
}

impl Dither {
    #[must_use]
    pub fn new(bit_depth: u8, noise_shaping_factor: f32, channel_count: usize) -> Self {
        Self {
            bit_depth,
            noise_shaping_factor: noise_shaping_factor.clamp(0.0, 1.0),
            rng: (0..channel_count)
                .map(|i| Xorshift32(0x9E37_79B9 ^ (i as u32 + 1)))
                .collect(),
            error_feedback: vec![0.0; channel_count],
        }
    }

    #[must_use]
    pub fn process(&mut self, input: &PlanarBuffer) -> PlanarBuffer {
        if self.bit_depth >= INTERNAL_BIT_DEPTH {
            return input.clone();
        }

        let scale = (1i64 << (self.bit_depth - 1)) as f32;
        let max = ((1i64 << (self.bit_depth - 1)) - 1) as f32;
        let min = -((1i64 << (self.bit_depth - 1)) as f32);

        let mut output = input.clone();
        for (ch_idx, channel) in output.channels.iter_mut().enumerate() {
            if ch_idx >= self.rng.len() {
                self.rng.push(Xorshift32(0x9E37_79B9 ^ (ch_idx as u32 + 1)));
                self.error_feedback.push(0.0);
            }
            let rng = &mut self.rng[ch_idx];
            let feedback = &mut self.error_feedback[ch_idx];

            for sample in channel.iter_mut() {
                let scaled = *sample * scale;
                // Triangular dither: sum of two independent uniform draws.
                let dither = (rng.next_unit() + rng.next_unit()) * 0.5;
                let shaped = scaled + dither + *feedback * self.noise_shaping_factor;
                let quantized = shaped.round().clamp(min, max);
                *feedback = shaped - quantized;
                *sample = (quantized / scale).clamp(-1.0, 1.0);
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypasses_when_output_matches_internal_precision() {
        let mut dither = Dither::new(32, 0.5, 1);
        let input = PlanarBuffer {
            channels: vec![vec![0.123456, -0.654321]],
            frames: 2,
        };
        let output = dither.process(&input);
        assert_eq!(output.channels, input.channels);
    }

    #[test]
    fn quantizes_to_steps_representable_at_target_depth() {
        let mut dither = Dither::new(16, 0.5, 1);
        let input = PlanarBuffer {
            channels: vec![vec![0.2; 50]],
            frames: 50,
        };
        let output = dither.process(&input);
        let step = 1.0 / (1i64 << 15) as f32;
        for &s in &output.channels[0] {
            let steps = s / step;
            assert!((steps - steps.round()).abs() < 1e-3);
        }
    }

    #[test]
    fn average_error_stays_small_over_many_samples() {
        let mut dither = Dither::new(16, 0.5, 1);
        let input = PlanarBuffer {
            channels: vec![vec![0.3; 2000]],
            frames: 2000,
        };
        let output = dither.process(&input);
        let avg: f32 = output.channels[0].iter().sum::<f32>() / 2000.0;
        assert!((avg - 0.3).abs() < 0.01);
    }

    #[test]
    fn output_never_exceeds_unit_range() {
        let mut dither = Dither::new(16, 0.9, 1);
        let input = PlanarBuffer {
            channels: vec![vec![1.0; 10]],
            frames: 10,
        };
        let output = dither.process(&input);
        assert!(output.channels[0].iter().all(|&s| (-1.0..=1.0).contains(&s)));
    }
}
