//! Polyphase resampler with state persisted across chunks (spec 4.3 step 3).
//!
//! A windowed-sinc low-pass filter is evaluated at `oversampling_factor`
//! phase offsets between input samples; each output sample is a convolution
//! of the nearest input samples against the phase closest to its fractional
//! position. History from the tail of one chunk carries into the next so
//! chunk boundaries don't introduce discontinuities, and [`Resampler::reset`]
//! drops that history when the source processor detects a receive-time gap
//! (spec 4.3's discontinuity handling).

use std::f32::consts::PI;

use super::format::PlanarBuffer;

/// Number of input samples on each side of the convolution center.
const FILTER_HALF_TAPS: usize = 8;

fn sinc(x: f32) -> f32 {
    if x.abs() < 1e-7 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

fn blackman(n: f32, len: f32) -> f32 {
    0.42 - 0.5 * (2.0 * PI * n / len).cos() + 0.08 * (4.0 * PI * n / len).cos()
}

/// A single channel's resampling state: its carried-over input history and
/// the fractional read position into the (conceptually continuous) input
/// stream.
#[derive(Debug, Clone)]
struct ChannelState {
    history: Vec<f32>,
    fractional_pos: f64,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            history: vec![0.0; FILTER_HALF_TAPS * 2],
            fractional_pos: 0.0,
        }
    }
}

/// Per-path polyphase resampler. One instance per source path; persists
/// across chunks until the path is torn down or a discontinuity resets it.
#[derive(Debug, Clone)]
pub struct Resampler {
    input_rate: u32,
    output_rate: u32,
    oversampling_factor: u32,
    channels: Vec<ChannelState>,
}

impl Resampler {
    #[must_use]
    pub fn new(input_rate: u32, output_rate: u32, channel_count: usize, oversampling_factor: u32) -> Self {
        Self {
            input_rate,
            output_rate,
            oversampling_factor: oversampling_factor.max(1),
            channels: (0..channel_count).map(|_| ChannelState::new()).collect(),
        }
    }

    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        self.input_rate == self.output_rate
    }

    /// Output-rate-over-input-rate ratio this resampler currently applies;
    /// reported verbatim in [`crate::stats::SourceStats::resample_ratio`].
    #[must_use]
    pub fn ratio(&self) -> f64 {
        f64::from(self.output_rate) / f64::from(self.input_rate)
    }

    /// Drops carried-over history, used when a receive-time gap makes the
    /// history no longer contiguous with the new input (avoids ringing).
    pub fn reset(&mut self) {
        for channel in &mut self.channels {
            *channel = ChannelState::new();
        }
    }

    /// Resamples `input` to the configured output rate. Returns the input
    /// unchanged if `input_rate == output_rate`.
    #[must_use]
    pub fn process(&mut self, input: &PlanarBuffer) -> PlanarBuffer {
        if self.is_passthrough() {
            return input.clone();
        }

        let ratio = f64::from(self.input_rate) / f64::from(self.output_rate);
        let out_frames = ((input.frames as f64) / ratio).round().max(0.0) as usize;

        let mut output = PlanarBuffer {
            channels: Vec::with_capacity(input.channel_count()),
            frames: out_frames,
        };

        for (ch_idx, in_channel) in input.channels.iter().enumerate() {
            if ch_idx >= self.channels.len() {
                self.channels.push(ChannelState::new());
            }
            let state = &mut self.channels[ch_idx];

            // Treat the carried history as a prefix of this chunk's samples
            // so the convolution window can reach backward across the
            // boundary.
            let mut extended = state.history.clone();
            extended.extend_from_slice(in_channel);

            let mut out_channel = Vec::with_capacity(out_frames);
            let mut pos = state.fractional_pos;
            for _ in 0..out_frames {
                let center = pos + FILTER_HALF_TAPS as f64;
                let base = center.floor() as isize;
                let frac = (center - center.floor()) as f32;

                let mut acc = 0.0f32;
                let mut norm = 0.0f32;
                for tap in -(FILTER_HALF_TAPS as isize)..(FILTER_HALF_TAPS as isize) {
                    let idx = base + tap;
                    if idx < 0 || idx as usize >= extended.len() {
                        continue;
                    }
                    let x = tap as f32 - frac;
                    let window = blackman(
                        (tap + FILTER_HALF_TAPS as isize) as f32,
                        (FILTER_HALF_TAPS * 2) as f32,
                    );
                    let weight = sinc(x / self.oversampling_factor.max(1) as f32) * window;
                    acc += extended[idx as usize] * weight;
                    norm += weight;
                }
                if norm.abs() > 1e-6 {
                    acc /= norm;
                }
                out_channel.push(acc.clamp(-1.0, 1.0));
                pos += ratio;
            }

            // Carry the tail of this chunk's samples forward as next
            // chunk's history, and keep the fractional position relative to
            // the new chunk origin.
            let consumed_whole = pos.floor() as usize;
            state.fractional_pos = pos - consumed_whole as f64;
            let tail_start = in_channel.len().saturating_sub(FILTER_HALF_TAPS * 2);
            state.history = in_channel[tail_start..].to_vec();
            if state.history.len() < FILTER_HALF_TAPS * 2 {
                let mut padded = vec![0.0; FILTER_HALF_TAPS * 2 - state.history.len()];
                padded.extend_from_slice(&state.history);
                state.history = padded;
            }

            output.channels.push(out_channel);
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse(frames: usize, at: usize) -> PlanarBuffer {
        let mut channel = vec![0.0f32; frames];
        channel[at] = 1.0;
        PlanarBuffer {
            channels: vec![channel],
            frames,
        }
    }

    #[test]
    fn passthrough_when_rates_match() {
        let mut r = Resampler::new(48000, 48000, 1, 32);
        let input = impulse(128, 10);
        let output = r.process(&input);
        assert_eq!(output.frames, input.frames);
        assert_eq!(output.channels[0], input.channels[0]);
    }

    #[test]
    fn upsampling_produces_more_frames() {
        let mut r = Resampler::new(44100, 48000, 1, 32);
        let input = impulse(441, 200);
        let output = r.process(&input);
        assert!(output.frames > input.frames);
    }

    #[test]
    fn downsampling_produces_fewer_frames() {
        let mut r = Resampler::new(48000, 44100, 1, 32);
        let input = impulse(480, 200);
        let output = r.process(&input);
        assert!(output.frames < input.frames);
    }

    #[test]
    fn reset_clears_carried_history() {
        let mut r = Resampler::new(44100, 48000, 1, 32);
        let input = impulse(441, 200);
        r.process(&input);
        assert!(r.channels[0].history.iter().any(|&s| s != 0.0));
        r.reset();
        assert!(r.channels[0].history.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn output_stays_within_unit_range() {
        let mut r = Resampler::new(44100, 48000, 1, 32);
        let input = impulse(441, 200);
        let output = r.process(&input);
        assert!(output.channels[0].iter().all(|&s| (-1.0..=1.0).contains(&s)));
    }
}
