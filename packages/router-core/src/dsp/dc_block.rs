//! DC-blocking high-pass filter (spec 4.3 step 6): removes any constant
//! offset the resampler or channel remap may have introduced before it
//! reaches the normalizer, which assumes a zero-centered signal.

use super::format::PlanarBuffer;

#[derive(Debug, Clone, Copy, Default)]
struct DcState {
    prev_in: f32,
    prev_out: f32,
}

/// One-pole DC blocker, `y[n] = x[n] - x[n-1] + r*y[n-1]`, `r` derived from
/// `cutoff_hz`.
#[derive(Debug, Clone)]
pub struct DcBlocker {
    r: f32,
    state: Vec<DcState>,
}

impl DcBlocker {
    #[must_use]
    pub fn new(sample_rate: u32, cutoff_hz: f32, channel_count: usize) -> Self {
        let r = 1.0 - (2.0 * std::f32::consts::PI * cutoff_hz / sample_rate as f32);
        Self {
            r: r.clamp(0.0, 0.9999),
            state: vec![DcState::default(); channel_count],
        }
    }

    #[must_use]
    pub fn process(&mut self, input: &PlanarBuffer) -> PlanarBuffer {
        let mut output = input.clone();
        for (ch_idx, channel) in output.channels.iter_mut().enumerate() {
            if ch_idx >= self.state.len() {
                self.state.push(DcState::default());
            }
            let state = &mut self.state[ch_idx];
            for sample in channel.iter_mut() {
                let x = *sample;
                let y = x - state.prev_in + self.r * state.prev_out;
                state.prev_in = x;
                state.prev_out = y;
                *sample = y;
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_constant_dc_offset() {
        let mut blocker = DcBlocker::new(48000, 20.0, 1);
        let input = PlanarBuffer {
            channels: vec![vec![0.3; 2000]],
            frames: 2000,
        };
        let output = blocker.process(&input);
        let tail_avg: f32 = output.channels[0][1500..].iter().sum::<f32>() / 500.0;
        assert!(tail_avg.abs() < 0.01, "DC offset should settle near zero, got {tail_avg}");
    }

    #[test]
    fn passes_ac_signal_with_little_attenuation_well_above_cutoff() {
        let sample_rate = 48000;
        let mut blocker = DcBlocker::new(sample_rate, 20.0, 1);
        let freq = 1000.0;
        let samples: Vec<f32> = (0..4800)
            .map(|n| (2.0 * std::f32::consts::PI * freq * n as f32 / sample_rate as f32).sin())
            .collect();
        let input = PlanarBuffer {
            channels: vec![samples.clone()],
            frames: samples.len(),
        };
        let output = blocker.process(&input);
        let in_peak = samples[1000..].iter().cloned().fold(0.0f32, f32::max);
        let out_peak = output.channels[0][1000..].iter().cloned().fold(0.0f32, f32::max);
        assert!((in_peak - out_peak).abs() < 0.05);
    }
}
