//! Channel remapping: a fixed matrix (speaker layout keyed by input channel
//! count) or an auto-mode fallback that applies standard ITU up/downmix
//! coefficients (spec 4.3 step 4).

use super::format::PlanarBuffer;

/// `output_channels[o] = sum_i matrix[o][i] * input_channels[i]`.
#[derive(Debug, Clone)]
pub struct ChannelMatrix {
    rows: Vec<Vec<f32>>,
}

impl ChannelMatrix {
    #[must_use]
    pub fn new(rows: Vec<Vec<f32>>) -> Self {
        Self { rows }
    }

    #[must_use]
    pub fn output_channels(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn identity(channel_count: usize) -> Self {
        let rows = (0..channel_count)
            .map(|i| {
                let mut row = vec![0.0; channel_count];
                row[i] = 1.0;
                row
            })
            .collect();
        Self::new(rows)
    }

    /// Standard ITU-ish up/down-mix for the input channel count, falling
    /// back to truncate-or-duplicate for layouts with no named convention.
    #[must_use]
    pub fn auto(input_channels: usize, output_channels: usize) -> Self {
        match (input_channels, output_channels) {
            (a, b) if a == b => Self::identity(a),
            (1, 2) => Self::new(vec![vec![1.0], vec![1.0]]),
            (2, 1) => Self::new(vec![vec![0.5, 0.5]]),
            // 5.1 (L R C LFE Ls Rs) down to stereo, ITU BS.775 coefficients.
            (6, 2) => Self::new(vec![
                vec![1.0, 0.0, 0.707, 0.0, 0.707, 0.0],
                vec![0.0, 1.0, 0.707, 0.0, 0.0, 0.707],
            ]),
            (6, 1) => Self::new(vec![vec![0.333, 0.333, 0.333, 0.0, 0.0, 0.0]]),
            (1, n) => {
                // Duplicate mono onto every output channel.
                Self::new(vec![vec![1.0]; n])
            }
            (n, m) if m < n => {
                // Truncate extra input channels, identity otherwise.
                let rows = (0..m)
                    .map(|i| {
                        let mut row = vec![0.0; n];
                        row[i] = 1.0;
                        row
                    })
                    .collect();
                Self::new(rows)
            }
            (n, m) => {
                // Upmix by repeating the last available input channel onto
                // any extra output channels.
                let rows = (0..m)
                    .map(|i| {
                        let mut row = vec![0.0; n];
                        row[i.min(n - 1)] = 1.0;
                        row
                    })
                    .collect();
                Self::new(rows)
            }
        }
    }

    #[must_use]
    pub fn apply(&self, input: &PlanarBuffer) -> PlanarBuffer {
        let frames = input.frames;
        let mut output = PlanarBuffer {
            channels: vec![vec![0.0; frames]; self.rows.len()],
            frames,
        };

        for (out_idx, row) in self.rows.iter().enumerate() {
            for frame in 0..frames {
                let mut acc = 0.0f32;
                for (in_idx, &weight) in row.iter().enumerate() {
                    if weight == 0.0 {
                        continue;
                    }
                    if let Some(channel) = input.channels.get(in_idx) {
                        acc += weight * channel[frame];
                    }
                }
                output.channels[out_idx][frame] = acc.clamp(-1.0, 1.0);
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(samples: Vec<Vec<f32>>) -> PlanarBuffer {
        let frames = samples[0].len();
        PlanarBuffer { channels: samples, frames }
    }

    #[test]
    fn identity_matrix_preserves_input() {
        let matrix = ChannelMatrix::identity(2);
        let input = buffer(vec![vec![0.5, -0.5], vec![0.25, -0.25]]);
        let output = matrix.apply(&input);
        assert_eq!(output.channels, input.channels);
    }

    #[test]
    fn mono_to_stereo_duplicates() {
        let matrix = ChannelMatrix::auto(1, 2);
        let input = buffer(vec![vec![0.5, 0.25]]);
        let output = matrix.apply(&input);
        assert_eq!(output.channels[0], output.channels[1]);
    }

    #[test]
    fn stereo_to_mono_averages() {
        let matrix = ChannelMatrix::auto(2, 1);
        let input = buffer(vec![vec![1.0], vec![0.0]]);
        let output = matrix.apply(&input);
        assert!((output.channels[0][0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn surround_downmix_has_expected_channel_count() {
        let matrix = ChannelMatrix::auto(6, 2);
        assert_eq!(matrix.output_channels(), 2);
    }

    #[test]
    fn truncation_fallback_drops_extra_channels() {
        let matrix = ChannelMatrix::auto(4, 2);
        let input = buffer(vec![vec![1.0], vec![0.5], vec![0.25], vec![0.1]]);
        let output = matrix.apply(&input);
        assert_eq!(output.channels[0][0], 1.0);
        assert_eq!(output.channels[1][0], 0.5);
    }
}
