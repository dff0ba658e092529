//! Smoothed volume control (spec 4.3 step 8): multiplies by a gain that
//! itself slews toward the configured target, so a `set_volume` call
//! doesn't produce an audible step ("zipper noise").

use super::format::PlanarBuffer;

#[derive(Debug, Clone)]
pub struct VolumeControl {
    target: f32,
    current: f32,
    smoothing_factor: f32,
}

impl VolumeControl {
    /// `volume` is unbounded above (spec 3: "0..infinity, conventionally
    /// <= 4") but clamped to zero from below.
    #[must_use]
    pub fn new(volume: f32, smoothing_factor: f32) -> Self {
        let target = volume.max(0.0);
        Self {
            target,
            current: target,
            smoothing_factor: smoothing_factor.clamp(0.0, 1.0),
        }
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.target = volume.max(0.0);
    }

    #[must_use]
    pub fn current(&self) -> f32 {
        self.current
    }

    #[must_use]
    pub fn process(&mut self, input: &PlanarBuffer) -> PlanarBuffer {
        let mut output = input.clone();
        for channel in &mut output.channels {
            for sample in channel.iter_mut() {
                self.current += self.smoothing_factor * (self.target - self.current);
                *sample = (*sample * self.current).clamp(-1.0, 1.0);
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_volume_is_passthrough_at_steady_state() {
        let mut vol = VolumeControl::new(1.0, 0.1);
        let input = PlanarBuffer {
            channels: vec![vec![0.5; 10]],
            frames: 10,
        };
        let output = vol.process(&input);
        assert!((output.channels[0][9] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn volume_change_slews_rather_than_stepping() {
        let mut vol = VolumeControl::new(1.0, 0.1);
        vol.set_volume(0.0);
        let input = PlanarBuffer {
            channels: vec![vec![0.5; 1]],
            frames: 1,
        };
        let output = vol.process(&input);
        // One tick of a 0.1 smoothing factor should not reach zero immediately.
        assert!(output.channels[0][0] > 0.0);
    }

    #[test]
    fn volume_eventually_converges_to_target() {
        let mut vol = VolumeControl::new(1.0, 0.2);
        vol.set_volume(0.0);
        let input = PlanarBuffer {
            channels: vec![vec![0.5; 200]],
            frames: 200,
        };
        let output = vol.process(&input);
        assert!(output.channels[0][199].abs() < 0.01);
    }

    #[test]
    fn volume_above_unity_is_allowed() {
        let mut vol = VolumeControl::new(2.0, 1.0);
        let input = PlanarBuffer {
            channels: vec![vec![0.4; 1]],
            frames: 1,
        };
        let output = vol.process(&input);
        assert!((output.channels[0][0] - 0.8).abs() < 1e-4);
    }
}
