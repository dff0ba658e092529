//! Local playback device seam (spec 4.4/6 "ALSA sink", Non-goals: no real
//! ALSA binding is implemented here). `AlsaPlaybackDevice` is the trait a
//! concrete binding (e.g. the `alsa` crate) would implement; `AlsaSender`
//! wires one into [`SinkTransport`] so the mixer can treat a local device
//! exactly like a network sink.

use crate::error::{RouterError, RouterResult};
use crate::packet::FormatDescriptor;
use crate::sink::SinkTransport;

/// Seam for a local playback device. A real implementation would open an
/// ALSA PCM handle configured for `format` and write interleaved frames to
/// it, blocking (or returning `Err` on underrun/xrun) as the hardware ring
/// buffer drains.
pub trait AlsaPlaybackDevice: Send {
    fn write_interleaved(&mut self, pcm: &[u8], format: &FormatDescriptor) -> RouterResult<()>;
}

/// Adapts an [`AlsaPlaybackDevice`] to [`SinkTransport`].
pub struct AlsaSender<D: AlsaPlaybackDevice> {
    device: D,
}

impl<D: AlsaPlaybackDevice> AlsaSender<D> {
    #[must_use]
    pub fn new(device: D) -> Self {
        Self { device }
    }
}

impl<D: AlsaPlaybackDevice> SinkTransport for AlsaSender<D> {
    fn send_chunk(&mut self, pcm: &[u8], format: &FormatDescriptor) -> RouterResult<()> {
        self.device.write_interleaved(pcm, format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDevice {
        writes: Vec<usize>,
        fail_next: bool,
    }

    impl AlsaPlaybackDevice for FakeDevice {
        fn write_interleaved(&mut self, pcm: &[u8], _format: &FormatDescriptor) -> RouterResult<()> {
            if self.fail_next {
                return Err(RouterError::Transport("xrun".into()));
            }
            self.writes.push(pcm.len());
            Ok(())
        }
    }

    fn fmt() -> FormatDescriptor {
        FormatDescriptor::new(48000, 16, 2, 0x0003)
    }

    #[test]
    fn forwards_writes_to_the_device() {
        let mut sender = AlsaSender::new(FakeDevice {
            writes: Vec::new(),
            fail_next: false,
        });
        sender.send_chunk(&[0u8; 16], &fmt()).unwrap();
        assert_eq!(sender.device.writes, vec![16]);
    }

    #[test]
    fn propagates_device_errors() {
        let mut sender = AlsaSender::new(FakeDevice {
            writes: Vec::new(),
            fail_next: true,
        });
        assert!(sender.send_chunk(&[0u8; 16], &fmt()).is_err());
    }
}
