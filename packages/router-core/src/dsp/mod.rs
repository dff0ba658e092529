//! The per-path DSP chain applied by the source processor: format
//! reconciliation, resampling, channel remap, EQ, DC-block, normalization,
//! volume, and dither/requantize (spec 4.3).

pub mod channel_map;
pub mod dc_block;
pub mod dither;
pub mod eq;
pub mod format;
pub mod normalize;
pub mod resample;
pub mod volume;

pub use channel_map::ChannelMatrix;
pub use dc_block::DcBlocker;
pub use dither::Dither;
pub use eq::{EqChain, EqGains, BAND_CENTER_FREQUENCIES_HZ, BAND_COUNT};
pub use format::PlanarBuffer;
pub use normalize::{NormalizeParams, Normalizer};
pub use resample::Resampler;
pub use volume::VolumeControl;
