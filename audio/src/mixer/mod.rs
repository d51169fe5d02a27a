//! Trackmixers: one per direction, between the tracks and the hardware ring.

mod play;
mod record;

pub(crate) use play::PlayMixer;
pub(crate) use record::RecordMixer;

use std::fmt;

use crate::codec::Converter;
use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::format::Format;
use crate::hw::HwCodec;

/// Block and ring sizing shared by a mixer and its tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    /// Negotiated hardware format.
    pub(crate) hw_format: Format,
    /// Frames per hardware block.
    pub(crate) frames_per_block: usize,
    /// Blocks in the hardware ring.
    pub(crate) hw_blocks: usize,
    /// Blocks in a track's output (playback) or input (capture) ring.
    pub(crate) out_blocks: usize,
    /// Minimum user ring size in blocks.
    pub(crate) user_min_blocks: usize,
    /// Preferred user ring size in bytes.
    pub(crate) user_buffer_bytes: usize,
}

impl Geometry {
    pub(crate) fn new(hw_format: Format, frames_per_block: usize, config: &DeviceConfig) -> Self {
        Self {
            hw_format,
            frames_per_block,
            hw_blocks: config.hw_blocks,
            out_blocks: config.out_blocks,
            user_min_blocks: config.user_min_blocks,
            user_buffer_bytes: config.user_buffer_bytes,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(hw_format: Format, frames_per_block: usize) -> Self {
        Self {
            hw_format,
            frames_per_block,
            hw_blocks: 3,
            out_blocks: 4,
            user_min_blocks: 3,
            user_buffer_bytes: 65536,
        }
    }

    /// The format every track pipeline terminates in.
    pub(crate) fn track_format(&self) -> Format {
        Format::internal(self.hw_format.channels, self.hw_format.sample_rate)
    }

    /// Frames covering one block's duration at `rate`, rounded up so a rate
    /// stage always has a whole destination block's worth of source.
    pub(crate) fn frames_per_block_at(&self, rate: u32) -> usize {
        (rate as u64 * self.frames_per_block as u64).div_ceil(self.hw_format.sample_rate as u64) as usize
    }

    /// Bytes in one hardware block.
    pub(crate) fn block_bytes(&self) -> usize {
        self.frames_per_block * self.hw_format.frame_bytes()
    }
}

/// Converts between internal samples and the hardware encoding.
pub(crate) enum HwConverter {
    /// 16-bit linear hardware, native or swapped byte order.
    Soft(Converter),
    /// A codec registered by the driver.
    Driver(Box<dyn HwCodec>),
}

impl HwConverter {
    pub(crate) fn select(format: &Format, driver: Option<Box<dyn HwCodec>>) -> Result<Self> {
        match driver {
            Some(codec) => Ok(Self::Driver(codec)),
            None if format.is_internal() || format.is_internal_swapped() => {
                Ok(Self::Soft(Converter::new(format)))
            }
            None => Err(Error::InvalidFormat(format!(
                "hardware format {format} needs a driver codec"
            ))),
        }
    }

    pub(crate) fn encode(&mut self, src: &[i16], dst: &mut [u8]) -> Result<()> {
        match self {
            Self::Soft(conv) => {
                Converter::encode(conv, src, dst);
                Ok(())
            }
            Self::Driver(codec) => codec.encode(src, dst),
        }
    }

    pub(crate) fn decode(&mut self, src: &[u8], dst: &mut [i16]) -> Result<()> {
        match self {
            Self::Soft(conv) => {
                Converter::decode(conv, src, dst);
                Ok(())
            }
            Self::Driver(codec) => codec.decode(src, dst),
        }
    }
}

impl fmt::Debug for HwConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Soft(conv) => f.debug_tuple("Soft").field(conv).finish(),
            Self::Driver(_) => f.write_str("Driver"),
        }
    }
}

/// Counters of one trackmixer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MixerStats {
    /// Blocks sealed into (playback) or taken from (capture) the hardware ring.
    pub blocks: u64,
    /// Blocks the hardware has completed.
    pub hw_blocks: u64,
    /// Registered tracks.
    pub tracks: usize,
    /// Soft master volume, 256 is unity.
    pub volume: u16,
    /// Quanta in which the AGC lowered the master volume.
    pub agc_events: u64,
    /// Quanta that emitted silence because of a hardware failure.
    pub hw_errors: u64,
    /// Capture blocks lost to a codec failure or a full hardware ring.
    pub dropped_blocks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_per_block_at_rounds_up() {
        let geometry = Geometry::for_tests(Format::internal(2, 48000), 480);
        assert_eq!(geometry.frames_per_block_at(48000), 480);
        assert_eq!(geometry.frames_per_block_at(8000), 80);
        assert_eq!(geometry.frames_per_block_at(44100), 441);
        assert_eq!(geometry.frames_per_block_at(11025), 111);
        assert_eq!(geometry.frames_per_block_at(22050), 221);
    }
}
