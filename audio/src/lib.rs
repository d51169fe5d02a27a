//! Machine-independent audio track mixing.
//!
//! Any number of playback and capture streams, each in its own sample
//! format, are multiplexed onto one hardware stream at one negotiated
//! format:
//!
//! - [`Format`] and the [`codec`] module describe and convert sample
//!   encodings
//! - each open stream is a track with a user ring and a minimal chain of
//!   conversion stages (rate, channel mix, channel volume, codec)
//! - the playback trackmixer sums tracks into a 32-bit accumulator with
//!   automatic gain control; the capture trackmixer fans blocks out
//! - a [`HardwareDriver`] moves blocks and calls back through an
//!   [`Interrupt`] handle
//! - [`Device`] is the caller-facing surface
//!
//! # Example
//!
//! ```
//! use trackmix_audio::{Device, DeviceConfig, Direction, Format, OpenMode, SimulatedDriver, StageKind};
//!
//! let driver = SimulatedDriver::new(Some(Format::internal(2, 48000)), None);
//! let device = Device::new(driver, DeviceConfig::default()).unwrap();
//! let file = device.open(OpenMode::Playback).unwrap();
//!
//! // Tracks open as 8 kHz mono µ-law.
//! assert_eq!(
//!     device.stages(file, Direction::Playback).unwrap(),
//!     vec![StageKind::Codec, StageKind::ChannelMix, StageKind::Rate],
//! );
//! ```

pub mod codec;
mod config;
mod device;
mod dispatch;
mod error;
mod format;
pub mod hw;
mod mixer;
mod pipeline;
mod stage;
mod track;

pub use codec::Converter;
pub use config::{DEFAULT_HW_FORMAT, DeviceConfig};
pub use device::{Device, FileId, OpenMode, Readiness};
pub use dispatch::Interrupt;
pub use error::{Error, Result};
pub use format::{Direction, Encoding, Format, MAX_CHANNELS, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};
pub use hw::{Capabilities, Clock, Codecs, HardwareDriver, HwCodec, RingExtent, SimulatedDriver, TransferMode};
pub use mixer::MixerStats;
pub use stage::{StageKind, UNITY_GAIN};
pub use track::{PlayState, TrackStats};
