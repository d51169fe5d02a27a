//! The hardware driver boundary.
//!
//! The core never touches hardware directly. It negotiates a format through
//! [`HardwareDriver`], hands it one block at a time (start mode) or a whole
//! ring (trigger mode), and gets called back through an
//! [`Interrupt`](crate::Interrupt) handle once per completed block.

mod sim;

pub use sim::{Clock, SimulatedDriver};

use crate::codec::Converter;
use crate::dispatch::Interrupt;
use crate::error::{Error, Result};
use crate::format::{Direction, Format};

/// How the driver moves blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// One `start_output`/`start_input` call per block.
    Start,
    /// One `trigger_output`/`trigger_input` call per run; the driver walks the
    /// ring on its own.
    Trigger,
}

/// What a driver can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub playback: bool,
    pub capture: bool,
    pub mode: TransferMode,
}

impl Capabilities {
    pub fn supports(&self, direction: Direction) -> bool {
        match direction {
            Direction::Playback => self.playback,
            Direction::Capture => self.capture,
        }
    }
}

/// The hardware ring handed to a trigger-mode driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingExtent {
    /// Bytes per block; the driver interrupts once per block.
    pub block_bytes: usize,
    /// Bytes in the whole ring.
    pub ring_bytes: usize,
}

/// A software codec between internal samples and a hardware encoding that
/// is not 16-bit linear.
pub trait HwCodec: Send {
    /// Encodes one block of internal samples for the hardware.
    fn encode(&mut self, src: &[i16], dst: &mut [u8]) -> Result<()>;

    /// Decodes one hardware block into internal samples.
    fn decode(&mut self, src: &[u8], dst: &mut [i16]) -> Result<()>;
}

impl HwCodec for Converter {
    fn encode(&mut self, src: &[i16], dst: &mut [u8]) -> Result<()> {
        Converter::encode(self, src, dst);
        Ok(())
    }

    fn decode(&mut self, src: &[u8], dst: &mut [i16]) -> Result<()> {
        Converter::decode(self, src, dst);
        Ok(())
    }
}

/// Codecs a driver registers in [`HardwareDriver::set_format`].
#[derive(Default)]
pub struct Codecs {
    pub playback: Option<Box<dyn HwCodec>>,
    pub capture: Option<Box<dyn HwCodec>>,
}

impl std::fmt::Debug for Codecs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codecs")
            .field("playback", &self.playback.is_some())
            .field("capture", &self.capture.is_some())
            .finish()
    }
}

/// A hardware driver.
///
/// Completion callbacks must be delivered through the [`Interrupt`] handle
/// from a context that does not hold any lock the driver's own methods take:
/// the core calls back into the driver while holding its interrupt lock.
pub trait HardwareDriver: Send {
    fn capabilities(&self) -> Capabilities;

    /// Returns the closest format the hardware accepts for `requested`.
    fn negotiate_format(&mut self, direction: Direction, requested: &Format) -> Result<Format>;

    /// Commits the negotiated formats and returns any codecs the core must
    /// run between its internal samples and the hardware encoding.
    fn set_format(&mut self, playback: Option<&Format>, capture: Option<&Format>) -> Result<Codecs>;

    /// Adjusts a block size in bytes. The result must be a multiple of the
    /// hardware frame size.
    fn round_block_size(&self, _direction: Direction, bytes: usize) -> usize {
        bytes
    }

    /// Transfers one block to the hardware.
    fn start_output(&mut self, _block: &[u8], _intr: Interrupt) -> Result<()> {
        Err(Error::Unsupported("start_output".into()))
    }

    /// Asks the hardware to fill one block of `block_bytes`.
    fn start_input(&mut self, _block_bytes: usize, _intr: Interrupt) -> Result<()> {
        Err(Error::Unsupported("start_input".into()))
    }

    /// Starts walking the playback ring.
    fn trigger_output(&mut self, _extent: RingExtent, _intr: Interrupt) -> Result<()> {
        Err(Error::Unsupported("trigger_output".into()))
    }

    /// Starts filling the capture ring.
    fn trigger_input(&mut self, _extent: RingExtent, _intr: Interrupt) -> Result<()> {
        Err(Error::Unsupported("trigger_input".into()))
    }

    fn halt_output(&mut self) -> Result<()>;

    fn halt_input(&mut self) -> Result<()>;
}
