//! An in-memory driver: completes blocks when told to, or from a clock
//! thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{Capabilities, Codecs, HardwareDriver, RingExtent, TransferMode};
use crate::dispatch::Interrupt;
use crate::error::{Error, Result};
use crate::format::{Direction, Format};

#[derive(Default)]
struct SimState {
    output: Option<Format>,
    input: Option<Format>,
    trigger: bool,
    codecs: Option<Box<dyn FnMut(Direction) -> Option<Box<dyn super::HwCodec>> + Send>>,
    out_intr: Option<Interrupt>,
    in_intr: Option<Interrupt>,
    /// Start mode: the block handed over by `start_output`.
    pending: Option<Vec<u8>>,
    /// Start mode: bytes requested by `start_input`.
    requested: Option<usize>,
    out_extent: Option<RingExtent>,
    in_extent: Option<RingExtent>,
    played: Vec<u8>,
    blocks_played: u64,
    blocks_captured: u64,
}

/// A driver with no hardware behind it.
///
/// It accepts exactly the formats it was created with. Playback blocks are
/// appended to an in-memory log when completed; capture blocks are supplied
/// by the caller of [`SimulatedDriver::complete_input`]. Clones share state,
/// so a test keeps one clone to drive completions after handing the other to
/// the device.
#[derive(Clone, Default)]
pub struct SimulatedDriver {
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimulatedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("SimulatedDriver")
            .field("output", &st.output)
            .field("input", &st.input)
            .field("trigger", &st.trigger)
            .field("blocks_played", &st.blocks_played)
            .finish()
    }
}

impl SimulatedDriver {
    /// Creates a start-mode driver. `None` disables that direction.
    pub fn new(output: Option<Format>, input: Option<Format>) -> Self {
        let driver = Self::default();
        {
            let mut st = driver.state.lock();
            st.output = output;
            st.input = input;
        }
        driver
    }

    /// Switches to trigger mode.
    pub fn trigger_mode(self) -> Self {
        self.state.lock().trigger = true;
        self
    }

    /// Registers codecs returned from `set_format`, for hardware formats the
    /// core cannot convert on its own.
    pub fn with_codecs(
        self,
        codecs: impl FnMut(Direction) -> Option<Box<dyn super::HwCodec>> + Send + 'static,
    ) -> Self {
        self.state.lock().codecs = Some(Box::new(codecs));
        self
    }

    /// Completes the block in flight. Returns false if playback is idle.
    pub fn complete_output(&self) -> bool {
        let (intr, trigger) = {
            let mut st = self.state.lock();
            let Some(intr) = st.out_intr.clone() else {
                return false;
            };
            if st.trigger {
                (intr, true)
            } else {
                let Some(block) = st.pending.take() else {
                    return false;
                };
                st.played.extend_from_slice(&block);
                st.blocks_played += 1;
                (intr, false)
            }
        };
        if trigger {
            let block_bytes = self.state.lock().out_extent.map_or(0, |e| e.block_bytes);
            let mut block = vec![0u8; block_bytes];
            let n = intr.peek_output(&mut block);
            let mut st = self.state.lock();
            st.played.extend_from_slice(&block[..n]);
            st.blocks_played += 1;
        }
        intr.output_done();
        true
    }

    /// Delivers one filled capture block. Returns false if capture is idle.
    pub fn complete_input(&self, data: &[u8]) -> bool {
        let intr = {
            let mut st = self.state.lock();
            let Some(intr) = st.in_intr.clone() else {
                return false;
            };
            if !st.trigger && st.requested.take().is_none() {
                return false;
            }
            st.blocks_captured += 1;
            intr
        };
        intr.input_done(data);
        true
    }

    /// Reports the device as gone.
    pub fn unplug(&self) {
        let intr = {
            let st = self.state.lock();
            st.out_intr.clone().or_else(|| st.in_intr.clone())
        };
        if let Some(intr) = intr {
            intr.device_gone();
        }
    }

    /// Takes everything played so far.
    pub fn take_played(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().played)
    }

    pub fn blocks_played(&self) -> u64 {
        self.state.lock().blocks_played
    }

    pub fn blocks_captured(&self) -> u64 {
        self.state.lock().blocks_captured
    }

    pub fn is_output_running(&self) -> bool {
        self.state.lock().out_intr.is_some()
    }

    pub fn is_input_running(&self) -> bool {
        self.state.lock().in_intr.is_some()
    }

    /// Bytes per capture block, once capture has started.
    pub fn input_block_bytes(&self) -> Option<usize> {
        let st = self.state.lock();
        st.in_intr.as_ref()?;
        st.requested.or(st.in_extent.map(|e| e.block_bytes))
    }

    /// Completes blocks from a background thread every `period` until the
    /// returned [`Clock`] is dropped. Capture blocks are filled with zeros.
    pub fn start_clock(&self, period: Duration) -> Clock {
        let stop = Arc::new(AtomicBool::new(false));
        let driver = self.clone();
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("trackmix-sim-clock".into())
            .spawn(move || {
                let mut silence = Vec::new();
                while !flag.load(Ordering::Acquire) {
                    if period.is_zero() {
                        thread::yield_now();
                    } else {
                        thread::sleep(period);
                    }
                    driver.complete_output();
                    if let Some(n) = driver.input_block_bytes() {
                        silence.resize(n, 0);
                        driver.complete_input(&silence);
                    }
                }
            })
            .ok();
        Clock { stop, handle }
    }
}

impl HardwareDriver for SimulatedDriver {
    fn capabilities(&self) -> Capabilities {
        let st = self.state.lock();
        Capabilities {
            playback: st.output.is_some(),
            capture: st.input.is_some(),
            mode: if st.trigger {
                TransferMode::Trigger
            } else {
                TransferMode::Start
            },
        }
    }

    fn negotiate_format(&mut self, direction: Direction, requested: &Format) -> Result<Format> {
        let st = self.state.lock();
        let native = match direction {
            Direction::Playback => st.output,
            Direction::Capture => st.input,
        };
        let native = native.ok_or_else(|| Error::Unsupported(format!("{direction} not supported")))?;
        if *requested != native {
            debug!(%direction, %requested, accepted = %native, "simulated driver offered its own format");
        }
        Ok(native)
    }

    fn set_format(&mut self, playback: Option<&Format>, capture: Option<&Format>) -> Result<Codecs> {
        let mut st = self.state.lock();
        let mut codecs = Codecs::default();
        if let Some(make) = st.codecs.as_mut() {
            if playback.is_some() {
                codecs.playback = make(Direction::Playback);
            }
            if capture.is_some() {
                codecs.capture = make(Direction::Capture);
            }
        }
        Ok(codecs)
    }

    fn start_output(&mut self, block: &[u8], intr: Interrupt) -> Result<()> {
        let mut st = self.state.lock();
        if st.trigger {
            return Err(Error::Unsupported("start_output in trigger mode".into()));
        }
        st.pending = Some(block.to_vec());
        st.out_intr = Some(intr);
        Ok(())
    }

    fn start_input(&mut self, block_bytes: usize, intr: Interrupt) -> Result<()> {
        let mut st = self.state.lock();
        if st.trigger {
            return Err(Error::Unsupported("start_input in trigger mode".into()));
        }
        st.requested = Some(block_bytes);
        st.in_intr = Some(intr);
        Ok(())
    }

    fn trigger_output(&mut self, extent: RingExtent, intr: Interrupt) -> Result<()> {
        let mut st = self.state.lock();
        st.out_extent = Some(extent);
        st.out_intr = Some(intr);
        Ok(())
    }

    fn trigger_input(&mut self, extent: RingExtent, intr: Interrupt) -> Result<()> {
        let mut st = self.state.lock();
        st.in_extent = Some(extent);
        st.in_intr = Some(intr);
        Ok(())
    }

    fn halt_output(&mut self) -> Result<()> {
        let mut st = self.state.lock();
        st.out_intr = None;
        st.pending = None;
        Ok(())
    }

    fn halt_input(&mut self) -> Result<()> {
        let mut st = self.state.lock();
        st.in_intr = None;
        st.requested = None;
        Ok(())
    }
}

/// A running simulated clock. Dropping it stops the thread.
#[derive(Debug)]
pub struct Clock {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
