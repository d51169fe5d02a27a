//! Hardware callbacks and the deferred pass.
//!
//! Work happens in two phases. Phase one runs on the driver's callback under
//! the interrupt lock: it retires the completed block, feeds the driver the
//! next one and runs one mixing quantum. It never wakes anybody. Phase two
//! runs on the `trackmix-deferred` worker thread: it broadcasts to blocked
//! callers and invokes readiness callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::device::{FileId, OpenFile, Readiness};
use crate::error::{Error, Result};
use crate::format::Direction;
use crate::hw::{HardwareDriver, RingExtent, TransferMode};
use crate::mixer::{PlayMixer, RecordMixer};

/// State owned by the interrupt context.
pub(crate) struct IntrState {
    pub(crate) driver: Box<dyn HardwareDriver>,
    pub(crate) mode: TransferMode,
    pub(crate) play: Option<PlayMixer>,
    pub(crate) record: Option<RecordMixer>,
    /// Playback transfers are running.
    pub(crate) pbusy: bool,
    /// Capture transfers are running.
    pub(crate) rbusy: bool,
}

/// Where blocked callers sleep.
#[derive(Default)]
pub(crate) struct Waiters {
    pub(crate) lock: Mutex<()>,
    pub(crate) play: Condvar,
    pub(crate) record: Condvar,
}

impl Waiters {
    pub(crate) fn condvar(&self, direction: Direction) -> &Condvar {
        match direction {
            Direction::Playback => &self.play,
            Direction::Capture => &self.record,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deferred {
    Playback,
    Capture,
    Gone,
    Exit,
}

/// Everything the device, the driver callbacks and the deferred worker
/// share.
pub(crate) struct Shared {
    me: Weak<Shared>,
    pub(crate) intr: Mutex<IntrState>,
    pub(crate) waiters: Waiters,
    deferred: Sender<Deferred>,
    gone: AtomicBool,
    shutdown: AtomicBool,
    play_hwseq: AtomicU64,
    record_hwseq: AtomicU64,
    pub(crate) files: RwLock<HashMap<FileId, Arc<OpenFile>>>,
    single_buffer: bool,
}

impl Shared {
    pub(crate) fn new(intr: IntrState, single_buffer: bool) -> (Arc<Self>, Receiver<Deferred>) {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            intr: Mutex::new(intr),
            waiters: Waiters::default(),
            deferred: tx,
            gone: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            play_hwseq: AtomicU64::new(0),
            record_hwseq: AtomicU64::new(0),
            files: RwLock::new(HashMap::new()),
            single_buffer,
        });
        (shared, rx)
    }

    fn interrupt(&self) -> Interrupt {
        Interrupt {
            shared: self.me.clone(),
        }
    }

    pub(crate) fn defer(&self, event: Deferred) {
        // The worker only goes away after the device is dropped.
        let _ = self.deferred.send(event);
    }

    pub(crate) fn hw_seq(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Playback => self.play_hwseq.load(Ordering::Acquire),
            Direction::Capture => self.record_hwseq.load(Ordering::Acquire),
        }
    }

    pub(crate) fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Fails with `Cancelled` after shutdown and `DeviceGone` after a
    /// hardware loss.
    pub(crate) fn check_alive(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(Error::Cancelled)
        } else if self.is_gone() {
            Err(Error::DeviceGone)
        } else {
            Ok(())
        }
    }

    pub(crate) fn mark_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::AcqRel)
    }

    /// Starts playback transfers if they are not running: prefills the
    /// hardware ring and hands the first block to the driver.
    pub(crate) fn start_playback(&self) -> Result<()> {
        let mut guard = self.intr.lock();
        let st = &mut *guard;
        if st.pbusy {
            return Ok(());
        }
        self.check_alive()?;
        let mixer = st
            .play
            .as_mut()
            .ok_or_else(|| Error::Unsupported("playback".into()))?;
        let prefill = if self.single_buffer { 1 } else { 2 };
        for _ in 0..prefill {
            mixer.process();
        }
        let started = match st.mode {
            TransferMode::Start => st.driver.start_output(mixer.head_block(), self.interrupt()),
            TransferMode::Trigger => {
                let extent = extent(mixer.geometry().block_bytes(), mixer.geometry().hw_blocks);
                st.driver.trigger_output(extent, self.interrupt())
            }
        };
        if let Err(err) = started {
            mixer.halt();
            return Err(err);
        }
        st.pbusy = true;
        debug!(mode = ?st.mode, "playback started");
        Ok(())
    }

    pub(crate) fn start_capture(&self) -> Result<()> {
        let mut guard = self.intr.lock();
        let st = &mut *guard;
        if st.rbusy {
            return Ok(());
        }
        self.check_alive()?;
        let mixer = st
            .record
            .as_mut()
            .ok_or_else(|| Error::Unsupported("capture".into()))?;
        let block_bytes = mixer.geometry().block_bytes();
        let started = match st.mode {
            TransferMode::Start => st.driver.start_input(block_bytes, self.interrupt()),
            TransferMode::Trigger => {
                let extent = extent(block_bytes, mixer.geometry().hw_blocks);
                st.driver.trigger_input(extent, self.interrupt())
            }
        };
        started?;
        st.rbusy = true;
        debug!(mode = ?st.mode, "capture started");
        Ok(())
    }

    pub(crate) fn halt_playback(&self) -> Result<()> {
        let mut guard = self.intr.lock();
        let st = &mut *guard;
        if !st.pbusy {
            return Ok(());
        }
        st.pbusy = false;
        let halted = st.driver.halt_output();
        if let Some(mixer) = st.play.as_mut() {
            mixer.halt();
        }
        self.play_hwseq.store(0, Ordering::Release);
        debug!("playback halted");
        halted
    }

    pub(crate) fn halt_capture(&self) -> Result<()> {
        let mut guard = self.intr.lock();
        let st = &mut *guard;
        if !st.rbusy {
            return Ok(());
        }
        st.rbusy = false;
        let halted = st.driver.halt_input();
        if let Some(mixer) = st.record.as_mut() {
            mixer.halt();
        }
        self.record_hwseq.store(0, Ordering::Release);
        debug!("capture halted");
        halted
    }

    pub(crate) fn halt_all(&self) {
        if let Err(err) = self.halt_playback() {
            warn!(%err, "halting playback failed");
        }
        if let Err(err) = self.halt_capture() {
            warn!(%err, "halting capture failed");
        }
    }

    /// Wakes every blocked caller.
    pub(crate) fn wake_all(&self) {
        let _guard = self.waiters.lock.lock();
        self.waiters.play.notify_all();
        self.waiters.record.notify_all();
    }

    fn output_done(&self) {
        {
            let mut guard = self.intr.lock();
            let st = &mut *guard;
            let Some(mixer) = st.play.as_mut().filter(|_| st.pbusy) else {
                trace!("stray playback interrupt");
                return;
            };
            mixer.complete_block();
            self.play_hwseq.store(mixer.hw_seq(), Ordering::Release);
            match st.mode {
                TransferMode::Start => {
                    let later = mixer.queued_blocks() == 0;
                    if !later {
                        if let Err(err) = st.driver.start_output(mixer.head_block(), self.interrupt()) {
                            mixer.hw_failure(&err);
                        }
                    }
                    mixer.process();
                    if later {
                        if let Err(err) = st.driver.start_output(mixer.head_block(), self.interrupt()) {
                            mixer.hw_failure(&err);
                        }
                    }
                }
                TransferMode::Trigger => {
                    mixer.process();
                }
            }
        }
        self.defer(Deferred::Playback);
    }

    fn input_done(&self, data: &[u8]) {
        {
            let mut guard = self.intr.lock();
            let st = &mut *guard;
            let Some(mixer) = st.record.as_mut().filter(|_| st.rbusy) else {
                trace!("stray capture interrupt");
                return;
            };
            mixer.receive(data);
            while mixer.process() {}
            self.record_hwseq.store(mixer.hw_seq(), Ordering::Release);
            if st.mode == TransferMode::Start {
                let block_bytes = mixer.geometry().block_bytes();
                if let Err(err) = st.driver.start_input(block_bytes, self.interrupt()) {
                    mixer.hw_failure(&err);
                }
            }
        }
        self.defer(Deferred::Capture);
    }

    fn peek_output(&self, buf: &mut [u8]) -> usize {
        let st = self.intr.lock();
        match st.play.as_ref().filter(|_| st.pbusy) {
            Some(mixer) => {
                let block = mixer.head_block();
                let n = block.len().min(buf.len());
                buf[..n].copy_from_slice(&block[..n]);
                n
            }
            None => 0,
        }
    }

    fn device_gone(&self) {
        if !self.gone.swap(true, Ordering::AcqRel) {
            warn!("hardware reported the device gone");
            self.defer(Deferred::Gone);
        }
    }

    /// Calls the readiness callback of every file with a track in one of the
    /// woken directions.
    fn notify_readiness(&self, playback: bool, capture: bool) {
        let files: Vec<Arc<OpenFile>> = self.files.read().values().cloned().collect();
        for file in files {
            let Some(callback) = file.readiness_callback() else {
                continue;
            };
            let mut ready = Readiness::default();
            if let Some(track) = file.playback.as_ref().filter(|_| playback) {
                let st = track.lock();
                ready.writable = !track.is_paused() && st.usrbuf.used() <= st.low;
            }
            if let Some(track) = file.capture.as_ref().filter(|_| capture) {
                ready.readable = track.lock().read_ready();
            }
            if ready.readable || ready.writable {
                callback(file.id, ready);
            }
        }
    }
}

fn extent(block_bytes: usize, blocks: usize) -> RingExtent {
    RingExtent {
        block_bytes,
        ring_bytes: block_bytes * blocks,
    }
}

/// Runs the deferred pass until the device goes away.
pub(crate) fn spawn_worker(shared: Weak<Shared>, rx: Receiver<Deferred>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("trackmix-deferred".into())
        .spawn(move || {
            while let Ok(first) = rx.recv() {
                let events: Vec<Deferred> = std::iter::once(first).chain(rx.try_iter()).collect();
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let gone = events.contains(&Deferred::Gone);
                if gone {
                    shared.halt_all();
                }
                shared.wake_all();
                shared.notify_readiness(
                    gone || events.contains(&Deferred::Playback),
                    gone || events.contains(&Deferred::Capture),
                );
                if events.contains(&Deferred::Exit) {
                    break;
                }
            }
            trace!("deferred worker exiting");
        })
        .map_err(|e| Error::Hardware(format!("spawning deferred worker: {e}")))
}

/// The handle a driver calls back through.
///
/// Clones are cheap. Callbacks arriving after the device was dropped, or for
/// a direction that is halted, are ignored.
#[derive(Clone)]
pub struct Interrupt {
    shared: Weak<Shared>,
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupt")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl Interrupt {
    /// The hardware finished playing the block it was given.
    pub fn output_done(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.output_done();
        }
    }

    /// The hardware filled a capture block.
    pub fn input_done(&self, data: &[u8]) {
        if let Some(shared) = self.shared.upgrade() {
            shared.input_done(data);
        }
    }

    /// Copies the block at the head of the playback ring into `buf`.
    /// Returns the bytes copied, zero when playback is halted.
    pub fn peek_output(&self, buf: &mut [u8]) -> usize {
        self.shared
            .upgrade()
            .map_or(0, |shared| shared.peek_output(buf))
    }

    /// The hardware failed or was removed. Both directions are halted and
    /// every further call fails with [`Error::DeviceGone`].
    pub fn device_gone(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.device_gone();
        }
    }
}
