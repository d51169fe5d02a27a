//! The caller-facing surface.
//!
//! A [`Device`] owns the driver, both trackmixers, the registry of open
//! files and the deferred worker. Every stream operation takes the
//! [`FileId`] returned by [`Device::open`].
//!
//! # Example
//!
//! ```
//! use trackmix_audio::{Device, DeviceConfig, Format, OpenMode, SimulatedDriver};
//!
//! let hw = Format::internal(2, 48000);
//! let driver = SimulatedDriver::new(Some(hw), None);
//! let device = Device::new(driver.clone(), DeviceConfig::default()).unwrap();
//!
//! let file = device.open(OpenMode::Playback).unwrap();
//! device.set_format(file, "ulaw:8000:1".parse().unwrap()).unwrap();
//! assert_eq!(device.write(file, &[0xFF; 800]).unwrap(), 800);
//!
//! let _clock = driver.start_clock(std::time::Duration::ZERO);
//! device.drain(file).unwrap();
//! device.close(file).unwrap();
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::DeviceConfig;
use crate::dispatch::{self, Deferred, IntrState, Shared};
use crate::error::{Error, Result};
use crate::format::{Direction, Format};
use crate::hw::{Codecs, HardwareDriver};
use crate::mixer::{Geometry, HwConverter, MixerStats, PlayMixer, RecordMixer};
use crate::stage::{StageKind, UNITY_GAIN};
use crate::track::{Layout, PlayState, Track, TrackStats};

/// Identifies an open file on a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which tracks an open file gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Playback,
    Capture,
    Duplex,
}

impl OpenMode {
    fn directions(self) -> &'static [Direction] {
        match self {
            OpenMode::Playback => &[Direction::Playback],
            OpenMode::Capture => &[Direction::Capture],
            OpenMode::Duplex => &[Direction::Playback, Direction::Capture],
        }
    }
}

/// What a readiness callback reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Captured bytes are waiting.
    pub readable: bool,
    /// The playback user ring is at or below its low watermark.
    pub writable: bool,
}

type ReadinessCallback = Arc<dyn Fn(FileId, Readiness) + Send + Sync>;

/// One open file: up to one track per direction.
pub(crate) struct OpenFile {
    pub(crate) id: FileId,
    pub(crate) playback: Option<Arc<Track>>,
    pub(crate) capture: Option<Arc<Track>>,
    nonblock: AtomicBool,
    readiness: Mutex<Option<ReadinessCallback>>,
}

impl OpenFile {
    pub(crate) fn readiness_callback(&self) -> Option<ReadinessCallback> {
        self.readiness.lock().clone()
    }

    fn tracks(&self) -> impl Iterator<Item = &Arc<Track>> {
        self.playback.iter().chain(self.capture.iter())
    }

    fn track(&self, direction: Direction) -> Result<&Arc<Track>> {
        let track = match direction {
            Direction::Playback => self.playback.as_ref(),
            Direction::Capture => self.capture.as_ref(),
        };
        track.ok_or_else(|| Error::BadFile(format!("{} has no {direction} track", self.id)))
    }

    fn is_nonblocking(&self) -> bool {
        self.nonblock.load(Ordering::Relaxed)
    }
}

/// An audio device: the driver plus every open stream on it.
pub struct Device {
    shared: Arc<Shared>,
    config: DeviceConfig,
    /// Serializes open, close and format changes.
    exlock: Mutex<()>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("files", &self.shared.files.read().len())
            .field("gone", &self.shared.is_gone())
            .finish()
    }
}

impl Device {
    /// Negotiates hardware formats with `driver` and starts the deferred
    /// worker. Mixers start when the first track needs them.
    pub fn new(driver: impl HardwareDriver + 'static, config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        let mut driver: Box<dyn HardwareDriver> = Box::new(driver);
        let caps = driver.capabilities();
        if !caps.supports(Direction::Playback) && !caps.supports(Direction::Capture) {
            return Err(Error::Unsupported("driver has neither playback nor capture".into()));
        }
        let playback = caps.supports(Direction::Playback).then_some(config.playback);
        let capture = caps.supports(Direction::Capture).then_some(config.capture);
        let (play, record) = configure(driver.as_mut(), &config, playback, capture)?;

        let intr = IntrState {
            driver,
            mode: caps.mode,
            play,
            record,
            pbusy: false,
            rbusy: false,
        };
        let (shared, rx) = Shared::new(intr, config.single_buffer);
        let worker = dispatch::spawn_worker(Arc::downgrade(&shared), rx)?;
        Ok(Self {
            shared,
            config,
            exlock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The negotiated hardware format of `direction`.
    pub fn hardware_format(&self, direction: Direction) -> Result<Format> {
        Ok(self.geometry(direction)?.hw_format)
    }

    fn geometry(&self, direction: Direction) -> Result<Geometry> {
        let st = self.shared.intr.lock();
        let geometry = match direction {
            Direction::Playback => st.play.as_ref().map(|m| *m.geometry()),
            Direction::Capture => st.record.as_ref().map(|m| *m.geometry()),
        };
        geometry.ok_or_else(|| Error::Unsupported(format!("{direction} not available")))
    }

    fn file(&self, id: FileId) -> Result<Arc<OpenFile>> {
        self.shared
            .files
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::BadFile(format!("{id} is not open")))
    }

    /// Opens a file with a track per direction of `mode`, each in the
    /// configured default format. Opening for capture starts the capture
    /// mixer.
    pub fn open(&self, mode: OpenMode) -> Result<FileId> {
        self.shared.check_alive()?;
        let _cfg = self.exlock.lock();
        let id = FileId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut playback = None;
        let mut capture = None;
        for &direction in mode.directions() {
            let geometry = self.geometry(direction)?;
            let track = Arc::new(Track::new(id.0, direction, self.config.default_format, &geometry)?);
            match direction {
                Direction::Playback => playback = Some(track),
                Direction::Capture => capture = Some(track),
            }
        }

        {
            let mut st = self.shared.intr.lock();
            if let (Some(track), Some(mixer)) = (&playback, st.play.as_mut()) {
                mixer.add_track(track.clone());
            }
            if let (Some(track), Some(mixer)) = (&capture, st.record.as_mut()) {
                mixer.add_track(track.clone());
            }
        }
        let file = Arc::new(OpenFile {
            id,
            playback,
            capture,
            nonblock: AtomicBool::new(false),
            readiness: Mutex::new(None),
        });
        let has_capture = file.capture.is_some();
        self.shared.files.write().insert(id, file);
        if has_capture {
            if let Err(err) = self.shared.start_capture() {
                self.unregister(id, true);
                return Err(err);
            }
        }
        debug!(file = %id, ?mode, format = %self.config.default_format, "opened");
        Ok(id)
    }

    /// Removes a file from the registry and its tracks from the mixers,
    /// halting a mixer left without tracks.
    fn unregister(&self, id: FileId, quiet: bool) -> Option<Arc<OpenFile>> {
        let file = self.shared.files.write().remove(&id)?;
        let (play_empty, record_empty) = {
            let mut st = self.shared.intr.lock();
            let play_empty = match st.play.as_mut() {
                Some(m) => m.remove_track(id.0) && m.tracks().is_empty(),
                None => false,
            };
            let record_empty = match st.record.as_mut() {
                Some(m) => m.remove_track(id.0) && m.tracks().is_empty(),
                None => false,
            };
            (play_empty, record_empty)
        };
        let mut halted = Ok(());
        if play_empty {
            halted = halted.and(self.shared.halt_playback());
        }
        if record_empty {
            halted = halted.and(self.shared.halt_capture());
        }
        if let (Err(err), false) = (halted, quiet) {
            warn!(%err, file = %id, "halting mixer on close failed");
        }
        Some(file)
    }

    /// Writes bytes to the playback track. Blocks while the user ring is
    /// full unless the file is non-blocking; a non-blocking write that made
    /// partial progress returns the partial count. A zero-length write is
    /// counted as an end-of-file marker.
    pub fn write(&self, id: FileId, data: &[u8]) -> Result<usize> {
        let file = self.file(id)?;
        let track = file.track(Direction::Playback)?;
        self.shared.check_alive()?;
        if data.is_empty() {
            track.lock().stats.eof_count += 1;
            return Ok(0);
        }

        let mut written = 0;
        loop {
            let n = {
                let mut st = track.lock();
                let n = st.write_user(&data[written..]);
                if n > 0 {
                    st.play_state = PlayState::Running;
                }
                st.play_all();
                n
            };
            written += n;
            if n > 0 && !track.is_paused() {
                self.shared.start_playback()?;
            }
            if written == data.len() {
                return Ok(written);
            }
            if n == 0 {
                if file.is_nonblocking() {
                    return if written > 0 {
                        Ok(written)
                    } else {
                        Err(Error::WouldBlock)
                    };
                }
                self.wait_until(Direction::Playback, || {
                    let st = track.lock();
                    st.usrbuf.used() <= st.low
                })?;
                self.shared.check_alive()?;
            }
        }
    }

    /// Reads captured bytes. Blocks until at least one byte is available
    /// unless the file is non-blocking.
    pub fn read(&self, id: FileId, buf: &mut [u8]) -> Result<usize> {
        let file = self.file(id)?;
        let track = file.track(Direction::Capture)?;
        loop {
            self.shared.check_alive()?;
            {
                let mut st = track.lock();
                st.record_all();
                let n = st.read_user(buf);
                if n > 0 || buf.is_empty() {
                    return Ok(n);
                }
            }
            if file.is_nonblocking() {
                return Err(Error::WouldBlock);
            }
            self.wait_until(Direction::Capture, || track.lock().read_ready())?;
        }
    }

    /// Sleeps until `ready` holds. Fails with `Timeout` when the hardware
    /// makes no progress for a whole wait period, and with `Cancelled` or
    /// `DeviceGone` when woken by shutdown or device loss.
    fn wait_until(&self, direction: Direction, mut ready: impl FnMut() -> bool) -> Result<()> {
        let timeout = self.config.io_timeout();
        let cv = self.shared.waiters.condvar(direction);
        let mut guard = self.shared.waiters.lock.lock();
        let mut seq = self.shared.hw_seq(direction);
        let mut deadline = Instant::now() + timeout;
        loop {
            self.shared.check_alive()?;
            if ready() {
                return Ok(());
            }
            let timed_out = cv.wait_until(&mut guard, deadline).timed_out();
            let now = self.shared.hw_seq(direction);
            if now != seq {
                seq = now;
                deadline = Instant::now() + timeout;
            } else if timed_out {
                self.shared.check_alive()?;
                return if ready() { Ok(()) } else { Err(Error::Timeout) };
            }
        }
    }

    /// Changes the format of every track of the file. Pending data is
    /// discarded. On failure nothing changes.
    pub fn set_format(&self, id: FileId, format: Format) -> Result<()> {
        let file = self.file(id)?;
        self.shared.check_alive()?;
        let format = format.validate()?;
        let _cfg = self.exlock.lock();
        self.rebuild(&file, |_| format, None)?;
        debug!(file = %id, %format, "format set");
        Ok(())
    }

    /// Rebuilds the layouts of every track of `file` off-lock, then installs
    /// them all. Gains are taken from `ch_volume` when given.
    fn rebuild(
        &self,
        file: &OpenFile,
        format: impl Fn(&Track) -> Format,
        ch_volume: Option<&[u16]>,
    ) -> Result<()> {
        let mut layouts = Vec::new();
        for track in file.tracks() {
            let geometry = self.geometry(track.direction)?;
            let gains = match ch_volume {
                Some(gains) => gains.to_vec(),
                None => track.lock().ch_volume.clone(),
            };
            let layout = Layout::build(track.direction, format(track.as_ref()), &geometry, &gains)?;
            layouts.push((track, layout, gains));
        }
        for (track, layout, gains) in layouts {
            let mut st = track.lock();
            st.clear();
            st.install(layout);
            st.ch_volume = gains;
        }
        Ok(())
    }

    /// The user format of the file's track in `direction`.
    pub fn format(&self, id: FileId, direction: Direction) -> Result<Format> {
        Ok(self.file(id)?.track(direction)?.lock().format())
    }

    /// Active conversion stages of the file's track in `direction`, in
    /// processing order.
    pub fn stages(&self, id: FileId, direction: Direction) -> Result<Vec<StageKind>> {
        Ok(self.file(id)?.track(direction)?.stages())
    }

    /// Sets per-channel gains (0..=256) on every track of the file.
    pub fn set_channel_volumes(&self, id: FileId, gains: &[u16]) -> Result<()> {
        let file = self.file(id)?;
        self.shared.check_alive()?;
        let gains: Vec<u16> = gains.iter().map(|&g| g.min(UNITY_GAIN)).collect();
        let _cfg = self.exlock.lock();
        self.rebuild(&file, |t| t.lock().format(), Some(&gains))?;
        debug!(file = %id, ?gains, "channel volumes set");
        Ok(())
    }

    /// Sets the mixing gain (0..=256) of the playback track.
    pub fn set_gain(&self, id: FileId, gain: u16) -> Result<()> {
        self.file(id)?.track(Direction::Playback)?.set_gain(gain);
        Ok(())
    }

    /// Overrides the user ring watermarks of every track, in blocks.
    pub fn set_watermarks(&self, id: FileId, high_blocks: usize, low_blocks: usize) -> Result<()> {
        let file = self.file(id)?;
        for track in file.tracks() {
            track.lock().set_watermarks(high_blocks, low_blocks, track.direction)?;
        }
        Ok(())
    }

    /// Pauses or resumes every track of the file. Resuming starts the mixers
    /// the tracks need.
    pub fn pause(&self, id: FileId, paused: bool) -> Result<()> {
        let file = self.file(id)?;
        self.shared.check_alive()?;
        for track in file.tracks() {
            track.set_paused(paused);
        }
        if !paused {
            if let Some(track) = &file.playback {
                let pending = !track.lock().usrbuf.is_empty();
                if pending {
                    self.shared.start_playback()?;
                }
            }
            if file.capture.is_some() {
                self.shared.start_capture()?;
            }
        }
        self.shared.defer(Deferred::Playback);
        debug!(file = %id, paused, "pause set");
        Ok(())
    }

    /// Blocks until everything written has been played by the hardware.
    /// A paused track is cleared instead. On timeout the track is cleared and
    /// `Timeout` returned.
    pub fn drain(&self, id: FileId) -> Result<()> {
        let file = self.file(id)?;
        let track = file.track(Direction::Playback)?;
        self.drain_track(id, track, false)
    }

    fn drain_track(&self, id: FileId, track: &Track, closing: bool) -> Result<()> {
        self.shared.check_alive()?;
        if track.is_paused() {
            track.lock().discard();
            return Ok(());
        }
        let pending = {
            let mut st = track.lock();
            if st.play_state == PlayState::Running {
                st.play_state = PlayState::Draining;
            }
            st.play_all();
            !st.drained(self.shared.hw_seq(Direction::Playback))
        };
        if pending {
            self.shared.start_playback()?;
        }
        let drained = self.wait_until(Direction::Playback, || {
            track.lock().drained(self.shared.hw_seq(Direction::Playback))
        });
        match drained {
            Ok(()) => {
                track.lock().play_state = PlayState::Clear;
                Ok(())
            }
            Err(Error::Timeout) => {
                warn!(file = %id, "drain timed out, discarding pending data");
                track.lock().discard();
                if closing { Ok(()) } else { Err(Error::Timeout) }
            }
            Err(Error::Cancelled) if closing => {
                track.lock().discard();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Discards everything buffered in every track of the file.
    pub fn flush(&self, id: FileId) -> Result<()> {
        let file = self.file(id)?;
        for track in file.tracks() {
            track.lock().discard();
        }
        self.shared.defer(Deferred::Playback);
        Ok(())
    }

    /// Bytes a read would return without blocking.
    pub fn readable_bytes(&self, id: FileId) -> Result<usize> {
        let file = self.file(id)?;
        let mut st = file.track(Direction::Capture)?.lock();
        st.record_all();
        Ok(st.usrbuf.used())
    }

    /// Registers a callback run from the deferred worker whenever the file
    /// becomes readable or writable. Replaces any previous callback.
    pub fn register_for_readiness(
        &self,
        id: FileId,
        callback: impl Fn(FileId, Readiness) + Send + Sync + 'static,
    ) -> Result<()> {
        let file = self.file(id)?;
        *file.readiness.lock() = Some(Arc::new(callback));
        Ok(())
    }

    pub fn set_nonblocking(&self, id: FileId, nonblocking: bool) -> Result<()> {
        self.file(id)?.nonblock.store(nonblocking, Ordering::Relaxed);
        Ok(())
    }

    /// Counters of the file's track in `direction`.
    pub fn stats(&self, id: FileId, direction: Direction) -> Result<TrackStats> {
        Ok(self.file(id)?.track(direction)?.lock().stats)
    }

    /// Drains the playback track and closes the file. Closing the last track
    /// of a direction halts that mixer.
    pub fn close(&self, id: FileId) -> Result<()> {
        let file = self.file(id)?;
        if let Some(track) = &file.playback {
            if let Err(err) = self.drain_track(id, track, true) {
                debug!(file = %id, %err, "drain on close failed");
            }
        }
        let _cfg = self.exlock.lock();
        self.unregister(id, self.shared.is_gone());
        debug!(file = %id, "closed");
        Ok(())
    }

    /// Counters of the mixer in `direction`.
    pub fn mixer_stats(&self, direction: Direction) -> Result<MixerStats> {
        let st = self.shared.intr.lock();
        let stats = match direction {
            Direction::Playback => st.play.as_ref().map(PlayMixer::stats),
            Direction::Capture => st.record.as_ref().map(RecordMixer::stats),
        };
        stats.ok_or_else(|| Error::Unsupported(format!("{direction} not available")))
    }

    /// Renegotiates the hardware formats and rebuilds every open track for
    /// the new geometry. Pending data is discarded.
    pub fn set_hardware_format(&self, playback: Option<Format>, capture: Option<Format>) -> Result<()> {
        self.shared.check_alive()?;
        let _cfg = self.exlock.lock();
        self.shared.halt_all();

        let files: Vec<Arc<OpenFile>> = self.shared.files.read().values().cloned().collect();
        let mut guard = self.shared.intr.lock();
        let st = &mut *guard;
        let playback = playback.or(st.play.as_ref().map(|m| m.geometry().hw_format));
        let capture = capture.or(st.record.as_ref().map(|m| m.geometry().hw_format));
        let (mut play, mut record) = configure(st.driver.as_mut(), &self.config, playback, capture)?;

        let mut layouts = Vec::new();
        for file in &files {
            for track in file.tracks() {
                let geometry = match track.direction {
                    Direction::Playback => play.as_ref().map(|m| *m.geometry()),
                    Direction::Capture => record.as_ref().map(|m| *m.geometry()),
                };
                let geometry = geometry
                    .ok_or_else(|| Error::Unsupported(format!("{} not available", track.direction)))?;
                let (format, gains) = {
                    let ts = track.lock();
                    (ts.format(), ts.ch_volume.clone())
                };
                layouts.push((track.clone(), Layout::build(track.direction, format, &geometry, &gains)?));
            }
        }
        for (track, layout) in layouts {
            {
                let mut ts = track.lock();
                ts.clear();
                ts.install(layout);
                ts.seq = 0;
            }
            match track.direction {
                Direction::Playback => play.as_mut().map(|m| m.add_track(track)),
                Direction::Capture => record.as_mut().map(|m| m.add_track(track)),
            };
        }
        let restart_capture = record.as_ref().is_some_and(|m| !m.tracks().is_empty());
        st.play = play;
        st.record = record;
        drop(guard);

        debug!(?playback, ?capture, "hardware format changed");
        if restart_capture {
            self.shared.start_capture()?;
        }
        Ok(())
    }

    /// Halts both directions and wakes every blocked caller with
    /// `Cancelled`. Further calls fail with `Cancelled`.
    pub fn shutdown(&self) {
        if self.shared.mark_shutdown() {
            debug!("shutting down");
            self.shared.halt_all();
            self.shared.wake_all();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
        self.shared.defer(Deferred::Exit);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

/// Negotiates formats and block sizes with the driver and builds the mixers.
fn configure(
    driver: &mut dyn HardwareDriver,
    config: &DeviceConfig,
    playback: Option<Format>,
    capture: Option<Format>,
) -> Result<(Option<PlayMixer>, Option<RecordMixer>)> {
    let play_geometry = match playback {
        Some(requested) => Some(negotiate(driver, config, Direction::Playback, requested)?),
        None => None,
    };
    let record_geometry = match capture {
        Some(requested) => Some(negotiate(driver, config, Direction::Capture, requested)?),
        None => None,
    };
    let Codecs {
        playback: play_codec,
        capture: record_codec,
    } = driver.set_format(
        play_geometry.as_ref().map(|g| &g.hw_format),
        record_geometry.as_ref().map(|g| &g.hw_format),
    )?;

    let play = play_geometry
        .map(|g| -> Result<PlayMixer> {
            Ok(PlayMixer::new(g, HwConverter::select(&g.hw_format, play_codec)?, config.agc))
        })
        .transpose()?;
    let record = record_geometry
        .map(|g| -> Result<RecordMixer> {
            Ok(RecordMixer::new(g, HwConverter::select(&g.hw_format, record_codec)?))
        })
        .transpose()?;
    Ok((play, record))
}

fn negotiate(
    driver: &mut dyn HardwareDriver,
    config: &DeviceConfig,
    direction: Direction,
    requested: Format,
) -> Result<Geometry> {
    let format = driver.negotiate_format(direction, &requested)?.validate()?;
    let frame_bytes = format.frame_bytes();
    let frames = (format.sample_rate as usize * config.block_ms as usize).div_ceil(1000);
    let bytes = driver.round_block_size(direction, frames * frame_bytes);
    if bytes == 0 || bytes % frame_bytes != 0 {
        return Err(Error::Hardware(format!(
            "driver rounded the {direction} block to {bytes} bytes, not a multiple of {frame_bytes}"
        )));
    }
    debug!(%direction, %requested, accepted = %format, block_bytes = bytes, "hardware format negotiated");
    Ok(Geometry::new(format, bytes / frame_bytes, config))
}
