//! Tracks: one open playback or capture stream.
//!
//! A [`Track`] is shared between its owner (caller context) and the mixer
//! (interrupt context). Everything mutable lives in [`TrackState`] behind the
//! per-track lock; the mixer only ever `try_lock`s it and skips the track for
//! one quantum when the owner holds it.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use parking_lot::{Mutex, MutexGuard};
use trackmix_buffer::Ring;

use crate::error::{Error, Result};
use crate::format::{Direction, Format};
use crate::mixer::Geometry;
use crate::pipeline::Pipeline;
use crate::stage::{StageKind, UNITY_GAIN};

/// Playback progress of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    /// Nothing pending: never written, drained or flushed.
    Clear,
    /// Written to since the last drain or flush.
    Running,
    /// A drain is in progress.
    Draining,
}

/// Monotonic per-track counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackStats {
    /// Bytes moved between the caller and the user ring.
    pub user_bytes: u64,
    /// Frames handed to (playback) or received from (capture) the mixer.
    pub output_frames: u64,
    /// Capture frames discarded because the input ring was full.
    pub drop_frames: u64,
    /// Quanta in which a running playback track had nothing to mix.
    pub underruns: u64,
    /// Zero-length writes.
    pub eof_count: u64,
}

/// A user ring and pipeline pair, built off-lock and installed atomically.
#[derive(Debug)]
pub(crate) struct Layout {
    pipeline: Pipeline,
    usrbuf: Ring<u8>,
    block_bytes: usize,
    high: usize,
    low: usize,
}

impl Layout {
    pub(crate) fn build(
        direction: Direction,
        format: Format,
        geometry: &Geometry,
        ch_volume: &[u16],
    ) -> Result<Self> {
        let pipeline = Pipeline::build(direction, format, geometry, ch_volume)?;
        let block_bytes = pipeline.user_block() * pipeline.user_format().frame_bytes();
        let wanted = (block_bytes * geometry.user_min_blocks).max(geometry.user_buffer_bytes);
        let capacity = wanted / block_bytes * block_bytes;
        let (high, low) = match direction {
            Direction::Playback => (capacity, capacity * 3 / 4),
            Direction::Capture => (capacity - block_bytes, 0),
        };
        Ok(Self {
            pipeline,
            usrbuf: Ring::new(capacity, 1),
            block_bytes,
            high,
            low,
        })
    }
}

/// Mutable track state, guarded by the per-track lock.
#[derive(Debug)]
pub(crate) struct TrackState {
    pub(crate) pipeline: Pipeline,
    pub(crate) usrbuf: Ring<u8>,
    pub(crate) block_bytes: usize,
    pub(crate) high: usize,
    pub(crate) low: usize,
    pub(crate) ch_volume: Vec<u16>,
    pub(crate) play_state: PlayState,
    /// Mix sequence of the last block this track contributed to.
    pub(crate) seq: u64,
    pub(crate) stats: TrackStats,
}

impl TrackState {
    fn new(layout: Layout) -> Self {
        Self {
            pipeline: layout.pipeline,
            usrbuf: layout.usrbuf,
            block_bytes: layout.block_bytes,
            high: layout.high,
            low: layout.low,
            ch_volume: Vec::new(),
            play_state: PlayState::Clear,
            seq: 0,
            stats: TrackStats::default(),
        }
    }

    /// Replaces the pipeline and user ring. Pending data is discarded.
    pub(crate) fn install(&mut self, layout: Layout) {
        self.pipeline = layout.pipeline;
        self.usrbuf = layout.usrbuf;
        self.block_bytes = layout.block_bytes;
        self.high = layout.high;
        self.low = layout.low;
        self.play_state = PlayState::Clear;
    }

    pub(crate) fn format(&self) -> Format {
        self.pipeline.user_format()
    }

    /// Copies caller bytes into the user ring, up to the high watermark.
    pub(crate) fn write_user(&mut self, data: &[u8]) -> usize {
        let room = self.high.saturating_sub(self.usrbuf.used());
        let n = self.usrbuf.write(&data[..data.len().min(room)]);
        self.stats.user_bytes += n as u64;
        n
    }

    /// Copies captured bytes out of the user ring.
    pub(crate) fn read_user(&mut self, buf: &mut [u8]) -> usize {
        let n = self.usrbuf.read(buf);
        self.stats.user_bytes += n as u64;
        n
    }

    /// Converts up to one user block into the output ring.
    pub(crate) fn play(&mut self) {
        let frame_bytes = self.pipeline.user_format().frame_bytes();
        let mut remaining = self.usrbuf.used().min(self.block_bytes) / frame_bytes;
        let mut consumed = 0;
        while remaining > 0 {
            let run = (self.usrbuf.used_contig() / frame_bytes).min(remaining);
            if run == 0 {
                break;
            }
            let n = self
                .pipeline
                .decode_input(&self.usrbuf.head()[..run * frame_bytes]);
            self.usrbuf.take(n * frame_bytes);
            consumed += n * frame_bytes;
            remaining -= n;
            if n < run {
                break;
            }
        }
        self.pipeline.run();
        if consumed < self.block_bytes {
            self.pipeline.rewind_stages();
        }
    }

    /// Converts up to one block from the input ring into the user ring.
    pub(crate) fn record(&mut self) {
        self.pipeline.run();
        let frame_bytes = self.pipeline.user_format().frame_bytes();
        let mut remaining = self.block_bytes / frame_bytes;
        while remaining > 0 && !self.pipeline.tail().is_empty() {
            let room = self.usrbuf.free_contig() / frame_bytes;
            let want = room.min(remaining) * frame_bytes;
            if want == 0 {
                break;
            }
            let n = self
                .pipeline
                .encode_output(&mut self.usrbuf.tail_mut()[..want]);
            if n == 0 {
                break;
            }
            self.usrbuf.push(n * frame_bytes);
            remaining -= n;
        }
    }

    /// Empties every buffer and resets interpolation phase.
    pub(crate) fn clear(&mut self) {
        self.usrbuf.clear();
        self.pipeline.clear();
    }

    /// Clears the track and forgets the blocks it was mixed into, so a
    /// following drain has nothing to wait for.
    pub(crate) fn discard(&mut self) {
        self.clear();
        self.seq = 0;
        self.play_state = PlayState::Clear;
    }

    /// True when a reader has something to take or convert.
    pub(crate) fn read_ready(&self) -> bool {
        !self.usrbuf.is_empty() || !self.pipeline.input().is_empty()
    }

    /// True when the user ring has room for another converted block.
    pub(crate) fn record_room(&self) -> bool {
        self.usrbuf.used() + self.block_bytes <= self.high
    }

    /// Converts everything that fits into the user ring.
    pub(crate) fn record_all(&mut self) {
        while self.record_room() && !self.pipeline.input().is_empty() {
            let before = (self.usrbuf.used(), self.pipeline.input().used());
            self.record();
            if (self.usrbuf.used(), self.pipeline.input().used()) == before {
                break;
            }
        }
    }

    /// Plays as many whole blocks as the output ring accepts.
    pub(crate) fn play_all(&mut self) {
        loop {
            let out = self.pipeline.tail();
            if self.usrbuf.used() < self.block_bytes || out.used() >= out.capacity() {
                break;
            }
            let before = self.usrbuf.used();
            self.play();
            if self.usrbuf.used() == before {
                break;
            }
        }
    }

    /// True once everything written has been played out by the hardware.
    pub(crate) fn drained(&self, hw_seq: u64) -> bool {
        self.usrbuf.used() < self.pipeline.user_format().frame_bytes()
            && self.pipeline.is_empty()
            && self.seq <= hw_seq
    }

    pub(crate) fn set_watermarks(&mut self, high_blocks: usize, low_blocks: usize, direction: Direction) -> Result<()> {
        let capacity = self.usrbuf.capacity();
        let limit = match direction {
            Direction::Playback => capacity,
            Direction::Capture => capacity - self.block_bytes,
        };
        let high = (high_blocks * self.block_bytes).min(limit);
        let low = low_blocks * self.block_bytes;
        if high < self.block_bytes || low > high {
            return Err(Error::InvalidConfig(format!(
                "watermarks {high_blocks}/{low_blocks} blocks do not fit a {capacity} byte ring"
            )));
        }
        self.high = high;
        self.low = low;
        Ok(())
    }
}

/// One open stream.
#[derive(Debug)]
pub(crate) struct Track {
    pub(crate) id: u64,
    pub(crate) direction: Direction,
    state: Mutex<TrackState>,
    paused: AtomicBool,
    gain: AtomicU16,
}

impl Track {
    pub(crate) fn new(id: u64, direction: Direction, format: Format, geometry: &Geometry) -> Result<Self> {
        let layout = Layout::build(direction, format, geometry, &[])?;
        Ok(Self {
            id,
            direction,
            state: Mutex::new(TrackState::new(layout)),
            paused: AtomicBool::new(false),
            gain: AtomicU16::new(UNITY_GAIN),
        })
    }

    /// Takes the per-track lock from caller context.
    pub(crate) fn lock(&self) -> MutexGuard<'_, TrackState> {
        self.state.lock()
    }

    /// Takes the per-track lock from interrupt context, or gives up.
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, TrackState>> {
        self.state.try_lock()
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub(crate) fn gain(&self) -> u16 {
        self.gain.load(Ordering::Relaxed)
    }

    pub(crate) fn set_gain(&self, gain: u16) {
        self.gain.store(gain.min(UNITY_GAIN), Ordering::Relaxed);
    }

    pub(crate) fn stages(&self) -> Vec<StageKind> {
        self.lock().pipeline.kinds()
    }
}
