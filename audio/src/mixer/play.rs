use std::sync::Arc;

use tracing::{trace, warn};
use trackmix_buffer::Ring;

use super::{Geometry, HwConverter, MixerStats};
use crate::codec::Converter;
use crate::stage::UNITY_GAIN;
use crate::track::{PlayState, Track, TrackState};

const UNITY: i32 = UNITY_GAIN as i32;

/// The playback trackmixer.
///
/// Each call to [`PlayMixer::process`] seals one block into the hardware
/// ring: every registered track that is not paused and not busy contributes
/// at most one block of its output ring to a 32-bit accumulator, which is
/// then gain-controlled, saturated to 16 bits and encoded for the hardware.
#[derive(Debug)]
pub(crate) struct PlayMixer {
    geometry: Geometry,
    hwbuf: Ring<u8>,
    codec: HwConverter,
    silence: Vec<u8>,
    mix: Vec<i32>,
    narrow: Vec<i16>,
    tracks: Vec<Arc<Track>>,
    mixseq: u64,
    hwseq: u64,
    volume: i32,
    voltimer: usize,
    agc: bool,
    stats: MixerStats,
    warned: bool,
}

impl PlayMixer {
    pub(crate) fn new(geometry: Geometry, codec: HwConverter, agc: bool) -> Self {
        let fpb = geometry.frames_per_block;
        let hw = geometry.hw_format;
        let samples = fpb * hw.channels as usize;
        let mut silence = vec![0u8; geometry.block_bytes()];
        Converter::new(&hw).encode(&vec![0i16; samples], &mut silence);
        Self {
            geometry,
            hwbuf: Ring::new(geometry.hw_blocks * fpb, hw.frame_bytes()),
            codec,
            silence,
            mix: vec![0; samples],
            narrow: vec![0; samples],
            tracks: Vec::new(),
            mixseq: 0,
            hwseq: 0,
            volume: UNITY,
            voltimer: 0,
            agc,
            stats: MixerStats {
                volume: UNITY_GAIN,
                ..MixerStats::default()
            },
            warned: false,
        }
    }

    pub(crate) fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub(crate) fn add_track(&mut self, track: Arc<Track>) {
        self.tracks.push(track);
    }

    /// Unregisters a track. Returns true if it was registered.
    pub(crate) fn remove_track(&mut self, id: u64) -> bool {
        let before = self.tracks.len();
        self.tracks.retain(|t| t.id != id);
        before != self.tracks.len()
    }

    pub(crate) fn tracks(&self) -> &[Arc<Track>] {
        &self.tracks
    }

    pub(crate) fn hw_seq(&self) -> u64 {
        self.hwseq
    }

    /// Blocks sealed but not yet completed by the hardware.
    pub(crate) fn queued_blocks(&self) -> usize {
        self.hwbuf.used() / self.geometry.frames_per_block
    }

    /// The oldest queued block, in hardware encoding.
    pub(crate) fn head_block(&self) -> &[u8] {
        let len = self.geometry.block_bytes().min(self.hwbuf.head().len());
        &self.hwbuf.head()[..len]
    }

    /// Retires the oldest block after the hardware consumed it.
    pub(crate) fn complete_block(&mut self) {
        let fpb = self.geometry.frames_per_block.min(self.hwbuf.used());
        self.hwbuf.take(fpb);
        self.hwseq += 1;
        self.stats.hw_blocks = self.hwseq;
    }

    /// Records a failed hardware transfer.
    pub(crate) fn hw_failure(&mut self, err: &crate::Error) {
        self.stats.hw_errors += 1;
        if !self.warned {
            warn!(%err, "playback hardware failure, emitting silence");
            self.warned = true;
        }
    }

    /// Mixes and seals one block. Returns false when the hardware ring has no
    /// room.
    pub(crate) fn process(&mut self) -> bool {
        let fpb = self.geometry.frames_per_block;
        if self.hwbuf.free() < fpb {
            return false;
        }
        let channels = self.geometry.hw_format.channels as usize;
        let seal = self.mixseq + 1;

        let mut contributors = 0;
        for track in &self.tracks {
            if track.is_paused() {
                continue;
            }
            let Some(mut st) = track.try_lock() else {
                trace!(track = track.id, "track busy, skipped");
                continue;
            };
            if st.pipeline.tail().used() < fpb && !st.usrbuf.is_empty() {
                st.play();
            }
            let gain = track.gain() as i32;
            let mixed = mix_track(&mut st, &mut self.mix, fpb, channels, gain, contributors == 0);
            if mixed == 0 {
                if st.play_state == PlayState::Running {
                    st.stats.underruns += 1;
                }
                continue;
            }
            st.stats.output_frames += mixed as u64;
            st.seq = seal;
            contributors += 1;
        }

        if contributors == 0 {
            self.narrow.fill(0);
        } else {
            if contributors > 1 && self.agc {
                self.detect_overflow();
            }
            if self.volume < UNITY {
                self.scale_and_recover(fpb);
            }
            for (n, &m) in self.narrow.iter_mut().zip(&self.mix) {
                *n = m.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
        }

        let block_bytes = self.geometry.block_bytes();
        let dst = &mut self.hwbuf.tail_mut()[..block_bytes];
        if let Err(err) = self.codec.encode(&self.narrow, dst) {
            dst.copy_from_slice(&self.silence);
            self.stats.hw_errors += 1;
            if !self.warned {
                warn!(%err, "playback codec failed, emitting silence");
                self.warned = true;
            }
        }
        self.hwbuf.push(fpb);
        self.mixseq = seal;
        self.stats.blocks = seal;
        true
    }

    /// Lowers the master volume to the largest value that keeps this block
    /// within 16 bits.
    fn detect_overflow(&mut self) {
        let (min, max) = self
            .mix
            .iter()
            .fold((0i32, 0i32), |(lo, hi), &s| (lo.min(s), hi.max(s)));
        let mut volume = self.volume;
        if max > i16::MAX as i32 {
            volume = volume.min(i16::MAX as i32 * UNITY / max);
        }
        if min < i16::MIN as i32 {
            volume = volume.min(i16::MIN as i32 * UNITY / min);
        }
        if volume < self.volume {
            trace!(from = self.volume, to = volume, "agc lowered master volume");
            self.volume = volume;
            self.voltimer = 0;
            self.stats.agc_events += 1;
            self.stats.volume = volume as u16;
        }
    }

    fn scale_and_recover(&mut self, fpb: usize) {
        let volume = self.volume;
        for s in &mut self.mix {
            *s = (*s * volume) >> 8;
        }
        self.voltimer += fpb;
        if self.voltimer * 4 >= self.geometry.hw_format.sample_rate as usize {
            self.volume += 1;
            self.voltimer = 0;
            self.stats.volume = self.volume as u16;
        }
    }

    /// Stops mixing: empties the hardware ring and restarts all sequence
    /// numbering at zero.
    pub(crate) fn halt(&mut self) {
        self.hwbuf.clear();
        self.mixseq = 0;
        self.hwseq = 0;
        for track in &self.tracks {
            track.lock().seq = 0;
        }
    }

    pub(crate) fn stats(&self) -> MixerStats {
        MixerStats {
            tracks: self.tracks.len(),
            ..self.stats
        }
    }
}

/// Adds up to one block of a track's output ring into `mix`. The first
/// contributor overwrites the accumulator. Returns the frames taken.
fn mix_track(
    st: &mut TrackState,
    mix: &mut [i32],
    fpb: usize,
    channels: usize,
    gain: i32,
    first: bool,
) -> usize {
    let out = st.pipeline.tail_mut();
    if out.is_empty() {
        return 0;
    }
    if first {
        mix.fill(0);
    }
    let mut done = 0;
    while done < fpb {
        let run = out.used_contig().min(fpb - done);
        if run == 0 {
            break;
        }
        let src = &out.head()[..run * channels];
        let dst = &mut mix[done * channels..(done + run) * channels];
        for (m, &s) in dst.iter_mut().zip(src) {
            *m += (s as i32 * gain) >> 8;
        }
        out.take(run);
        done += run;
    }
    if out.is_empty() {
        out.rewind();
    }
    done
}
