//! Conversion stages between internal-format rings.
//!
//! A stage owns its source ring and writes into a destination ring supplied
//! by the caller (the next stage's source, or the track's terminal ring).
//! All stages work on the internal 16-bit sample; the encoding codec sits at
//! the user-ring boundary and is handled by the pipeline.

use tracing::trace;
use trackmix_buffer::Ring;

use crate::format::Format;

/// Unity gain for per-channel and per-track volume (8-bit fixed point).
pub const UNITY_GAIN: u16 = 256;

const PHASE_ONE: u64 = 1 << 16;

/// Kinds of conversion stages, as reported by a track's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Encoding conversion at the user boundary.
    Codec,
    /// Per-channel gain.
    ChannelVolume,
    /// Channel count conversion.
    ChannelMix,
    /// Sample rate conversion.
    Rate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelMix {
    /// Many to mono: average of the first two channels.
    Average,
    /// Mono to many: copy into the first two channels, silence the rest.
    Duplicate,
    /// Drop trailing channels.
    Shrink,
    /// Silence the added channels.
    Expand,
}

#[derive(Debug)]
struct RateState {
    step: u64,
    leap: u64,
    phase: u64,
    up: bool,
    src_block: usize,
    dst_block: usize,
    prev: Vec<i16>,
    curr: Vec<i16>,
}

impl RateState {
    fn new(src_rate: u32, dst_rate: u32, channels: usize, src_block: usize, dst_block: usize) -> Self {
        let (src, dst) = (src_rate as u64, dst_rate as u64);
        let step = src * PHASE_ONE / dst;
        let remainder = src * PHASE_ONE % dst;
        let leap = (remainder * dst_block as u64 + dst / 2) / dst;
        let up = step < PHASE_ONE;
        trace!(src_rate, dst_rate, step, leap, up, "rate stage");
        let mut state = Self {
            step,
            leap,
            phase: 0,
            up,
            src_block,
            dst_block,
            prev: vec![0; channels],
            curr: vec![0; channels],
        };
        state.reset();
        state
    }

    fn reset(&mut self) {
        self.phase = if self.up { PHASE_ONE } else { 0 };
        self.prev.fill(0);
        self.curr.fill(0);
    }

    /// Converts at most one source block into at most one destination block.
    fn apply(&mut self, src: &mut Ring<i16>, dst: &mut Ring<i16>, pad: bool, src_ch: usize, dst_ch: usize) {
        let used = src.used();
        if pad && used > 0 && used < self.src_block && src.free_contig() >= self.src_block - used {
            src.push_silence(self.src_block - used);
        }
        let src_count = src.used_contig().min(self.src_block);
        if src_count == 0 {
            return;
        }
        let dst_count = dst.free_contig().min(self.dst_block);
        let input = &src.head()[..src_count * src_ch];
        let output = &mut dst.tail_mut()[..dst_count * dst_ch];
        let produced = if self.up {
            self.interpolate(input, output)
        } else {
            self.decimate(input, output)
        };
        src.take(src_count);
        dst.push(produced);
    }

    /// Linear interpolation. Returns the number of frames written.
    fn interpolate(&mut self, src: &[i16], dst: &mut [i16]) -> usize {
        let ch = self.curr.len();
        let src_frames = src.len() / ch;
        let mut next = 0;
        let mut t = self.phase;
        let mut produced = 0;

        for out in dst.chunks_exact_mut(ch) {
            if t >= PHASE_ONE {
                if next >= src_frames {
                    break;
                }
                self.prev.copy_from_slice(&self.curr);
                self.curr.copy_from_slice(&src[next * ch..(next + 1) * ch]);
                next += 1;
                t -= PHASE_ONE;
            }
            for ((d, &p), &c) in out.iter_mut().zip(&self.prev).zip(&self.curr) {
                let grad = c as i64 - p as i64;
                *d = (p as i64 + grad * t as i64 / PHASE_ONE as i64) as i16;
            }
            t += self.step;
            produced += 1;
        }
        self.phase = t + self.leap;
        produced
    }

    /// Nearest-sample selection. Returns the number of frames written.
    fn decimate(&mut self, src: &[i16], dst: &mut [i16]) -> usize {
        let ch = self.curr.len();
        let src_frames = (src.len() / ch) as u64;
        let mut t = self.phase;
        let mut produced = 0;

        for out in dst.chunks_exact_mut(ch) {
            let idx = t >> 16;
            if idx >= src_frames {
                break;
            }
            let idx = idx as usize;
            out.copy_from_slice(&src[idx * ch..(idx + 1) * ch]);
            t += self.step;
            produced += 1;
        }
        self.phase = (t + self.leap) % PHASE_ONE;
        produced
    }
}

#[derive(Debug)]
enum Filter {
    Volume(Vec<i32>),
    Mix(ChannelMix),
    Rate(RateState),
}

/// One link of a track's conversion pipeline.
#[derive(Debug)]
pub(crate) struct Stage {
    pub(crate) src: Ring<i16>,
    src_fmt: Format,
    dst_fmt: Format,
    filter: Filter,
}

impl Stage {
    /// Per-channel gain on `fmt`. Missing gains are unity.
    pub(crate) fn channel_volume(fmt: Format, gains: &[u16], block: usize) -> Self {
        let gains = (0..fmt.channels as usize)
            .map(|ch| gains.get(ch).copied().unwrap_or(UNITY_GAIN) as i32)
            .collect();
        Self {
            src: Ring::new(block, fmt.channels as usize),
            src_fmt: fmt,
            dst_fmt: fmt,
            filter: Filter::Volume(gains),
        }
    }

    pub(crate) fn channel_mix(src_fmt: Format, dst_fmt: Format, block: usize) -> Self {
        let mix = match (src_fmt.channels, dst_fmt.channels) {
            (s, 1) if s >= 2 => ChannelMix::Average,
            (1, d) if d >= 2 => ChannelMix::Duplicate,
            (s, d) if s > d => ChannelMix::Shrink,
            _ => ChannelMix::Expand,
        };
        Self {
            src: Ring::new(block, src_fmt.channels as usize),
            src_fmt,
            dst_fmt,
            filter: Filter::Mix(mix),
        }
    }

    pub(crate) fn rate(src_fmt: Format, dst_fmt: Format, src_block: usize, dst_block: usize) -> Self {
        let channels = src_fmt.channels as usize;
        Self {
            src: Ring::new(src_block, channels),
            src_fmt,
            dst_fmt,
            filter: Filter::Rate(RateState::new(
                src_fmt.sample_rate,
                dst_fmt.sample_rate,
                channels,
                src_block,
                dst_block,
            )),
        }
    }

    pub(crate) fn kind(&self) -> StageKind {
        match self.filter {
            Filter::Volume(_) => StageKind::ChannelVolume,
            Filter::Mix(_) => StageKind::ChannelMix,
            Filter::Rate(_) => StageKind::Rate,
        }
    }

    pub(crate) fn src_format(&self) -> Format {
        self.src_fmt
    }

    /// Replaces the source ring, keeping its format.
    pub(crate) fn resize_src(&mut self, frames: usize) {
        self.src = Ring::new(frames, self.src_fmt.channels as usize);
    }

    /// Empties the source ring and forgets interpolation state.
    pub(crate) fn reset(&mut self) {
        self.src.clear();
        if let Filter::Rate(rate) = &mut self.filter {
            rate.reset();
        }
    }

    /// Converts one contiguous run from the source ring into `dst`.
    ///
    /// With `pad` set, a partial source block is topped up with silence
    /// before rate conversion.
    pub(crate) fn apply(&mut self, dst: &mut Ring<i16>, pad: bool) {
        let src_ch = self.src_fmt.channels as usize;
        let dst_ch = self.dst_fmt.channels as usize;
        let Stage { src, filter, .. } = self;

        let count = match &mut *filter {
            Filter::Rate(rate) => return rate.apply(src, dst, pad, src_ch, dst_ch),
            _ => src.used_contig().min(dst.free_contig()),
        };
        if count == 0 {
            return;
        }
        let input = &src.head()[..count * src_ch];
        let output = &mut dst.tail_mut()[..count * dst_ch];
        match filter {
            Filter::Volume(gains) => {
                let frames = input.chunks_exact(src_ch).zip(output.chunks_exact_mut(dst_ch));
                for (s_frame, d_frame) in frames {
                    for ((d, &s), &g) in d_frame.iter_mut().zip(s_frame).zip(gains.iter()) {
                        *d = ((s as i32 * g) >> 8) as i16;
                    }
                }
            }
            Filter::Mix(mix) => mix_channels(*mix, input, output, src_ch, dst_ch),
            Filter::Rate(_) => {}
        }
        src.take(count);
        dst.push(count);
    }
}

fn mix_channels(mix: ChannelMix, input: &[i16], output: &mut [i16], src_ch: usize, dst_ch: usize) {
    let frames = input.chunks_exact(src_ch).zip(output.chunks_exact_mut(dst_ch));
    match mix {
        ChannelMix::Average => {
            for (s, d) in frames {
                d[0] = s[0] / 2 + s[1] / 2;
            }
        }
        ChannelMix::Duplicate => {
            for (s, d) in frames {
                d[0] = s[0];
                d[1] = s[0];
                d[2..].fill(0);
            }
        }
        ChannelMix::Shrink => {
            for (s, d) in frames {
                d.copy_from_slice(&s[..dst_ch]);
            }
        }
        ChannelMix::Expand => {
            for (s, d) in frames {
                d[..src_ch].copy_from_slice(s);
                d[src_ch..].fill(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(ring: &mut Ring<i16>) -> Vec<i16> {
        let mut out = vec![0; ring.used() * ring.frame_len()];
        ring.read(&mut out);
        out
    }

    #[test]
    fn test_channel_volume() {
        let fmt = Format::internal(2, 8000);
        let mut stage = Stage::channel_volume(fmt, &[128, 0], 4);
        stage.src.write(&[1000, 1000, -1000, 32767]);
        let mut dst = Ring::new(4, 2);
        stage.apply(&mut dst, false);
        assert_eq!(drain(&mut dst), vec![500, 0, -500, 0]);
        assert_eq!(stage.kind(), StageKind::ChannelVolume);
    }

    #[test]
    fn test_channel_mix_average_and_duplicate() {
        let stereo = Format::internal(2, 8000);
        let mono = Format::internal(1, 8000);

        let mut down = Stage::channel_mix(stereo, mono, 4);
        down.src.write(&[100, 300, -7, -7, 32767, 32767]);
        let mut dst = Ring::new(4, 1);
        down.apply(&mut dst, false);
        assert_eq!(drain(&mut dst), vec![200, -6, 32766]);

        let quad = Format::internal(4, 8000);
        let mut up = Stage::channel_mix(mono, quad, 4);
        up.src.write(&[5, -9]);
        let mut dst = Ring::new(4, 4);
        up.apply(&mut dst, false);
        assert_eq!(drain(&mut dst), vec![5, 5, 0, 0, -9, -9, 0, 0]);
    }

    #[test]
    fn test_channel_mix_shrink_and_expand() {
        let three = Format::internal(3, 8000);
        let two = Format::internal(2, 8000);
        let six = Format::internal(6, 8000);

        let mut shrink = Stage::channel_mix(three, two, 2);
        shrink.src.write(&[1, 2, 3, 4, 5, 6]);
        let mut dst = Ring::new(2, 2);
        shrink.apply(&mut dst, false);
        assert_eq!(drain(&mut dst), vec![1, 2, 4, 5]);

        let mut expand = Stage::channel_mix(three, six, 1);
        expand.src.write(&[1, 2, 3]);
        let mut dst = Ring::new(1, 6);
        expand.apply(&mut dst, false);
        assert_eq!(drain(&mut dst), vec![1, 2, 3, 0, 0, 0]);
    }

    #[test]
    fn test_rate_up_exact_block() {
        // 8 kHz to 48 kHz, 10 ms blocks.
        let src = Format::internal(1, 8000);
        let dst_fmt = Format::internal(1, 48000);
        let mut stage = Stage::rate(src, dst_fmt, 80, 480);
        let mut dst = Ring::new(480 * 4, 1);
        for block in 0..10 {
            stage.src.write(&[1000; 80]);
            stage.apply(&mut dst, true);
            assert_eq!(dst.used(), 480, "block {block}");
            dst.take(480);
            assert!(stage.src.is_empty());
        }
    }

    #[test]
    fn test_rate_up_interpolates() {
        let src = Format::internal(1, 1000);
        let dst_fmt = Format::internal(1, 2000);
        let mut stage = Stage::rate(src, dst_fmt, 4, 8);
        stage.src.write(&[0, 100, 200, 300]);
        let mut dst = Ring::new(8, 1);
        stage.apply(&mut dst, false);
        // The first frame interpolates from the zero history.
        assert_eq!(drain(&mut dst), vec![0, 0, 0, 50, 100, 150, 200, 250]);
    }

    #[test]
    fn test_rate_down_nearest() {
        let src = Format::internal(2, 96000);
        let dst_fmt = Format::internal(2, 48000);
        let mut stage = Stage::rate(src, dst_fmt, 4, 2);
        stage.src.write(&[1, -1, 2, -2, 3, -3, 4, -4]);
        let mut dst = Ring::new(2, 2);
        stage.apply(&mut dst, false);
        assert_eq!(drain(&mut dst), vec![1, -1, 3, -3]);
    }

    #[test]
    fn test_rate_44100_no_drift() {
        let src = Format::internal(2, 44100);
        let dst_fmt = Format::internal(2, 48000);
        let mut stage = Stage::rate(src, dst_fmt, 441, 480);
        let mut dst = Ring::new(480, 2);
        let mut total = 0;
        for _ in 0..100 {
            stage.src.write(&vec![0; 441 * 2]);
            stage.apply(&mut dst, true);
            total += dst.used();
            dst.clear();
        }
        assert_eq!(total, 48000);
    }

    #[test]
    fn test_rate_11025_up_one_block_per_block() {
        let src = Format::internal(1, 11025);
        let dst_fmt = Format::internal(1, 48000);
        let mut stage = Stage::rate(src, dst_fmt, 111, 480);
        let mut dst = Ring::new(480 * 2, 1);
        let mut total = 0;
        for block in 0..100 {
            stage.src.write(&[1000; 111]);
            stage.apply(&mut dst, true);
            assert_eq!(dst.used(), 480, "block {block}");
            assert!(stage.src.is_empty());
            total += dst.used();
            dst.clear();
        }
        assert_eq!(total, 48000);
    }

    #[test]
    fn test_rate_down_to_22050() {
        let src = Format::internal(2, 48000);
        let dst_fmt = Format::internal(2, 22050);
        let mut stage = Stage::rate(src, dst_fmt, 480, 221);
        let mut dst = Ring::new(221 * 2, 2);
        for block in 0..100 {
            stage.src.write(&vec![-300; 480 * 2]);
            stage.apply(&mut dst, false);
            assert_eq!(dst.used(), 221, "block {block}");
            assert!(stage.src.is_empty());
            assert!(dst.head().iter().all(|&s| s == -300));
            dst.clear();
        }
    }

    #[test]
    fn test_rate_pads_partial_block() {
        let src = Format::internal(1, 8000);
        let dst_fmt = Format::internal(1, 16000);
        let mut stage = Stage::rate(src, dst_fmt, 80, 160);
        stage.src.write(&[500; 30]);
        let mut dst = Ring::new(160, 1);
        stage.apply(&mut dst, true);
        assert_eq!(dst.used(), 160);
        assert!(stage.src.is_empty());
    }

    #[test]
    fn test_reset_restores_phase() {
        let src = Format::internal(1, 8000);
        let dst_fmt = Format::internal(1, 48000);
        let mut stage = Stage::rate(src, dst_fmt, 80, 480);
        stage.src.write(&[7; 50]);
        stage.reset();
        assert!(stage.src.is_empty());
        stage.src.write(&[0; 80]);
        let mut dst = Ring::new(480, 1);
        stage.apply(&mut dst, true);
        assert_eq!(dst.used(), 480);
        assert!(dst.head().iter().all(|&s| s == 0));
    }
}
