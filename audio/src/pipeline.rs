//! A track's conversion chain.
//!
//! The pipeline is built by walking from the fixed end (the mixer's working
//! format) towards the user format, adding a stage only for the axes that
//! differ. Processing order is the reverse of build order, so playback runs
//! codec, volume, channel mix, rate and capture runs rate, channel mix,
//! volume, codec.

use tracing::debug;
use trackmix_buffer::Ring;

use crate::codec::Converter;
use crate::error::Result;
use crate::format::{Direction, Format};
use crate::mixer::Geometry;
use crate::stage::{Stage, StageKind, UNITY_GAIN};

#[derive(Debug)]
pub(crate) struct Pipeline {
    direction: Direction,
    user: Format,
    codec: Converter,
    codec_stage: bool,
    /// Stages in processing order.
    stages: Vec<Stage>,
    /// Playback: the output ring the mixer reads.
    /// Capture: the last internal ring before the user boundary.
    tail: Ring<i16>,
    user_block: usize,
}

impl Pipeline {
    pub(crate) fn build(
        direction: Direction,
        user: Format,
        geometry: &Geometry,
        ch_volume: &[u16],
    ) -> Result<Self> {
        let user = user.validate()?;
        let mixer_fmt = geometry.track_format();
        let user_block = geometry.frames_per_block_at(user.sample_rate);
        let block = |fmt: &Format| geometry.frames_per_block_at(fmt.sample_rate);
        let needs_volume = ch_volume
            .iter()
            .take(user.channels as usize)
            .any(|&g| g != UNITY_GAIN);

        let mut built = Vec::new();
        let tail_fmt = match direction {
            Direction::Playback => {
                let mut last = mixer_fmt;
                if user.sample_rate != last.sample_rate {
                    let src = last.with_rate(user.sample_rate);
                    built.push(Stage::rate(src, last, block(&src), block(&last)));
                    last = src;
                }
                if user.channels != last.channels {
                    let src = last.with_channels(user.channels);
                    built.push(Stage::channel_mix(src, last, block(&src)));
                    last = src;
                }
                if needs_volume {
                    built.push(Stage::channel_volume(last, ch_volume, block(&last)));
                }
                mixer_fmt
            }
            Direction::Capture => {
                let user_side = mixer_fmt
                    .with_rate(user.sample_rate)
                    .with_channels(user.channels);
                let mut last = user_side;
                if needs_volume {
                    built.push(Stage::channel_volume(last, ch_volume, block(&last)));
                }
                if mixer_fmt.channels != last.channels {
                    let src = last.with_channels(mixer_fmt.channels);
                    built.push(Stage::channel_mix(src, last, block(&src)));
                    last = src;
                }
                if mixer_fmt.sample_rate != last.sample_rate {
                    let src = last.with_rate(mixer_fmt.sample_rate);
                    built.push(Stage::rate(src, last, block(&src), block(&last)));
                }
                user_side
            }
        };
        built.reverse();

        let tail_frames = match direction {
            Direction::Playback => geometry.out_blocks * block(&tail_fmt),
            Direction::Capture if built.is_empty() => geometry.out_blocks * block(&tail_fmt),
            Direction::Capture => block(&tail_fmt),
        };
        if direction == Direction::Capture {
            if let Some(first) = built.first_mut() {
                let frames = geometry.out_blocks * block(&first.src_format());
                first.resize_src(frames);
            }
        }

        let pipeline = Self {
            direction,
            user,
            codec: Converter::new(&user),
            codec_stage: !user.is_internal(),
            stages: built,
            tail: Ring::new(tail_frames, tail_fmt.channels as usize),
            user_block,
        };
        debug!(%direction, %user, stages = ?pipeline.kinds(), "pipeline built");
        Ok(pipeline)
    }

    pub(crate) fn user_format(&self) -> Format {
        self.user
    }

    /// Frames per block at the user rate.
    pub(crate) fn user_block(&self) -> usize {
        self.user_block
    }

    /// Active stages in processing order.
    pub(crate) fn kinds(&self) -> Vec<StageKind> {
        let stages = self.stages.iter().map(Stage::kind);
        match (self.codec_stage, self.direction) {
            (false, _) => stages.collect(),
            (true, Direction::Playback) => std::iter::once(StageKind::Codec).chain(stages).collect(),
            (true, Direction::Capture) => stages.chain(std::iter::once(StageKind::Codec)).collect(),
        }
    }

    /// The first internal ring: where decoded user data lands on playback and
    /// where the mixer deposits hardware blocks on capture.
    pub(crate) fn input(&self) -> &Ring<i16> {
        self.stages.first().map(|s| &s.src).unwrap_or(&self.tail)
    }

    pub(crate) fn input_mut(&mut self) -> &mut Ring<i16> {
        match self.stages.first_mut() {
            Some(stage) => &mut stage.src,
            None => &mut self.tail,
        }
    }

    pub(crate) fn tail(&self) -> &Ring<i16> {
        &self.tail
    }

    pub(crate) fn tail_mut(&mut self) -> &mut Ring<i16> {
        &mut self.tail
    }

    /// True when no stage holds data and the tail ring is empty.
    pub(crate) fn is_empty(&self) -> bool {
        self.tail.is_empty() && self.stages.iter().all(|s| s.src.is_empty())
    }

    /// Decodes whole user frames from `bytes` into the input ring.
    /// Returns the number of frames consumed.
    pub(crate) fn decode_input(&mut self, bytes: &[u8]) -> usize {
        let frame_bytes = self.user.frame_bytes();
        let channels = self.user.channels as usize;
        let codec = self.codec;
        let input = self.input_mut();
        let frames = (bytes.len() / frame_bytes).min(input.free_contig());
        codec.decode(
            &bytes[..frames * frame_bytes],
            &mut input.tail_mut()[..frames * channels],
        );
        input.push(frames);
        frames
    }

    /// Encodes up to `dst.len()` bytes worth of whole frames from the tail
    /// ring into `dst`. Returns the number of frames produced.
    pub(crate) fn encode_output(&mut self, dst: &mut [u8]) -> usize {
        let frame_bytes = self.user.frame_bytes();
        let channels = self.user.channels as usize;
        let frames = (dst.len() / frame_bytes).min(self.tail.used_contig());
        self.codec.encode(
            &self.tail.head()[..frames * channels],
            &mut dst[..frames * frame_bytes],
        );
        self.tail.take(frames);
        frames
    }

    /// Runs every stage once, in processing order.
    pub(crate) fn run(&mut self) {
        let pad = self.direction == Direction::Playback;
        for i in 0..self.stages.len() {
            let (head, rest) = self.stages.split_at_mut(i + 1);
            let dst = match rest.first_mut() {
                Some(next) => &mut next.src,
                None => &mut self.tail,
            };
            head[i].apply(dst, pad);
        }
    }

    /// Moves empty stage rings back to the start of storage.
    pub(crate) fn rewind_stages(&mut self) {
        for stage in &mut self.stages {
            if stage.src.is_empty() {
                stage.src.rewind();
            }
        }
    }

    /// Drops every buffered frame and resets interpolation phase.
    pub(crate) fn clear(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
        self.tail.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::format::Encoding;

    fn geometry() -> Geometry {
        Geometry::for_tests(Format::internal(2, 48000), 480)
    }

    fn kinds(direction: Direction, user: &str) -> Vec<StageKind> {
        Pipeline::build(direction, user.parse().unwrap(), &geometry(), &[])
            .unwrap()
            .kinds()
    }

    #[test]
    fn test_minimal_identical() {
        let native = Format::internal(2, 48000).to_string();
        assert!(kinds(Direction::Playback, &native).is_empty());
        assert!(kinds(Direction::Capture, &native).is_empty());
    }

    #[test]
    fn test_minimal_per_axis() {
        use StageKind::*;
        let ne = Encoding::slinear_ne();
        let oe = Encoding::slinear_oe();

        assert_eq!(kinds(Direction::Playback, &format!("{ne}:44100:2")), vec![Rate]);
        assert_eq!(kinds(Direction::Playback, &format!("{ne}:48000:1")), vec![ChannelMix]);
        assert_eq!(kinds(Direction::Playback, &format!("{oe}:48000:2")), vec![Codec]);
        assert_eq!(kinds(Direction::Playback, "ulaw:8000:1"), vec![Codec, ChannelMix, Rate]);
        assert_eq!(kinds(Direction::Capture, "ulaw:8000:1"), vec![Rate, ChannelMix, Codec]);
        assert_eq!(kinds(Direction::Capture, &format!("{ne}:16000:2")), vec![Rate]);
        assert_eq!(kinds(Direction::Playback, &format!("{ne}:48000:2:24:32")), vec![Codec]);
    }

    #[test]
    fn test_channel_volume_stage_only_when_needed() {
        let fmt: Format = "ulaw:48000:2".parse().unwrap();
        let unity = Pipeline::build(Direction::Playback, fmt, &geometry(), &[256, 256]).unwrap();
        assert_eq!(unity.kinds(), vec![StageKind::Codec]);

        let half = Pipeline::build(Direction::Playback, fmt, &geometry(), &[128, 256]).unwrap();
        assert_eq!(half.kinds(), vec![StageKind::Codec, StageKind::ChannelVolume]);

        let cap = Pipeline::build(Direction::Capture, fmt, &geometry(), &[128, 256]).unwrap();
        assert_eq!(cap.kinds(), vec![StageKind::ChannelVolume, StageKind::Codec]);
    }

    #[test]
    fn test_ring_sizes() {
        let fmt: Format = "ulaw:8000:1".parse().unwrap();
        let play = Pipeline::build(Direction::Playback, fmt, &geometry(), &[]).unwrap();
        assert_eq!(play.user_block(), 80);
        assert_eq!(play.input().capacity(), 80);
        assert_eq!(play.tail().capacity(), 4 * 480);

        let cap = Pipeline::build(Direction::Capture, fmt, &geometry(), &[]).unwrap();
        assert_eq!(cap.input().capacity(), 4 * 480);
        assert_eq!(cap.input().frame_len(), 2);
        assert_eq!(cap.tail().capacity(), 80);
        assert_eq!(cap.tail().frame_len(), 1);
    }

    #[test]
    fn test_invalid_format() {
        let fmt = Format::new(Encoding::Ulaw, 16, 1, 8000);
        assert!(matches!(
            Pipeline::build(Direction::Playback, fmt, &geometry(), &[]),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_playback_block_flow() {
        let fmt: Format = "ulaw:8000:1".parse().unwrap();
        let mut p = Pipeline::build(Direction::Playback, fmt, &geometry(), &[]).unwrap();
        let block = vec![0xFFu8; 80];
        assert_eq!(p.decode_input(&block), 80);
        p.run();
        assert_eq!(p.tail().used(), 480);
        assert!(p.tail().head().iter().all(|&s| s == 0));
        p.clear();
        assert!(p.is_empty());
    }

    #[test]
    fn test_capture_block_flow() {
        let fmt: Format = "slinear_le:24000:1".parse().unwrap();
        let mut p = Pipeline::build(Direction::Capture, fmt, &geometry(), &[]).unwrap();
        p.input_mut().write(&vec![1000i16; 480 * 2]);
        p.run();
        assert_eq!(p.tail().used(), 240);
        let mut out = vec![0u8; 240 * 2];
        assert_eq!(p.encode_output(&mut out), 240);
        assert_eq!(&out[..2], &1000i16.to_le_bytes());
        assert!(p.is_empty());
    }
}
