use std::sync::Arc;

use tracing::{trace, warn};
use trackmix_buffer::Ring;

use super::{Geometry, HwConverter, MixerStats};
use crate::track::Track;

/// The capture trackmixer: fans every hardware block out to the registered
/// capture tracks.
#[derive(Debug)]
pub(crate) struct RecordMixer {
    geometry: Geometry,
    hwbuf: Ring<u8>,
    codec: HwConverter,
    wide: Vec<i16>,
    tracks: Vec<Arc<Track>>,
    hwseq: u64,
    stats: MixerStats,
    warned: bool,
}

impl RecordMixer {
    pub(crate) fn new(geometry: Geometry, codec: HwConverter) -> Self {
        let fpb = geometry.frames_per_block;
        let hw = geometry.hw_format;
        Self {
            geometry,
            hwbuf: Ring::new(geometry.hw_blocks * fpb, hw.frame_bytes()),
            codec,
            wide: vec![0; fpb * hw.channels as usize],
            tracks: Vec::new(),
            hwseq: 0,
            stats: MixerStats::default(),
            warned: false,
        }
    }

    pub(crate) fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub(crate) fn add_track(&mut self, track: Arc<Track>) {
        self.tracks.push(track);
    }

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

    /// Appends hardware-filled bytes. When the ring is full the oldest
    /// blocks are discarded to make room.
    pub(crate) fn receive(&mut self, data: &[u8]) {
        let frame_bytes = self.geometry.hw_format.frame_bytes();
        let fpb = self.geometry.frames_per_block;
        let frames = data.len() / frame_bytes;
        let data = &data[data.len() - frames.min(self.hwbuf.capacity()) * frame_bytes..];
        let frames = data.len() / frame_bytes;
        while self.hwbuf.free() < frames {
            let drop = fpb.min(self.hwbuf.used());
            self.hwbuf.take(drop);
            self.stats.dropped_blocks += 1;
        }
        self.hwbuf.write(data);
    }

    /// Decodes one block from the hardware ring and hands it to every
    /// non-paused, non-busy track. Returns false when no data was pending.
    pub(crate) fn process(&mut self) -> bool {
        let fpb = self.geometry.frames_per_block;
        let count = self.hwbuf.used_contig().min(fpb);
        if count == 0 {
            return false;
        }
        let channels = self.geometry.hw_format.channels as usize;
        let frame_bytes = self.geometry.hw_format.frame_bytes();
        let src = &self.hwbuf.head()[..count * frame_bytes];
        let decoded = self.codec.decode(src, &mut self.wide[..count * channels]);
        self.hwbuf.take(count);
        self.hwseq += 1;
        self.stats.blocks = self.hwseq;
        self.stats.hw_blocks = self.hwseq;

        if let Err(err) = decoded {
            self.stats.dropped_blocks += 1;
            if !self.warned {
                warn!(%err, "capture codec failed, dropping block");
                self.warned = true;
            }
            return true;
        }

        let block = &self.wide[..count * channels];
        for track in &self.tracks {
            if track.is_paused() {
                continue;
            }
            let Some(mut st) = track.try_lock() else {
                trace!(track = track.id, "track busy, skipped");
                continue;
            };
            let input = st.pipeline.input_mut();
            let overflow = count.saturating_sub(input.free());
            if overflow > 0 {
                input.take(overflow);
            }
            input.write(block);
            st.stats.drop_frames += overflow as u64;
            st.stats.output_frames += count as u64;
        }
        true
    }

    /// Records a failed request for the next capture block.
    pub(crate) fn hw_failure(&mut self, err: &crate::Error) {
        self.stats.hw_errors += 1;
        if !self.warned {
            warn!(%err, "capture hardware failure");
            self.warned = true;
        }
    }

    pub(crate) fn halt(&mut self) {
        self.hwbuf.clear();
        self.hwseq = 0;
    }

    pub(crate) fn stats(&self) -> MixerStats {
        MixerStats {
            tracks: self.tracks.len(),
            volume: crate::stage::UNITY_GAIN,
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Direction, Format};

    fn geometry() -> Geometry {
        Geometry::for_tests(Format::internal(2, 48000), 480)
    }

    fn mixer() -> RecordMixer {
        let g = geometry();
        RecordMixer::new(g, HwConverter::select(&g.hw_format, None).unwrap())
    }

    fn block(value: i16) -> Vec<u8> {
        std::iter::repeat_n(value.to_ne_bytes(), 960).flatten().collect()
    }

    #[test]
    fn test_fan_out() {
        let mut m = mixer();
        let g = geometry();
        let a = Arc::new(Track::new(1, Direction::Capture, Format::internal(2, 48000), &g).unwrap());
        let b = Arc::new(Track::new(2, Direction::Capture, "ulaw:8000:1".parse().unwrap(), &g).unwrap());
        m.add_track(a.clone());
        m.add_track(b.clone());

        m.receive(&block(1000));
        assert!(m.process());
        assert!(!m.process());
        assert_eq!(a.lock().pipeline.input().used(), 480);
        assert_eq!(b.lock().pipeline.input().used(), 480);

        let mut st = b.lock();
        st.record_all();
        assert_eq!(st.usrbuf.used(), 80);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut m = mixer();
        let a = Arc::new(Track::new(1, Direction::Capture, Format::internal(2, 48000), &geometry()).unwrap());
        m.add_track(a.clone());

        // The input ring holds four blocks.
        for i in 0..6 {
            m.receive(&block(i));
            m.process();
        }
        let st = a.lock();
        let input = st.pipeline.input();
        assert_eq!(input.used(), input.capacity());
        assert_eq!(st.stats.drop_frames, 2 * 480);
        assert_eq!(st.stats.output_frames, 6 * 480);
        // Freshness: the oldest surviving block is the third one.
        assert_eq!(input.head()[0], 2);
    }

    #[test]
    fn test_paused_track_gets_nothing() {
        let mut m = mixer();
        let a = Arc::new(Track::new(1, Direction::Capture, Format::internal(2, 48000), &geometry()).unwrap());
        a.set_paused(true);
        m.add_track(a.clone());
        m.receive(&block(5));
        m.process();
        assert!(a.lock().pipeline.input().is_empty());
    }

    #[test]
    fn test_hw_ring_overrun() {
        let mut m = mixer();
        for i in 0..4 {
            m.receive(&block(i));
        }
        assert_eq!(m.stats().dropped_blocks, 1);
        assert!(m.process());
        assert_eq!(m.wide[0], 1);
    }
}
