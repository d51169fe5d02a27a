//! Encoding conversion between user/hardware byte formats and the internal
//! 16-bit signed linear sample.
//!
//! Every conversion has the internal representation on one side. µ-law and
//! A-law follow G.711; linear formats of any precision/stride/endianness are
//! scaled to and from 16 bits by shifting.

use crate::format::{Encoding, Format};

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

const ULAW_TO_LINEAR: [i16; 256] = build_ulaw_table();
const ALAW_TO_LINEAR: [i16; 256] = build_alaw_table();

const fn build_ulaw_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        let u = !(i as u8);
        let exponent = ((u >> 4) & 0x07) as i32;
        let mantissa = (u & 0x0F) as i32;
        let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
        table[i] = if u & 0x80 != 0 {
            -magnitude as i16
        } else {
            magnitude as i16
        };
        i += 1;
    }
    table
}

const fn build_alaw_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        let a = (i as u8) ^ 0x55;
        let segment = ((a & 0x70) >> 4) as i32;
        let mut t = ((a & 0x0F) as i32) << 4;
        t = match segment {
            0 => t + 8,
            1 => t + 0x108,
            _ => (t + 0x108) << (segment - 1),
        };
        table[i] = if a & 0x80 != 0 { t as i16 } else { -t as i16 };
        i += 1;
    }
    table
}

/// Decodes one µ-law byte.
#[inline]
pub fn ulaw_to_linear(code: u8) -> i16 {
    ULAW_TO_LINEAR[code as usize]
}

/// Encodes one sample as µ-law.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut s = sample as i32;
    let sign = if s < 0 {
        s = -s;
        0x80
    } else {
        0
    };
    s = s.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while s & mask == 0 && exponent > 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (s >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Decodes one A-law byte.
#[inline]
pub fn alaw_to_linear(code: u8) -> i16 {
    ALAW_TO_LINEAR[code as usize]
}

/// Encodes one sample as A-law.
pub fn linear_to_alaw(sample: i16) -> u8 {
    const SEGMENT_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

    let mut pcm = (sample as i32) >> 3;
    let mask: i32 = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };
    let Some(segment) = SEGMENT_END.iter().position(|&end| pcm <= end) else {
        return (0x7F ^ mask) as u8;
    };
    let mut aval = (segment as i32) << 4;
    aval |= if segment < 2 {
        (pcm >> 1) & 0x0F
    } else {
        (pcm >> segment) & 0x0F
    };
    (aval ^ mask) as u8
}

/// Converts samples between one byte format and the internal sample.
///
/// Only the layout of the format matters (encoding, precision, stride); rate
/// and channels are ignored. The same converter serves the user side of a
/// track and the hardware side of a mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Converter {
    encoding: Encoding,
    precision: u32,
    sample_bytes: usize,
}

impl Converter {
    pub fn new(format: &Format) -> Self {
        Self {
            encoding: format.encoding,
            precision: format.precision,
            sample_bytes: format.sample_bytes(),
        }
    }

    /// Bytes per encoded sample.
    pub fn sample_bytes(&self) -> usize {
        self.sample_bytes
    }

    /// Decodes `dst.len()` samples from `src` into internal samples.
    pub fn decode(&self, src: &[u8], dst: &mut [i16]) {
        debug_assert!(src.len() >= dst.len() * self.sample_bytes);
        let samples = src.chunks_exact(self.sample_bytes).zip(dst.iter_mut());
        match self.encoding {
            Encoding::Ulaw => samples.for_each(|(s, d)| *d = ulaw_to_linear(s[0])),
            Encoding::Alaw => samples.for_each(|(s, d)| *d = alaw_to_linear(s[0])),
            _ if self.is_native16() => {
                samples.for_each(|(s, d)| *d = i16::from_ne_bytes([s[0], s[1]]))
            }
            _ => samples.for_each(|(s, d)| *d = self.decode_linear(s)),
        }
    }

    /// Encodes internal samples from `src` into `dst`.
    pub fn encode(&self, src: &[i16], dst: &mut [u8]) {
        debug_assert!(dst.len() >= src.len() * self.sample_bytes);
        let samples = src.iter().zip(dst.chunks_exact_mut(self.sample_bytes));
        match self.encoding {
            Encoding::Ulaw => samples.for_each(|(s, d)| d[0] = linear_to_ulaw(*s)),
            Encoding::Alaw => samples.for_each(|(s, d)| d[0] = linear_to_alaw(*s)),
            _ if self.is_native16() => {
                samples.for_each(|(s, d)| d.copy_from_slice(&s.to_ne_bytes()))
            }
            _ => samples.for_each(|(s, d)| self.encode_linear(*s, d)),
        }
    }

    fn is_native16(&self) -> bool {
        self.encoding == Encoding::slinear_ne() && self.precision == 16 && self.sample_bytes == 2
    }

    fn mask(&self) -> u32 {
        if self.precision == 32 {
            u32::MAX
        } else {
            (1u32 << self.precision) - 1
        }
    }

    fn decode_linear(&self, bytes: &[u8]) -> i16 {
        let raw = if self.encoding.is_big_endian() {
            bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
        } else {
            bytes.iter().rev().fold(0u32, |acc, &b| (acc << 8) | b as u32)
        };
        let mut raw = raw & self.mask();
        if !self.encoding.is_signed() {
            raw ^= 1 << (self.precision - 1);
        }
        let shift = 32 - self.precision;
        let value = ((raw << shift) as i32) >> shift;
        if self.precision >= 16 {
            (value >> (self.precision - 16)) as i16
        } else {
            (value << (16 - self.precision)) as i16
        }
    }

    fn encode_linear(&self, sample: i16, out: &mut [u8]) {
        let value = sample as i32;
        let mut raw = if self.precision >= 16 {
            (value << (self.precision - 16)) as u32
        } else {
            (value >> (16 - self.precision)) as u32
        };
        if !self.encoding.is_signed() {
            raw ^= 1 << (self.precision - 1);
        }
        raw &= self.mask();

        let n = out.len();
        for (i, b) in out.iter_mut().enumerate() {
            let byte = if self.encoding.is_big_endian() { n - 1 - i } else { i };
            *b = (raw >> (8 * byte)) as u8;
        }
    }
}
