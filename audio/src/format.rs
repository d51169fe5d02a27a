//! Sample format definitions and validation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum number of channels a track or the hardware may carry.
pub const MAX_CHANNELS: u32 = 12;
/// Lowest accepted sample rate in Hz.
pub const MIN_SAMPLE_RATE: u32 = 1000;
/// Highest accepted sample rate in Hz.
pub const MAX_SAMPLE_RATE: u32 = 192_000;
/// Precision of the internal working sample.
pub const INTERNAL_BITS: u32 = 16;

/// Sample encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    SlinearLe,
    SlinearBe,
    UlinearLe,
    UlinearBe,
    /// G.711 µ-law.
    Ulaw,
    /// G.711 A-law.
    Alaw,
}

impl Encoding {
    /// Signed linear in the host byte order.
    pub const fn slinear_ne() -> Self {
        if cfg!(target_endian = "little") {
            Encoding::SlinearLe
        } else {
            Encoding::SlinearBe
        }
    }

    /// Signed linear in the opposite of the host byte order.
    pub const fn slinear_oe() -> Self {
        if cfg!(target_endian = "little") {
            Encoding::SlinearBe
        } else {
            Encoding::SlinearLe
        }
    }

    pub fn is_linear(self) -> bool {
        !matches!(self, Encoding::Ulaw | Encoding::Alaw)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Encoding::SlinearLe | Encoding::SlinearBe)
    }

    pub fn is_big_endian(self) -> bool {
        matches!(self, Encoding::SlinearBe | Encoding::UlinearBe)
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::SlinearLe => "slinear_le",
            Encoding::SlinearBe => "slinear_be",
            Encoding::UlinearLe => "ulinear_le",
            Encoding::UlinearBe => "ulinear_be",
            Encoding::Ulaw => "ulaw",
            Encoding::Alaw => "alaw",
        }
    }

    // 8-bit samples have no byte order; keep one spelling for them.
    fn without_byte_order(self) -> Self {
        match self {
            Encoding::SlinearBe => Encoding::SlinearLe,
            Encoding::UlinearBe => Encoding::UlinearLe,
            other => other,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "slinear_le" | "s_le" => Ok(Encoding::SlinearLe),
            "slinear_be" | "s_be" => Ok(Encoding::SlinearBe),
            "slinear" | "slinear_ne" => Ok(Encoding::slinear_ne()),
            "ulinear_le" | "u_le" => Ok(Encoding::UlinearLe),
            "ulinear_be" | "u_be" => Ok(Encoding::UlinearBe),
            "ulaw" | "mulaw" => Ok(Encoding::Ulaw),
            "alaw" => Ok(Encoding::Alaw),
            other => Err(Error::InvalidFormat(format!("unknown encoding {other:?}"))),
        }
    }
}

/// Describes a sample stream: rate, encoding, channels and sample layout.
///
/// `precision` is the number of significant bits per sample and `stride` the
/// number of bits each sample occupies in memory. Samples narrower than their
/// stride sit in the low bits.
///
/// Formats print and parse as `encoding:rate:channels[:precision[:stride]]`:
///
/// ```
/// use trackmix_audio::{Encoding, Format};
///
/// let fmt: Format = "ulaw:8000:1".parse().unwrap();
/// assert_eq!(fmt.encoding, Encoding::Ulaw);
/// assert_eq!(fmt.frame_bytes(), 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Format {
    pub sample_rate: u32,
    pub encoding: Encoding,
    pub channels: u32,
    pub precision: u32,
    pub stride: u32,
}

impl Format {
    /// Creates a format whose stride equals its precision.
    pub const fn new(encoding: Encoding, precision: u32, channels: u32, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            encoding,
            channels,
            precision,
            stride: precision,
        }
    }

    /// 16-bit signed native-endian linear, the internal working format.
    pub const fn internal(channels: u32, sample_rate: u32) -> Self {
        Self::new(Encoding::slinear_ne(), INTERNAL_BITS, channels, sample_rate)
    }

    /// 8 kHz mono µ-law, the format a freshly opened track starts with.
    pub const fn ulaw_8k_mono() -> Self {
        Self::new(Encoding::Ulaw, 8, 1, 8000)
    }

    /// Returns the format with a different sample rate.
    pub const fn with_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Returns the format with a different channel count.
    pub const fn with_channels(mut self, channels: u32) -> Self {
        self.channels = channels;
        self
    }

    /// Bytes occupied by one sample.
    pub fn sample_bytes(&self) -> usize {
        (self.stride / 8) as usize
    }

    /// Bytes occupied by one frame.
    pub fn frame_bytes(&self) -> usize {
        self.sample_bytes() * self.channels as usize
    }

    /// True if this is the internal sample layout (16-bit signed linear,
    /// native byte order), ignoring rate and channels.
    pub fn is_internal(&self) -> bool {
        self.encoding == Encoding::slinear_ne()
            && self.precision == INTERNAL_BITS
            && self.stride == INTERNAL_BITS
    }

    /// True if the sample layout is internal except for byte order.
    pub fn is_internal_swapped(&self) -> bool {
        self.encoding == Encoding::slinear_oe()
            && self.precision == INTERNAL_BITS
            && self.stride == INTERNAL_BITS
    }

    /// Checks the format and returns its canonical spelling.
    pub fn validate(self) -> Result<Format> {
        let mut fmt = self;
        match fmt.encoding {
            Encoding::Ulaw | Encoding::Alaw => {
                if fmt.precision != 8 || fmt.stride != 8 {
                    return Err(fmt.invalid("companded encodings are 8-bit"));
                }
            }
            _ => {
                if !matches!(fmt.precision, 8 | 16 | 24 | 32) {
                    return Err(fmt.invalid("unsupported precision"));
                }
                if !matches!(fmt.stride, 8 | 16 | 24 | 32) {
                    return Err(fmt.invalid("unsupported stride"));
                }
                if fmt.precision > fmt.stride {
                    return Err(fmt.invalid("precision exceeds stride"));
                }
                if fmt.stride == 8 {
                    fmt.encoding = fmt.encoding.without_byte_order();
                }
            }
        }
        if fmt.channels == 0 || fmt.channels > MAX_CHANNELS {
            return Err(fmt.invalid("channel count out of range"));
        }
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&fmt.sample_rate) {
            return Err(fmt.invalid("sample rate out of range"));
        }
        Ok(fmt)
    }

    fn invalid(&self, msg: &str) -> Error {
        Error::InvalidFormat(format!("{self}: {msg}"))
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.encoding, self.sample_rate, self.channels)?;
        if self.encoding.is_linear() {
            write!(f, ":{}", self.precision)?;
            if self.stride != self.precision {
                write!(f, ":{}", self.stride)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if !(3..=5).contains(&parts.len()) {
            return Err(Error::InvalidFormat(format!(
                "{s:?}: expected encoding:rate:channels[:precision[:stride]]"
            )));
        }
        let num = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| Error::InvalidFormat(format!("{s:?}: bad number {p:?}")))
        };
        let encoding: Encoding = parts[0].parse()?;
        let sample_rate = num(parts[1])?;
        let channels = num(parts[2])?;
        let precision = match parts.get(3) {
            Some(p) => num(p)?,
            None if encoding.is_linear() => INTERNAL_BITS,
            None => 8,
        };
        let stride = match parts.get(4) {
            Some(p) => num(p)?,
            None => precision,
        };
        Ok(Format {
            sample_rate,
            encoding,
            channels,
            precision,
            stride,
        })
    }
}

impl TryFrom<String> for Format {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Format> for String {
    fn from(fmt: Format) -> Self {
        fmt.to_string()
    }
}

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Playback,
    Capture,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Playback => f.write_str("playback"),
            Direction::Capture => f.write_str("capture"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_format() {
        let fmt = Format::internal(2, 48000);
        assert!(fmt.is_internal());
        assert!(!fmt.is_internal_swapped());
        assert_eq!(fmt.frame_bytes(), 4);
        assert_eq!(fmt.encoding, Encoding::slinear_ne());
    }

    #[test]
    fn test_parse_and_display() {
        let fmt: Format = "slinear_le:44100:2:24:32".parse().unwrap();
        assert_eq!(fmt.sample_rate, 44100);
        assert_eq!(fmt.channels, 2);
        assert_eq!(fmt.precision, 24);
        assert_eq!(fmt.stride, 32);
        assert_eq!(fmt.frame_bytes(), 8);
        assert_eq!(fmt.to_string(), "slinear_le:44100:2:24:32");

        let fmt: Format = "alaw:8000:1".parse().unwrap();
        assert_eq!(fmt.precision, 8);
        assert_eq!(fmt.to_string(), "alaw:8000:1");

        let fmt: Format = "ulinear_be:16000:1".parse().unwrap();
        assert_eq!(fmt.precision, 16);
    }

    #[test]
    fn test_parse_errors() {
        assert!("ulaw:8000".parse::<Format>().is_err());
        assert!("flac:8000:1".parse::<Format>().is_err());
        assert!("ulaw:fast:1".parse::<Format>().is_err());
    }

    #[test]
    fn test_validate_accepts() {
        for s in [
            "ulaw:8000:1",
            "alaw:8000:2",
            "slinear_le:48000:2:16",
            "slinear_be:96000:6:24",
            "ulinear_le:22050:1:8",
            "slinear_le:192000:12:24:32",
        ] {
            let fmt: Format = s.parse().unwrap();
            assert!(fmt.validate().is_ok(), "{s} should be valid");
        }
    }

    #[test]
    fn test_validate_rejects() {
        for s in [
            "ulaw:8000:1:16",
            "slinear_le:48000:2:12",
            "slinear_le:48000:2:32:16",
            "slinear_le:48000:0",
            "slinear_le:48000:13",
            "slinear_le:500:1",
            "slinear_le:200000:1",
        ] {
            let fmt: Format = s.parse().unwrap();
            assert!(
                matches!(fmt.validate(), Err(Error::InvalidFormat(_))),
                "{s} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_normalizes_8bit_byte_order() {
        let fmt = Format::new(Encoding::UlinearBe, 8, 1, 8000).validate().unwrap();
        assert_eq!(fmt.encoding, Encoding::UlinearLe);
    }

    #[test]
    fn test_serde_yaml() {
        let fmt: Format = serde_yaml::from_str("\"slinear_le:48000:2\"").unwrap();
        assert_eq!(fmt, Format::new(Encoding::SlinearLe, 16, 2, 48000));
        let text = serde_yaml::to_string(&Format::ulaw_8k_mono()).unwrap();
        assert_eq!(text.trim(), "ulaw:8000:1");
    }
}
