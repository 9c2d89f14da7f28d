//! Interleaved little-endian PCM <-> normalized float conversion.

use std::fmt;
use std::str::FromStr;

use alsa::pcm::Format;

const S16_SCALE: f32 = 32_768.0;
const S24_SCALE: f32 = 8_388_608.0;
const S32_SCALE: f32 = 2_147_483_648.0;

// Largest positive values that do not wrap after scaling.
const S16_MAX: f32 = 0.999_969_5;
const S24_S32_MAX: f32 = 0.999_999_9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16Le,
    /// Packed 3-byte 24-bit.
    S24Le3,
    S32Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16Le => 2,
            SampleFormat::S24Le3 => 3,
            SampleFormat::S32Le => 4,
        }
    }

    pub fn alsa_format(self) -> Format {
        match self {
            SampleFormat::S16Le => Format::S16LE,
            SampleFormat::S24Le3 => Format::S243LE,
            SampleFormat::S32Le => Format::S32LE,
        }
    }
}

impl FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s16" | "s16_le" => Ok(SampleFormat::S16Le),
            "s24" | "s24_3le" => Ok(SampleFormat::S24Le3),
            "s32" | "s32_le" => Ok(SampleFormat::S32Le),
            other => Err(format!("unsupported format: {}", other)),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleFormat::S16Le => "S16_LE",
            SampleFormat::S24Le3 => "S24_3LE",
            SampleFormat::S32Le => "S32_LE",
        };
        f.write_str(name)
    }
}

/// Decodes every complete sample in `src` into `dst` (replacing its contents).
pub fn pcm_to_float(src: &[u8], format: SampleFormat, dst: &mut Vec<f32>) {
    dst.clear();
    match format {
        SampleFormat::S16Le => dst.extend(
            src.chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / S16_SCALE),
        ),
        SampleFormat::S24Le3 => dst.extend(src.chunks_exact(3).map(|b| {
            // sign-extend bit 23
            let value = i32::from_le_bytes([b[0], b[1], b[2], 0]) << 8 >> 8;
            value as f32 / S24_SCALE
        })),
        SampleFormat::S32Le => dst.extend(
            src.chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32 / S32_SCALE),
        ),
    }
}

/// Encodes `src` into `dst` (replacing its contents), clamping first.
pub fn float_to_pcm(src: &[f32], format: SampleFormat, dst: &mut Vec<u8>) {
    dst.clear();
    dst.reserve(src.len() * format.bytes_per_sample());
    match format {
        SampleFormat::S16Le => {
            for &s in src {
                let v = (s.clamp(-1.0, S16_MAX) * S16_SCALE) as i16;
                dst.extend_from_slice(&v.to_le_bytes());
            }
        }
        SampleFormat::S24Le3 => {
            for &s in src {
                let v = (s.clamp(-1.0, S24_S32_MAX) * S24_SCALE) as i32;
                dst.extend_from_slice(&v.to_le_bytes()[..3]);
            }
        }
        SampleFormat::S32Le => {
            for &s in src {
                let v = (s.clamp(-1.0, S24_S32_MAX) * S32_SCALE) as i32;
                dst.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
}
