//! # Audio Transcoding
//!
//! Stateless, frame-at-a-time conversion between 8-bit G.711 mu-law and
//! 16-bit linear PCM, with naive rate conversion between the 8kHz telephony
//! leg and the 16kHz agent leg.
//!
//! ## Rate Conversion:
//! Upsampling duplicates each sample; downsampling drops every other sample
//! instead of filtering. Both are deliberate allocation-light, real-time-safe
//! tradeoffs that accept quality loss: telephony audio is band-limited well
//! below the artifacts this introduces.
//!
//! No cross-frame state is kept, so these functions are safe to call
//! concurrently across any number of sessions.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Encoding bias used by the G.711 mu-law segment layout.
const MULAW_BIAS: i32 = 0x84;

/// Largest magnitude representable before the encoder saturates.
const MULAW_CLIP: i32 = 32_635;

/// Audio format spoken on a socket leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    /// 8-bit G.711 mu-law at 8kHz (the telephony native format)
    #[serde(rename = "ulaw_8000")]
    Ulaw8000,
    /// 16-bit little-endian linear PCM at 16kHz
    #[serde(rename = "pcm_16000")]
    Pcm16000,
}

impl AudioFormat {
    /// Wire name used in agent protocol messages and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Ulaw8000 => "ulaw_8000",
            AudioFormat::Pcm16000 => "pcm_16000",
        }
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ulaw_8000" => Ok(AudioFormat::Ulaw8000),
            "pcm_16000" => Ok(AudioFormat::Pcm16000),
            _ => Err(format!("Unknown audio format: {}", s)),
        }
    }
}

/// Expand one mu-law byte into a linear 16-bit sample.
///
/// Standard G.711 expansion: invert the byte, split sign bit, 3-bit
/// exponent, and 4-bit mantissa, then rebuild the biased magnitude.
pub fn mulaw_to_pcm(byte: u8) -> i16 {
    let b = !byte;
    let sign = b & 0x80;
    let exponent = ((b >> 4) & 0x07) as i32;
    let mantissa = (b & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;

    if sign != 0 {
        -(magnitude as i16)
    } else {
        magnitude as i16
    }
}

/// Compress one linear 16-bit sample into a mu-law byte.
///
/// Logarithmic compression of the clamped sample: the segment (exponent) is
/// the position of the highest set bit of the biased magnitude, the mantissa
/// the four bits below it.
pub fn pcm_to_mulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign: u8 = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };

    if pcm > MULAW_CLIP {
        pcm = MULAW_CLIP;
    }
    pcm += MULAW_BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (pcm & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = ((pcm >> (exponent as i32 + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Decode a mu-law frame into linear samples.
///
/// With `upsample` set, each decoded sample is duplicated to convert the
/// 8kHz telephony rate to the agent's 16kHz rate.
pub fn decode_mulaw_frame(frame: &[u8], upsample: bool) -> Vec<i16> {
    let mut samples = Vec::with_capacity(if upsample { frame.len() * 2 } else { frame.len() });
    for &byte in frame {
        let sample = mulaw_to_pcm(byte);
        samples.push(sample);
        if upsample {
            samples.push(sample);
        }
    }
    samples
}

/// Encode linear samples into a mu-law frame.
///
/// With `decimate` set, every other sample is dropped to convert the agent's
/// 16kHz rate back to the 8kHz telephony rate.
pub fn encode_mulaw_frame(samples: &[i16], decimate: bool) -> Vec<u8> {
    let step = if decimate { 2 } else { 1 };
    samples
        .iter()
        .step_by(step)
        .map(|&s| pcm_to_mulaw(s))
        .collect()
}

/// Parse raw little-endian 16-bit PCM bytes into samples.
///
/// Returns an error message for odd-length input rather than silently
/// truncating a frame.
pub fn pcm_bytes_to_samples(data: &[u8]) -> Result<Vec<i16>, String> {
    if data.len() % 2 != 0 {
        return Err("PCM data length must be even for 16-bit samples".to_string());
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Serialize samples as little-endian 16-bit PCM bytes.
pub fn samples_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        bytes.write_i16::<LittleEndian>(sample).unwrap();
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every mu-law codeword except negative zero survives a decode/encode
    /// round trip exactly.
    #[test]
    fn test_mulaw_codeword_identity() {
        for byte in 0u16..=255 {
            let byte = byte as u8;
            if byte == 0x7F {
                // Negative zero decodes to 0, which re-encodes as positive
                // zero (0xFF); this is inherent to the format.
                continue;
            }
            let pcm = mulaw_to_pcm(byte);
            assert_eq!(
                pcm_to_mulaw(pcm),
                byte,
                "codeword 0x{:02X} did not survive round trip",
                byte
            );
        }
    }

    /// PCM -> mu-law -> PCM stays within the segment's quantization step.
    #[test]
    fn test_pcm_round_trip_within_quantization_error() {
        for sample in (-32_000..32_000).step_by(37) {
            let sample = sample as i16;
            let recovered = mulaw_to_pcm(pcm_to_mulaw(sample));
            // The largest mu-law segment quantizes in steps of 1024; half a
            // step of error on either side is the theoretical bound.
            let error = (recovered as i32 - sample as i32).abs();
            assert!(
                error <= 1024,
                "sample {} recovered as {} (error {})",
                sample,
                recovered,
                error
            );
        }
    }

    #[test]
    fn test_clipping_saturates() {
        let loud = mulaw_to_pcm(pcm_to_mulaw(i16::MAX));
        let clipped = mulaw_to_pcm(pcm_to_mulaw(32_635));
        assert_eq!(loud, clipped);

        let quiet = mulaw_to_pcm(pcm_to_mulaw(i16::MIN));
        assert_eq!(quiet, -clipped);
    }

    #[test]
    fn test_upsample_duplicates_samples() {
        let frame = vec![0xFFu8, 0x00];
        let samples = decode_mulaw_frame(&frame, true);
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0], samples[1]);
        assert_eq!(samples[2], samples[3]);
    }

    #[test]
    fn test_decimate_drops_every_other_sample() {
        let samples = vec![100i16, -100, 200, -200, 300, -300];
        let encoded = encode_mulaw_frame(&samples, true);
        assert_eq!(encoded.len(), 3);
        // The retained samples are the even-indexed (positive) ones
        for &byte in &encoded {
            assert!(mulaw_to_pcm(byte) >= 0);
        }
    }

    #[test]
    fn test_pcm_byte_conversion() {
        let samples = vec![0i16, 16_384, -16_384, 32_767, -32_768];
        let bytes = samples_to_pcm_bytes(&samples);
        assert_eq!(bytes.len(), samples.len() * 2);
        assert_eq!(pcm_bytes_to_samples(&bytes).unwrap(), samples);

        assert!(pcm_bytes_to_samples(&bytes[..3]).is_err());
    }

    #[test]
    fn test_format_names() {
        assert_eq!(AudioFormat::Ulaw8000.as_str(), "ulaw_8000");
        assert_eq!(
            "pcm_16000".parse::<AudioFormat>().unwrap(),
            AudioFormat::Pcm16000
        );
        assert!("pcm_44100".parse::<AudioFormat>().is_err());
    }
}
