//! PCM16 <-> float conversion for the audio that crosses the WebSocket.
//!
//! Audio travels as base64 text of 16-bit little-endian mono PCM. Playback
//! works on `f32` samples in `[-1.0, 1.0)`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{RelayError, RelayResult};

/// One decoded audio segment, ready to be scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl PlaybackBuffer {
    /// Decode an `audio-chunk` payload.
    pub fn from_base64(data: &str, sample_rate: u32) -> RelayResult<Self> {
        let bytes = STANDARD
            .decode(data.trim())
            .map_err(|e| RelayError::Decode(format!("audio chunk is not base64: {}", e)))?;
        Self::from_pcm16(&bytes, sample_rate)
    }

    /// Decode raw PCM16 little-endian bytes.
    ///
    /// Samples are scaled by 1/32768, so `i16::MIN` maps to exactly -1.0.
    pub fn from_pcm16(bytes: &[u8], sample_rate: u32) -> RelayResult<Self> {
        if sample_rate == 0 {
            return Err(RelayError::Decode("sample rate must be positive".to_string()));
        }
        if bytes.len() % 2 != 0 {
            return Err(RelayError::Decode(format!(
                "PCM16 data has an odd length of {} bytes",
                bytes.len()
            )));
        }

        let mut cursor = Cursor::new(bytes);
        let mut samples = Vec::with_capacity(bytes.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample as f32 / 32768.0);
        }

        Ok(Self {
            samples,
            sample_rate,
        })
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Back to 16-bit samples, e.g. for writing a WAV file.
    pub fn to_pcm16(&self) -> Vec<i16> {
        self.samples
            .iter()
            .map(|&s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16)
            .collect()
    }
}

/// Encode one microphone frame as an `audio-input` payload.
///
/// Samples are clamped to `[-1, 1]`; negatives scale by 0x8000 and positives
/// by 0x7fff so both extremes are representable.
pub fn encode_capture_frame(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        let value = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(value as i16);
    }
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_pcm16() {
        let bytes = [0x00, 0x00, 0x00, 0x40, 0x00, 0xC0, 0xFF, 0x7F, 0x00, 0x80];
        let buffer = PlaybackBuffer::from_base64(&STANDARD.encode(bytes), 24_000).unwrap();

        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.samples()[0], 0.0);
        assert_eq!(buffer.samples()[1], 0.5);
        assert_eq!(buffer.samples()[2], -0.5);
        assert_eq!(buffer.samples()[3], 32767.0 / 32768.0);
        assert_eq!(buffer.samples()[4], -1.0);
        assert_eq!(buffer.to_pcm16(), vec![0, 16384, -16384, 32767, -32768]);
    }

    #[test]
    fn test_duration() {
        let bytes = vec![0u8; 24_000 * 2];
        let buffer = PlaybackBuffer::from_pcm16(&bytes, 24_000).unwrap();
        assert!((buffer.duration_secs() - 1.0).abs() < 1e-12);

        let empty = PlaybackBuffer::from_base64("", 24_000).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.duration_secs(), 0.0);
    }

    #[test]
    fn test_decode_errors() {
        let odd = STANDARD.encode([0x01, 0x02, 0x03]);
        assert!(matches!(
            PlaybackBuffer::from_base64(&odd, 24_000),
            Err(RelayError::Decode(_))
        ));
        assert!(matches!(
            PlaybackBuffer::from_base64("@@not base64@@", 24_000),
            Err(RelayError::Decode(_))
        ));
        assert!(PlaybackBuffer::from_pcm16(&[0, 0], 0).is_err());
    }

    #[test]
    fn test_capture_encoding_clamps_and_scales() {
        let encoded = encode_capture_frame(&[-1.0, 0.0, 1.0, 2.0, -3.0, 0.5]);
        let bytes = STANDARD.decode(encoded).unwrap();
        let mut cursor = Cursor::new(bytes);
        let mut values = Vec::new();
        while let Ok(v) = cursor.read_i16::<LittleEndian>() {
            values.push(v);
        }
        assert_eq!(values, vec![-32768, 0, 32767, 32767, -32768, 16383]);
    }
}
