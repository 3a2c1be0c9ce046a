use std::{io::Cursor, time::Duration};

use bytes::Bytes;
use hound::{WavSpec, WavWriter};
use thiserror::Error;

use crate::capture::{CaptureFormat, SampleFormat};

pub const WAV_MIME_TYPE: &str = "audio/wav";

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("no audio data captured")]
    Empty,
    #[error("cannot transcode {0} to wav without a decoder")]
    UnsupportedInput(String),
    #[error("pcm payload of {len} bytes is not a multiple of the {frame}-byte frame size")]
    MisalignedPcm { len: usize, frame: usize },
    #[error("wav encoding failed: {0}")]
    Wav(#[from] hound::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedAudio {
    pub bytes: Bytes,
    pub mime_type: String,
    pub duration: Option<Duration>,
}

impl EncodedAudio {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub trait AudioEncoder: Send + Sync {
    fn encode(&self, chunks: &[Bytes], format: &CaptureFormat) -> Result<EncodedAudio, EncodeError>;
}

/// Produces 16-bit PCM WAV, the format every client can play back.
#[derive(Debug, Default, Clone, Copy)]
pub struct WavEncoder;

impl AudioEncoder for WavEncoder {
    fn encode(&self, chunks: &[Bytes], format: &CaptureFormat) -> Result<EncodedAudio, EncodeError> {
        let total: usize = chunks.iter().map(Bytes::len).sum();
        if total == 0 {
            return Err(EncodeError::Empty);
        }

        match format {
            CaptureFormat::Pcm {
                sample_rate,
                channels,
                sample_format,
            } => encode_pcm(chunks, total, *sample_rate, *channels, *sample_format),
            CaptureFormat::Encoded { mime_type } if is_wav(mime_type) => Ok(EncodedAudio {
                bytes: concat(chunks, total),
                mime_type: WAV_MIME_TYPE.to_string(),
                duration: None,
            }),
            CaptureFormat::Encoded { mime_type } => {
                Err(EncodeError::UnsupportedInput(mime_type.clone()))
            }
        }
    }
}

fn is_wav(mime_type: &str) -> bool {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case("audio/wav")
        || essence.eq_ignore_ascii_case("audio/x-wav")
        || essence.eq_ignore_ascii_case("audio/wave")
}

fn concat(chunks: &[Bytes], total: usize) -> Bytes {
    let mut joined = Vec::with_capacity(total);
    for chunk in chunks {
        joined.extend_from_slice(chunk);
    }
    Bytes::from(joined)
}

fn encode_pcm(
    chunks: &[Bytes],
    total: usize,
    sample_rate: u32,
    channels: u16,
    sample_format: SampleFormat,
) -> Result<EncodedAudio, EncodeError> {
    let frame = sample_format.bytes_per_sample() * usize::from(channels.max(1));
    if total % frame != 0 {
        return Err(EncodeError::MisalignedPcm { len: total, frame });
    }
    let raw = concat(chunks, total);

    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + total));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        match sample_format {
            SampleFormat::I16 => {
                for pair in raw.chunks_exact(2) {
                    writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
                }
            }
            SampleFormat::F32 => {
                for quad in raw.chunks_exact(4) {
                    let sample = f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]);
                    writer.write_sample(f32_to_i16(sample))?;
                }
            }
        }
        writer.finalize()?;
    }

    let frames = total / frame;
    let duration = if sample_rate == 0 {
        None
    } else {
        Some(Duration::from_secs_f64(frames as f64 / f64::from(sample_rate)))
    };

    Ok(EncodedAudio {
        bytes: Bytes::from(cursor.into_inner()),
        mime_type: WAV_MIME_TYPE.to_string(),
        duration,
    })
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

#[cfg(test)]
#[path = "tests/encoder_tests.rs"]
mod tests;
