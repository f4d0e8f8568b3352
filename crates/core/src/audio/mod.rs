use std::io::Cursor;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

use crate::{LipSyncError, Result};

/// Mono PCM audio with its sample rate. Samples are expected in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl PcmBuffer {
    /// Wraps the provided samples after checking they can be analysed.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(LipSyncError::invalid("sample rate must be positive"));
        }
        if samples.is_empty() {
            return Err(LipSyncError::invalid("audio buffer is empty"));
        }
        if let Some(position) = samples.iter().position(|sample| !sample.is_finite()) {
            return Err(LipSyncError::invalid(format!(
                "sample {position} is not a finite number"
            )));
        }

        Ok(Self {
            samples,
            sample_rate,
        })
    }

    /// Builds a buffer from 16-bit little-endian PCM bytes.
    pub fn from_pcm16_le(bytes: &[u8], sample_rate: u32) -> Result<Self> {
        Self::new(pcm16_le_to_f32(bytes)?, sample_rate)
    }

    /// Builds a buffer from 32-bit float little-endian bytes.
    pub fn from_f32_le(bytes: &[u8], sample_rate: u32) -> Result<Self> {
        Self::new(f32_le_to_samples(bytes)?, sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
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

    pub fn duration_seconds(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Splits the buffer into consecutive non-overlapping windows of
    /// `window_len` samples. A trailing partial window is dropped.
    pub fn frames(&self, window_len: usize) -> impl Iterator<Item = AudioFrame<'_>> {
        let sample_rate = self.sample_rate;
        self.samples
            .chunks_exact(window_len.max(1))
            .enumerate()
            .map(move |(index, samples)| AudioFrame {
                index,
                sample_rate,
                samples,
            })
    }

    /// Serialises the samples as 32-bit float little-endian bytes.
    pub fn to_f32_le_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.samples.len() * 4);
        for sample in &self.samples {
            out.put_f32_le(*sample);
        }
        out.freeze()
    }
}

/// Fixed-size window of samples handed to the FFT.
#[derive(Debug, Clone, Copy)]
pub struct AudioFrame<'a> {
    pub index: usize,
    pub sample_rate: u32,
    pub samples: &'a [f32],
}

impl AudioFrame<'_> {
    /// Start time of the frame in seconds.
    pub fn start_seconds(&self) -> f32 {
        (self.index * self.samples.len()) as f32 / self.sample_rate as f32
    }
}

/// Converts 16-bit little-endian PCM into floats in `[-1, 1)`.
pub fn pcm16_le_to_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(LipSyncError::invalid(
            "16-bit PCM data must contain an even number of bytes",
        ));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect())
}

/// Decodes 32-bit float little-endian bytes.
pub fn f32_le_to_samples(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(LipSyncError::invalid(
            "32-bit float PCM data length must be a multiple of four",
        ));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Turns encoded audio bytes into mono PCM.
#[async_trait]
pub trait PcmDecoder: Send + Sync {
    async fn decode(&self, bytes: &[u8]) -> Result<PcmBuffer>;
}

/// Decoder for RIFF/WAVE data. Multi-channel audio is averaged down to mono.
#[derive(Debug, Default, Clone, Copy)]
pub struct WavDecoder;

impl WavDecoder {
    pub fn decode_sync(&self, bytes: &[u8]) -> Result<PcmBuffer> {
        let reader = hound::WavReader::new(Cursor::new(bytes))?;
        let spec = reader.spec();

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let max_value = (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|sample| sample.map(|s| s as f32 / max_value))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        let channels = spec.channels.max(1) as usize;
        let mono = if channels > 1 {
            interleaved
                .chunks(channels)
                .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
                .collect()
        } else {
            interleaved
        };

        tracing::debug!(
            sample_rate = spec.sample_rate,
            channels,
            samples = mono.len(),
            "decoded wav audio"
        );
        PcmBuffer::new(mono, spec.sample_rate)
    }
}

#[async_trait]
impl PcmDecoder for WavDecoder {
    async fn decode(&self, bytes: &[u8]) -> Result<PcmBuffer> {
        self.decode_sync(bytes)
    }
}

#[cfg(test)]
pub(crate) fn wav_bytes(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for sample in samples {
            writer
                .write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_non_finite_audio() {
        assert!(matches!(
            PcmBuffer::new(Vec::new(), 24_000),
            Err(LipSyncError::InvalidInput(_))
        ));
        assert!(matches!(
            PcmBuffer::new(vec![0.0, f32::NAN], 24_000),
            Err(LipSyncError::InvalidInput(_))
        ));
        assert!(matches!(
            PcmBuffer::new(vec![0.0], 0),
            Err(LipSyncError::InvalidInput(_))
        ));
    }

    #[test]
    fn frames_drop_the_trailing_partial_window() {
        let pcm = PcmBuffer::new(vec![0.1; 2_050], 1_000).unwrap();
        let frames: Vec<_> = pcm.frames(100).collect();

        assert_eq!(frames.len(), 20);
        assert_eq!(frames[3].index, 3);
        assert!((frames[3].start_seconds() - 0.3).abs() < 1e-6);
        assert!(frames.iter().all(|frame| frame.samples.len() == 100));
    }

    #[test]
    fn converts_pcm16_bytes() {
        let bytes: Vec<u8> = [0_i16, 16_384, -32_768]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let samples = pcm16_le_to_f32(&bytes).unwrap();

        assert_eq!(samples, vec![0.0, 0.5, -1.0]);
        assert!(pcm16_le_to_f32(&[1, 2, 3]).is_err());
    }

    #[test]
    fn f32_bytes_survive_transport_encoding() {
        let pcm = PcmBuffer::new(vec![0.25, -0.5, 1.0], 8_000).unwrap();
        let bytes = pcm.to_f32_le_bytes();
        let restored = PcmBuffer::from_f32_le(&bytes, 8_000).unwrap();

        assert_eq!(restored, pcm);
    }

    #[tokio::test]
    async fn decodes_wav_into_mono_pcm() {
        let samples: Vec<f32> = (0..480).map(|i| (i as f32 / 480.0) - 0.5).collect();
        let wav = wav_bytes(&samples, 24_000);

        let pcm = WavDecoder.decode(&wav).await.unwrap();
        assert_eq!(pcm.sample_rate(), 24_000);
        assert_eq!(pcm.len(), 480);
        assert!((pcm.samples()[0] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn rejects_garbage_wav() {
        let err = WavDecoder.decode_sync(b"not a wav file").unwrap_err();
        assert!(matches!(err, LipSyncError::Wav(_)));
    }
}
