//! Audio to motion pipeline plus the external collaborators it can call on.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    AnalysisConfig, AppConfig, BinaryMotionCodec, MotionConfig, MotionDocument,
    MotionKeyframeEncoder, PcmBuffer, Result,
};

/// Opaque handle to a scene prepared by a [`SecondaryConverter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneHandle(pub u64);

/// Text-to-speech model producing encoded audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Loads model state. Called once while the hosting backend initialises.
    async fn load(&self) -> Result<()> {
        Ok(())
    }

    async fn synthesize(&self, text: &str) -> Result<Bytes>;
}

/// Converts a motion buffer into a size-optimised encoding bound to a scene.
#[async_trait]
pub trait SecondaryConverter: Send + Sync {
    async fn create_scene(&self) -> Result<SceneHandle>;

    /// `source` is always a private copy the converter may keep or mutate.
    async fn convert(&self, source: Bytes, scene: &SceneHandle) -> Result<Bytes>;
}

/// Outcome of the optional secondary conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ConversionStatus {
    NotRequested,
    Converted,
    /// The converter was missing or failed; the caller got the plain motion
    /// buffer and may convert it elsewhere.
    Skipped { reason: String },
}

/// Result of a motion generation job.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionOutput {
    pub vmd: Bytes,
    pub converted: Option<Bytes>,
    pub conversion: ConversionStatus,
}

impl MotionOutput {
    pub fn unconverted(vmd: Bytes) -> Self {
        Self {
            vmd,
            converted: None,
            conversion: ConversionStatus::NotRequested,
        }
    }

    pub fn conversion_skipped(&self) -> bool {
        matches!(self.conversion, ConversionStatus::Skipped { .. })
    }

    /// The most compact buffer available.
    pub fn preferred(&self) -> &Bytes {
        self.converted.as_ref().unwrap_or(&self.vmd)
    }
}

/// Audio ready for playback together with the motion that animates it.
#[derive(Debug, Clone, PartialEq)]
pub struct LipSyncAudio {
    pub audio: Bytes,
    pub motion: Option<MotionOutput>,
}

impl LipSyncAudio {
    pub fn audio_only(audio: Bytes) -> Self {
        Self {
            audio,
            motion: None,
        }
    }
}

/// Spectrogram, vowel analysis and keyframe encoding wired together.
#[derive(Debug, Clone, Default)]
pub struct LipSyncPipeline {
    analysis: AnalysisConfig,
    motion: MotionConfig,
}

impl LipSyncPipeline {
    pub fn new(analysis: AnalysisConfig, motion: MotionConfig) -> Self {
        Self { analysis, motion }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.analysis.clone(), config.motion.clone())
    }

    pub fn default_model_name(&self) -> &str {
        &self.motion.model_name
    }

    /// Builds the motion document for `pcm`.
    pub async fn generate_document(
        &self,
        pcm: &PcmBuffer,
        model_name: &str,
        cancel: &CancellationToken,
    ) -> Result<MotionDocument> {
        let spectrogram = self
            .analysis
            .spectrogram_engine()
            .compute_async(pcm, cancel)
            .await?;
        let weights = self.analysis.vowel_analyzer().process(&spectrogram);

        let encoder = MotionKeyframeEncoder::with_source_frame_rate(self.analysis.target_frame_rate);
        let document = encoder.encode(&weights, model_name);
        let document = if self.motion.optimize {
            encoder.optimize(document)
        } else {
            document
        };

        tracing::debug!(
            duration_seconds = pcm.duration_seconds(),
            keyframes = document.morphs.len(),
            "generated motion document"
        );
        Ok(document)
    }

    /// Builds and serialises the motion for `pcm`.
    pub async fn generate_motion(&self, pcm: &PcmBuffer, model_name: &str) -> Result<Bytes> {
        let document = self
            .generate_document(pcm, model_name, &CancellationToken::new())
            .await?;
        Ok(BinaryMotionCodec::serialize(&document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{analysis::sine, Vowel};

    #[tokio::test]
    async fn silent_audio_produces_closed_mouth_motion() {
        let pipeline = LipSyncPipeline::default();
        let pcm = PcmBuffer::new(vec![0.0; 24_000], 24_000).unwrap();

        let vmd = pipeline.generate_motion(&pcm, "silent").await.unwrap();
        let document = BinaryMotionCodec::deserialize(&vmd).unwrap();

        assert_eq!(document.model_name, "silent");
        assert!(!document.morphs.is_empty());
        assert!(document.morphs.iter().all(|k| k.weight.abs() < 1e-6));
    }

    #[tokio::test]
    async fn tone_drives_the_a_shape() {
        let pipeline = LipSyncPipeline::new(
            AnalysisConfig::default(),
            MotionConfig {
                optimize: false,
                ..MotionConfig::default()
            },
        );
        let pcm = sine(1_000.0, 24_000, 1.0, 0.8);

        let document = pipeline
            .generate_document(&pcm, "tone", &CancellationToken::new())
            .await
            .unwrap();
        let middle = 15;
        let at = |vowel: Vowel| {
            document
                .morph_track(vowel.label())
                .find(|k| k.frame == middle)
                .map(|k| k.weight)
                .unwrap()
        };

        assert_eq!(document.morphs.len(), 30 * 4);
        assert!(at(Vowel::A) > at(Vowel::I));
        assert!(at(Vowel::A) > at(Vowel::U));
        assert!(at(Vowel::A) > at(Vowel::O));
    }

    #[test]
    fn preferred_buffer_falls_back_to_vmd() {
        let output = MotionOutput::unconverted(Bytes::from_static(b"vmd"));
        assert_eq!(output.preferred(), &Bytes::from_static(b"vmd"));
        assert!(!output.conversion_skipped());
    }
}
