//! Core library for generating lip sync motion from speech audio.
//!
//! Audio is turned into a spectrogram, the spectrogram into per-frame vowel
//! weights, and the weights into morph keyframes that are serialised in the
//! Vocaloid motion format. Jobs are routed to one of several interchangeable
//! execution backends through the [`dispatch`] module.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod motion;
pub mod pipeline;
pub mod vowel;

pub use analysis::{Spectrogram, SpectrogramEngine};
pub use audio::{AudioFrame, PcmBuffer, PcmDecoder, WavDecoder};
pub use config::{AnalysisConfig, AppConfig, MotionConfig, RouterConfig};
pub use dispatch::{
    BackendKind, DispatchRequest, DispatchResponse, ExecutionContextRouter, JobType,
    PlatformCapabilities,
};
pub use error::{LipSyncError, Result};
pub use motion::{BinaryMotionCodec, DecodeOptions, MorphKeyframe, MotionDocument, MotionKeyframeEncoder};
pub use pipeline::{
    ConversionStatus, LipSyncAudio, LipSyncPipeline, MotionOutput, SecondaryConverter,
    SpeechSynthesizer,
};
pub use vowel::{
    PerVowel, Vowel, VowelMultipliers, VowelRanges, VowelWeightAnalyzer, VowelWeightFrame,
};
