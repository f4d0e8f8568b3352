use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{DEFAULT_TARGET_FRAME_RATE, DEFAULT_YIELD_INTERVAL},
    vowel::{default_multipliers, DEFAULT_SMOOTHING_ALPHA, DEFAULT_SMOOTHING_WINDOW},
    PlatformCapabilities, Result, SpectrogramEngine, VowelMultipliers, VowelRanges,
    VowelWeightAnalyzer,
};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub analysis: AnalysisConfig,
    pub motion: MotionConfig,
    pub router: RouterConfig,
}

impl AppConfig {
    /// Loads a JSON configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config = serde_json::from_str(raw)?;
        tracing::debug!(?config, "loaded configuration");
        Ok(config)
    }
}

/// Configuration for the spectral and vowel analysis stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub target_frame_rate: f32,
    pub smoothing_window: usize,
    pub smoothing_alpha: f32,
    pub vowel_ranges: VowelRanges,
    pub vowel_multipliers: VowelMultipliers,
    pub yield_interval: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            target_frame_rate: DEFAULT_TARGET_FRAME_RATE,
            smoothing_window: DEFAULT_SMOOTHING_WINDOW,
            smoothing_alpha: DEFAULT_SMOOTHING_ALPHA,
            vowel_ranges: VowelRanges::default(),
            vowel_multipliers: default_multipliers(),
            yield_interval: DEFAULT_YIELD_INTERVAL,
        }
    }
}

impl AnalysisConfig {
    pub fn spectrogram_engine(&self) -> SpectrogramEngine {
        SpectrogramEngine::with_frame_rate(self.target_frame_rate)
            .with_yield_interval(self.yield_interval)
    }

    pub fn vowel_analyzer(&self) -> VowelWeightAnalyzer {
        VowelWeightAnalyzer::new()
            .with_ranges(self.vowel_ranges)
            .with_multipliers(self.vowel_multipliers)
            .with_smoothing(self.smoothing_window, self.smoothing_alpha)
    }
}

/// Configuration for keyframe generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub model_name: String,
    pub optimize: bool,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            model_name: "lipsync".to_string(),
            optimize: true,
        }
    }
}

/// Configuration for backend selection and the message transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub capabilities: PlatformCapabilities,
    /// Depth of each endpoint's request queue.
    pub bus_capacity: usize,
    /// Endpoint name the offscreen document answers to.
    pub offscreen_target: String,
    /// Endpoint name shared by the persistent worker.
    pub shared_worker_target: String,
    pub dedicated_worker_target: String,
    /// How long a remote backend may take to acknowledge `initialize`.
    pub init_timeout_ms: u64,
}

impl RouterConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            capabilities: PlatformCapabilities::default(),
            bus_capacity: 64,
            offscreen_target: "offscreen".to_string(),
            shared_worker_target: "shared-worker".to_string(),
            dedicated_worker_target: "dedicated-worker".to_string(),
            init_timeout_ms: 5_000,
        }
    }
}
