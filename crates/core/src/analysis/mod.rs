use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use tokio_util::sync::CancellationToken;

use crate::{AudioFrame, LipSyncError, PcmBuffer, Result};

/// Frame rate of the motion timeline the analysis feeds.
pub const DEFAULT_TARGET_FRAME_RATE: f32 = 30.0;
/// Number of frames processed between cooperative yields.
pub const DEFAULT_YIELD_INTERVAL: usize = 50;

/// Per-frame magnitude spectra together with their frequency and time axes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Spectrogram {
    magnitudes: Vec<Vec<f32>>,
    frequencies: Vec<f32>,
    times: Vec<f32>,
    sample_rate: u32,
    window_len: usize,
    fft_size: usize,
}

impl Spectrogram {
    /// Magnitude vectors, one per analysed frame. Each has `fft_size / 2` bins.
    pub fn frames(&self) -> &[Vec<f32>] {
        &self.magnitudes
    }

    /// Bin centre frequencies in Hz.
    pub fn frequencies(&self) -> &[f32] {
        &self.frequencies
    }

    /// Frame start times in seconds.
    pub fn times(&self) -> &[f32] {
        &self.times
    }

    pub fn len(&self) -> usize {
        self.magnitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnitudes.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Index of the bin whose centre frequency lies nearest to `hz`.
    pub fn nearest_bin(&self, hz: f32) -> usize {
        if self.frequencies.is_empty() || self.fft_size == 0 {
            return 0;
        }
        let bin = (hz * self.fft_size as f32 / self.sample_rate as f32).round();
        (bin.max(0.0) as usize).min(self.frequencies.len() - 1)
    }

    /// Sum of squared magnitudes of one frame.
    pub fn frame_energy(&self, index: usize) -> f32 {
        self.magnitudes
            .get(index)
            .map(|frame| frame.iter().map(|m| m * m).sum())
            .unwrap_or(0.0)
    }
}

/// Geometry shared by every frame of one computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameLayout {
    window_len: usize,
    fft_size: usize,
    frame_count: usize,
}

/// Frames PCM audio, applies a Hann window and runs a real-input FFT per
/// frame. The FFT plan is cached while the frame size stays the same.
pub struct SpectrogramEngine {
    target_frame_rate: f32,
    yield_interval: usize,
    fft: Option<FftResources>,
}

impl SpectrogramEngine {
    /// Creates an engine targeting the default 30 fps animation rate.
    pub fn new() -> Self {
        Self::with_frame_rate(DEFAULT_TARGET_FRAME_RATE)
    }

    pub fn with_frame_rate(target_frame_rate: f32) -> Self {
        Self {
            target_frame_rate,
            yield_interval: DEFAULT_YIELD_INTERVAL,
            fft: None,
        }
    }

    /// Overrides how many frames run between voluntary yields in
    /// [`SpectrogramEngine::compute_async`].
    pub fn with_yield_interval(mut self, frames: usize) -> Self {
        self.yield_interval = frames.max(1);
        self
    }

    pub fn target_frame_rate(&self) -> f32 {
        self.target_frame_rate
    }

    /// Window length in samples for the given sample rate.
    pub fn window_len(&self, sample_rate: u32) -> Result<usize> {
        if !self.target_frame_rate.is_finite() || self.target_frame_rate <= 0.0 {
            return Err(LipSyncError::invalid(format!(
                "target frame rate must be a positive finite number, got {}",
                self.target_frame_rate
            )));
        }

        let window_len = (sample_rate as f32 / self.target_frame_rate).floor() as usize;
        if window_len < 2 {
            return Err(LipSyncError::invalid(format!(
                "sample rate {sample_rate} is too low for {} frames per second",
                self.target_frame_rate
            )));
        }
        Ok(window_len)
    }

    /// Computes the whole spectrogram without yielding.
    pub fn compute(&mut self, pcm: &PcmBuffer) -> Result<Spectrogram> {
        let layout = self.layout(pcm)?;
        let mut magnitudes = Vec::with_capacity(layout.frame_count);
        for frame in pcm.frames(layout.window_len) {
            magnitudes.push(self.transform_frame(&frame, layout)?);
        }
        Ok(self.assemble(pcm, layout, magnitudes))
    }

    /// Computes the spectrogram, yielding to the runtime every
    /// `yield_interval` frames. The token is checked at every yield point.
    pub async fn compute_async(
        &mut self,
        pcm: &PcmBuffer,
        cancel: &CancellationToken,
    ) -> Result<Spectrogram> {
        let layout = self.layout(pcm)?;
        let mut magnitudes = Vec::with_capacity(layout.frame_count);
        for frame in pcm.frames(layout.window_len) {
            if frame.index > 0 && frame.index % self.yield_interval == 0 {
                tokio::task::yield_now().await;
                if cancel.is_cancelled() {
                    tracing::debug!(frame = frame.index, "spectrogram computation cancelled");
                    return Err(LipSyncError::Cancelled);
                }
            }
            magnitudes.push(self.transform_frame(&frame, layout)?);
        }
        Ok(self.assemble(pcm, layout, magnitudes))
    }

    fn layout(&self, pcm: &PcmBuffer) -> Result<FrameLayout> {
        if pcm.is_empty() {
            return Err(LipSyncError::invalid("spectrogram requires at least one sample"));
        }

        let window_len = self.window_len(pcm.sample_rate())?;
        let fft_size = window_len.next_power_of_two();
        let frame_count = pcm.len() / window_len;
        if frame_count == 0 {
            tracing::warn!(
                samples = pcm.len(),
                window_len,
                "audio is shorter than one analysis window"
            );
        }

        Ok(FrameLayout {
            window_len,
            fft_size,
            frame_count,
        })
    }

    fn transform_frame(&mut self, frame: &AudioFrame<'_>, layout: FrameLayout) -> Result<Vec<f32>> {
        let fft = self.prepare_fft(layout.fft_size);

        fft.input.iter_mut().for_each(|value| *value = 0.0);
        for (index, value) in frame.samples.iter().enumerate() {
            fft.input[index] = *value * hann_value(index, layout.window_len);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        // Bins above N/2 mirror the lower half for real input.
        Ok(fft.spectrum[..layout.fft_size / 2]
            .iter()
            .map(|bin| bin.norm())
            .collect())
    }

    fn assemble(&self, pcm: &PcmBuffer, layout: FrameLayout, magnitudes: Vec<Vec<f32>>) -> Spectrogram {
        let sample_rate = pcm.sample_rate();
        let frequencies = (0..layout.fft_size / 2)
            .map(|bin| bin as f32 * sample_rate as f32 / layout.fft_size as f32)
            .collect();
        let times = (0..magnitudes.len())
            .map(|frame| (frame * layout.window_len) as f32 / sample_rate as f32)
            .collect();

        tracing::debug!(
            frames = magnitudes.len(),
            fft_size = layout.fft_size,
            window_len = layout.window_len,
            "computed spectrogram"
        );

        Spectrogram {
            magnitudes,
            frequencies,
            times,
            sample_rate,
            window_len: layout.window_len,
            fft_size: layout.fft_size,
        }
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        if self.fft.as_ref().map(|fft| fft.size != size).unwrap_or(false) {
            self.fft = None;
        }

        // The planner is not Send, so only the plan outlives this call.
        self.fft.get_or_insert_with(|| {
            let plan = RealFftPlanner::<f32>::new().plan_fft_forward(size);
            FftResources {
                size,
                scratch: plan.make_scratch_vec(),
                spectrum: plan.make_output_vec(),
                input: plan.make_input_vec(),
                plan,
            }
        })
    }
}

impl Default for SpectrogramEngine {
    fn default() -> Self {
        Self::new()
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for SpectrogramEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrogramEngine")
            .field("target_frame_rate", &self.target_frame_rate)
            .field("yield_interval", &self.yield_interval)
            .field("fft", &self.fft)
            .finish()
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
pub(crate) fn sine(freq_hz: f32, sample_rate: u32, seconds: f32, amplitude: f32) -> PcmBuffer {
    let len = (sample_rate as f32 * seconds) as usize;
    let samples = (0..len)
        .map(|i| amplitude * (2.0 * PI * freq_hz * i as f32 / sample_rate as f32).sin())
        .collect();
    PcmBuffer::new(samples, sample_rate).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_count_follows_window_length() {
        let mut engine = SpectrogramEngine::new();
        let pcm = PcmBuffer::new(vec![0.1; 24_000 + 799], 24_000).unwrap();
        let spectrogram = engine.compute(&pcm).unwrap();

        assert_eq!(spectrogram.window_len(), 800);
        assert_eq!(spectrogram.fft_size(), 1024);
        assert_eq!(spectrogram.len(), (24_000 + 799) / 800);
        assert!(spectrogram
            .frames()
            .iter()
            .all(|frame| frame.len() == spectrogram.frequencies().len()));
        assert!(spectrogram
            .frames()
            .iter()
            .flatten()
            .all(|m| m.is_finite() && *m >= 0.0));
    }

    #[test]
    fn axes_map_bins_and_frames() {
        let mut engine = SpectrogramEngine::new();
        let pcm = PcmBuffer::new(vec![0.0; 4_800], 24_000).unwrap();
        let spectrogram = engine.compute(&pcm).unwrap();

        assert_eq!(spectrogram.frequencies().len(), 512);
        assert!((spectrogram.frequencies()[1] - 24_000.0 / 1024.0).abs() < 1e-3);
        assert!((spectrogram.times()[3] - 0.1).abs() < 1e-6);
        assert_eq!(spectrogram.nearest_bin(1_000.0), 43);
        assert_eq!(spectrogram.nearest_bin(1.0e9), 511);
    }

    #[test]
    fn pure_tone_peaks_at_its_bin() {
        let mut engine = SpectrogramEngine::new();
        let pcm = sine(1_000.0, 24_000, 0.5, 0.8);
        let spectrogram = engine.compute(&pcm).unwrap();
        let frame = &spectrogram.frames()[5];

        let (peak, _) = frame
            .iter()
            .enumerate()
            .fold((0, 0.0_f32), |best, (i, m)| if *m > best.1 { (i, *m) } else { best });
        assert!((spectrogram.frequencies()[peak] - 1_000.0).abs() < 30.0);
    }

    #[test]
    fn rejects_bad_frame_rates() {
        let pcm = PcmBuffer::new(vec![0.0; 100], 24_000).unwrap();

        for rate in [0.0, -1.0, f32::NAN, f32::INFINITY] {
            let mut engine = SpectrogramEngine::with_frame_rate(rate);
            assert!(matches!(
                engine.compute(&pcm),
                Err(LipSyncError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn short_audio_yields_no_frames() {
        let mut engine = SpectrogramEngine::new();
        let pcm = PcmBuffer::new(vec![0.3; 100], 24_000).unwrap();
        let spectrogram = engine.compute(&pcm).unwrap();

        assert!(spectrogram.is_empty());
        assert_eq!(spectrogram.frequencies().len(), 512);
    }

    #[tokio::test]
    async fn async_matches_sync_computation() {
        let pcm = sine(440.0, 16_000, 4.0, 0.5);
        let sync = SpectrogramEngine::new().compute(&pcm).unwrap();
        let asynchronous = SpectrogramEngine::new()
            .with_yield_interval(7)
            .compute_async(&pcm, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sync, asynchronous);
    }

    #[tokio::test]
    async fn cancellation_stops_at_a_yield_point() {
        let pcm = sine(440.0, 16_000, 4.0, 0.5);
        let token = CancellationToken::new();
        token.cancel();

        let result = SpectrogramEngine::new()
            .with_yield_interval(10)
            .compute_async(&pcm, &token)
            .await;
        assert!(matches!(result, Err(LipSyncError::Cancelled)));
    }
}
