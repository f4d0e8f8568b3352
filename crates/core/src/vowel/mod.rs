//! Mouth-shape estimation from spectral energy.
//!
//! Each spectrogram frame is reduced to four band averages, one per vowel
//! shape, which are normalised, smoothed over time, re-weighted and finally
//! gated by the frame's overall energy so silence closes the mouth.

use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

use crate::Spectrogram;

/// Default symmetric moving-average width in frames.
pub const DEFAULT_SMOOTHING_WINDOW: usize = 20;
/// Default exponential smoothing factor.
pub const DEFAULT_SMOOTHING_ALPHA: f32 = 0.2;

/// Previous values above this level are protected against sudden drops.
const DROP_GUARD_FLOOR: f32 = 0.2;
/// A raw value below this fraction of the previous one counts as a snap.
const DROP_GUARD_RATIO: f32 = 0.5;
/// A guarded drop decays to this fraction of the previous value.
const DROP_GUARD_DECAY: f32 = 0.7;

/// The four mouth shapes driven by the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Vowel {
    A,
    I,
    U,
    O,
}

impl Vowel {
    pub const ALL: [Vowel; 4] = [Vowel::A, Vowel::I, Vowel::U, Vowel::O];

    /// Morph name written into motion files.
    pub fn label(self) -> &'static str {
        match self {
            Vowel::A => "あ",
            Vowel::I => "い",
            Vowel::U => "う",
            Vowel::O => "お",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|vowel| vowel.label() == label)
    }
}

/// One value per vowel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerVowel<T> {
    pub a: T,
    pub i: T,
    pub u: T,
    pub o: T,
}

impl<T: Copy> PerVowel<T> {
    pub fn splat(value: T) -> Self {
        Self {
            a: value,
            i: value,
            u: value,
            o: value,
        }
    }

    pub fn from_fn(mut f: impl FnMut(Vowel) -> T) -> Self {
        Self {
            a: f(Vowel::A),
            i: f(Vowel::I),
            u: f(Vowel::U),
            o: f(Vowel::O),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Vowel, T)> + '_ {
        Vowel::ALL.into_iter().map(move |vowel| (vowel, self[vowel]))
    }
}

impl<T> Index<Vowel> for PerVowel<T> {
    type Output = T;

    fn index(&self, vowel: Vowel) -> &T {
        match vowel {
            Vowel::A => &self.a,
            Vowel::I => &self.i,
            Vowel::U => &self.u,
            Vowel::O => &self.o,
        }
    }
}

impl<T> IndexMut<Vowel> for PerVowel<T> {
    fn index_mut(&mut self, vowel: Vowel) -> &mut T {
        match vowel {
            Vowel::A => &mut self.a,
            Vowel::I => &mut self.i,
            Vowel::U => &mut self.u,
            Vowel::O => &mut self.o,
        }
    }
}

/// Frequency range in Hz, inclusive at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyBand {
    pub low_hz: f32,
    pub high_hz: f32,
}

impl FrequencyBand {
    pub const fn new(low_hz: f32, high_hz: f32) -> Self {
        Self { low_hz, high_hz }
    }
}

pub type VowelRanges = PerVowel<FrequencyBand>;
pub type VowelMultipliers = PerVowel<f32>;

impl Default for PerVowel<f32> {
    fn default() -> Self {
        Self::splat(0.0)
    }
}

impl Default for PerVowel<FrequencyBand> {
    fn default() -> Self {
        Self {
            a: FrequencyBand::new(800.0, 1200.0),
            i: FrequencyBand::new(2300.0, 2700.0),
            u: FrequencyBand::new(300.0, 700.0),
            o: FrequencyBand::new(500.0, 900.0),
        }
    }
}

/// Default emphasis applied after smoothing.
pub fn default_multipliers() -> VowelMultipliers {
    PerVowel {
        a: 2.7,
        i: 1.0,
        u: 2.5,
        o: 2.7,
    }
}

/// Vowel weights for one analysis frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VowelWeightFrame {
    pub weights: PerVowel<f32>,
}

impl VowelWeightFrame {
    pub fn new(weights: PerVowel<f32>) -> Self {
        Self { weights }
    }

    pub fn weight(&self, vowel: Vowel) -> f32 {
        self.weights[vowel]
    }

    pub fn sum(&self) -> f32 {
        self.weights.iter().map(|(_, w)| w).sum()
    }

    /// Vowel carrying the largest weight, if any weight is non-zero.
    pub fn dominant(&self) -> Option<Vowel> {
        self.weights
            .iter()
            .filter(|(_, w)| *w > 0.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(vowel, _)| vowel)
    }

    /// Scales the weights to sum to one, or leaves them at zero when the
    /// total is not positive.
    pub fn normalized(self) -> Self {
        let total = self.sum();
        if total > 0.0 && total.is_finite() {
            Self::new(PerVowel::from_fn(|v| self.weights[v] / total))
        } else {
            Self::default()
        }
    }
}

/// Converts spectra into smoothed, energy-gated vowel weights.
#[derive(Debug, Clone)]
pub struct VowelWeightAnalyzer {
    ranges: VowelRanges,
    multipliers: VowelMultipliers,
    smoothing_window: usize,
    alpha: f32,
}

impl Default for VowelWeightAnalyzer {
    fn default() -> Self {
        Self {
            ranges: VowelRanges::default(),
            multipliers: default_multipliers(),
            smoothing_window: DEFAULT_SMOOTHING_WINDOW,
            alpha: DEFAULT_SMOOTHING_ALPHA,
        }
    }
}

impl VowelWeightAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ranges(mut self, ranges: VowelRanges) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn with_multipliers(mut self, multipliers: VowelMultipliers) -> Self {
        self.multipliers = multipliers;
        self
    }

    pub fn with_smoothing(mut self, window: usize, alpha: f32) -> Self {
        self.smoothing_window = window;
        self.alpha = alpha.clamp(0.0, 1.0);
        self
    }

    pub fn ranges(&self) -> &VowelRanges {
        &self.ranges
    }

    /// Runs every stage: band analysis, smoothing, emphasis and energy gating.
    pub fn process(&self, spectrogram: &Spectrogram) -> Vec<VowelWeightFrame> {
        let raw = self.analyze(spectrogram);
        let smoothed = self.smooth(&raw, self.smoothing_window);
        let emphasized = self.emphasize(&smoothed);
        let gated = gate_by_energy(&emphasized, spectrogram);

        tracing::debug!(frames = gated.len(), "computed vowel weights");
        gated
    }

    /// Band-averaged magnitudes per frame, normalised to sum to one.
    pub fn analyze(&self, spectrogram: &Spectrogram) -> Vec<VowelWeightFrame> {
        let bins = PerVowel::from_fn(|vowel| {
            let band = self.ranges[vowel];
            let start = spectrogram.nearest_bin(band.low_hz.min(band.high_hz));
            let end = spectrogram.nearest_bin(band.low_hz.max(band.high_hz));
            (start, end)
        });

        spectrogram
            .frames()
            .iter()
            .map(|magnitudes| {
                let averages = PerVowel::from_fn(|vowel| {
                    let (start, end) = bins[vowel];
                    band_average(magnitudes, start, end)
                });
                VowelWeightFrame::new(averages).normalized()
            })
            .collect()
    }

    /// Symmetric moving average over `window_size` frames followed by
    /// guarded exponential smoothing.
    pub fn smooth(&self, frames: &[VowelWeightFrame], window_size: usize) -> Vec<VowelWeightFrame> {
        let averaged = moving_average(frames, window_size);
        exponential_smoothing(&averaged, self.alpha)
    }

    /// Applies the per-vowel multipliers and re-normalises each frame.
    pub fn emphasize(&self, frames: &[VowelWeightFrame]) -> Vec<VowelWeightFrame> {
        frames
            .iter()
            .map(|frame| {
                VowelWeightFrame::new(PerVowel::from_fn(|v| {
                    frame.weights[v] * self.multipliers[v].max(0.0)
                }))
                .normalized()
            })
            .collect()
    }
}

/// Scales each frame by `sqrt(energy / max_energy)`, clamped to one.
pub fn gate_by_energy(frames: &[VowelWeightFrame], spectrogram: &Spectrogram) -> Vec<VowelWeightFrame> {
    let energies: Vec<f32> = (0..frames.len())
        .map(|index| spectrogram.frame_energy(index))
        .collect();
    let max_energy = energies.iter().copied().fold(0.0_f32, f32::max);

    frames
        .iter()
        .zip(&energies)
        .map(|(frame, energy)| {
            let gain = if max_energy > 0.0 {
                (energy / max_energy).sqrt().min(1.0)
            } else {
                0.0
            };
            VowelWeightFrame::new(PerVowel::from_fn(|v| frame.weights[v] * gain))
        })
        .collect()
}

fn band_average(magnitudes: &[f32], start: usize, end: usize) -> f32 {
    if magnitudes.is_empty() {
        return 0.0;
    }
    let end = end.min(magnitudes.len() - 1);
    let start = start.min(end);
    let slice = &magnitudes[start..=end];
    slice.iter().sum::<f32>() / slice.len() as f32
}

fn moving_average(frames: &[VowelWeightFrame], window_size: usize) -> Vec<VowelWeightFrame> {
    if window_size <= 1 || frames.is_empty() {
        return frames.to_vec();
    }

    let before = window_size / 2;
    let after = (window_size - 1) / 2;
    let last = frames.len() - 1;

    (0..frames.len())
        .map(|index| {
            let window = &frames[index.saturating_sub(before)..=(index + after).min(last)];
            let count = window.len() as f32;
            VowelWeightFrame::new(PerVowel::from_fn(|v| {
                window.iter().map(|frame| frame.weights[v]).sum::<f32>() / count
            }))
        })
        .collect()
}

fn exponential_smoothing(frames: &[VowelWeightFrame], alpha: f32) -> Vec<VowelWeightFrame> {
    let mut out: Vec<VowelWeightFrame> = Vec::with_capacity(frames.len());
    for frame in frames {
        let next = match out.last() {
            None => *frame,
            Some(previous) => VowelWeightFrame::new(PerVowel::from_fn(|v| {
                let prev = previous.weights[v];
                let raw = frame.weights[v];
                if prev > DROP_GUARD_FLOOR && raw < prev * DROP_GUARD_RATIO {
                    prev * DROP_GUARD_DECAY
                } else {
                    alpha * raw + (1.0 - alpha) * prev
                }
            })),
        };
        out.push(next);
    }
    out
}
