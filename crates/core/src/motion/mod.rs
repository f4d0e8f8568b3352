//! Motion keyframe documents and their construction from vowel weights.

pub mod charset;
pub mod codec;

use std::collections::BTreeMap;

use crate::{Vowel, VowelWeightFrame};

pub use codec::{BinaryMotionCodec, DecodeOptions};

/// Frame rate of the motion timeline.
pub const MOTION_FRAME_RATE: f32 = 30.0;
/// Minimum rise from a silent neighbour that marks a new onset.
const ONSET_RISE: f32 = 0.0099;
/// Weights at or below this level count as silent for onset detection.
const NEAR_ZERO: f32 = 0.001;
/// Frames at either end of a track that are always kept.
const PINNED_EDGE_FRAMES: usize = 2;

pub const BONE_RECORD_LEN: usize = 111;
pub const MORPH_RECORD_LEN: usize = 23;
pub const CAMERA_RECORD_LEN: usize = 61;
pub const LIGHT_RECORD_LEN: usize = 28;
pub const SHADOW_RECORD_LEN: usize = 9;

/// Fixed-size record carried through the codec without interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord<const N: usize>(pub [u8; N]);

impl<const N: usize> RawRecord<N> {
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    fn u32_at(&self, offset: usize) -> u32 {
        let mut word = [0_u8; 4];
        word.copy_from_slice(&self.0[offset..offset + 4]);
        u32::from_le_bytes(word)
    }
}

impl<const N: usize> From<[u8; N]> for RawRecord<N> {
    fn from(bytes: [u8; N]) -> Self {
        Self(bytes)
    }
}

pub type BoneRecord = RawRecord<BONE_RECORD_LEN>;
pub type CameraRecord = RawRecord<CAMERA_RECORD_LEN>;
pub type LightRecord = RawRecord<LIGHT_RECORD_LEN>;
pub type ShadowRecord = RawRecord<SHADOW_RECORD_LEN>;

impl RawRecord<BONE_RECORD_LEN> {
    pub fn name(&self) -> String {
        charset::decode_name(&self.0[..15])
    }

    pub fn frame(&self) -> u32 {
        self.u32_at(15)
    }
}

impl RawRecord<CAMERA_RECORD_LEN> {
    pub fn frame(&self) -> u32 {
        self.u32_at(0)
    }
}

impl RawRecord<LIGHT_RECORD_LEN> {
    pub fn frame(&self) -> u32 {
        self.u32_at(0)
    }
}

impl RawRecord<SHADOW_RECORD_LEN> {
    pub fn frame(&self) -> u32 {
        self.u32_at(0)
    }
}

/// Blend weight of one morph at one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MorphKeyframe {
    pub name: String,
    pub frame: u32,
    pub weight: f32,
}

impl MorphKeyframe {
    pub fn new(name: impl Into<String>, frame: u32, weight: f32) -> Self {
        Self {
            name: name.into(),
            frame,
            weight,
        }
    }
}

/// In-memory form of a motion file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MotionDocument {
    pub model_name: String,
    pub bones: Vec<BoneRecord>,
    pub morphs: Vec<MorphKeyframe>,
    pub cameras: Vec<CameraRecord>,
    pub lights: Vec<LightRecord>,
    pub shadows: Vec<ShadowRecord>,
    /// Sections after the shadow section, kept verbatim.
    pub trailing: Vec<u8>,
}

impl MotionDocument {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Default::default()
        }
    }

    /// Keyframes of a single morph, in document order.
    pub fn morph_track<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MorphKeyframe> + 'a {
        self.morphs.iter().filter(move |keyframe| keyframe.name == name)
    }

    /// Number of frames spanned by the morph section.
    pub fn duration_frames(&self) -> u32 {
        self.morphs
            .iter()
            .map(|keyframe| keyframe.frame.saturating_add(1))
            .max()
            .unwrap_or(0)
    }
}

/// Turns vowel weights into morph keyframes.
#[derive(Debug, Clone)]
pub struct MotionKeyframeEncoder {
    source_frame_rate: f32,
}

impl Default for MotionKeyframeEncoder {
    fn default() -> Self {
        Self {
            source_frame_rate: MOTION_FRAME_RATE,
        }
    }
}

impl MotionKeyframeEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the frame rate of the incoming weight frames. Frames are mapped
    /// onto the 30 fps motion timeline.
    pub fn with_source_frame_rate(frame_rate: f32) -> Self {
        let source_frame_rate = if frame_rate.is_finite() && frame_rate > 0.0 {
            frame_rate
        } else {
            MOTION_FRAME_RATE
        };
        Self { source_frame_rate }
    }

    /// Emits one keyframe per vowel per motion frame. When several weight
    /// frames land on the same motion frame, the last one wins.
    pub fn encode(&self, frames: &[VowelWeightFrame], model_name: &str) -> MotionDocument {
        let scale = MOTION_FRAME_RATE / self.source_frame_rate;
        let mut document = MotionDocument::new(model_name);
        document.morphs.reserve(frames.len() * Vowel::ALL.len());

        let mut last_frame = None;
        for (index, weights) in frames.iter().enumerate() {
            let frame = (index as f32 * scale).round() as u32;
            if last_frame == Some(frame) {
                let start = document.morphs.len() - Vowel::ALL.len();
                for (keyframe, vowel) in document.morphs[start..].iter_mut().zip(Vowel::ALL) {
                    keyframe.weight = clamp_weight(weights.weight(vowel));
                }
                continue;
            }
            for vowel in Vowel::ALL {
                document
                    .morphs
                    .push(MorphKeyframe::new(vowel.label(), frame, clamp_weight(weights.weight(vowel))));
            }
            last_frame = Some(frame);
        }

        tracing::debug!(
            frames = frames.len(),
            keyframes = document.morphs.len(),
            "encoded morph keyframes"
        );
        document
    }

    /// Drops keyframes that do not shape the curve and sorts the morph
    /// section by frame.
    pub fn optimize(&self, mut document: MotionDocument) -> MotionDocument {
        let before = document.morphs.len();

        let mut tracks: BTreeMap<String, Vec<MorphKeyframe>> = BTreeMap::new();
        for keyframe in document.morphs.drain(..) {
            tracks.entry(keyframe.name.clone()).or_default().push(keyframe);
        }

        let mut kept = Vec::with_capacity(before);
        for (_, mut track) in tracks {
            track.sort_by_key(|keyframe| keyframe.frame);
            let weights: Vec<f32> = track.iter().map(|keyframe| keyframe.weight).collect();
            kept.extend(
                track
                    .into_iter()
                    .enumerate()
                    .filter(|(index, _)| is_keyframe(&weights, *index))
                    .map(|(_, keyframe)| keyframe),
            );
        }
        kept.sort_by_key(|keyframe| keyframe.frame);
        document.morphs = kept;

        tracing::debug!(before, after = document.morphs.len(), "optimized morph keyframes");
        document
    }
}

fn clamp_weight(weight: f32) -> f32 {
    if weight.is_finite() {
        weight.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn is_keyframe(weights: &[f32], index: usize) -> bool {
    if index < PINNED_EDGE_FRAMES || index + PINNED_EDGE_FRAMES >= weights.len() {
        return true;
    }

    let previous = weights[index - 1];
    let current = weights[index];
    let next = weights[index + 1];

    // Both edges of a flat peak or valley count.
    let peak = (current >= previous && current > next) || (current > previous && current >= next);
    let valley = (current <= previous && current < next) || (current < previous && current <= next);
    let extremum = peak || valley;
    let at_bound = |w: f32| w <= 0.0 || w >= 1.0;
    let touches_bound = at_bound(current) != at_bound(previous) || at_bound(current) != at_bound(next);
    let onset = (previous <= NEAR_ZERO && current - previous > ONSET_RISE)
        || (next <= NEAR_ZERO && current - next > ONSET_RISE);

    extremum || touches_bound || onset
}
