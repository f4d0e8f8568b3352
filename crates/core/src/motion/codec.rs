//! Binary layout of motion files.
//!
//! ```text
//! magic (30) | model name (20) | bone count u32 | bone records (111 each)
//! | morph count u32 | morph records (23 each) | camera count u32 | camera records (61 each)
//! | light count u32 | light records (28 each) | [shadow count u32 | shadow records (9 each)]
//! ```
//!
//! All integers and floats are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    charset, MorphKeyframe, MotionDocument, RawRecord, BONE_RECORD_LEN, CAMERA_RECORD_LEN,
    LIGHT_RECORD_LEN, MORPH_RECORD_LEN, SHADOW_RECORD_LEN,
};
use crate::{LipSyncError, Result};

pub const MAGIC: &[u8] = b"Vocaloid Motion Data 0002";
pub const MAGIC_LEN: usize = 30;
pub const MODEL_NAME_LEN: usize = 20;
pub const MORPH_NAME_LEN: usize = 15;
pub const HEADER_LEN: usize = MAGIC_LEN + MODEL_NAME_LEN;

/// Options controlling how strictly buffers are validated on read.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Fail with [`LipSyncError::UnsupportedFormat`] when the magic header
    /// is not recognised. When false the buffer is parsed best-effort.
    pub strict_magic: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self { strict_magic: true }
    }
}

/// Reads and writes [`MotionDocument`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryMotionCodec;

impl BinaryMotionCodec {
    pub fn serialize(document: &MotionDocument) -> Bytes {
        let len = HEADER_LEN
            + 4 * 5
            + document.bones.len() * BONE_RECORD_LEN
            + document.morphs.len() * MORPH_RECORD_LEN
            + document.cameras.len() * CAMERA_RECORD_LEN
            + document.lights.len() * LIGHT_RECORD_LEN
            + document.shadows.len() * SHADOW_RECORD_LEN
            + document.trailing.len();
        let mut out = BytesMut::with_capacity(len);

        let mut magic = [0_u8; MAGIC_LEN];
        magic[..MAGIC.len()].copy_from_slice(MAGIC);
        out.put_slice(&magic);
        out.put_slice(&charset::encode_name(&document.model_name, MODEL_NAME_LEN));

        put_records(&mut out, &document.bones);

        out.put_u32_le(document.morphs.len() as u32);
        for keyframe in &document.morphs {
            out.put_slice(&charset::encode_name(&keyframe.name, MORPH_NAME_LEN));
            out.put_u32_le(keyframe.frame);
            out.put_f32_le(keyframe.weight);
        }

        put_records(&mut out, &document.cameras);
        put_records(&mut out, &document.lights);
        put_records(&mut out, &document.shadows);
        out.put_slice(&document.trailing);

        out.freeze()
    }

    pub fn deserialize(buffer: &[u8]) -> Result<MotionDocument> {
        Self::deserialize_with(buffer, DecodeOptions::default())
    }

    pub fn deserialize_with(buffer: &[u8], options: DecodeOptions) -> Result<MotionDocument> {
        let mut cursor = buffer;
        ensure(&cursor, HEADER_LEN)?;

        let magic = &cursor[..MAGIC_LEN];
        if !magic.starts_with(MAGIC) {
            let found = String::from_utf8_lossy(magic).trim_end_matches('\0').to_string();
            if options.strict_magic {
                return Err(LipSyncError::UnsupportedFormat(format!(
                    "unrecognised motion header `{found}`"
                )));
            }
            tracing::warn!(header = %found, "parsing motion data with unknown header");
        }
        cursor.advance(MAGIC_LEN);

        let model_name = charset::decode_name(&cursor[..MODEL_NAME_LEN]);
        cursor.advance(MODEL_NAME_LEN);

        let bones = take_records(&mut cursor)?;

        let morph_count = take_count(&mut cursor, MORPH_RECORD_LEN)?;
        let mut morphs = Vec::with_capacity(morph_count);
        for _ in 0..morph_count {
            let name = charset::decode_name(&cursor[..MORPH_NAME_LEN]);
            cursor.advance(MORPH_NAME_LEN);
            let frame = cursor.get_u32_le();
            let weight = cursor.get_f32_le();
            morphs.push(MorphKeyframe { name, frame, weight });
        }

        let cameras = take_records(&mut cursor)?;
        let lights = take_records(&mut cursor)?;
        let shadows = if cursor.has_remaining() {
            take_records(&mut cursor)?
        } else {
            Vec::new()
        };

        Ok(MotionDocument {
            model_name,
            bones,
            morphs,
            cameras,
            lights,
            shadows,
            trailing: cursor.to_vec(),
        })
    }
}

fn ensure(cursor: &&[u8], needed: usize) -> Result<()> {
    if cursor.remaining() < needed {
        return Err(LipSyncError::TruncatedData {
            needed,
            available: cursor.remaining(),
        });
    }
    Ok(())
}

/// Reads a section count and checks the section body is present.
fn take_count(cursor: &mut &[u8], record_len: usize) -> Result<usize> {
    ensure(cursor, 4)?;
    let count = cursor.get_u32_le() as usize;
    let needed = count.checked_mul(record_len).unwrap_or(usize::MAX);
    ensure(cursor, needed)?;
    Ok(count)
}

fn take_records<const N: usize>(cursor: &mut &[u8]) -> Result<Vec<RawRecord<N>>> {
    let count = take_count(cursor, N)?;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let mut record = [0_u8; N];
        cursor.copy_to_slice(&mut record);
        records.push(RawRecord(record));
    }
    Ok(records)
}

fn put_records<const N: usize>(out: &mut BytesMut, records: &[RawRecord<N>]) {
    out.put_u32_le(records.len() as u32);
    for record in records {
        out.put_slice(&record.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::{BoneRecord, CameraRecord, LightRecord, ShadowRecord};

    fn sample_document() -> MotionDocument {
        let mut document = MotionDocument::new("lipsync");
        document.morphs = vec![
            MorphKeyframe::new("あ", 0, 0.0),
            MorphKeyframe::new("い", 0, 0.25),
            MorphKeyframe::new("う", 12, 1.0),
            MorphKeyframe::new("お", 4_000, 0.123_456),
        ];
        document
    }

    #[test]
    fn empty_document_has_fixed_size() {
        let bytes = BinaryMotionCodec::serialize(&MotionDocument::new("m"));

        assert_eq!(bytes.len(), HEADER_LEN + 20);
        assert_eq!(&bytes[..MAGIC.len()], MAGIC);
        assert!(bytes[MAGIC.len()..MAGIC_LEN].iter().all(|b| *b == 0));
        assert_eq!(bytes[MAGIC_LEN], b'm');
        assert!(bytes[HEADER_LEN..].iter().all(|b| *b == 0));
    }

    #[test]
    fn morph_records_follow_the_fixed_layout() {
        let mut document = MotionDocument::new("m");
        document.morphs.push(MorphKeyframe::new("あ", 7, 0.5));
        let bytes = BinaryMotionCodec::serialize(&document);

        let morph_count_at = HEADER_LEN + 4;
        assert_eq!(&bytes[morph_count_at..morph_count_at + 4], &1_u32.to_le_bytes());
        let record = &bytes[morph_count_at + 4..morph_count_at + 4 + MORPH_RECORD_LEN];
        assert_eq!(&record[..2], &[0x82, 0xA0]);
        assert!(record[2..15].iter().all(|b| *b == 0));
        assert_eq!(&record[15..19], &7_u32.to_le_bytes());
        assert_eq!(&record[19..23], &0.5_f32.to_le_bytes());
    }

    #[test]
    fn round_trips_generated_documents() {
        let document = sample_document();
        let decoded = BinaryMotionCodec::deserialize(&BinaryMotionCodec::serialize(&document)).unwrap();

        assert_eq!(decoded, document);
    }

    #[test]
    fn preserves_opaque_sections_byte_for_byte() {
        let mut document = sample_document();
        let mut bone = [0xAB_u8; BONE_RECORD_LEN];
        bone[..15].copy_from_slice(&charset::encode_name("center", 15));
        bone[15..19].copy_from_slice(&9_u32.to_le_bytes());
        document.bones.push(BoneRecord::from(bone));
        document.cameras.push(CameraRecord::from([1; CAMERA_RECORD_LEN]));
        document.lights.push(LightRecord::from([2; LIGHT_RECORD_LEN]));
        document.shadows.push(ShadowRecord::from([3; SHADOW_RECORD_LEN]));
        document.trailing = vec![0, 0, 0, 0];

        let bytes = BinaryMotionCodec::serialize(&document);
        let decoded = BinaryMotionCodec::deserialize(&bytes).unwrap();

        assert_eq!(decoded, document);
        assert_eq!(decoded.bones[0].name(), "center");
        assert_eq!(decoded.bones[0].frame(), 9);
        assert_eq!(BinaryMotionCodec::serialize(&decoded), bytes);
    }

    #[test]
    fn missing_shadow_section_reads_as_empty() {
        let bytes = BinaryMotionCodec::serialize(&sample_document());
        let without_shadow = &bytes[..bytes.len() - 4];

        let decoded = BinaryMotionCodec::deserialize(without_shadow).unwrap();
        assert!(decoded.shadows.is_empty());
        assert_eq!(decoded.morphs.len(), 4);
    }

    #[test]
    fn truncated_sections_are_reported() {
        let bytes = BinaryMotionCodec::serialize(&sample_document());

        for cut in [10, HEADER_LEN + 2, HEADER_LEN + 8 + MORPH_RECORD_LEN] {
            let err = BinaryMotionCodec::deserialize(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, LipSyncError::TruncatedData { .. }), "cut at {cut}: {err}");
        }
    }

    #[test]
    fn oversized_counts_do_not_overflow() {
        let mut bytes = BinaryMotionCodec::serialize(&MotionDocument::new("m")).to_vec();
        bytes[HEADER_LEN..HEADER_LEN + 4].copy_from_slice(&u32::MAX.to_le_bytes());

        assert!(matches!(
            BinaryMotionCodec::deserialize(&bytes),
            Err(LipSyncError::TruncatedData { .. })
        ));
    }

    #[test]
    fn unknown_magic_is_rejected_unless_lenient() {
        let mut bytes = BinaryMotionCodec::serialize(&sample_document()).to_vec();
        bytes[..8].copy_from_slice(b"NotAVmd!");

        assert!(matches!(
            BinaryMotionCodec::deserialize(&bytes),
            Err(LipSyncError::UnsupportedFormat(_))
        ));

        let lenient = BinaryMotionCodec::deserialize_with(&bytes, DecodeOptions { strict_magic: false }).unwrap();
        assert_eq!(lenient.morphs, sample_document().morphs);
    }
}
