//! Name encoding for the fixed-width text fields of motion files.
//!
//! Motion files store names in a legacy double-byte Japanese code page. Only
//! printable ASCII and the five kana vowels are mapped here; anything else is
//! written as `?` and therefore does not survive a round trip.

const VOWEL_GLYPHS: [(char, [u8; 2]); 5] = [
    ('あ', [0x82, 0xA0]),
    ('い', [0x82, 0xA2]),
    ('う', [0x82, 0xA4]),
    ('え', [0x82, 0xA6]),
    ('お', [0x82, 0xA8]),
];

const UNMAPPED: u8 = b'?';

/// Encodes `name` into a zero-padded field of exactly `width` bytes.
/// Characters are never split across the field boundary.
pub fn encode_name(name: &str, width: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(width);
    for ch in name.chars() {
        let mut glyph = [0_u8; 2];
        let encoded: &[u8] = match encode_char(ch) {
            Encoded::Single(byte) => {
                glyph[0] = byte;
                &glyph[..1]
            }
            Encoded::Double(pair) => {
                glyph = pair;
                &glyph[..]
            }
        };
        if out.len() + encoded.len() > width {
            break;
        }
        out.extend_from_slice(encoded);
    }
    out.resize(width, 0);
    out
}

/// Decodes a field up to its first NUL byte.
pub fn decode_name(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    let bytes = &field[..end];

    let mut out = String::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        let byte = bytes[index];
        if byte < 0x80 {
            out.push(byte as char);
            index += 1;
        } else if is_lead_byte(byte) && index + 1 < bytes.len() {
            let pair = [byte, bytes[index + 1]];
            out.push(decode_pair(pair).unwrap_or(char::REPLACEMENT_CHARACTER));
            index += 2;
        } else {
            out.push(char::REPLACEMENT_CHARACTER);
            index += 1;
        }
    }
    out
}

/// True when `name` encodes and decodes back to itself.
pub fn is_round_trippable(name: &str) -> bool {
    name.chars()
        .all(|ch| ch == '?' || !matches!(encode_char(ch), Encoded::Single(UNMAPPED)))
}

enum Encoded {
    Single(u8),
    Double([u8; 2]),
}

fn encode_char(ch: char) -> Encoded {
    if (' '..='~').contains(&ch) {
        return Encoded::Single(ch as u8);
    }
    VOWEL_GLYPHS
        .iter()
        .find(|(glyph, _)| *glyph == ch)
        .map(|(_, pair)| Encoded::Double(*pair))
        .unwrap_or(Encoded::Single(UNMAPPED))
}

fn decode_pair(pair: [u8; 2]) -> Option<char> {
    VOWEL_GLYPHS
        .iter()
        .find(|(_, bytes)| *bytes == pair)
        .map(|(glyph, _)| *glyph)
}

fn is_lead_byte(byte: u8) -> bool {
    matches!(byte, 0x81..=0x9F | 0xE0..=0xFC)
}
