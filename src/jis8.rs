//! JIS X 0201 (code page 50222) single-byte codec, the text repertoire
//! SEMI E5 designates for SECS-II's JIS8 item format.
//!
//! This is deliberately not built on a general Shift-JIS/EUC-JP crate:
//! those target multi-byte repertoires, while JIS8 here is a single-byte
//! mapping close to ASCII in the low half and half-width katakana in the
//! high half.

use crate::error::InvalidText;
use crate::format::SecsFormat;

/// Half-width katakana block, one code point per byte 0xA1..=0xDF.
const KATAKANA: [char; 63] = [
    '\u{FF61}', '\u{FF62}', '\u{FF63}', '\u{FF64}', '\u{FF65}', '\u{FF66}', '\u{FF67}', '\u{FF68}',
    '\u{FF69}', '\u{FF6A}', '\u{FF6B}', '\u{FF6C}', '\u{FF6D}', '\u{FF6E}', '\u{FF6F}', '\u{FF70}',
    '\u{FF71}', '\u{FF72}', '\u{FF73}', '\u{FF74}', '\u{FF75}', '\u{FF76}', '\u{FF77}', '\u{FF78}',
    '\u{FF79}', '\u{FF7A}', '\u{FF7B}', '\u{FF7C}', '\u{FF7D}', '\u{FF7E}', '\u{FF7F}', '\u{FF80}',
    '\u{FF81}', '\u{FF82}', '\u{FF83}', '\u{FF84}', '\u{FF85}', '\u{FF86}', '\u{FF87}', '\u{FF88}',
    '\u{FF89}', '\u{FF8A}', '\u{FF8B}', '\u{FF8C}', '\u{FF8D}', '\u{FF8E}', '\u{FF8F}', '\u{FF90}',
    '\u{FF91}', '\u{FF92}', '\u{FF93}', '\u{FF94}', '\u{FF95}', '\u{FF96}', '\u{FF97}', '\u{FF98}',
    '\u{FF99}', '\u{FF9A}', '\u{FF9B}', '\u{FF9C}', '\u{FF9D}', '\u{FF9E}', '\u{FF9F}',
];

/// Decode a JIS8-encoded byte slice into a `String`.
pub fn decode(bytes: &[u8]) -> Result<String, InvalidText> {
    let mut out = String::with_capacity(bytes.len());
    for (offset, &b) in bytes.iter().enumerate() {
        let ch = match b {
            0x00..=0x5B | 0x5D..=0x7D => b as char,
            0x5C => '\u{00A5}', // YEN SIGN
            0x7E => '\u{203E}', // OVERLINE
            0xA1..=0xDF => KATAKANA[(b - 0xA1) as usize],
            _ => {
                return Err(InvalidText {
                    format: SecsFormat::Jis8,
                    offset,
                })
            }
        };
        out.push(ch);
    }
    Ok(out)
}

/// Encode a `str` into JIS8 bytes.
pub fn encode(text: &str) -> Result<Vec<u8>, InvalidText> {
    let mut out = Vec::with_capacity(text.len());
    for (offset, ch) in text.chars().enumerate() {
        let byte = match ch {
            c @ '\u{0000}'..='\u{005B}' => c as u8,
            c @ '\u{005D}'..='\u{007D}' => c as u8,
            '\u{00A5}' => 0x5C,
            '\u{203E}' => 0x7E,
            c if ('\u{FF61}'..='\u{FF9F}').contains(&c) => {
                (c as u32 - '\u{FF61}' as u32) as u8 + 0xA1
            }
            _ => {
                return Err(InvalidText {
                    format: SecsFormat::Jis8,
                    offset,
                })
            }
        };
        out.push(byte);
    }
    Ok(out)
}
