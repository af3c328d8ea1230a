//! RAD50 filename codec.
//!
//! RAD50 packs three characters from a 40-symbol alphabet into one 16-bit
//! word. An RT-11 filename is a six-character stem (two words) and a
//! three-character extension (one word), each right-padded with spaces.
//! Lowercase letters are not in the alphabet, so lowercase names do not
//! parse; the volume is effectively case sensitive.

use crate::{Rad50Name, FILENAME_LENGTH};

/// The RAD50 alphabet; a character's index is its base-40 digit.
pub const CHARSET: &[u8; 40] = b" ABCDEFGHIJKLMNOPQRSTUVWXYZ$.%0123456789";

const RADIX: u16 = 40;

/// Decode one RAD50 word into its three characters.
#[must_use]
pub fn decode_word(word: u16) -> [char; 3] {
    let c0 = CHARSET[(word as usize / (RADIX as usize * RADIX as usize)) % 40] as char;
    let c1 = CHARSET[(word as usize / RADIX as usize) % 40] as char;
    let c2 = CHARSET[word as usize % 40] as char;
    [c0, c1, c2]
}

/// Encode exactly three characters into one RAD50 word.
///
/// Returns `None` if any character is outside the alphabet.
#[must_use]
pub fn encode_word(triple: &str) -> Option<u16> {
    let mut chars = triple.chars();
    let mut word = 0_u16;
    for _ in 0..3 {
        let ch = chars.next()?;
        let digit = CHARSET.iter().position(|&c| c as char == ch)?;
        word = word * RADIX + digit as u16;
    }
    if chars.next().is_some() {
        return None;
    }
    Some(word)
}

/// Parse a printable filename into its on-disk RAD50 representation.
///
/// The stem may contain one to six characters and may be followed by a dot
/// and an extension of up to three characters. Both parts are space-padded
/// to their fixed widths before encoding.
#[must_use]
pub fn parse_filename(name: &str) -> Option<Rad50Name> {
    if !name.is_ascii() {
        return None;
    }

    let (stem, ext) = match name.find('.') {
        Some(dot) => (&name[..dot], &name[dot + 1..]),
        None => (name, ""),
    };

    if stem.is_empty() || stem.len() > 6 || ext.len() > 3 {
        return None;
    }

    let stem = format!("{stem:<6}");
    let ext = format!("{ext:<3}");

    Some([
        encode_word(&stem[0..3])?,
        encode_word(&stem[3..6])?,
        encode_word(&ext)?,
    ])
}

/// Render an on-disk name as the printable form shown to callers.
///
/// Trailing stem padding is trimmed, a dot is always present, and trailing
/// extension padding is trimmed after the dot.
#[must_use]
pub fn format_filename(name: &Rad50Name) -> String {
    debug_assert_eq!(name.len(), FILENAME_LENGTH);

    let mut out = String::with_capacity(10);
    out.extend(decode_word(name[0]));
    out.extend(decode_word(name[1]));
    let stem_len = out.trim_end_matches(' ').len();
    out.truncate(stem_len);

    out.push('.');
    out.extend(decode_word(name[2]));
    let full_len = out.trim_end_matches(' ').len();
    out.truncate(full_len);

    out
}
