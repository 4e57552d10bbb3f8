//! Code-point to key-sequence table.
//!
//! Non-ASCII characters in macros and `input` messages are emitted as a
//! fixed four-key sequence encoding an index into this table; a compose
//! arrangement on the host side turns the sequence back into the intended
//! character. Only the index scheme matters here, the table is ordered
//! ranges of code points.

use evdev::KeyCode;

/// Contiguous code-point ranges covered by the table, each with the index of
/// its first entry. Must stay sorted by code point.
const RANGES: &[(u32, u32, u32)] = &[
    // (first, last, base index)
    (0x00a0, 0x024f, 0),      // Latin-1 supplement, Latin Extended-A/B
    (0x0370, 0x03ff, 0x1b0),  // Greek
    (0x0400, 0x04ff, 0x240),  // Cyrillic
    (0x2000, 0x206f, 0x340),  // general punctuation
    (0x20a0, 0x20bf, 0x3b0),  // currency
    (0x2190, 0x21ff, 0x3d0),  // arrows
    (0x2200, 0x22ff, 0x440),  // mathematical operators
    (0x2500, 0x257f, 0x540),  // box drawing
];

pub fn lookup_index(codepoint: u32) -> Option<u32> {
    let i = RANGES.partition_point(|&(_, last, _)| last < codepoint);
    let &(first, last, base) = RANGES.get(i)?;

    if (first..=last).contains(&codepoint) {
        Some(base + (codepoint - first))
    } else {
        None
    }
}

/// The sixteen digit keys used to spell a table index, nibble by nibble.
fn digit_key(nibble: u32) -> u16 {
    const DIGITS: [KeyCode; 16] = [
        KeyCode::KEY_0,
        KeyCode::KEY_1,
        KeyCode::KEY_2,
        KeyCode::KEY_3,
        KeyCode::KEY_4,
        KeyCode::KEY_5,
        KeyCode::KEY_6,
        KeyCode::KEY_7,
        KeyCode::KEY_8,
        KeyCode::KEY_9,
        KeyCode::KEY_A,
        KeyCode::KEY_B,
        KeyCode::KEY_C,
        KeyCode::KEY_D,
        KeyCode::KEY_E,
        KeyCode::KEY_F,
    ];

    DIGITS[nibble as usize].code()
}

/// Four-key spelling of a table index.
pub fn sequence(idx: u32) -> [u16; 4] {
    [
        digit_key((idx >> 12) & 0xf),
        digit_key((idx >> 8) & 0xf),
        digit_key((idx >> 4) & 0xf),
        digit_key(idx & 0xf),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup() {
        assert_eq!(lookup_index(0x00e9), Some(0x49)); // é
        assert_eq!(lookup_index(0x0410), Some(0x250)); // А
        assert_eq!(lookup_index(0x0041), None); // plain ASCII is not in the table
        assert_eq!(lookup_index(0x1f600), None);
    }

    #[test]
    fn sequences_are_distinct() {
        let a = sequence(lookup_index(0x00e9).unwrap());
        let b = sequence(lookup_index(0x00ea).unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn ranges_sorted() {
        for w in RANGES.windows(2) {
            assert!(w[0].1 < w[1].0);
        }
    }
}
