//! Text/UTF-8 classification of testcase bytes, `check_if_text_buf` and
//! `check_if_text` from `afl-fuzz-queue.c`.
//!
//! The length guard here is `len < MIN || len > MAX`. The source reads
//! `len < MIN || len < MAX`, which (since `MIN < MAX`) makes the second
//! half of the condition redundant and effectively only ever checks
//! `len < MIN` — almost every seed above the minimum length gets classified
//! regardless of how large it is. The guard here is corrected so oversized
//! buffers are skipped rather than scanned in full.

use crate::corpus::queue::TextKind;

/// Minimum byte length worth classifying at all.
pub const TXT_MIN_LEN: usize = 10;
/// Maximum byte length worth classifying; larger buffers are assumed
/// non-text rather than scanned in full.
pub const TXT_MAX_LEN: usize = 1024;
/// Minimum percentage of recognized bytes for a classification to count.
pub const TXT_MIN_PERCENT: u32 = 90;

/// Lightweight count-based classification (`check_if_text_buf`): returns
/// the larger of the ASCII or UTF-8 run counts. This is a lower-fidelity
/// cousin of [`classify`], used where only a quick, allocation-free
/// estimate is wanted rather than a final `is_ascii` verdict.
pub fn count_text_like(buf: &[u8]) -> u32 {
    let mut offset = 0usize;
    let mut ascii = 0u32;
    let mut utf8 = 0u32;
    let len = buf.len();

    while offset < len {
        let b0 = buf[offset];
        if b0 == 0x09 || b0 == 0x0A || b0 == 0x0D || (0x20..=0x7E).contains(&b0) {
            offset += 1;
            utf8 += 1;
            ascii += 1;
            continue;
        }

        if b0.is_ascii() {
            ascii += 1;
        }

        if let Some(n) = utf8_seq_len(buf, offset) {
            offset += n;
            utf8 += 1;
            continue;
        }

        offset += 1;
    }

    utf8.max(ascii)
}

/// Full classification (`check_if_text`): percentage of ASCII/UTF-8 bytes
/// against the buffer length, gated by [`TXT_MIN_LEN`]/[`TXT_MAX_LEN`] so
/// only plausibly-small, plausibly-textual buffers are scanned.
pub fn classify(buf: &[u8]) -> TextKind {
    let len = buf.len();
    if len < TXT_MIN_LEN || len > TXT_MAX_LEN {
        return TextKind::NotText;
    }

    let mut offset = 0usize;
    let mut ascii = 0u32;
    let mut utf8 = 0u32;
    // `comp` mirrors the source's byte-count denominator for the UTF-8
    // percentage: each multi-byte sequence counts once, not once per byte.
    let mut comp = len as i64;

    while offset < len {
        let b0 = buf[offset];
        if b0 == 0x09 || b0 == 0x0A || b0 == 0x0D || (0x20..=0x7E).contains(&b0) {
            offset += 1;
            utf8 += 1;
            ascii += 1;
            continue;
        }

        if b0.is_ascii() {
            ascii += 1;
        }

        if let Some(n) = utf8_seq_len(buf, offset) {
            offset += n;
            utf8 += 1;
            comp -= (n as i64) - 1;
            continue;
        }

        offset += 1;
    }

    if comp <= 0 {
        comp = 1;
    }
    let percent_utf8 = (utf8 as i64 * 100 / comp) as u32;
    let percent_ascii = ascii * 100 / len as u32;

    if percent_utf8 >= percent_ascii && percent_utf8 >= TXT_MIN_PERCENT {
        TextKind::Utf8
    } else if percent_ascii >= TXT_MIN_PERCENT {
        TextKind::Ascii
    } else {
        TextKind::NotText
    }
}

/// If `buf[offset..]` starts a valid non-overlong UTF-8 sequence of length
/// 2-4, returns that length.
fn utf8_seq_len(buf: &[u8], offset: usize) -> Option<usize> {
    let remaining = buf.len() - offset;
    let b0 = buf[offset];

    if remaining > 1 && (0xC2..=0xDF).contains(&b0) && (0x80..=0xBF).contains(&buf[offset + 1]) {
        return Some(2);
    }

    if remaining > 2 {
        let b1 = buf[offset + 1];
        let b2 = buf[offset + 2];
        let three_byte = (b0 == 0xE0 && (0xA0..=0xBF).contains(&b1) && (0x80..=0xBF).contains(&b2))
            || (((0xE1..=0xEC).contains(&b0) || b0 == 0xEE || b0 == 0xEF)
                && (0x80..=0xBF).contains(&b1)
                && (0x80..=0xBF).contains(&b2))
            || (b0 == 0xED && (0x80..=0x9F).contains(&b1) && (0x80..=0xBF).contains(&b2));
        if three_byte {
            return Some(3);
        }
    }

    if remaining > 3 {
        let b1 = buf[offset + 1];
        let b2 = buf[offset + 2];
        let b3 = buf[offset + 3];
        let four_byte = (b0 == 0xF0
            && (0x90..=0xBF).contains(&b1)
            && (0x80..=0xBF).contains(&b2)
            && (0x80..=0xBF).contains(&b3))
            || ((0xF1..=0xF3).contains(&b0)
                && (0x80..=0xBF).contains(&b1)
                && (0x80..=0xBF).contains(&b2)
                && (0x80..=0xBF).contains(&b3))
            || (b0 == 0xF4
                && (0x80..=0x8F).contains(&b1)
                && (0x80..=0xBF).contains(&b2)
                && (0x80..=0xBF).contains(&b3));
        if four_byte {
            return Some(4);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_buffer_is_never_text() {
        assert_eq!(classify(b"hi"), TextKind::NotText);
    }

    #[test]
    fn oversized_buffer_is_not_scanned() {
        let buf = vec![b'a'; TXT_MAX_LEN + 1];
        assert_eq!(classify(&buf), TextKind::NotText);
    }

    #[test]
    fn plain_ascii_classifies_as_ascii() {
        let buf = b"the quick brown fox jumps over the lazy dog repeatedly".to_vec();
        assert_eq!(classify(&buf), TextKind::Ascii);
    }

    #[test]
    fn binary_garbage_is_not_text() {
        let buf: Vec<u8> = (0..64u32).map(|i| (i * 37 % 256) as u8).collect();
        assert_eq!(classify(&buf), TextKind::NotText);
    }

    #[test]
    fn utf8_heavy_buffer_classifies_as_utf8() {
        let s = "héllo wörld this is tëxt with areas of accénts repeated ";
        assert_eq!(classify(s.as_bytes()), TextKind::Utf8);
    }

    #[test]
    fn count_text_like_prefers_the_larger_run() {
        let ascii_heavy = b"plain ascii text that is long enough to matter here";
        assert!(count_text_like(ascii_heavy) > 0);
    }
}
