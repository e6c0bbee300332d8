//! memchr anchored pattern scanning backend
//!
//! Searches for the first literal byte of the pattern with `memchr`, then verifies the
//! whole pattern at the implied start. Candidates are visited in ascending order, so the
//! first verified candidate is the leftmost match.

use memchr::memchr_iter;

use crate::scan::Pattern;

/// `anchor` is `(index, byte)` of the first literal in `pattern`
pub(crate) fn find(pattern: &Pattern, anchor: (usize, u8), haystack: &[u8]) -> Option<usize> {
    let (anchor_index, anchor_byte) = anchor;
    let last_start = haystack.len().checked_sub(pattern.len())?;

    // the anchor of the last possible start sits at last_start + anchor_index
    let window = &haystack[anchor_index..=last_start + anchor_index];

    memchr_iter(anchor_byte, window)
        .find(|&start| pattern.matches_prefix(&haystack[start..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_after_wildcards() {
        let pattern = Pattern::new("?? ?? 89").unwrap();
        let anchor = pattern.first_literal().unwrap();
        assert_eq!(anchor, (2, 0x89));

        // a 0x89 at index 1 cannot be the anchor of any start
        assert_eq!(find(&pattern, anchor, &[0x00, 0x89, 0x00, 0x89]), Some(1));
        assert_eq!(find(&pattern, anchor, &[0x89, 0x89, 0x00]), None);
    }
}
