//! Scalar pattern scanning backend

use crate::scan::Pattern;

/// Find the first occurrence of a pattern in the binary by trying every start offset
pub(crate) fn find(pattern: &Pattern, haystack: &[u8]) -> Option<usize> {
    let last_start = haystack.len().checked_sub(pattern.len())?;

    (0..=last_start).find(|&start| pattern.matches_prefix(&haystack[start..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_leftmost() {
        let pattern = Pattern::new("AA ?? AA").unwrap();
        assert_eq!(find(&pattern, &[0x00, 0xAA, 0xAA, 0xAA, 0xAA]), Some(1));
        assert_eq!(find(&pattern, &[0xAA, 0xAA]), None);
    }
}
