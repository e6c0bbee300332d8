mod anchored;
mod scalar;

use super::Pattern;

/// Leftmost match of `pattern` in `haystack`
///
/// Patterns with a literal jump between candidates of that literal; fully wildcarded
/// patterns match at offset 0 whenever they fit, which the scalar backend handles.
pub(crate) fn find(pattern: &Pattern, haystack: &[u8]) -> Option<usize> {
    if pattern.len() > haystack.len() {
        return None;
    }

    match pattern.first_literal() {
        Some(anchor) => anchored::find(pattern, anchor, haystack),
        None => scalar::find(pattern, haystack),
    }
}
