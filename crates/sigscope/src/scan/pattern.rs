use std::{fmt, str::FromStr};

/// Errors produced while compiling a [`Pattern`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    /// pattern text had no tokens
    #[error("pattern is empty")]
    Empty,
    /// a token was neither two hex digits nor a wildcard
    #[error("invalid token `{token}` at position {position}. tokens must be 2 hex digits, or ?? for wildcards")]
    Syntax {
        /// zero-based token index
        position: usize,
        /// the offending token
        token: String,
    },
    /// more than [`Pattern::MAX_LEN`] tokens
    #[error("pattern has {len} bytes, max is {}", Pattern::MAX_LEN)]
    TooLong {
        /// token count of the rejected pattern
        len: usize,
    },
    /// mask contained something other than `x` or `?`
    #[error("mask is invalid. mask must be x or ? for wildcards")]
    Mask,
    /// mask and data lengths differ
    #[error("mask is not the same length as the data")]
    MaskLen,
}

/// One byte position of a [`Pattern`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// must equal this byte
    Literal(u8),
    /// matches any byte
    Wildcard,
}

impl Segment {
    /// Whether `byte` satisfies this segment
    #[inline]
    pub fn matches(self, byte: u8) -> bool {
        match self {
            Segment::Literal(b) => b == byte,
            Segment::Wildcard => true,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(b) => write!(f, "{b:02X}"),
            Segment::Wildcard => f.write_str("??"),
        }
    }
}

/// An IDA-style binary pattern
///
/// Compiled once, immutable afterwards. Each token of the source text maps to exactly one
/// [`Segment`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    segments: Vec<Segment>,
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, r#"Pattern("{self}")"#)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }

            write!(f, "{segment}")?;
        }

        Ok(())
    }
}

impl Pattern {
    /// Maximum number of bytes a pattern may describe
    pub const MAX_LEN: usize = 256;

    /// Create a new IDA-style [`Pattern`] instance
    ///
    /// # Example
    ///
    /// ```rust
    /// # use sigscope::Pattern;
    /// let pattern = Pattern::new("48 89 ?? 24 ?? 48 89 6c").unwrap();
    /// assert_eq!(pattern.len(), 8);
    /// ```
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let mut segments = Vec::new();

        for (position, token) in pattern.split_whitespace().enumerate() {
            if position == Self::MAX_LEN {
                let len = pattern.split_whitespace().count();
                return Err(PatternError::TooLong { len });
            }

            let segment = match token.as_bytes() {
                b"??" | b"?" => Segment::Wildcard,

                // only hex digits are allowed; a-f A-F 0-9
                &[hi, lo] if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                    Segment::Literal(hex_value(hi) << 4 | hex_value(lo))
                }

                _ => {
                    return Err(PatternError::Syntax {
                        position,
                        token: token.to_owned(),
                    })
                }
            };

            segments.push(segment);
        }

        if segments.is_empty() {
            return Err(PatternError::Empty);
        }

        Ok(Self { segments })
    }

    /// A pattern made only of literals
    pub fn from_bytes(data: &[u8]) -> Result<Self, PatternError> {
        Self::from_segments(data.iter().copied().map(Segment::Literal).collect())
    }

    /// A pattern from raw data and a mask, `x` for a known byte and `?` for an unknown byte
    pub fn from_data_with_mask(data: &[u8], mask: &str) -> Result<Self, PatternError> {
        if mask.len() != data.len() {
            return Err(PatternError::MaskLen);
        }

        let segments = data
            .iter()
            .zip(mask.chars())
            .map(|(&byte, sym)| match sym {
                'x' => Ok(Segment::Literal(byte)),
                '?' => Ok(Segment::Wildcard),
                _ => Err(PatternError::Mask),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_segments(segments)
    }

    fn from_segments(segments: Vec<Segment>) -> Result<Self, PatternError> {
        match segments.len() {
            0 => Err(PatternError::Empty),
            len if len > Self::MAX_LEN => Err(PatternError::TooLong { len }),
            _ => Ok(Self { segments }),
        }
    }

    /// Number of byte positions
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Always false, compiled patterns hold at least one segment
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The compiled segments, in order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Index and value of the first literal, if the pattern has one
    pub(crate) fn first_literal(&self) -> Option<(usize, u8)> {
        self.segments.iter().enumerate().find_map(|(i, s)| match s {
            Segment::Literal(b) => Some((i, *b)),
            Segment::Wildcard => None,
        })
    }

    /// Whether `bytes` is exactly as long as the pattern and every literal matches
    pub fn matches(&self, bytes: &[u8]) -> bool {
        bytes.len() == self.segments.len() && self.matches_prefix(bytes)
    }

    /// Caller guarantees `bytes.len() >= self.len()`
    #[inline]
    pub(crate) fn matches_prefix(&self, bytes: &[u8]) -> bool {
        self.segments
            .iter()
            .zip(bytes)
            .all(|(segment, &byte)| segment.matches(byte))
    }

    /// Offset of the first (leftmost) match in `haystack`
    ///
    /// # Example
    ///
    /// ```rust
    /// # use sigscope::Pattern;
    /// let pattern = Pattern::new("8B ?? 89").unwrap();
    /// assert_eq!(pattern.find(&[0x90, 0x8B, 0x11, 0x89, 0x00]), Some(1));
    /// ```
    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        super::backends::find(self, haystack)
    }

    /// Every match offset in `haystack`, ascending. Overlapping matches are all reported
    pub fn find_iter<'a>(&'a self, haystack: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
        let mut start = 0;

        std::iter::from_fn(move || {
            let found = start + self.find(haystack.get(start..)?)?;
            start = found + 1;
            Some(found)
        })
    }
}

fn hex_value(c: u8) -> u8 {
    match c {
        b'a'..=b'f' => c - b'a' + 0xA,
        b'A'..=b'F' => c - b'A' + 0xA,
        _ => c - b'0',
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for Pattern {
    type Error = PatternError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&[u8]> for Pattern {
    type Error = PatternError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(value)
    }
}
