//! Character ranges into a block's concatenated text.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::OverlayError;

/// A half-open `[start, end)` character range measured against the ordered
/// concatenation of a block's text-bearing leaves.
///
/// Offsets count Unicode scalar values, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextRange {
    #[serde(rename = "startOffset")]
    pub start: usize,
    #[serde(rename = "endOffset")]
    pub end: usize,
}

impl TextRange {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Build a range from untrusted signed offsets, rejecting anything that is
    /// negative, empty or reversed.
    pub fn checked(start: i64, end: i64) -> Result<Self, OverlayError> {
        if start < 0 || end < 0 || start >= end {
            return Err(OverlayError::RangeInvalid {
                start,
                end,
                len: None,
            });
        }
        Ok(Self::new(start as usize, end as usize))
    }

    #[must_use]
    pub fn len(self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// `a.start < b.end && b.start < a.end`. Adjacent ranges do not intersect.
    pub fn intersects(self, other: TextRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(self, offset: usize) -> bool {
        self.start <= offset && offset < self.end
    }

    /// Check the range against the current text length of a block.
    pub fn validate(self, text_len: usize) -> Result<Self, OverlayError> {
        if self.start >= self.end || self.end > text_len {
            return Err(OverlayError::RangeInvalid {
                start: self.start as i64,
                end: self.end as i64,
                len: Some(text_len),
            });
        }
        Ok(self)
    }

    /// Extract the covered characters from `text`.
    pub fn slice(self, text: &str) -> String {
        text.chars().skip(self.start).take(self.len()).collect()
    }
}

impl fmt::Display for TextRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl From<std::ops::Range<usize>> for TextRange {
    fn from(r: std::ops::Range<usize>) -> Self {
        Self::new(r.start, r.end)
    }
}
