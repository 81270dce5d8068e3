//! Common types used throughout OmniStore.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Normalize a name into a backend-safe slug.
///
/// Non-ASCII characters are transliterated, everything is lower-cased and
/// every run of characters outside `[a-z0-9._~-]` becomes a single `-`.
/// Leading and trailing separators are trimmed. The transform is idempotent.
pub fn slugify(input: &str) -> String {
    let ascii = deunicode::deunicode(input).to_ascii_lowercase();
    let mut slug = String::with_capacity(ascii.len());
    let mut pending_dash = false;

    for c in ascii.chars() {
        let allowed = c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '~');
        if allowed {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }

    slug
}

/// Name of a bucket after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketName(String);

impl BucketName {
    /// Normalize a caller-supplied bucket name.
    ///
    /// # Errors
    /// - Returns error if the name is empty or slugifies to nothing
    /// - Returns error if the slug starts with `.` (this covers `.` and `..`)
    pub fn new(name: &str) -> crate::Result<Self> {
        let slug = slugify(name);
        if slug.is_empty() || slug.starts_with('.') {
            return Err(crate::Error::Validation(format!(
                "Can not use \"{}\" as bucket name",
                name
            )));
        }
        Ok(Self(slug))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for BucketName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A path-like object key within a bucket.
///
/// Every segment is slugified independently, so the directory structure of
/// the caller's key survives while each segment becomes name-safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    segments: Vec<String>,
}

impl ObjectKey {
    /// Parse and normalize a key.
    ///
    /// Both `/` and `\` separate segments; empty segments are dropped.
    ///
    /// # Errors
    /// - Key has no segments
    /// - A segment slugifies to nothing or to a relative path marker
    pub fn parse(key: &str) -> crate::Result<Self> {
        let mut segments = Vec::new();

        for raw in key.split(['/', '\\']).filter(|s| !s.is_empty()) {
            let segment = slugify(raw);
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(crate::Error::Validation(format!(
                    "Key segment \"{}\" in \"{}\" is not name-safe",
                    raw, key
                )));
            }
            segments.push(segment);
        }

        if segments.is_empty() {
            return Err(crate::Error::Validation(format!(
                "Can not use \"{}\" as file key",
                key
            )));
        }

        Ok(Self { segments })
    }

    /// Get the key segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Get the last segment.
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// Inclusive byte range for partial reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    /// Last byte to read; `None` reads to the end of the object.
    pub end: Option<u64>,
}

impl ByteRange {
    /// Create a validated range.
    ///
    /// # Errors
    /// - `end` lies before `start`
    pub fn new(start: u64, end: Option<u64>) -> crate::Result<Self> {
        if let Some(end) = end {
            if end < start {
                return Err(crate::Error::Validation(format!(
                    "Invalid byte range: end {} is before start {}",
                    end, start
                )));
            }
        }
        Ok(Self { start, end })
    }

    /// Range starting at `start` and running to the end of the object.
    pub fn from_offset(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of bytes covered when applied to an object of `size` bytes.
    pub fn len_within(&self, size: u64) -> u64 {
        if self.start >= size {
            return 0;
        }
        let last = self.end.map_or(size - 1, |end| end.min(size - 1));
        last - self.start + 1
    }

    /// Render as an HTTP `Range` header value.
    pub fn to_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Credential string that is redacted in `Debug` output and zeroized on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a credential.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the credential for use in a request.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
