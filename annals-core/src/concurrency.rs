//! Optimistic concurrency control for appends.
//!
//! Every append carries an [`ExpectedVersion`]. The store compares it against
//! the stream's last assigned offset inside its serialization point and
//! rejects the write with a [`ConcurrencyConflict`] when they disagree.
//!
//! # Example
//!
//! ```
//! use annals_core::concurrency::ExpectedVersion;
//!
//! // `None` means "any version", `-1` means "stream must not exist".
//! assert_eq!(ExpectedVersion::from_raw(None), Ok(ExpectedVersion::Any));
//! assert_eq!(ExpectedVersion::from_raw(Some(-1)), Ok(ExpectedVersion::NoStream));
//! assert_eq!(ExpectedVersion::from_raw(Some(4)), Ok(ExpectedVersion::Exact(4)));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StreamPosition;

/// Version a writer expects the target stream to be at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// No version checking - last writer wins.
    #[default]
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The offset of the stream's last event must equal this value.
    Exact(u64),
}

/// Raised when a raw expected version is below [`StreamPosition::END_OF_STREAM`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid expected version {0}: must be -1 (no stream) or a non-negative offset")]
pub struct InvalidExpectedVersion(pub i64);

impl ExpectedVersion {
    /// Convert the nullable integer form used at API boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidExpectedVersion`] for values below `-1`.
    pub fn from_raw(raw: Option<i64>) -> Result<Self, InvalidExpectedVersion> {
        match raw {
            None => Ok(Self::Any),
            Some(StreamPosition::END_OF_STREAM) => Ok(Self::NoStream),
            Some(v) => u64::try_from(v)
                .map(Self::Exact)
                .map_err(|_| InvalidExpectedVersion(v)),
        }
    }

    /// Inverse of [`ExpectedVersion::from_raw`].
    #[must_use]
    pub fn into_raw(self) -> Option<i64> {
        match self {
            Self::Any => None,
            Self::NoStream => Some(StreamPosition::END_OF_STREAM),
            Self::Exact(v) => Some(i64::try_from(v).unwrap_or(i64::MAX)),
        }
    }

    /// Check the expectation against the stream's last assigned offset.
    ///
    /// `actual` is `None` when the stream does not exist.
    pub fn check(self, actual: Option<u64>) -> Result<(), ConcurrencyConflict> {
        let satisfied = match self {
            Self::Any => true,
            Self::NoStream => actual.is_none(),
            Self::Exact(expected) => actual == Some(expected),
        };
        if satisfied {
            Ok(())
        } else {
            Err(ConcurrencyConflict {
                expected: self,
                actual,
            })
        }
    }
}

impl From<u64> for ExpectedVersion {
    fn from(value: u64) -> Self {
        Self::Exact(value)
    }
}

/// Error indicating a concurrency conflict during append.
///
/// Another writer appended to (or created) the stream since the caller last
/// observed it. The store never retries; callers reload and retry or fail the
/// business operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(.expected, .actual.as_ref()))]
pub struct ConcurrencyConflict {
    /// The version the writer expected.
    pub expected: ExpectedVersion,
    /// The stream's last assigned offset, `None` if the stream does not exist.
    pub actual: Option<u64>,
}

/// Build a human-readable message for a [`ConcurrencyConflict`], including an
/// actionable hint for the caller.
fn format_conflict(expected: &ExpectedVersion, actual: Option<&u64>) -> String {
    match (expected, actual) {
        (ExpectedVersion::NoStream, Some(actual)) => format!(
            "concurrency conflict: expected new stream, found version {actual} (hint: another \
             writer created this stream; reload and retry)"
        ),
        (ExpectedVersion::Exact(expected), Some(actual)) => format!(
            "concurrency conflict: expected version {expected}, found {actual} (hint: stream was \
             modified; reload and retry)"
        ),
        (ExpectedVersion::Exact(expected), None) => format!(
            "concurrency conflict: expected version {expected}, but the stream does not exist"
        ),
        (expected, actual) => {
            format!("concurrency conflict: expected {expected:?}, found {}", Actual(actual))
        }
    }
}

struct Actual<'a>(Option<&'a u64>);

impl fmt::Display for Actual<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "version {v}"),
            None => f.write_str("no stream"),
        }
    }
}
