//! Revision addressing.
//!
//! A revision address selects one record from a newest-first revision list:
//!
//! * `CSV~N` steps back N revisions from the most recent (`CSV~0` is current).
//! * A number `<= 0` is the same relative offset; a number `> 0` is a serial.
//! * A path to an existing file stands in for a revision outside the list.
//! * Anything else is matched as a prefix of the revision id.

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

use crate::revision::{Locator, RevisionRecord};

/// Address of the most recent revision.
pub const CURRENT: &str = "CSV~0";

const OFFSET_PREFIX: &str = "CSV~";

/// Errors raised while resolving revision addresses.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The part after `CSV~` is not an integer.
    #[error("invalid CSV index: {0}")]
    InvalidOffset(String),

    /// The offset does not fall inside the revision list.
    #[error("index {index} out of range for versions of length {len}")]
    OffsetOutOfRange {
        /// Requested offset.
        index: i64,
        /// Number of revisions available.
        len: usize,
    },

    /// No revision carries the requested serial.
    #[error("failed to find state version with serial {0}")]
    SerialNotFound(i64),

    /// No revision id starts with the requested prefix.
    #[error("failed to find state version with ID prefix: {0}")]
    IdPrefixNotFound(String),
}

/// Classified form of a textual revision address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionAddress {
    /// Steps back from the most recent revision.
    Offset(i64),
    /// A specific document serial.
    Serial(i64),
    /// A document saved on the local filesystem.
    File(PathBuf),
    /// Prefix of a revision id.
    IdPrefix(String),
}

impl RevisionAddress {
    /// Classify `spec`. Classification order matters: a numeric spec is never
    /// treated as a file even if a file with that name exists.
    pub fn parse(spec: &str) -> Result<Self, AddressError> {
        if has_offset_prefix(spec) {
            let raw = &spec[OFFSET_PREFIX.len()..];
            return raw
                .parse::<i64>()
                .map(Self::Offset)
                .map_err(|_| AddressError::InvalidOffset(raw.to_string()));
        }
        if let Ok(n) = spec.parse::<i64>() {
            return Ok(if n <= 0 { Self::Offset(-n) } else { Self::Serial(n) });
        }
        if !spec.is_empty() && Path::new(spec).exists() {
            return Ok(Self::File(PathBuf::from(spec)));
        }
        Ok(Self::IdPrefix(spec.to_string()))
    }

    /// Pick the matching record out of a newest-first list.
    pub fn select(&self, records: &[RevisionRecord]) -> Result<RevisionRecord, AddressError> {
        match self {
            Self::Offset(index) => usize::try_from(*index)
                .ok()
                .and_then(|i| records.get(i))
                .cloned()
                .ok_or(AddressError::OffsetOutOfRange {
                    index: *index,
                    len: records.len(),
                }),
            Self::Serial(serial) => records
                .iter()
                .find(|r| r.serial == *serial)
                .cloned()
                .ok_or(AddressError::SerialNotFound(*serial)),
            Self::File(path) => Ok(RevisionRecord::new(
                path.to_string_lossy(),
                Utc::now(),
                0,
                Locator::Path(path.clone()),
            )),
            Self::IdPrefix(prefix) => records
                .iter()
                .find(|r| r.id.starts_with(prefix.as_str()))
                .cloned()
                .ok_or_else(|| AddressError::IdPrefixNotFound(prefix.clone())),
        }
    }
}

/// True when `spec` uses the `CSV~N` form, case-insensitively.
pub fn has_offset_prefix(spec: &str) -> bool {
    spec.get(..OFFSET_PREFIX.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(OFFSET_PREFIX))
}

/// Resolve each spec against `records`, in order. No specs selects the most
/// recent revision.
pub fn resolve<S: AsRef<str>>(
    records: &[RevisionRecord],
    specs: &[S],
) -> Result<Vec<RevisionRecord>, AddressError> {
    if specs.is_empty() {
        return RevisionAddress::Offset(0).select(records).map(|r| vec![r]);
    }
    specs
        .iter()
        .map(|spec| RevisionAddress::parse(spec.as_ref())?.select(records))
        .collect()
}
