//! Identity types for monitored subjects.
//!
//! This crate provides:
//! - `SubjectId`, the opaque identifier of a monitored entity
//! - `Group`, the ordered bucket of subjects served by a single connection
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod group;

pub use error::{Error, Result};
pub use group::Group;

use std::str::FromStr;

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a monitored subject (for example an account).
#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, From, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct SubjectId(u64);

impl SubjectId {
    /// Creates a subject ID from its numeric value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the numeric value of this subject ID.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl FromStr for SubjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|e| Error::InvalidSubjectId(s.to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subject_id() {
        let id: SubjectId = " 42 ".parse().unwrap();
        assert_eq!(id, SubjectId::new(42));
        assert_eq!(id.to_string(), "42");

        assert!("forty-two".parse::<SubjectId>().is_err());
    }

    #[test]
    fn test_subject_id_serializes_as_number() {
        let json = serde_json::to_string(&SubjectId::new(7)).unwrap();
        assert_eq!(json, "7");

        let id: SubjectId = serde_json::from_str("9").unwrap();
        assert_eq!(id.get(), 9);
    }
}
