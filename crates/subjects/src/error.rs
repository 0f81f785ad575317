use std::num::ParseIntError;

use thiserror::Error;

use crate::SubjectId;

/// Result type for subject operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building subject types.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The same subject appeared twice in one group.
    #[error("subject {0} appears more than once in the group")]
    DuplicateSubject(SubjectId),

    /// A subject ID could not be parsed.
    #[error("invalid subject id '{0}': {1}")]
    InvalidSubjectId(String, ParseIntError),
}
