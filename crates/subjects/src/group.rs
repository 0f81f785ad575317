use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};

use crate::error::{Error, Result};
use crate::SubjectId;

/// An ordered bucket of distinct subjects served by one connection.
///
/// Groups are immutable; cloning is a reference count bump.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Group {
    subjects: Arc<[SubjectId]>,
}

impl Group {
    /// Creates a group from an ordered sequence of subjects.
    ///
    /// # Errors
    ///
    /// Returns an error if a subject appears more than once.
    pub fn new(subjects: impl IntoIterator<Item = SubjectId>) -> Result<Self> {
        let subjects: Vec<SubjectId> = subjects.into_iter().collect();

        let mut seen = HashSet::with_capacity(subjects.len());
        for subject in &subjects {
            if !seen.insert(*subject) {
                return Err(Error::DuplicateSubject(*subject));
            }
        }

        Ok(Self {
            subjects: subjects.into(),
        })
    }

    /// Number of subjects in the group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    /// Whether the group has no subjects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Whether `subject` belongs to this group.
    #[must_use]
    pub fn contains(&self, subject: SubjectId) -> bool {
        self.subjects.contains(&subject)
    }

    /// Iterates over the subjects in order.
    pub fn iter(&self) -> impl Iterator<Item = SubjectId> + '_ {
        self.subjects.iter().copied()
    }

    /// The subjects as a slice.
    #[must_use]
    pub fn subjects(&self) -> &[SubjectId] {
        &self.subjects
    }

    /// Comma separated IDs, the form remote endpoints take in a `follow` parameter.
    #[must_use]
    pub fn to_query_value(&self) -> String {
        self.subjects
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.to_query_value())
    }
}

impl Serialize for Group {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.subjects.as_ref().serialize(serializer)
    }
}
