//! Partitioning of the monitored set into connection groups

use std::collections::BTreeSet;

use shardline_subjects::{Group, SubjectId};

use crate::error::{Error, Result};

/// Split `subjects` into the fewest groups of at most `capacity` subjects.
///
/// Subjects are taken in ascending order and chunked, so the same set always
/// yields the same partition. An empty set yields no groups.
///
/// # Errors
///
/// Returns [`Error::InvalidCapacity`] if `capacity` is zero.
pub fn allocate(subjects: &BTreeSet<SubjectId>, capacity: usize) -> Result<Vec<Group>> {
    if capacity == 0 {
        return Err(Error::InvalidCapacity { capacity, max: None });
    }

    let ordered: Vec<SubjectId> = subjects.iter().copied().collect();
    let groups = ordered
        .chunks(capacity)
        .map(|chunk| Group::new(chunk.iter().copied()))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(raw: impl IntoIterator<Item = u64>) -> BTreeSet<SubjectId> {
        raw.into_iter().map(SubjectId::new).collect()
    }

    fn raw(group: &Group) -> Vec<u64> {
        group.iter().map(SubjectId::get).collect()
    }

    #[test]
    fn test_five_subjects_capacity_three() {
        let groups = allocate(&set([5, 3, 1, 4, 2]), 3).unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(raw(&groups[0]), vec![1, 2, 3]);
        assert_eq!(raw(&groups[1]), vec![4, 5]);
    }

    #[test]
    fn test_empty_set() {
        assert!(allocate(&BTreeSet::new(), 3).unwrap().is_empty());
    }

    #[test]
    fn test_fits_in_one_group() {
        let groups = allocate(&set([7, 8]), 100).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(raw(&groups[0]), vec![7, 8]);
    }

    #[test]
    fn test_zero_capacity() {
        assert!(matches!(
            allocate(&set([1]), 0),
            Err(Error::InvalidCapacity { capacity: 0, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_minimal_disjoint_cover(
            subjects in prop::collection::btree_set(any::<u64>(), 0..200),
            capacity in 1usize..50,
        ) {
            let subjects: BTreeSet<SubjectId> = subjects.into_iter().map(SubjectId::new).collect();
            let groups = allocate(&subjects, capacity).unwrap();

            prop_assert_eq!(groups.len(), subjects.len().div_ceil(capacity));
            prop_assert!(groups.iter().all(|g| !g.is_empty() && g.len() <= capacity));

            let mut covered = BTreeSet::new();
            for group in &groups {
                for subject in group.iter() {
                    prop_assert!(covered.insert(subject), "subject {} in two groups", subject);
                }
            }
            prop_assert_eq!(&covered, &subjects);

            prop_assert_eq!(allocate(&subjects, capacity).unwrap(), groups);
        }
    }
}
