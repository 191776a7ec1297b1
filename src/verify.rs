//! Host-side checking of a [`Selection`] against a sequential scan.

use crate::launch::SENTINEL;
use crate::select::Selection;
use crate::{SelError, SelResult};

/// Indices `i` with `input[i] >= limit`, ascending.
pub fn reference_indices(input: &[f32], limit: f32) -> Vec<i32> {
    input
        .iter()
        .enumerate()
        .filter(|(_, &x)| x >= limit)
        .map(|(i, _)| i as i32)
        .collect()
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    /// Count reported by the device.
    pub selected: usize,
    /// Count found by the reference scan.
    pub expected: usize,
    /// Non-sentinel entries found in the whole output buffer.
    pub non_sentinel: usize,
}

/// Check that `selection` holds exactly the qualifying indices of `input`.
///
/// The selected prefix must match the reference scan as a set, with no
/// duplicates, and every slot past the prefix must be the sentinel.
pub fn verify(input: &[f32], limit: f32, selection: &Selection) -> SelResult<VerifyReport> {
    if selection.indices.len() != input.len() || selection.count > input.len() {
        return Err(SelError::Device(format!(
            "selection of {} slots (count {}) does not match input of {}",
            selection.indices.len(),
            selection.count,
            input.len()
        )));
    }

    let expected = reference_indices(input, limit);
    let non_sentinel = selection.indices.iter().filter(|&&v| v != SENTINEL).count();
    let stray_tail = selection.tail().iter().filter(|&&v| v != SENTINEL).count();

    let mut got = selection.sorted();
    let before = got.len();
    got.dedup();
    let duplicates = before - got.len();

    let (missing, unexpected) = diff_sorted(&expected, &got);
    let unexpected = unexpected + stray_tail;

    log::debug!(
        "verify: {} selected, {} expected, {non_sentinel} non-sentinel",
        selection.count,
        expected.len()
    );

    if missing != 0 || unexpected != 0 || duplicates != 0 {
        return Err(SelError::VerificationMismatch {
            missing,
            unexpected,
            duplicates,
        });
    }

    Ok(VerifyReport {
        selected: selection.count,
        expected: expected.len(),
        non_sentinel,
    })
}

/// Count entries only in `expected` and entries only in `got`. Both ascending.
fn diff_sorted(expected: &[i32], got: &[i32]) -> (usize, usize) {
    let (mut i, mut j) = (0, 0);
    let (mut missing, mut unexpected) = (0, 0);
    while i < expected.len() && j < got.len() {
        match expected[i].cmp(&got[j]) {
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                missing += 1;
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                unexpected += 1;
                j += 1;
            }
        }
    }
    missing += expected.len() - i;
    unexpected += got.len() - j;
    (missing, unexpected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::LaunchConfig;
    use crate::select::LaunchStats;

    fn selection(indices: Vec<i32>, count: usize) -> Selection {
        let len = indices.len();
        Selection {
            indices,
            count,
            config: LaunchConfig::new(len, len, 1).unwrap(),
            stats: LaunchStats::default(),
        }
    }

    const INPUT: [f32; 6] = [0.1, 0.9, 0.5, 0.95, 0.0, 0.9];

    #[test]
    fn test_reference_indices() {
        assert_eq!(reference_indices(&INPUT, 0.9), vec![1, 3, 5]);
        assert_eq!(reference_indices(&INPUT, 2.0), Vec::<i32>::new());
        assert_eq!(reference_indices(&INPUT, 0.0).len(), 6);
        // Same answer on repeat.
        assert_eq!(reference_indices(&INPUT, 0.9), reference_indices(&INPUT, 0.9));
    }

    #[test]
    fn test_accepts_any_prefix_order() {
        let sel = selection(vec![5, 1, 3, -1, -1, -1], 3);
        let report = verify(&INPUT, 0.9, &sel).unwrap();
        assert_eq!(
            report,
            VerifyReport {
                selected: 3,
                expected: 3,
                non_sentinel: 3
            }
        );
    }

    #[test]
    fn test_rejects_missing() {
        let sel = selection(vec![5, 1, -1, -1, -1, -1], 2);
        assert_eq!(
            verify(&INPUT, 0.9, &sel),
            Err(SelError::VerificationMismatch {
                missing: 1,
                unexpected: 0,
                duplicates: 0
            })
        );
    }

    #[test]
    fn test_rejects_extra() {
        let sel = selection(vec![5, 1, 3, 2, -1, -1], 4);
        assert_eq!(
            verify(&INPUT, 0.9, &sel),
            Err(SelError::VerificationMismatch {
                missing: 0,
                unexpected: 1,
                duplicates: 0
            })
        );
    }

    #[test]
    fn test_rejects_duplicate() {
        let sel = selection(vec![5, 1, 3, 3, -1, -1], 4);
        assert_eq!(
            verify(&INPUT, 0.9, &sel),
            Err(SelError::VerificationMismatch {
                missing: 0,
                unexpected: 0,
                duplicates: 1
            })
        );
    }

    #[test]
    fn test_rejects_dirty_tail() {
        let sel = selection(vec![5, 1, 3, -1, 4, -1], 3);
        assert_eq!(
            verify(&INPUT, 0.9, &sel),
            Err(SelError::VerificationMismatch {
                missing: 0,
                unexpected: 1,
                duplicates: 0
            })
        );
    }

    #[test]
    fn test_rejects_wrong_length() {
        let sel = selection(vec![1, 3, 5, -1], 3);
        assert!(matches!(verify(&INPUT, 0.9, &sel), Err(SelError::Device(_))));
    }

    #[test]
    fn test_diff_sorted() {
        assert_eq!(diff_sorted(&[1, 2, 3], &[1, 2, 3]), (0, 0));
        assert_eq!(diff_sorted(&[1, 2, 3], &[2, 4]), (2, 1));
        assert_eq!(diff_sorted(&[], &[7]), (0, 1));
    }
}
