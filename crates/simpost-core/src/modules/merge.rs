//! Pairwise reduction tree.
//!
//! Each round sums element `2i` with `2i + 1`; an odd trailing element passes
//! through untouched. Rounds repeat until two elements remain, and those two
//! are merged with [`MergeStep::is_final`] set so the caller can give the
//! result its externally visible name.

use crate::domain::{PipelineError, PipelineResult, WideVolume};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeStep {
    pub round: usize,
    pub pair: usize,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome<T> {
    Empty,
    /// A single operand is already the final result; nothing was merged.
    Single(T),
    Merged { value: T, rounds: usize },
}

impl<T> MergeOutcome<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Empty => None,
            Self::Single(value) | Self::Merged { value, .. } => Some(value),
        }
    }
}

pub fn reduce_pairwise<T, E, F>(items: Vec<T>, mut merge: F) -> Result<MergeOutcome<T>, E>
where
    F: FnMut(T, T, MergeStep) -> Result<T, E>,
{
    let mut current = items;
    match current.len() {
        0 => return Ok(MergeOutcome::Empty),
        1 => return Ok(MergeOutcome::Single(current.remove(0))),
        _ => {}
    }

    let mut round = 0;
    while current.len() > 2 {
        round += 1;
        let mut next = Vec::with_capacity(current.len().div_ceil(2));
        let mut operands = current.into_iter();
        let mut pair = 0;
        while let Some(left) = operands.next() {
            match operands.next() {
                Some(right) => {
                    next.push(merge(
                        left,
                        right,
                        MergeStep {
                            round,
                            pair,
                            is_final: false,
                        },
                    )?);
                    pair += 1;
                }
                None => next.push(left),
            }
        }
        current = next;
    }

    round += 1;
    let mut operands = current.into_iter();
    let (Some(left), Some(right)) = (operands.next(), operands.next()) else {
        unreachable!("reduction loop stops with exactly two operands");
    };
    let value = merge(
        left,
        right,
        MergeStep {
            round,
            pair: 0,
            is_final: true,
        },
    )?;
    Ok(MergeOutcome::Merged {
        value,
        rounds: round,
    })
}

/// Element-wise `left + right`.
pub fn merge_pair(left: WideVolume, right: &WideVolume) -> PipelineResult<WideVolume> {
    if left.shape() != right.shape() {
        return Err(PipelineError::group(
            "GROUP.MERGE_SHAPE",
            format!(
                "cannot merge volumes of shape {:?} and {:?}",
                left.shape(),
                right.shape()
            ),
        ));
    }
    let mut sum = left;
    for (total, value) in sum.data_mut().iter_mut().zip(right.data()) {
        *total += *value;
    }
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::{MergeOutcome, MergeStep, merge_pair, reduce_pairwise};
    use crate::domain::{PipelineError, WideVolume};

    fn volume(values: &[f64]) -> WideVolume {
        WideVolume::new(vec![values.len()], values.to_vec()).expect("volume")
    }

    #[test]
    fn merge_pair_is_element_wise_sum() {
        let sum = merge_pair(volume(&[1.0, 2.5, -3.0]), &volume(&[0.5, 0.5, 3.0]))
            .expect("same shapes");
        assert_eq!(sum.data(), &[1.5, 3.0, 0.0]);
    }

    #[test]
    fn merge_pair_rejects_shape_mismatch() {
        let error = merge_pair(volume(&[1.0, 2.0]), &volume(&[1.0])).expect_err("mismatch");
        assert_eq!(error.code(), "GROUP.MERGE_SHAPE");
    }

    #[test]
    fn tree_equals_full_sum_for_assorted_sizes() {
        for n in [1_usize, 2, 3, 4, 5, 7, 16] {
            let items: Vec<WideVolume> = (0..n)
                .map(|i| volume(&[i as f64 + 1.0, (i * i) as f64]))
                .collect();
            let expected_first: f64 = (1..=n).map(|i| i as f64).sum();
            let expected_second: f64 = (0..n).map(|i| (i * i) as f64).sum();

            let outcome = reduce_pairwise(items, |left, right, _step| {
                merge_pair(left, &right)
            })
            .expect("reduction");

            if n == 1 {
                assert!(matches!(outcome, MergeOutcome::Single(_)));
            }
            let value = outcome.into_value().expect("value");
            assert_eq!(value.data(), &[expected_first, expected_second], "n = {}", n);
        }
    }

    #[test]
    fn rounds_are_logarithmic_and_final_step_is_flagged_once() {
        for (n, expected_rounds) in [(2_usize, 1_usize), (3, 2), (4, 2), (5, 3), (7, 3), (16, 4)]
        {
            let mut steps: Vec<MergeStep> = Vec::new();
            let outcome = reduce_pairwise((0..n).collect::<Vec<usize>>(), |l, r, step| {
                steps.push(step);
                Ok::<_, PipelineError>(l + r)
            })
            .expect("reduction");

            match outcome {
                MergeOutcome::Merged { value, rounds } => {
                    assert_eq!(value, (0..n).sum::<usize>());
                    assert_eq!(rounds, expected_rounds, "n = {}", n);
                }
                other => panic!("expected merged outcome, got {:?}", other),
            }
            assert_eq!(steps.len(), n - 1);
            assert_eq!(steps.iter().filter(|step| step.is_final).count(), 1);
            assert!(steps.last().expect("steps").is_final);
        }
    }

    #[test]
    fn odd_remainder_passes_through_untouched() {
        let mut merged_pairs = Vec::new();
        let outcome = reduce_pairwise(
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            |l, r, step| {
                merged_pairs.push((l.clone(), r.clone(), step.round));
                Ok::<_, PipelineError>(format!("({}+{})", l, r))
            },
        )
        .expect("reduction");

        assert_eq!(
            merged_pairs,
            vec![
                ("a".to_string(), "b".to_string(), 1),
                ("(a+b)".to_string(), "c".to_string(), 2),
            ]
        );
        assert_eq!(outcome.into_value().as_deref(), Some("((a+b)+c)"));
    }

    #[test]
    fn empty_input_is_empty_outcome() {
        let outcome = reduce_pairwise(Vec::<u8>::new(), |l, r, _| Ok::<_, PipelineError>(l + r))
            .expect("reduction");
        assert_eq!(outcome, MergeOutcome::Empty);
    }

    #[test]
    fn merge_errors_stop_the_reduction() {
        let mut calls = 0;
        let result = reduce_pairwise(vec![1, 2, 3, 4], |_, _, _| {
            calls += 1;
            Err::<i32, _>(PipelineError::group("GROUP.MERGE", "boom"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
