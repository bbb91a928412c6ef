//! Consumer side of `unbucketize_permute` and per-partition views.

use rayon::prelude::*;

use crate::bucketize::BucketizedBatch;
use crate::error::{BucketizeError, Result};
use crate::index::SparseIndex;

/// Restores original element order: `out[i] = bucketed[permute[i]]`.
///
/// Used to bring per-element results (embeddings, gradients, weights) computed
/// in bucketized order back to the caller's order.
pub fn unbucketize<T, I>(bucketed: &[T], permute: &[I]) -> Result<Vec<T>>
where
    T: Copy + Send + Sync,
    I: SparseIndex,
{
    if bucketed.len() != permute.len() {
        return Err(BucketizeError::CountMismatch {
            what: "unbucketize_permute",
            expected: bucketed.len(),
            actual: permute.len(),
        });
    }
    let len = bucketed.len();
    permute
        .par_iter()
        .enumerate()
        .map(|(position, &slot)| {
            let target = slot.to_i64();
            if target < 0 || target as usize >= len {
                Err(BucketizeError::PermutationOutOfRange {
                    position,
                    target,
                    len,
                })
            } else {
                Ok(bucketed[target as usize])
            }
        })
        .collect()
}

/// One partition's share of a bucketized batch: what gets shipped to its shard.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PartitionView<'a, L, I, W> {
    pub partition: usize,
    /// One length per input row.
    pub lengths: &'a [L],
    pub indices: &'a [I],
    pub weights: Option<&'a [W]>,
    pub positions: Option<&'a [I]>,
}

impl<L: SparseIndex, I: SparseIndex, W: Copy + Send + Sync> BucketizedBatch<L, I, W> {
    /// Slices of partition `p`, or `None` when `p >= partition_count`.
    pub fn partition(&self, p: usize) -> Option<PartitionView<'_, L, I, W>> {
        let range = self.partition_range(p)?;
        let rows = self.num_rows();
        Some(PartitionView {
            partition: p,
            lengths: &self.new_lengths[p * rows..(p + 1) * rows],
            indices: &self.new_indices[range.clone()],
            weights: self.new_weights.as_deref().map(|w| &w[range.clone()]),
            positions: self.new_positions.as_deref().map(|x| &x[range]),
        })
    }

    /// Iterates all partitions in order.
    pub fn partitions(&self) -> impl Iterator<Item = PartitionView<'_, L, I, W>> + '_ {
        (0..self.partition_count).filter_map(|p| self.partition(p))
    }

    /// Brings `bucketed` (one value per output slot) back to input order.
    /// Needs a batch produced with `sequence = true`.
    pub fn restore<T: Copy + Send + Sync>(&self, bucketed: &[T]) -> Result<Vec<T>> {
        let permute = self.unbucketize_permute.as_deref().ok_or_else(|| {
            BucketizeError::invalid("unbucketize_permute", "bucketization ran without sequence")
        })?;
        unbucketize(bucketed, permute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbucketize() {
        let bucketed = ['c', 'a', 'b'];
        let permute = [1i32, 2, 0];
        assert_eq!(unbucketize(&bucketed, &permute).unwrap(), vec!['a', 'b', 'c']);
    }

    #[test]
    fn test_out_of_range() {
        let err = unbucketize(&[1u8, 2], &[0i64, 2]).unwrap_err();
        assert_eq!(
            err,
            BucketizeError::PermutationOutOfRange {
                position: 1,
                target: 2,
                len: 2
            }
        );
        assert!(matches!(
            unbucketize(&[1u8, 2], &[0i64]),
            Err(BucketizeError::CountMismatch { .. })
        ));
    }

    #[test]
    fn test_restore_requires_permutation() {
        let out: BucketizedBatch<i32, i32> = BucketizedBatch {
            partition_count: 1,
            new_lengths: vec![1],
            new_offsets: vec![0],
            new_indices: vec![3],
            new_weights: None,
            new_positions: None,
            unbucketize_permute: None,
        };
        assert!(out.restore(&[3i32]).is_err());
        let view = out.partition(0).unwrap();
        assert_eq!(view.indices, &[3]);
        assert_eq!(view.lengths, &[1]);
        assert!(out.partition(1).is_none());
    }
}
