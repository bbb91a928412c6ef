//! Row → feature lookup for ragged batches.
//!
//! With per-feature batch sizes the flattened rows of one feature no longer
//! start at `t * B`, so the owning feature of a row is materialised up front.
//! The table is filled by broadcasting over a padded `features × max_local_batch`
//! grid: cell `(t, b)` is live iff `b < batch_size_per_feature[t]` and writes `t`
//! at `batch_size_offsets[t] + b`. Padding cells do nothing.

use rayon::prelude::*;

use crate::disjoint::DisjointSlice;
use crate::error::{BucketizeError, Result};
use crate::scan;

/// Builds `length_to_feature_idx`, one feature id per flattened row.
///
/// Fails when a feature's batch size exceeds `max_local_batch` or when
/// `max_local_batch` is zero while rows exist.
pub fn resolve_feature_indices(
    batch_size_per_feature: &[usize],
    max_local_batch: usize,
) -> Result<Vec<u32>> {
    let nfeat = batch_size_per_feature.len();
    if max_local_batch == 0 && batch_size_per_feature.iter().any(|&b| b > 0) {
        return Err(BucketizeError::MissingMaxLocalBatch);
    }
    if let Some((feature, &batch_size)) = batch_size_per_feature
        .iter()
        .enumerate()
        .find(|&(_, &b)| b > max_local_batch)
    {
        return Err(BucketizeError::RaggedBatchOverflow {
            feature,
            batch_size,
            max_local_batch,
        });
    }
    let grid = nfeat
        .checked_mul(max_local_batch)
        .ok_or_else(|| BucketizeError::invalid("max_local_batch", "resolver grid overflows"))?;
    scan::check_scan_capacity(grid)?;

    let batch_size_offsets = scan::par_exclusive_scan(batch_size_per_feature)?;
    let total: usize = batch_size_per_feature.iter().sum();

    let mut length_to_feature_idx = vec![0u32; total];
    let out = DisjointSlice::new(&mut length_to_feature_idx);
    (0..grid).into_par_iter().for_each(|cell| {
        let t = cell / max_local_batch;
        let b = cell % max_local_batch;
        if b >= batch_size_per_feature[t] {
            return;
        }
        let row = batch_size_offsets[t] + b;
        if row < out.len() {
            // SAFETY: offsets are the exclusive scan of the batch sizes, so
            // every live cell owns a distinct row.
            unsafe { out.write(row, t as u32) };
        }
    });

    Ok(length_to_feature_idx)
}
