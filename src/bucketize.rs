//! Orchestrator: shape checks, row layout, count pass, rescan, scatter pass.

use std::ops::Range;
use std::time::Instant;

use log::debug;

use crate::count::count_pass;
use crate::disjoint::DisjointSlice;
use crate::error::{BucketizeError, Result};
use crate::index::SparseIndex;
use crate::policy::{BoundaryTable, FeatureRoute, NO_BUCKET};
use crate::resolver::resolve_feature_indices;
use crate::scan;
use crate::scatter::{ScatterInputs, ScatterOutputs, ScatterVariant, scatter_pass};

/// A batch of sparse bags, one bag per (feature, row), feature-major.
#[derive(Clone, Copy, Debug)]
pub struct SparseBatch<'a, L, I, W = f32> {
    pub lengths: &'a [L],
    pub indices: &'a [I],
    pub weights: Option<&'a [W]>,
}

impl<'a, L, I, W> SparseBatch<'a, L, I, W> {
    pub fn new(lengths: &'a [L], indices: &'a [I]) -> Self {
        Self {
            lengths,
            indices,
            weights: None,
        }
    }

    pub fn with_weights(mut self, weights: &'a [W]) -> Self {
        self.weights = Some(weights);
        self
    }
}

/// Everything besides the batch that shapes one bucketization call.
#[derive(Clone, Copy, Debug)]
pub struct BucketizeParams<'a> {
    /// Number of destination partitions `P`.
    pub partition_count: usize,
    /// Block width per feature; its length defines the feature count `T`.
    pub block_sizes: &'a [i64],
    /// Non-zero entries select round-robin for that feature.
    pub dist_type_per_feature: &'a [i32],
    /// Emit `unbucketize_permute`.
    pub sequence: bool,
    /// Emit intra-row positions.
    pub bucketize_pos: bool,
    /// Store original keys instead of block/boundary-relative ones.
    pub keep_orig_idx: bool,
    /// Per-feature local batch for ragged batches.
    pub batch_size_per_feature: Option<&'a [i64]>,
    /// Padding bound of the resolver grid; required with `batch_size_per_feature`.
    pub max_local_batch: usize,
    /// Explicit per-feature cut points.
    pub boundaries: Option<&'a BoundaryTable>,
}

impl<'a> BucketizeParams<'a> {
    pub fn new(partition_count: usize, block_sizes: &'a [i64], dist_type_per_feature: &'a [i32]) -> Self {
        Self {
            partition_count,
            block_sizes,
            dist_type_per_feature,
            sequence: false,
            bucketize_pos: false,
            keep_orig_idx: false,
            batch_size_per_feature: None,
            max_local_batch: 0,
            boundaries: None,
        }
    }

    pub fn sequence(mut self, on: bool) -> Self {
        self.sequence = on;
        self
    }

    pub fn bucketize_pos(mut self, on: bool) -> Self {
        self.bucketize_pos = on;
        self
    }

    pub fn keep_orig_idx(mut self, on: bool) -> Self {
        self.keep_orig_idx = on;
        self
    }

    pub fn ragged(mut self, batch_size_per_feature: &'a [i64], max_local_batch: usize) -> Self {
        self.batch_size_per_feature = Some(batch_size_per_feature);
        self.max_local_batch = max_local_batch;
        self
    }

    pub fn boundaries(mut self, table: &'a BoundaryTable) -> Self {
        self.boundaries = Some(table);
        self
    }

    fn num_features(&self) -> usize {
        self.block_sizes.len()
    }
}

/// Result of [`bucketize`]. Per-cell buffers are partition-major:
/// cell `(p, row)` lives at `p * num_rows + row`.
#[derive(Clone, Debug, PartialEq)]
pub struct BucketizedBatch<L, I, W = f32> {
    pub partition_count: usize,
    pub new_lengths: Vec<L>,
    pub new_offsets: Vec<L>,
    pub new_indices: Vec<I>,
    pub new_weights: Option<Vec<W>>,
    pub new_positions: Option<Vec<I>>,
    pub unbucketize_permute: Option<Vec<I>>,
}

/// The five buffers handed back to callers of the flat interface.
pub type BucketizedParts<L, I, W> = (Vec<L>, Vec<I>, Option<Vec<W>>, Option<Vec<I>>, Option<Vec<I>>);

impl<L: SparseIndex, I: SparseIndex, W> BucketizedBatch<L, I, W> {
    /// Rows of the input batch, i.e. cells per partition.
    pub fn num_rows(&self) -> usize {
        if self.partition_count == 0 {
            0
        } else {
            self.new_lengths.len() / self.partition_count
        }
    }

    /// `(new_lengths, new_indices, new_weights, new_positions, unbucketize_permute)`.
    pub fn into_parts(self) -> BucketizedParts<L, I, W> {
        (
            self.new_lengths,
            self.new_indices,
            self.new_weights,
            self.new_positions,
            self.unbucketize_permute,
        )
    }

    /// Element range of partition `p` inside the bucketized buffers.
    pub fn partition_range(&self, p: usize) -> Option<Range<usize>> {
        if p >= self.partition_count {
            return None;
        }
        let rows = self.num_rows();
        if rows == 0 {
            return Some(0..0);
        }
        let start = self.new_offsets[p * rows].to_i64() as usize;
        let end = if p + 1 < self.partition_count {
            self.new_offsets[(p + 1) * rows].to_i64() as usize
        } else {
            self.new_indices.len()
        };
        Some(start..end)
    }
}

/// Row layout and per-feature routes shared by both passes.
pub(crate) struct RoutingPlan<'a> {
    pub partitions: usize,
    pub keep_orig_idx: bool,
    pub lengths: Vec<usize>,
    pub row_offsets: Vec<usize>,
    pub rows: RowFeatures,
    pub routes: Vec<FeatureRoute<'a>>,
}

pub(crate) enum RowFeatures {
    Uniform { local_batch: usize },
    Ragged { length_to_feature_idx: Vec<u32> },
}

impl RoutingPlan<'_> {
    #[inline]
    pub(crate) fn num_rows(&self) -> usize {
        self.lengths.len()
    }

    #[inline]
    pub(crate) fn feature_of_row(&self, b_t: usize) -> usize {
        match &self.rows {
            RowFeatures::Uniform { local_batch } => b_t / local_batch,
            RowFeatures::Ragged {
                length_to_feature_idx,
            } => length_to_feature_idx[b_t] as usize,
        }
    }

    #[inline]
    pub(crate) fn route_of_row(&self, b_t: usize) -> &FeatureRoute<'_> {
        &self.routes[self.feature_of_row(b_t)]
    }

    #[inline]
    pub(crate) fn row_range(&self, b_t: usize) -> Range<usize> {
        let start = self.row_offsets[b_t];
        start..start + self.lengths[b_t]
    }
}

fn to_counts<L: SparseIndex>(
    values: &[L],
    on_negative: impl Fn(usize, i64) -> BucketizeError,
) -> Result<Vec<usize>> {
    values
        .iter()
        .enumerate()
        .map(|(row, v)| match v.to_i64() {
            v if v < 0 => Err(on_negative(row, v)),
            v => Ok(v as usize),
        })
        .collect()
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(BucketizeError::CountMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

enum Layout {
    Uniform,
    Ragged(Vec<usize>),
}

/// Checks every caller contract; nothing is dispatched before this passes.
fn validate<L: SparseIndex, I, W>(
    batch: &SparseBatch<'_, L, I, W>,
    params: &BucketizeParams<'_>,
) -> Result<(Vec<usize>, Layout)> {
    let nfeat = params.num_features();
    let nrows = batch.lengths.len();

    if params.partition_count == 0 {
        return Err(BucketizeError::invalid("partition_count", "must be positive"));
    }
    check_len("dist_type_per_feature", nfeat, params.dist_type_per_feature.len())?;
    if let Some(tbl) = params.boundaries {
        check_len("boundary features", nfeat, tbl.num_features())?;
    }

    let lengths = to_counts(batch.lengths, |row, value| BucketizeError::NegativeLength { row, value })?;
    let lengths_total: usize = lengths.iter().sum();
    if lengths_total != batch.indices.len() {
        return Err(BucketizeError::LengthMismatch {
            lengths_total,
            indices: batch.indices.len(),
        });
    }
    if let Some(w) = batch.weights {
        check_len("weights", batch.indices.len(), w.len())?;
    }

    let layout = match params.batch_size_per_feature {
        Some(bspf) => {
            check_len("batch_size_per_feature", nfeat, bspf.len())?;
            if params.max_local_batch == 0 {
                return Err(BucketizeError::MissingMaxLocalBatch);
            }
            let bspf = to_counts(bspf, |t, v| {
                BucketizeError::invalid("batch_size_per_feature", format!("negative entry {v} for feature {t}"))
            })?;
            check_len("lengths", bspf.iter().sum(), nrows)?;
            Layout::Ragged(bspf)
        }
        None => {
            if nfeat == 0 {
                if nrows != 0 {
                    return Err(BucketizeError::invalid("block_sizes", "no features for a non-empty batch"));
                }
            } else if nrows % nfeat != 0 {
                return Err(BucketizeError::invalid(
                    "lengths",
                    format!("{nrows} rows do not split evenly over {nfeat} features"),
                ));
            }
            Layout::Uniform
        }
    };

    scan::check_scan_capacity(batch.indices.len())?;
    let cells = nrows
        .checked_mul(params.partition_count)
        .ok_or(BucketizeError::ScanCapacity {
            count: usize::MAX,
            limit: scan::SCAN_LIMIT,
        })?;
    scan::check_scan_capacity(cells)?;

    Ok((lengths, layout))
}

pub(crate) fn empty_result<L, I, W>(batch: &SparseBatch<'_, L, I, W>, params: &BucketizeParams<'_>) -> BucketizedBatch<L, I, W> {
    BucketizedBatch {
        partition_count: params.partition_count,
        new_lengths: Vec::new(),
        new_offsets: Vec::new(),
        new_indices: Vec::new(),
        new_weights: batch.weights.map(|_| Vec::new()),
        new_positions: params.bucketize_pos.then(Vec::new),
        unbucketize_permute: params.sequence.then(Vec::new),
    }
}

/// Builds the validated row layout and routes. Shared with the CUDA path.
pub(crate) fn plan<'p, L: SparseIndex, I, W>(
    batch: &SparseBatch<'_, L, I, W>,
    params: &BucketizeParams<'p>,
) -> Result<Option<RoutingPlan<'p>>> {
    let (lengths, layout) = validate(batch, params)?;
    if lengths.is_empty() {
        return Ok(None);
    }

    let rows = match layout {
        Layout::Uniform => RowFeatures::Uniform {
            local_batch: lengths.len() / params.num_features(),
        },
        Layout::Ragged(bspf) => RowFeatures::Ragged {
            length_to_feature_idx: resolve_feature_indices(&bspf, params.max_local_batch)?,
        },
    };
    let routes = (0..params.num_features())
        .map(|t| {
            FeatureRoute::for_feature(
                t,
                params.dist_type_per_feature[t],
                params.block_sizes[t],
                params.boundaries,
            )
        })
        .collect();
    let row_offsets = scan::par_exclusive_scan(&lengths)?;

    Ok(Some(RoutingPlan {
        partitions: params.partition_count,
        keep_orig_idx: params.keep_orig_idx,
        lengths,
        row_offsets,
        rows,
        routes,
    }))
}

/// Bucketizes `batch` into `params.partition_count` partitions.
///
/// Output cell `(p, row)` holds the elements of input row `row` that route to
/// partition `p`, in their original order. Identical inputs give identical
/// outputs regardless of thread count.
pub fn bucketize<L, I, W>(
    batch: &SparseBatch<'_, L, I, W>,
    params: &BucketizeParams<'_>,
) -> Result<BucketizedBatch<L, I, W>>
where
    L: SparseIndex,
    I: SparseIndex,
    W: Copy + Send + Sync + Default,
{
    let t0 = Instant::now();
    let Some(plan) = plan(batch, params)? else {
        return Ok(empty_result(batch, params));
    };
    let nidx = batch.indices.len();
    let variant = ScatterVariant {
        sequence: params.sequence,
        weighted: batch.weights.is_some(),
        positions: params.bucketize_pos,
        boundaries: params.boundaries.is_some(),
    };
    debug!(
        "bucketize: rows={} features={} partitions={} elements={} variant={}",
        plan.num_rows(),
        plan.routes.len(),
        plan.partitions,
        nidx,
        variant.id()
    );

    /* -------- pass 1: counts -------- */
    let t1 = Instant::now();
    let mut bucket_cache = variant.boundaries.then(|| vec![NO_BUCKET as i32; nidx]);
    let counts = count_pass(&plan, batch.indices, bucket_cache.as_deref_mut());
    let new_offsets = scan::par_exclusive_scan(&counts)?;
    debug!("pass-1 counts + rescan {:>6} us", t1.elapsed().as_micros());

    /* -------- pass 2: scatter -------- */
    let t2 = Instant::now();
    let mut new_indices = vec![I::default(); nidx];
    let mut new_weights = batch.weights.map(|_| vec![W::default(); nidx]);
    let mut new_positions = params.bucketize_pos.then(|| vec![I::default(); nidx]);
    let mut unbucketize_permute = params.sequence.then(|| vec![I::default(); nidx]);
    {
        let inputs = ScatterInputs {
            indices: batch.indices,
            weights: batch.weights,
            bucket_cache: bucket_cache.as_deref(),
            new_offsets: &new_offsets,
        };
        let outputs = ScatterOutputs {
            indices: DisjointSlice::new(&mut new_indices),
            weights: new_weights.as_deref_mut().map(DisjointSlice::new),
            positions: new_positions.as_deref_mut().map(DisjointSlice::new),
            permute: unbucketize_permute.as_deref_mut().map(DisjointSlice::new),
        };
        scatter_pass(&plan, variant, &inputs, &outputs);
    }
    debug!("pass-2 scatter {:>6} us", t2.elapsed().as_micros());
    debug!("bucketize total {:>6} us", t0.elapsed().as_micros());

    Ok(BucketizedBatch {
        partition_count: plan.partitions,
        new_lengths: counts.into_iter().map(L::from_usize).collect(),
        new_offsets: new_offsets.into_iter().map(L::from_usize).collect(),
        new_indices,
        new_weights,
        new_positions,
        unbucketize_permute,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_batch() {
        let lengths: [i64; 0] = [];
        let indices: [i64; 0] = [];
        let batch = SparseBatch::<i64, i64>::new(&lengths, &indices);
        let params = BucketizeParams::new(4, &[8, 8], &[0, 0]).sequence(true);
        let out = bucketize(&batch, &params).unwrap();
        assert!(out.new_lengths.is_empty());
        assert!(out.new_indices.is_empty());
        assert_eq!(out.unbucketize_permute, Some(vec![]));
        assert_eq!(out.new_positions, None);
        assert_eq!(out.partition_range(3), Some(0..0));
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let batch = SparseBatch::<i32, i32>::new(&[2, 1], &[1, 2]);
        let params = BucketizeParams::new(2, &[4], &[0]);
        assert_eq!(
            bucketize(&batch, &params).unwrap_err(),
            BucketizeError::LengthMismatch {
                lengths_total: 3,
                indices: 2
            }
        );
    }

    #[test]
    fn test_rejects_uneven_rows() {
        let batch = SparseBatch::<i32, i32>::new(&[1, 1, 1], &[1, 2, 3]);
        let params = BucketizeParams::new(2, &[4, 4], &[0, 0]);
        assert!(matches!(
            bucketize(&batch, &params),
            Err(BucketizeError::InvalidArgument { arg: "lengths", .. })
        ));
    }

    #[test]
    fn test_rejects_bad_weights_and_negative_lengths() {
        let weights = [1.0f32];
        let batch = SparseBatch::<i32, i32>::new(&[1, 1], &[1, 2]).with_weights(&weights);
        let params = BucketizeParams::new(2, &[4], &[0]);
        assert_eq!(
            bucketize(&batch, &params).unwrap_err(),
            BucketizeError::CountMismatch {
                what: "weights",
                expected: 2,
                actual: 1
            }
        );

        let batch = SparseBatch::<i32, i32>::new(&[-1, 2], &[1]);
        assert_eq!(
            bucketize(&batch, &params).unwrap_err(),
            BucketizeError::NegativeLength { row: 0, value: -1 }
        );
    }

    #[test]
    fn test_rejects_missing_max_local_batch() {
        let batch = SparseBatch::<i32, i32>::new(&[1, 1, 1], &[1, 2, 3]);
        let params = BucketizeParams::new(2, &[4, 4], &[0, 0]).ragged(&[1, 2], 0);
        assert_eq!(
            bucketize(&batch, &params).unwrap_err(),
            BucketizeError::MissingMaxLocalBatch
        );
    }

    #[test]
    fn test_rejects_zero_partitions() {
        let batch = SparseBatch::<i32, i32>::new(&[1], &[1]);
        let params = BucketizeParams::new(0, &[4], &[0]);
        assert!(matches!(
            bucketize(&batch, &params),
            Err(BucketizeError::InvalidArgument {
                arg: "partition_count",
                ..
            })
        ));
    }

    #[test]
    fn test_block_example() {
        // block_size 4, P 3: 5 -> (1, 1), 15 -> (0, 5)
        let batch = SparseBatch::<i64, i64>::new(&[2], &[5, 15]);
        let params = BucketizeParams::new(3, &[4], &[0]);
        let out = bucketize(&batch, &params).unwrap();
        assert_eq!(out.new_lengths, vec![1, 1, 0]);
        assert_eq!(out.new_offsets, vec![0, 1, 2]);
        assert_eq!(out.new_indices, vec![5, 1]);
        assert_eq!(out.partition_range(0), Some(0..1));
        assert_eq!(out.partition_range(2), Some(2..2));
        assert_eq!(out.partition_range(3), None);
    }
}
