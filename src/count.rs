//! Pass 1: per-(partition,row) element counts.
//!
//! Rows are spread over the rayon pool; rows longer than [`ROW_SPLIT`] are
//! additionally split element-wise, so several workers may bump the same
//! counter. Every bump is an atomic `fetch_add`, a lost update here would
//! shift every downstream offset.

use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;

use crate::bucketize::RoutingPlan;
use crate::disjoint::DisjointSlice;
use crate::index::SparseIndex;

/// Rows at least this long are counted element-parallel.
pub(crate) const ROW_SPLIT: usize = 2048;

/// Atomic counter per (partition, row) cell, laid out partition-major.
pub(crate) struct PartitionCounters {
    rows: usize,
    cells: Vec<AtomicUsize>,
}

impl PartitionCounters {
    pub(crate) fn new(partitions: usize, rows: usize) -> Self {
        Self {
            rows,
            cells: (0..partitions * rows).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    #[inline]
    pub(crate) fn increment(&self, partition: usize, row: usize) {
        self.cells[partition * self.rows + row].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn into_counts(self) -> Vec<usize> {
        self.cells.into_iter().map(AtomicUsize::into_inner).collect()
    }
}

/// Counts destinations for every element and, when `bucket_cache` is given,
/// stores each element's boundary bucket for the scatter pass.
pub(crate) fn count_pass<I: SparseIndex>(
    plan: &RoutingPlan<'_>,
    indices: &[I],
    bucket_cache: Option<&mut [i32]>,
) -> Vec<usize> {
    let rows = plan.num_rows();
    let counters = PartitionCounters::new(plan.partitions, rows);
    let cache = bucket_cache.map(DisjointSlice::new);

    (0..rows).into_par_iter().for_each(|b_t| {
        let route = plan.route_of_row(b_t);
        let range = plan.row_range(b_t);
        let count_one = |i: usize| {
            let key = indices[i].to_i64();
            let bucket = route.resolve_bucket(key);
            if let Some(cache) = &cache {
                // SAFETY: element i belongs to exactly one row and is visited once.
                unsafe { cache.write(i, bucket as i32) };
            }
            let dst = route.destination(key, bucket, plan.partitions, plan.keep_orig_idx);
            counters.increment(dst.partition, b_t);
        };
        if range.len() >= ROW_SPLIT {
            range.into_par_iter().for_each(count_one);
        } else {
            range.for_each(count_one);
        }
    });

    counters.into_counts()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucketize::{RoutingPlan, RowFeatures};
    use crate::policy::FeatureRoute;
    use crate::scan::exclusive_scan;

    fn plan(lengths: Vec<usize>, routes: Vec<FeatureRoute<'_>>, partitions: usize) -> RoutingPlan<'_> {
        let local_batch = lengths.len() / routes.len();
        RoutingPlan {
            partitions,
            keep_orig_idx: false,
            row_offsets: exclusive_scan(&lengths),
            lengths,
            rows: RowFeatures::Uniform { local_batch },
            routes,
        }
    }

    #[test]
    fn test_counts_block() {
        // one feature, two rows: [5, 15] and [0, 11, 3]
        let p = plan(vec![2, 3], vec![FeatureRoute::Block { block_size: 4 }], 3);
        let counts = count_pass(&p, &[5i64, 15, 0, 11, 3], None);
        // partition-major: [p0r0, p0r1, p1r0, p1r1, p2r0, p2r1]
        assert_eq!(counts, vec![1, 2, 1, 0, 0, 1]);
    }

    #[test]
    fn test_long_row_matches_short_rows() {
        let n = ROW_SPLIT * 3 + 5;
        let keys: Vec<i64> = (0..n as i64).map(|k| k * 31 % 1000).collect();
        let routes = vec![FeatureRoute::RoundRobin];
        let long = plan(vec![n], routes.clone(), 7);
        let counts = count_pass(&long, &keys, None);
        assert_eq!(counts.iter().sum::<usize>(), n);
        for (q, &c) in counts.iter().enumerate() {
            let expected = keys.iter().filter(|&&k| k.rem_euclid(7) as usize == q).count();
            assert_eq!(c, expected);
        }
    }

    #[test]
    fn test_bucket_cache() {
        let bounds = [0i64, 10, 10, 25];
        let p = plan(vec![4], vec![FeatureRoute::Boundaries { bounds: &bounds }], 3);
        let mut cache = vec![-9i32; 4];
        let counts = count_pass(&p, &[10i64, 3, 30, 24], Some(&mut cache));
        assert_eq!(cache, vec![2, 0, 3, 2]);
        // 30 falls back to 30 % 3 = 0
        assert_eq!(counts, vec![2, 0, 2]);
    }
}
