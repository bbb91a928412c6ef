//! Distribution policies and the routing rule shared by both passes.
//!
//! Pass 1 (count) and pass 2 (scatter) must agree on every element's
//! destination, so both go through [`FeatureRoute::destination`]; for explicit
//! boundaries the binary search runs once in pass 1 and its result is cached.

use crate::error::{BucketizeError, Result};

/// How a feature's key space is split across partitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistributionPolicy {
    /// `key / block_size`, modulo fallback outside `[0, block_size * P)`.
    Block,
    /// `key % P`.
    RoundRobin,
    /// Last boundary `<= key`, modulo fallback outside the table.
    ExplicitBoundaries,
}

/// Marker for "no boundary bucket resolved".
pub(crate) const NO_BUCKET: i64 = -1;

/// Ragged per-feature boundary table, concatenated with an offset index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BoundaryTable {
    values: Vec<i64>,
    offsets: Vec<usize>,
}

impl BoundaryTable {
    /// Builds the table from one ascending cut-point list per feature.
    /// An empty list leaves that feature on its block policy.
    pub fn new<S: AsRef<[i64]>>(per_feature: &[S]) -> Result<Self> {
        let mut values = Vec::new();
        let mut offsets = Vec::with_capacity(per_feature.len() + 1);
        offsets.push(0);
        for (feature, bounds) in per_feature.iter().enumerate() {
            let bounds = bounds.as_ref();
            if let Some(k) = bounds.windows(2).position(|w| w[0] > w[1]) {
                return Err(BucketizeError::UnsortedBoundaries {
                    feature,
                    position: k + 1,
                });
            }
            values.extend_from_slice(bounds);
            offsets.push(values.len());
        }
        Ok(Self { values, offsets })
    }

    /// Number of features covered.
    pub fn num_features(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Cut points of feature `t`.
    pub fn feature(&self, t: usize) -> &[i64] {
        &self.values[self.offsets[t]..self.offsets[t + 1]]
    }

    /// Concatenated cut points.
    pub fn values(&self) -> &[i64] {
        &self.values
    }

    /// `features + 1` slice offsets into [`Self::values`].
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }
}

/// Bucket of `key` in an ascending cut list: the last `k` with `bounds[k] <= key`,
/// `-1` when `key` precedes every cut. Equal cuts resolve to the later one.
#[inline]
pub fn boundary_bucket(bounds: &[i64], key: i64) -> i64 {
    bounds.partition_point(|&b| b <= key) as i64 - 1
}

/// Where one element goes and what key it is stored under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Destination {
    pub partition: usize,
    pub index: i64,
}

/// A feature's policy with its parameters bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureRoute<'a> {
    Block { block_size: i64 },
    RoundRobin,
    Boundaries { bounds: &'a [i64] },
}

impl<'a> FeatureRoute<'a> {
    /// Picks the route for feature `t`. A non-zero `dist_type` means round-robin;
    /// otherwise a non-empty boundary slice wins over the block size.
    pub fn for_feature(
        t: usize,
        dist_type: i32,
        block_size: i64,
        boundaries: Option<&'a BoundaryTable>,
    ) -> Self {
        if dist_type != 0 {
            return FeatureRoute::RoundRobin;
        }
        match boundaries.map(|tbl| tbl.feature(t)) {
            Some(bounds) if !bounds.is_empty() => FeatureRoute::Boundaries { bounds },
            _ => FeatureRoute::Block { block_size },
        }
    }

    pub fn policy(&self) -> DistributionPolicy {
        match self {
            FeatureRoute::Block { .. } => DistributionPolicy::Block,
            FeatureRoute::RoundRobin => DistributionPolicy::RoundRobin,
            FeatureRoute::Boundaries { .. } => DistributionPolicy::ExplicitBoundaries,
        }
    }

    /// Boundary bucket of `key`, or [`NO_BUCKET`] for the other policies.
    #[inline]
    pub(crate) fn resolve_bucket(&self, key: i64) -> i64 {
        match self {
            FeatureRoute::Boundaries { bounds } => boundary_bucket(bounds, key),
            _ => NO_BUCKET,
        }
    }

    /// Destination of `key`; `bucket` must come from [`Self::resolve_bucket`].
    #[inline]
    pub(crate) fn destination(
        &self,
        key: i64,
        bucket: i64,
        partitions: usize,
        keep_orig_idx: bool,
    ) -> Destination {
        let p = partitions as i64;
        match *self {
            FeatureRoute::Block { block_size } => {
                if block_size > 0 && key >= 0 && key < block_size.saturating_mul(p) {
                    Destination {
                        partition: (key / block_size) as usize,
                        index: if keep_orig_idx { key } else { key % block_size },
                    }
                } else {
                    fallback(key, p, keep_orig_idx)
                }
            }
            FeatureRoute::RoundRobin => Destination {
                partition: key.rem_euclid(p) as usize,
                index: key,
            },
            FeatureRoute::Boundaries { bounds } => {
                if bucket >= 0 && bucket < p {
                    Destination {
                        partition: bucket as usize,
                        index: if keep_orig_idx {
                            key
                        } else {
                            key.wrapping_sub(bounds[bucket as usize])
                        },
                    }
                } else {
                    fallback(key, p, keep_orig_idx)
                }
            }
        }
    }

    /// Single-shot routing without a cached bucket.
    pub fn route(&self, key: i64, partitions: usize, keep_orig_idx: bool) -> Destination {
        self.destination(key, self.resolve_bucket(key), partitions, keep_orig_idx)
    }
}

// raw / unhashed keys
#[inline]
fn fallback(key: i64, p: i64, keep_orig_idx: bool) -> Destination {
    Destination {
        partition: key.rem_euclid(p) as usize,
        index: if keep_orig_idx { key } else { key.div_euclid(p) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tie_break_takes_last_equal_boundary() {
        let bounds = [0i64, 10, 10, 25];
        assert_eq!(boundary_bucket(&bounds, 10), 2);
        assert_eq!(boundary_bucket(&bounds, 9), 0);
        assert_eq!(boundary_bucket(&bounds, 25), 3);
        assert_eq!(boundary_bucket(&bounds, -1), -1);
    }

    #[test]
    fn test_block_in_range_and_fallback() {
        let r = FeatureRoute::Block { block_size: 4 };
        assert_eq!(r.route(5, 3, false), Destination { partition: 1, index: 1 });
        assert_eq!(r.route(15, 3, false), Destination { partition: 0, index: 5 });
        assert_eq!(r.route(11, 3, false), Destination { partition: 2, index: 3 });
        assert_eq!(r.route(12, 3, false), Destination { partition: 0, index: 4 });
    }

    #[test]
    fn test_keep_orig_idx() {
        let r = FeatureRoute::Block { block_size: 4 };
        assert_eq!(r.route(5, 3, true), Destination { partition: 1, index: 5 });
        assert_eq!(r.route(15, 3, true), Destination { partition: 0, index: 15 });
    }

    #[test]
    fn test_negative_and_degenerate_keys_stay_in_range() {
        let block = FeatureRoute::Block { block_size: 4 };
        let d = block.route(-7, 3, false);
        assert_eq!(d, Destination { partition: 2, index: -3 });

        let zero = FeatureRoute::Block { block_size: 0 };
        assert_eq!(zero.route(7, 3, false), Destination { partition: 1, index: 2 });

        let rr = FeatureRoute::RoundRobin;
        assert_eq!(rr.route(-1, 4, false), Destination { partition: 3, index: -1 });
        assert_eq!(rr.route(i64::MIN, 5, false).partition, i64::MIN.rem_euclid(5) as usize);
    }

    #[test]
    fn test_round_robin_keeps_key() {
        let rr = FeatureRoute::RoundRobin;
        assert_eq!(rr.route(14, 4, false), Destination { partition: 2, index: 14 });
    }

    #[test]
    fn test_boundaries() {
        let bounds = [0i64, 10, 10, 25];
        let r = FeatureRoute::Boundaries { bounds: &bounds };
        // P = 3: buckets 0..=2 valid
        assert_eq!(r.route(3, 3, false), Destination { partition: 0, index: 3 });
        assert_eq!(r.route(10, 3, false), Destination { partition: 2, index: 0 });
        assert_eq!(r.route(24, 3, false), Destination { partition: 2, index: 14 });
        // bucket 3 >= P
        assert_eq!(r.route(30, 3, false), Destination { partition: 0, index: 10 });
        // before the first cut
        assert_eq!(r.route(-4, 3, false), Destination { partition: 2, index: -2 });
    }

    #[test]
    fn test_feature_selection() {
        let tbl = BoundaryTable::new(&[vec![0i64, 5], vec![]]).unwrap();
        assert_eq!(
            FeatureRoute::for_feature(0, 0, 8, Some(&tbl)).policy(),
            DistributionPolicy::ExplicitBoundaries
        );
        assert_eq!(
            FeatureRoute::for_feature(1, 0, 8, Some(&tbl)),
            FeatureRoute::Block { block_size: 8 }
        );
        assert_eq!(
            FeatureRoute::for_feature(0, 1, 8, Some(&tbl)),
            FeatureRoute::RoundRobin
        );
    }

    #[test]
    fn test_unsorted_table() {
        let err = BoundaryTable::new(&[vec![0i64, 5], vec![3, 9, 4]]).unwrap_err();
        assert_eq!(err, BucketizeError::UnsortedBoundaries { feature: 1, position: 2 });
    }

    #[test]
    fn test_table_layout() {
        let tbl = BoundaryTable::new(&[vec![0i64, 5], vec![], vec![1, 2, 3]]).unwrap();
        assert_eq!(tbl.num_features(), 3);
        assert_eq!(tbl.offsets(), &[0, 2, 2, 5]);
        assert_eq!(tbl.feature(2), &[1, 2, 3]);
        assert!(tbl.feature(1).is_empty());
    }

    #[test]
    fn test_boundary_index_wraps_on_extreme_key() {
        let bounds = [-10i64];
        let r = FeatureRoute::Boundaries { bounds: &bounds };
        assert_eq!(
            r.route(i64::MAX, 2, false),
            Destination {
                partition: 0,
                index: i64::MAX.wrapping_sub(-10)
            }
        );
        assert_eq!(r.route(i64::MAX, 2, true).index, i64::MAX);
    }
}
