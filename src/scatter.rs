//! Pass 2: write every element into its bucketed slot.
//!
//! Each row is handled by one worker, which keeps one cursor per partition
//! seeded at `new_offsets[partition, row]`. Rows own disjoint slot ranges, so
//! the writes need no synchronisation.
//!
//! The four optional behaviours (permutation, weights, positions, cached
//! boundary buckets) are const parameters: the sixteen combinations are
//! monomorphised and picked once in [`scatter_pass`], keeping flag checks out
//! of the per-element loop. The shared outputs (`new_indices`) do not depend on
//! the variant.

use rayon::prelude::*;

use crate::bucketize::RoutingPlan;
use crate::disjoint::DisjointSlice;
use crate::index::SparseIndex;

/// Which auxiliary outputs the scatter pass produces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ScatterVariant {
    /// Emit `unbucketize_permute`.
    pub sequence: bool,
    /// Carry weights along.
    pub weighted: bool,
    /// Emit intra-row positions.
    pub positions: bool,
    /// Reuse boundary buckets cached by the count pass.
    pub boundaries: bool,
}

impl ScatterVariant {
    /// Stable id in `0..16`.
    pub fn id(&self) -> usize {
        (self.sequence as usize) << 3
            | (self.weighted as usize) << 2
            | (self.positions as usize) << 1
            | self.boundaries as usize
    }
}

pub(crate) struct ScatterInputs<'a, I, W> {
    pub indices: &'a [I],
    pub weights: Option<&'a [W]>,
    pub bucket_cache: Option<&'a [i32]>,
    /// Exclusive scan of the pass-1 counts, partition-major.
    pub new_offsets: &'a [usize],
}

pub(crate) struct ScatterOutputs<'a, I, W> {
    pub indices: DisjointSlice<'a, I>,
    pub weights: Option<DisjointSlice<'a, W>>,
    pub positions: Option<DisjointSlice<'a, I>>,
    pub permute: Option<DisjointSlice<'a, I>>,
}

macro_rules! variant {
    ($plan:expr, $inp:expr, $out:expr; $s:literal, $w:literal, $p:literal, $b:literal) => {
        scatter_rows::<I, W, $s, $w, $p, $b>($plan, $inp, $out)
    };
}

/// Runs the scatter variant selected by `variant`.
pub(crate) fn scatter_pass<I: SparseIndex, W: Copy + Send + Sync>(
    plan: &RoutingPlan<'_>,
    variant: ScatterVariant,
    inputs: &ScatterInputs<'_, I, W>,
    outputs: &ScatterOutputs<'_, I, W>,
) {
    let ScatterVariant {
        sequence,
        weighted,
        positions,
        boundaries,
    } = variant;
    match (sequence, weighted, positions, boundaries) {
        (false, false, false, false) => variant!(plan, inputs, outputs; false, false, false, false),
        (false, false, false, true) => variant!(plan, inputs, outputs; false, false, false, true),
        (false, false, true, false) => variant!(plan, inputs, outputs; false, false, true, false),
        (false, false, true, true) => variant!(plan, inputs, outputs; false, false, true, true),
        (false, true, false, false) => variant!(plan, inputs, outputs; false, true, false, false),
        (false, true, false, true) => variant!(plan, inputs, outputs; false, true, false, true),
        (false, true, true, false) => variant!(plan, inputs, outputs; false, true, true, false),
        (false, true, true, true) => variant!(plan, inputs, outputs; false, true, true, true),
        (true, false, false, false) => variant!(plan, inputs, outputs; true, false, false, false),
        (true, false, false, true) => variant!(plan, inputs, outputs; true, false, false, true),
        (true, false, true, false) => variant!(plan, inputs, outputs; true, false, true, false),
        (true, false, true, true) => variant!(plan, inputs, outputs; true, false, true, true),
        (true, true, false, false) => variant!(plan, inputs, outputs; true, true, false, false),
        (true, true, false, true) => variant!(plan, inputs, outputs; true, true, false, true),
        (true, true, true, false) => variant!(plan, inputs, outputs; true, true, true, false),
        (true, true, true, true) => variant!(plan, inputs, outputs; true, true, true, true),
    }
}

fn scatter_rows<
    I: SparseIndex,
    W: Copy + Send + Sync,
    const SEQ: bool,
    const WEIGHTED: bool,
    const POS: bool,
    const BOUNDS: bool,
>(
    plan: &RoutingPlan<'_>,
    inputs: &ScatterInputs<'_, I, W>,
    outputs: &ScatterOutputs<'_, I, W>,
) {
    let rows = plan.num_rows();
    let partitions = plan.partitions;

    (0..rows)
        .into_par_iter()
        .for_each_init(|| vec![0usize; partitions], |cursor, b_t| {
            if plan.lengths[b_t] == 0 {
                return;
            }
            for (q, c) in cursor.iter_mut().enumerate() {
                *c = inputs.new_offsets[q * rows + b_t];
            }
            let route = plan.route_of_row(b_t);
            let row_start = plan.row_offsets[b_t];

            for i in plan.row_range(b_t) {
                let key = inputs.indices[i].to_i64();
                let bucket = match inputs.bucket_cache {
                    Some(cache) if BOUNDS => cache[i] as i64,
                    _ => route.resolve_bucket(key),
                };
                let dst = route.destination(key, bucket, partitions, plan.keep_orig_idx);
                let slot = cursor[dst.partition];
                cursor[dst.partition] += 1;

                // SAFETY: `slot` lies in the range this row owns for `dst.partition`
                // and `i` lies in this row's input range; neither is shared.
                unsafe {
                    outputs.indices.write(slot, I::from_i64(dst.index));
                    if WEIGHTED {
                        if let (Some(out), Some(w)) = (&outputs.weights, inputs.weights) {
                            out.write(slot, w[i]);
                        }
                    }
                    if POS {
                        if let Some(out) = &outputs.positions {
                            out.write(slot, I::from_usize(i - row_start));
                        }
                    }
                    if SEQ {
                        if let Some(out) = &outputs.permute {
                            out.write(i, I::from_usize(slot));
                        }
                    }
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucketize::{RoutingPlan, RowFeatures};
    use crate::count::count_pass;
    use crate::policy::FeatureRoute;
    use crate::scan::exclusive_scan;

    struct Run {
        indices: Vec<i64>,
        weights: Vec<f32>,
        positions: Vec<i64>,
        permute: Vec<i64>,
    }

    fn run(plan: &RoutingPlan<'_>, keys: &[i64], weights: &[f32], variant: ScatterVariant) -> Run {
        let n = keys.len();
        let mut cache = vec![-1i32; n];
        let counts = count_pass(plan, keys, variant.boundaries.then_some(&mut cache[..]));
        let offsets = exclusive_scan(&counts);

        let mut out = Run {
            indices: vec![0; n],
            weights: vec![0.0; n],
            positions: vec![0; n],
            permute: vec![0; n],
        };
        let inputs = ScatterInputs {
            indices: keys,
            weights: variant.weighted.then_some(weights),
            bucket_cache: variant.boundaries.then_some(&cache[..]),
            new_offsets: &offsets,
        };
        let outputs = ScatterOutputs {
            indices: DisjointSlice::new(&mut out.indices),
            weights: variant.weighted.then(|| DisjointSlice::new(&mut out.weights)),
            positions: variant.positions.then(|| DisjointSlice::new(&mut out.positions)),
            permute: variant.sequence.then(|| DisjointSlice::new(&mut out.permute)),
        };
        scatter_pass(plan, variant, &inputs, &outputs);
        drop(outputs);
        out
    }

    #[test]
    fn test_all_variants_agree_on_indices() {
        let bounds = [0i64, 100, 250];
        // two features x two rows
        let lengths = vec![3usize, 2, 4, 1];
        let keys = vec![7i64, 260, 99, 120, 5, 1, 2, 3, 1000];
        let weights: Vec<f32> = (0..keys.len()).map(|i| i as f32 * 0.5).collect();
        let plan = RoutingPlan {
            partitions: 2,
            keep_orig_idx: false,
            row_offsets: exclusive_scan(&lengths),
            lengths,
            rows: RowFeatures::Uniform { local_batch: 2 },
            routes: vec![
                FeatureRoute::Boundaries { bounds: &bounds },
                FeatureRoute::Block { block_size: 2 },
            ],
        };

        let reference = run(&plan, &keys, &weights, ScatterVariant {
            sequence: true,
            weighted: true,
            positions: true,
            boundaries: true,
        });
        for id in 0..16usize {
            let variant = ScatterVariant {
                sequence: id & 8 != 0,
                weighted: id & 4 != 0,
                positions: id & 2 != 0,
                boundaries: id & 1 != 0,
            };
            assert_eq!(variant.id(), id);
            let got = run(&plan, &keys, &weights, variant);
            assert_eq!(got.indices, reference.indices, "variant {id}");
            if variant.weighted {
                assert_eq!(got.weights, reference.weights, "variant {id}");
            }
            if variant.positions {
                assert_eq!(got.positions, reference.positions, "variant {id}");
            }
            if variant.sequence {
                assert_eq!(got.permute, reference.permute, "variant {id}");
            }
        }
    }

    #[test]
    fn test_row_order_within_cell() {
        // one row, RR over 2 partitions: even keys keep their relative order
        let lengths = vec![5usize];
        let keys = vec![4i64, 1, 2, 3, 0];
        let plan = RoutingPlan {
            partitions: 2,
            keep_orig_idx: false,
            row_offsets: exclusive_scan(&lengths),
            lengths,
            rows: RowFeatures::Uniform { local_batch: 1 },
            routes: vec![FeatureRoute::RoundRobin],
        };
        let got = run(&plan, &keys, &[], ScatterVariant {
            sequence: true,
            positions: true,
            ..Default::default()
        });
        assert_eq!(got.indices, vec![4, 2, 0, 1, 3]);
        assert_eq!(got.positions, vec![0, 2, 4, 1, 3]);
        assert_eq!(got.permute, vec![0, 3, 1, 4, 2]);
    }
}
