//! Bucketization of sparse feature batches for sharded embedding tables.
//!
//!  * every key of every (feature, row) bag is routed to the partition that owns it
//!    (block, round-robin or explicit per-feature boundaries)
//!  * the batch is rewritten partition-major: lengths, indices and optionally
//!    weights, intra-row positions and the permutation that undoes the layout
//!
//! Two passes over the batch, both data-parallel on the rayon pool:
//!  1. count – atomic per-(partition,row) counters, rescanned into offsets
//!  2. scatter – every row writes its elements into the slots it owns
//!
//! ```
//! use sparse_bucketize::{BucketizeParams, SparseBatch, bucketize};
//!
//! // one feature, two rows: [5, 15] and [7]
//! let lengths = [2i64, 1];
//! let indices = [5i64, 15, 7];
//! let batch = SparseBatch::<i64, i64>::new(&lengths, &indices);
//! let params = BucketizeParams::new(3, &[4], &[0]).sequence(true);
//! let out = bucketize(&batch, &params).unwrap();
//!
//! assert_eq!(out.new_lengths, vec![1, 0, 1, 1, 0, 0]);
//! assert_eq!(out.new_indices, vec![5, 1, 3]);
//! assert_eq!(out.unbucketize_permute, Some(vec![1, 0, 2]));
//! ```

pub mod bucketize;
pub mod error;
pub mod index;
pub mod policy;
pub mod resolver;
pub mod scan;
pub mod unbucketize;

mod count;
mod disjoint;
mod scatter;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use bucketize::{BucketizeParams, BucketizedBatch, BucketizedParts, SparseBatch, bucketize};
pub use error::{BucketizeError, Result};
pub use index::SparseIndex;
pub use policy::{BoundaryTable, Destination, DistributionPolicy, FeatureRoute, boundary_bucket};
pub use resolver::resolve_feature_indices;
pub use scatter::ScatterVariant;
pub use unbucketize::{PartitionView, unbucketize};
