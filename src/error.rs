//! Error taxonomy for the bucketization engine.
//!
//! Every contract check runs on the host before any pass is dispatched, so an
//! `Err` never leaves partially written outputs behind.

use thiserror::Error;

/// Errors reported by [`crate::bucketize`] and its building blocks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BucketizeError {
    /// A parameter is out of its accepted domain.
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name.
        arg: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// `sum(lengths)` disagrees with the number of indices.
    #[error("lengths sum to {lengths_total} but {indices} indices were supplied")]
    LengthMismatch {
        /// Sum over the lengths buffer.
        lengths_total: usize,
        /// Number of indices supplied.
        indices: usize,
    },

    /// A companion buffer has the wrong number of entries.
    #[error("{what} count mismatch: expected {expected}, got {actual}")]
    CountMismatch {
        /// Which buffer is mismatched.
        what: &'static str,
        /// Required number of entries.
        expected: usize,
        /// Number of entries supplied.
        actual: usize,
    },

    /// A row length is negative.
    #[error("negative length {value} at row {row}")]
    NegativeLength {
        /// Flattened row position.
        row: usize,
        /// Offending value.
        value: i64,
    },

    /// The scan primitive counts with a signed 32-bit integer.
    #[error("element count {count} exceeds the scan limit of {limit}")]
    ScanCapacity {
        /// Requested element count.
        count: usize,
        /// Largest accepted count.
        limit: usize,
    },

    /// Ragged batching needs a positive padding bound.
    #[error("max_local_batch must be positive when batch_size_per_feature is supplied")]
    MissingMaxLocalBatch,

    /// A feature's local batch does not fit the resolver grid.
    #[error("feature {feature} has batch size {batch_size} above max_local_batch {max_local_batch}")]
    RaggedBatchOverflow {
        /// Feature id.
        feature: usize,
        /// Its declared batch size.
        batch_size: usize,
        /// Grid padding bound.
        max_local_batch: usize,
    },

    /// A feature's boundary slice is not ascending.
    #[error("boundaries for feature {feature} are not ascending at position {position}")]
    UnsortedBoundaries {
        /// Feature id.
        feature: usize,
        /// First position that breaks the order.
        position: usize,
    },

    /// An unbucketize permutation points outside the bucketized buffer.
    #[error("permutation entry {position} -> {target} is outside a buffer of {len}")]
    PermutationOutOfRange {
        /// Original element position.
        position: usize,
        /// Slot it points to.
        target: i64,
        /// Length of the bucketized buffer.
        len: usize,
    },

    /// A kernel launch or device memory operation failed.
    #[error("device operation '{op}' failed: {reason}")]
    Device {
        /// Originating operation.
        op: &'static str,
        /// Driver-provided description.
        reason: String,
    },
}

impl BucketizeError {
    pub(crate) fn invalid(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }
}

/// A specialized Result type for bucketization.
pub type Result<T> = std::result::Result<T, BucketizeError>;
