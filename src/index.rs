//! Integer element types accepted for lengths, indices and positions.

/// A signed integer usable as a sparse key, a row length or an output slot.
///
/// Arithmetic inside the engine is carried out in `i64`; values are narrowed
/// back with a plain `as` conversion when written to the output buffers.
pub trait SparseIndex: Copy + Send + Sync + Default + PartialEq + std::fmt::Debug + 'static {
    fn to_i64(self) -> i64;
    fn from_i64(v: i64) -> Self;

    #[inline]
    fn from_usize(v: usize) -> Self {
        Self::from_i64(v as i64)
    }
}

macro_rules! impl_sparse_index {
    ($($t:ty),*) => {
        $(
            impl SparseIndex for $t {
                #[inline]
                fn to_i64(self) -> i64 {
                    self as i64
                }
                #[inline]
                fn from_i64(v: i64) -> Self {
                    v as $t
                }
            }
        )*
    };
}

impl_sparse_index!(i32, i64);
