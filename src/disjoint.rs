//! Shared write handle over an output buffer.
//!
//! The scatter pass and the resolver grid write every slot exactly once, and
//! the slot sets of different rows (or grid cells) never overlap. That lets the
//! buffer be shared across rayon workers as a raw pointer instead of being split
//! into `&mut` pieces up front, which ragged rows make awkward.

use std::marker::PhantomData;
use std::ptr::NonNull;

pub(crate) struct DisjointSlice<'a, T> {
    ptr: NonNull<T>,
    len: usize,
    _buf: PhantomData<&'a mut [T]>,
}

//  SAFETY: callers guarantee that no two threads write the same slot and that
//  nothing reads the buffer until the writing pass has finished.
unsafe impl<T: Send> Send for DisjointSlice<'_, T> {}
unsafe impl<T: Send> Sync for DisjointSlice<'_, T> {}

impl<'a, T> DisjointSlice<'a, T> {
    pub(crate) fn new(buf: &'a mut [T]) -> Self {
        Self {
            len: buf.len(),
            ptr: NonNull::from(buf).cast(),
            _buf: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Writes `value` into slot `i`.
    ///
    /// # Safety
    /// `i < len`, and no other thread writes slot `i` during the same pass.
    #[inline]
    pub(crate) unsafe fn write(&self, i: usize, value: T) {
        debug_assert!(i < self.len, "slot {i} out of bounds ({})", self.len);
        unsafe { self.ptr.as_ptr().add(i).write(value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_parallel_disjoint_writes() {
        let mut buf = vec![0usize; 1000];
        let out = DisjointSlice::new(&mut buf);
        (0..1000usize).into_par_iter().for_each(|i| unsafe {
            out.write(999 - i, i);
        });
        assert!(buf.iter().enumerate().all(|(slot, &v)| v == 999 - slot));
    }
}
