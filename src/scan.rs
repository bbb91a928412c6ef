//! Prefix sums used to turn row lengths into row offsets.
//!
//! * host variants – plain sequential loop, no size bound
//! * device variants – block scan on the rayon pool:
//!     1. every block reduces to one total (parallel)
//!     2. block totals are scanned with the same routine (recursive, so depth is logarithmic)
//!     3. every block rescans itself seeded with its carry (parallel)
//!
//! Integer addition is associative, so both variants agree bit-for-bit.

use std::ops::Add;

use rayon::prelude::*;

use crate::error::{BucketizeError, Result};

/// Largest element count accepted by the device scan (signed 32-bit count).
pub const SCAN_LIMIT: usize = i32::MAX as usize;

/// Elements per block of the device scan.
pub(crate) const SCAN_BLOCK: usize = 4096;

/// Anything the scans can accumulate.
pub trait ScanElem: Copy + Default + Send + Sync + Add<Output = Self> {}

impl<T> ScanElem for T where T: Copy + Default + Send + Sync + Add<Output = T> {}

/// `out[i] = input[0] + .. + input[i-1]`, `out[0] = 0`.
pub fn exclusive_scan<T: ScanElem>(input: &[T]) -> Vec<T> {
    let mut out = Vec::with_capacity(input.len());
    let mut acc = T::default();
    for &x in input {
        out.push(acc);
        acc = acc + x;
    }
    out
}

/// `out[i] = input[0] + .. + input[i]`.
pub fn inclusive_scan<T: ScanElem>(input: &[T]) -> Vec<T> {
    let mut out = Vec::with_capacity(input.len());
    let mut acc = T::default();
    for &x in input {
        acc = acc + x;
        out.push(acc);
    }
    out
}

/// Rejects counts the device scan cannot index.
pub fn check_scan_capacity(count: usize) -> Result<()> {
    if count > SCAN_LIMIT {
        return Err(BucketizeError::ScanCapacity {
            count,
            limit: SCAN_LIMIT,
        });
    }
    Ok(())
}

/// Parallel exclusive scan.
pub fn par_exclusive_scan<T: ScanElem>(input: &[T]) -> Result<Vec<T>> {
    check_scan_capacity(input.len())?;
    Ok(block_scan(input, false))
}

/// Parallel inclusive scan.
pub fn par_inclusive_scan<T: ScanElem>(input: &[T]) -> Result<Vec<T>> {
    check_scan_capacity(input.len())?;
    Ok(block_scan(input, true))
}

fn block_scan<T: ScanElem>(input: &[T], inclusive: bool) -> Vec<T> {
    if input.len() <= SCAN_BLOCK {
        return if inclusive {
            inclusive_scan(input)
        } else {
            exclusive_scan(input)
        };
    }

    let totals: Vec<T> = input
        .par_chunks(SCAN_BLOCK)
        .map(|blk| blk.iter().fold(T::default(), |acc, &x| acc + x))
        .collect();
    let carries = block_scan(&totals, false);

    let mut out = vec![T::default(); input.len()];
    out.par_chunks_mut(SCAN_BLOCK)
        .zip(input.par_chunks(SCAN_BLOCK))
        .zip(carries.par_iter())
        .for_each(|((dst, src), &carry)| {
            let mut acc = carry;
            for (d, &x) in dst.iter_mut().zip(src) {
                if inclusive {
                    acc = acc + x;
                    *d = acc;
                } else {
                    *d = acc;
                    acc = acc + x;
                }
            }
        });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_scan() {
        assert_eq!(exclusive_scan(&[1u32, 2, 3, 4, 5]), vec![0, 1, 3, 6, 10]);
    }

    #[test]
    fn test_inclusive_scan() {
        assert_eq!(inclusive_scan(&[1u32, 2, 3, 4, 5]), vec![1, 3, 6, 10, 15]);
    }

    #[test]
    fn test_empty_scan() {
        let input: Vec<usize> = vec![];
        assert!(exclusive_scan(&input).is_empty());
        assert!(par_exclusive_scan(&input).unwrap().is_empty());
        assert!(par_inclusive_scan(&input).unwrap().is_empty());
    }

    #[test]
    fn test_single_element() {
        assert_eq!(par_exclusive_scan(&[42i64]).unwrap(), vec![0]);
        assert_eq!(par_inclusive_scan(&[42i64]).unwrap(), vec![42]);
    }

    #[test]
    fn test_device_matches_host_across_blocks() {
        // three levels of recursion are not needed here, but several blocks plus a ragged tail are
        let n = SCAN_BLOCK * 5 + 17;
        let input: Vec<usize> = (0..n).map(|i| (i * 7919) % 13).collect();
        assert_eq!(par_exclusive_scan(&input).unwrap(), exclusive_scan(&input));
        assert_eq!(par_inclusive_scan(&input).unwrap(), inclusive_scan(&input));
    }

    #[test]
    fn test_recursive_block_totals() {
        let n = SCAN_BLOCK * (SCAN_BLOCK + 3);
        let input = vec![1u32; n];
        let out = par_exclusive_scan(&input).unwrap();
        assert_eq!(out[0], 0);
        assert_eq!(out[n - 1] as usize, n - 1);
        assert_eq!(out[SCAN_BLOCK * SCAN_BLOCK + 1] as usize, SCAN_BLOCK * SCAN_BLOCK + 1);
    }

    #[test]
    fn test_capacity() {
        assert!(check_scan_capacity(SCAN_LIMIT).is_ok());
        assert_eq!(
            check_scan_capacity(SCAN_LIMIT + 1),
            Err(BucketizeError::ScanCapacity {
                count: SCAN_LIMIT + 1,
                limit: SCAN_LIMIT
            })
        );
    }
}
