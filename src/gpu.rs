//! gpu.rs
//! CUDA offload of the two bucketization passes.
//!
//! Design:
//! - Validation, row layout and the ragged feature table stay on the host
//!   (same plan as the CPU path, so both reject exactly the same inputs).
//! - Pass 1 on the device: a warp per row, one lane per element, `atomicAdd`
//!   on the per-(partition,row) counters; boundary buckets are cached per element.
//! - The counts come back to the host for the exclusive scan.
//! - Pass 2 on the device: one thread per row walking its elements in order,
//!   so slot assignment is deterministic. The variant flags (sequence, weights,
//!   positions, cached buckets) are baked into the kernel source as defines.
//!
//! Only `i64` lengths/indices and `f32` weights are offloaded.
//!
//! NOTE: compile with `--features gpu`; needs a CUDA toolkit visible to `cudarc`.

use std::time::Instant;

use cudarc::driver::{CudaContext, CudaSlice, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::compile_ptx;
use log::{debug, info};

use crate::bucketize::{BucketizeParams, BucketizedBatch, SparseBatch, empty_result, plan};
use crate::error::{BucketizeError, Result};
use crate::policy::{FeatureRoute, NO_BUCKET};
use crate::scan;
use crate::scatter::ScatterVariant;

#[derive(Clone, Debug)]
pub struct GpuOptions {
    /// CUDA device ordinal.
    pub device: usize,
    /// Rows handled per thread block in pass 1 (one warp each).
    pub rows_per_block: u32,
    /// Threads per block in pass 2.
    pub block_dim: u32,
}

impl Default for GpuOptions {
    fn default() -> Self {
        Self {
            device: 0,
            rows_per_block: 8,
            block_dim: 256,
        }
    }
}

fn dev_err<E: std::fmt::Debug>(op: &'static str) -> impl FnOnce(E) -> BucketizeError {
    move |e| BucketizeError::Device {
        op,
        reason: format!("{e:?}"),
    }
}

/// How many CUDA devices are visible.
pub fn device_count() -> Result<usize> {
    Ok(CudaContext::device_count().map_err(dev_err("device_count"))? as usize)
}

const KIND_BLOCK: i32 = 0;
const KIND_ROUND_ROBIN: i32 = 1;
const KIND_BOUNDARIES: i32 = 2;

/// [`crate::bucketize`] on a CUDA device.
pub fn bucketize_gpu(
    batch: &SparseBatch<'_, i64, i64, f32>,
    params: &BucketizeParams<'_>,
    opts: &GpuOptions,
) -> Result<BucketizedBatch<i64, i64, f32>> {
    let t_all = Instant::now();
    let Some(plan) = plan(batch, params)? else {
        return Ok(empty_result(batch, params));
    };

    let visible = device_count()?;
    if opts.device >= visible {
        return Err(BucketizeError::invalid(
            "device",
            format!("requested CUDA device {} but only {} available", opts.device, visible),
        ));
    }

    let rows = plan.num_rows();
    let nidx = batch.indices.len();
    let parts = plan.partitions;
    let variant = ScatterVariant {
        sequence: params.sequence,
        weighted: batch.weights.is_some(),
        positions: params.bucketize_pos,
        boundaries: params.boundaries.is_some(),
    };

    /* ─────────── host-side tables ─────────── */
    let row_offsets: Vec<i64> = plan.row_offsets.iter().map(|&o| o as i64).collect();
    let row_lengths: Vec<i64> = plan.lengths.iter().map(|&l| l as i64).collect();
    let row_feature: Vec<i32> = (0..rows).map(|b_t| plan.feature_of_row(b_t) as i32).collect();

    let nfeat = plan.routes.len();
    let mut kind = Vec::with_capacity(nfeat);
    let mut block_size = Vec::with_capacity(nfeat);
    let mut bound_start = Vec::with_capacity(nfeat);
    let mut bound_end = Vec::with_capacity(nfeat);
    let mut bound_values: Vec<i64> = Vec::new();
    for route in &plan.routes {
        let (k, bs) = match *route {
            FeatureRoute::Block { block_size } => (KIND_BLOCK, block_size),
            FeatureRoute::RoundRobin => (KIND_ROUND_ROBIN, 0),
            FeatureRoute::Boundaries { .. } => (KIND_BOUNDARIES, 0),
        };
        kind.push(k);
        block_size.push(bs);
        bound_start.push(bound_values.len() as i32);
        if let FeatureRoute::Boundaries { bounds } = route {
            bound_values.extend_from_slice(bounds);
        }
        bound_end.push(bound_values.len() as i32);
    }
    if bound_values.is_empty() {
        bound_values.push(0);
    }

    let ctx = CudaContext::new(opts.device).map_err(dev_err("context"))?;
    let stream = ctx.default_stream();

    let src = format!(
        "#define SEQ {}\n#define WEIGHTED {}\n#define POS {}\n#define BOUNDS {}\n#define KEEP_ORIG {}\n{}",
        variant.sequence as i32,
        variant.weighted as i32,
        variant.positions as i32,
        variant.boundaries as i32,
        plan.keep_orig_idx as i32,
        KERNEL_SRC
    );
    let ptx = compile_ptx(src).map_err(dev_err("nvrtc compile"))?;
    let module = ctx.load_module(ptx).map_err(dev_err("load module"))?;
    let f_count = module
        .load_function("bucketize_count")
        .map_err(dev_err("load bucketize_count"))?;
    let f_scatter = module
        .load_function("bucketize_scatter")
        .map_err(dev_err("load bucketize_scatter"))?;

    /* ─────────── uploads ─────────── */
    let htod = dev_err::<cudarc::driver::DriverError>;
    let d_row_offsets: CudaSlice<i64> = stream.clone_htod(&row_offsets).map_err(htod("upload row offsets"))?;
    let d_row_lengths: CudaSlice<i64> = stream.clone_htod(&row_lengths).map_err(htod("upload lengths"))?;
    let d_row_feature: CudaSlice<i32> = stream.clone_htod(&row_feature).map_err(htod("upload feature table"))?;
    let indices_host = batch.indices.to_vec();
    let d_indices: CudaSlice<i64> = stream.clone_htod(&indices_host).map_err(htod("upload indices"))?;
    let d_kind: CudaSlice<i32> = stream.clone_htod(&kind).map_err(htod("upload policies"))?;
    let d_block: CudaSlice<i64> = stream.clone_htod(&block_size).map_err(htod("upload block sizes"))?;
    let d_bstart: CudaSlice<i32> = stream.clone_htod(&bound_start).map_err(htod("upload boundary offsets"))?;
    let d_bend: CudaSlice<i32> = stream.clone_htod(&bound_end).map_err(htod("upload boundary offsets"))?;
    let d_bounds: CudaSlice<i64> = stream.clone_htod(&bound_values).map_err(htod("upload boundaries"))?;
    let weights_host: Vec<f32> = batch.weights.map_or_else(|| vec![0.0], <[f32]>::to_vec);
    let d_weights: CudaSlice<f32> = stream.clone_htod(&weights_host).map_err(htod("upload weights"))?;

    let mut d_counts: CudaSlice<u32> = stream
        .alloc_zeros(rows * parts)
        .map_err(htod("alloc counts"))?;
    let mut d_cache: CudaSlice<i32> = stream
        .clone_htod(&vec![NO_BUCKET as i32; nidx.max(1)])
        .map_err(htod("alloc bucket cache"))?;

    let rows_i32 = rows as i32;
    let parts_i64 = parts as i64;

    /* ─────────── pass 1 ─────────── */
    let t1 = Instant::now();
    let rpb = opts.rows_per_block.max(1);
    let cfg = LaunchConfig {
        grid_dim: ((rows as u32).div_ceil(rpb).min(65_535), 1, 1),
        block_dim: (32, rpb, 1),
        shared_mem_bytes: 0,
    };
    let mut launch = stream.launch_builder(&f_count);
    launch.arg(&d_row_offsets);
    launch.arg(&d_row_lengths);
    launch.arg(&d_row_feature);
    launch.arg(&d_indices);
    launch.arg(&d_kind);
    launch.arg(&d_block);
    launch.arg(&d_bstart);
    launch.arg(&d_bend);
    launch.arg(&d_bounds);
    launch.arg(&rows_i32);
    launch.arg(&parts_i64);
    launch.arg(&mut d_counts);
    launch.arg(&mut d_cache);
    unsafe { launch.launch(cfg) }.map_err(htod("launch bucketize_count"))?;
    stream.synchronize().map_err(htod("synchronize pass 1"))?;

    let mut counts32 = vec![0u32; rows * parts];
    stream
        .memcpy_dtoh(&d_counts, &mut counts32)
        .map_err(htod("download counts"))?;
    let counts: Vec<usize> = counts32.into_iter().map(|c| c as usize).collect();
    let new_offsets = scan::par_exclusive_scan(&counts)?;
    debug!("gpu pass-1 counts + rescan {:>6} us", t1.elapsed().as_micros());

    /* ─────────── pass 2 ─────────── */
    let t2 = Instant::now();
    let cursors: Vec<i64> = new_offsets.iter().map(|&o| o as i64).collect();
    let mut d_cursors: CudaSlice<i64> = stream.clone_htod(&cursors).map_err(htod("upload offsets"))?;
    let out_len = nidx.max(1);
    let mut d_new_indices: CudaSlice<i64> = stream.alloc_zeros(out_len).map_err(htod("alloc indices"))?;
    let mut d_new_weights: CudaSlice<f32> = stream.alloc_zeros(out_len).map_err(htod("alloc weights"))?;
    let mut d_new_pos: CudaSlice<i64> = stream.alloc_zeros(out_len).map_err(htod("alloc positions"))?;
    let mut d_permute: CudaSlice<i64> = stream.alloc_zeros(out_len).map_err(htod("alloc permute"))?;

    let bd = opts.block_dim.max(32);
    let cfg = LaunchConfig {
        grid_dim: ((rows as u32).div_ceil(bd).max(1), 1, 1),
        block_dim: (bd, 1, 1),
        shared_mem_bytes: 0,
    };
    let mut launch = stream.launch_builder(&f_scatter);
    launch.arg(&d_row_offsets);
    launch.arg(&d_row_lengths);
    launch.arg(&d_row_feature);
    launch.arg(&d_indices);
    launch.arg(&d_weights);
    launch.arg(&d_kind);
    launch.arg(&d_block);
    launch.arg(&d_bstart);
    launch.arg(&d_bend);
    launch.arg(&d_bounds);
    launch.arg(&d_cache);
    launch.arg(&rows_i32);
    launch.arg(&parts_i64);
    launch.arg(&mut d_cursors);
    launch.arg(&mut d_new_indices);
    launch.arg(&mut d_new_weights);
    launch.arg(&mut d_new_pos);
    launch.arg(&mut d_permute);
    unsafe { launch.launch(cfg) }.map_err(htod("launch bucketize_scatter"))?;
    stream.synchronize().map_err(htod("synchronize pass 2"))?;

    let download = |d: &CudaSlice<i64>, op: &'static str| -> Result<Vec<i64>> {
        let mut h = vec![0i64; out_len];
        stream.memcpy_dtoh(d, &mut h).map_err(htod(op))?;
        h.truncate(nidx);
        Ok(h)
    };
    let new_indices = download(&d_new_indices, "download indices")?;
    let new_positions = if variant.positions {
        Some(download(&d_new_pos, "download positions")?)
    } else {
        None
    };
    let unbucketize_permute = if variant.sequence {
        Some(download(&d_permute, "download permute")?)
    } else {
        None
    };
    let new_weights = if variant.weighted {
        let mut h = vec![0f32; out_len];
        stream
            .memcpy_dtoh(&d_new_weights, &mut h)
            .map_err(htod("download weights"))?;
        h.truncate(nidx);
        Some(h)
    } else {
        None
    };
    debug!("gpu pass-2 scatter {:>6} us", t2.elapsed().as_micros());
    info!(
        "GPU bucketize: rows={} partitions={} elements={} wall {} ms",
        rows,
        parts,
        nidx,
        t_all.elapsed().as_millis()
    );

    Ok(BucketizedBatch {
        partition_count: parts,
        new_lengths: counts.iter().map(|&c| c as i64).collect(),
        new_offsets: new_offsets.iter().map(|&o| o as i64).collect(),
        new_indices,
        new_weights,
        new_positions,
        unbucketize_permute,
    })
}

// ------------------------- CUDA kernels -------------------------

const KERNEL_SRC: &str = r#"
#define KIND_BLOCK 0
#define KIND_ROUND_ROBIN 1
#define KIND_BOUNDARIES 2

__device__ __forceinline__ long long rem_euclid(long long k, long long p) {
    long long m = k % p;
    return m < 0 ? m + p : m;
}

// last j with bounds[j] <= key, relative to the feature slice; -1 if none
__device__ __forceinline__ int boundary_bucket(
    const long long* __restrict__ bounds, int start, int end, long long key
){
    int lo = start, hi = end;
    while (lo < hi) {
        int mid = lo + ((hi - lo) >> 1);
        if (bounds[mid] <= key) lo = mid + 1; else hi = mid;
    }
    return lo - start - 1;
}

__device__ __forceinline__ void route(
    int kind, long long block_size, const long long* __restrict__ bounds, int bstart,
    long long key, int bucket, long long P,
    long long* part, long long* new_key
){
    if (kind == KIND_ROUND_ROBIN) {
        *part = rem_euclid(key, P);
        *new_key = key;
        return;
    }
    if (kind == KIND_BLOCK && block_size > 0 && key >= 0 && key / block_size < P) {
        *part = key / block_size;
        *new_key = KEEP_ORIG ? key : key % block_size;
        return;
    }
    if (kind == KIND_BOUNDARIES && bucket >= 0 && bucket < P) {
        *part = bucket;
        *new_key = KEEP_ORIG ? key : key - bounds[bstart + bucket];
        return;
    }
    long long m = rem_euclid(key, P);
    *part = m;
    *new_key = KEEP_ORIG ? key : (key - m) / P;
}

extern "C" __global__
void bucketize_count(
    const long long* __restrict__ row_offsets,  // [rows]
    const long long* __restrict__ row_lengths,  // [rows]
    const int* __restrict__ row_feature,        // [rows]
    const long long* __restrict__ indices,      // [n]
    const int* __restrict__ kind,               // [T]
    const long long* __restrict__ block_size,   // [T]
    const int* __restrict__ bstart,             // [T]
    const int* __restrict__ bend,               // [T]
    const long long* __restrict__ bounds,
    int rows,
    long long P,
    unsigned int* __restrict__ counts,          // [P * rows]
    int* __restrict__ bucket_cache              // [n]
){
    for (int b_t = blockIdx.x * blockDim.y + threadIdx.y; b_t < rows; b_t += gridDim.x * blockDim.y) {
        int t = row_feature[b_t];
        long long start = row_offsets[b_t];
        long long len = row_lengths[b_t];
        for (long long i = threadIdx.x; i < len; i += blockDim.x) {
            long long key = indices[start + i];
            int bucket = -1;
            if (kind[t] == KIND_BOUNDARIES) {
                bucket = boundary_bucket(bounds, bstart[t], bend[t], key);
            }
            if (BOUNDS) bucket_cache[start + i] = bucket;
            long long part, new_key;
            route(kind[t], block_size[t], bounds, bstart[t], key, bucket, P, &part, &new_key);
            atomicAdd(&counts[part * rows + b_t], 1u);
        }
    }
}

extern "C" __global__
void bucketize_scatter(
    const long long* __restrict__ row_offsets,
    const long long* __restrict__ row_lengths,
    const int* __restrict__ row_feature,
    const long long* __restrict__ indices,
    const float* __restrict__ weights,
    const int* __restrict__ kind,
    const long long* __restrict__ block_size,
    const int* __restrict__ bstart,
    const int* __restrict__ bend,
    const long long* __restrict__ bounds,
    const int* __restrict__ bucket_cache,
    int rows,
    long long P,
    long long* __restrict__ cursors,            // [P * rows], seeded with offsets
    long long* __restrict__ new_indices,
    float* __restrict__ new_weights,
    long long* __restrict__ new_positions,
    long long* __restrict__ permute
){
    for (int b_t = blockIdx.x * blockDim.x + threadIdx.x; b_t < rows; b_t += gridDim.x * blockDim.x) {
        int t = row_feature[b_t];
        long long start = row_offsets[b_t];
        long long len = row_lengths[b_t];
        for (long long i = 0; i < len; ++i) {
            long long key = indices[start + i];
            int bucket = -1;
            if (kind[t] == KIND_BOUNDARIES) {
                bucket = BOUNDS ? bucket_cache[start + i] : boundary_bucket(bounds, bstart[t], bend[t], key);
            }
            long long part, new_key;
            route(kind[t], block_size[t], bounds, bstart[t], key, bucket, P, &part, &new_key);
            long long slot = cursors[part * rows + b_t]++;
            new_indices[slot] = new_key;
            if (WEIGHTED) new_weights[slot] = weights[start + i];
            if (POS) new_positions[slot] = i;
            if (SEQ) permute[start + i] = slot;
        }
    }
}
"#;
