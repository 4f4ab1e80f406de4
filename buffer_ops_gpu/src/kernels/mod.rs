//! Device entry points.
//!
//! Every kernel takes its parameters in the order listed in
//! [`crate::abi::SIGNATURES`]: buffers as raw word pointers, scalars as `u32`,
//! integer arrays as one `u32` per element. Specializations are separate
//! symbols named after the entry and its lowercased flags, e.g.
//! `local_scan_data_type_int_num_group_threads_256`.

pub mod filter;
pub mod one_sweep;
pub mod radix_sort;
pub mod scan;
pub mod shuffle;

use cuda_std::thread;

/// Index of the calling thread's group along x, shifted by the launch's
/// first group.
#[inline(always)]
pub(crate) fn group_index(group_offset: u32) -> usize {
    (thread::block_idx_x() + group_offset) as usize
}

/// Global index of the calling thread along x, shifted by the launch's first
/// group.
#[inline(always)]
pub(crate) fn thread_index(group_offset: u32) -> usize {
    group_index(group_offset) * thread::block_dim_x() as usize + thread::thread_idx_x() as usize
}

/// Copies record `from` of `src` to record `to` of `dst`.
#[inline(always)]
pub(crate) unsafe fn copy_record(
    src: *const u32,
    from: usize,
    dst: *mut u32,
    to: usize,
    stride_words: usize,
) {
    for w in 0..stride_words {
        *dst.add(to * stride_words + w) = *src.add(from * stride_words + w);
    }
}
