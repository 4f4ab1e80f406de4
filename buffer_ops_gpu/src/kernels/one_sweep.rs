use super::thread_index;
use crate::{
    look_back::{pack, unpack, ELEMENTS_PER_GROUP, FLAG_AGGREGATE, FLAG_PREFIX},
    step::{down_sweep, up_sweep},
};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use cuda_std::{kernel, shared_array, thread};

#[kernel]
#[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
pub unsafe fn clear_buffer(
    partition_index_buffer: *mut u32,
    partition_descriptor_buffer: *mut u64,
    num_elements: u32,
    group_offset: u32,
) {
    let i = thread_index(group_offset);
    if i == 0 {
        *partition_index_buffer = 0;
    }
    if i < num_elements as usize {
        *partition_descriptor_buffer.add(i) = 0;
    }
}

/// Scans the partition the group claims from the shared counter, resolving
/// its prefix from the descriptors of earlier partitions.
#[kernel]
#[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
pub unsafe fn one_sweep_scan(
    data_buffer: *mut u32,
    partition_index_buffer: *mut u32,
    partition_descriptor_buffer: *mut u64,
    num_elements: u32,
    is_inclusive_scan: u32,
) {
    let t = thread::thread_idx_x() as usize;
    let half = thread::block_dim_x() as usize;
    let lanes = ELEMENTS_PER_GROUP as usize;
    let n = num_elements as usize;
    let shared = shared_array![u32; 2];
    let tree = shared_array![u32; ELEMENTS_PER_GROUP as usize];

    if t == 0 {
        let counter = &*(partition_index_buffer as *const AtomicU32);
        *shared = counter.fetch_add(1, Ordering::Relaxed);
    }
    thread::sync_threads();
    let partition = *shared as usize;
    let base = partition * lanes;
    if base >= n {
        return;
    }

    let mut inputs = [0u32; 2];
    for (k, input) in [t, t + half].into_iter().zip(inputs.iter_mut()) {
        if base + k < n {
            *input = *data_buffer.add(base + k);
        }
        *tree.add(k) = *input;
    }
    for stride in up_sweep(lanes) {
        thread::sync_threads();
        let i = (t + 1) * 2 * stride - 1;
        if i < lanes {
            *tree.add(i) = (*tree.add(i - stride)).wrapping_add(*tree.add(i));
        }
    }
    thread::sync_threads();

    if t == 0 {
        let descriptors = partition_descriptor_buffer as *const AtomicU64;
        let aggregate = *tree.add(lanes - 1);
        let flag = if partition == 0 { FLAG_PREFIX } else { FLAG_AGGREGATE };
        (*descriptors.add(partition)).store(pack(flag, aggregate), Ordering::Release);

        let mut exclusive = 0u32;
        let mut predecessor = partition;
        while predecessor > 0 {
            let (flag, value) = unpack((*descriptors.add(predecessor - 1)).load(Ordering::Acquire));
            if flag == FLAG_PREFIX {
                exclusive = exclusive.wrapping_add(value);
                break;
            } else if flag == FLAG_AGGREGATE {
                exclusive = exclusive.wrapping_add(value);
                predecessor -= 1;
            }
        }
        if partition > 0 {
            (*descriptors.add(partition))
                .store(pack(FLAG_PREFIX, exclusive.wrapping_add(aggregate)), Ordering::Release);
        }
        *shared.add(1) = exclusive;
        *tree.add(lanes - 1) = 0;
    }

    for stride in down_sweep(lanes) {
        thread::sync_threads();
        let i = (t + 1) * 2 * stride - 1;
        if i < lanes {
            let left = *tree.add(i - stride);
            *tree.add(i - stride) = *tree.add(i);
            *tree.add(i) = left.wrapping_add(*tree.add(i));
        }
    }
    thread::sync_threads();

    let exclusive = *shared.add(1);
    for (k, input) in [t, t + half].into_iter().zip(inputs) {
        if base + k < n {
            let mut value = exclusive.wrapping_add(*tree.add(k));
            if is_inclusive_scan != 0 {
                value = value.wrapping_add(input);
            }
            *data_buffer.add(base + k) = value;
        }
    }
}
