use super::group_index;
use crate::{
    step::{down_sweep, up_sweep},
    values::ValueType,
};
use cuda_std::{kernel, shared_array, thread};

/// Lanes of the widest scan group: 512 threads, two elements each.
const MAX_LANES: usize = 1024;

/// Work-efficient scan of one group's `2 * block_dim` elements. The group
/// total lands in `group_sums[group_sum_offset + group]`.
#[allow(clippy::too_many_arguments)]
unsafe fn local_scan(
    ty: ValueType,
    data: *mut u32,
    group_sums: *mut u32,
    num_elements: u32,
    is_inclusive_scan: u32,
    group_offset: u32,
    group_sum_offset: u32,
) {
    let t = thread::thread_idx_x() as usize;
    let half = thread::block_dim_x() as usize;
    let lanes = 2 * half;
    let group = group_index(group_offset);
    let base = group * lanes;
    let n = num_elements as usize;

    let tree = shared_array![u32; MAX_LANES];
    let mut inputs = [0u32; 2];
    for (k, input) in [t, t + half].into_iter().zip(inputs.iter_mut()) {
        if base + k < n {
            *input = *data.add(base + k);
        }
        *tree.add(k) = *input;
    }

    for stride in up_sweep(lanes) {
        thread::sync_threads();
        let i = (t + 1) * 2 * stride - 1;
        if i < lanes {
            *tree.add(i) = ty.add(*tree.add(i - stride), *tree.add(i));
        }
    }

    thread::sync_threads();
    if t == 0 {
        *group_sums.add(group_sum_offset as usize + group) = *tree.add(lanes - 1);
        *tree.add(lanes - 1) = 0;
    }

    for stride in down_sweep(lanes) {
        thread::sync_threads();
        let i = (t + 1) * 2 * stride - 1;
        if i < lanes {
            let left = *tree.add(i - stride);
            *tree.add(i - stride) = *tree.add(i);
            *tree.add(i) = ty.add(left, *tree.add(i));
        }
    }

    thread::sync_threads();
    for (k, input) in [t, t + half].into_iter().zip(inputs) {
        if base + k < n {
            let prefix = *tree.add(k);
            *data.add(base + k) = if is_inclusive_scan != 0 {
                ty.add(prefix, input)
            } else {
                prefix
            };
        }
    }
}

unsafe fn add_group_sum(
    ty: ValueType,
    data: *mut u32,
    group_sums: *const u32,
    num_elements: u32,
    group_offset: u32,
) {
    let t = thread::thread_idx_x() as usize;
    let half = thread::block_dim_x() as usize;
    let group = group_index(group_offset);
    let base = group * 2 * half;
    let prefix = *group_sums.add(group);
    for k in [t, t + half] {
        if base + k < num_elements as usize {
            *data.add(base + k) = ty.add(prefix, *data.add(base + k));
        }
    }
}

macro_rules! scan_kernels {
    ($($local:ident, $add:ident => $ty:expr;)*) => {$(
        #[kernel]
        #[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
        pub unsafe fn $local(
            data_buffer: *mut u32,
            group_sum_buffer: *mut u32,
            num_elements: u32,
            is_inclusive_scan: u32,
            group_offset: u32,
            group_sum_offset: u32,
        ) {
            local_scan(
                $ty,
                data_buffer,
                group_sum_buffer,
                num_elements,
                is_inclusive_scan,
                group_offset,
                group_sum_offset,
            )
        }

        #[kernel]
        #[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
        pub unsafe fn $add(
            data_buffer: *mut u32,
            group_sum_buffer: *const u32,
            num_elements: u32,
            group_offset: u32,
        ) {
            add_group_sum($ty, data_buffer, group_sum_buffer, num_elements, group_offset)
        }
    )*};
}

// The thread count is read from the block size, so the thread-count
// specializations of a value domain share one body.
scan_kernels! {
    local_scan_data_type_uint_num_group_threads_128, add_group_sum_data_type_uint_num_group_threads_128 => ValueType::Uint;
    local_scan_data_type_uint_num_group_threads_256, add_group_sum_data_type_uint_num_group_threads_256 => ValueType::Uint;
    local_scan_data_type_uint_num_group_threads_512, add_group_sum_data_type_uint_num_group_threads_512 => ValueType::Uint;
    local_scan_data_type_int_num_group_threads_128, add_group_sum_data_type_int_num_group_threads_128 => ValueType::Int;
    local_scan_data_type_int_num_group_threads_256, add_group_sum_data_type_int_num_group_threads_256 => ValueType::Int;
    local_scan_data_type_int_num_group_threads_512, add_group_sum_data_type_int_num_group_threads_512 => ValueType::Int;
    local_scan_data_type_float_num_group_threads_128, add_group_sum_data_type_float_num_group_threads_128 => ValueType::Float;
    local_scan_data_type_float_num_group_threads_256, add_group_sum_data_type_float_num_group_threads_256 => ValueType::Float;
    local_scan_data_type_float_num_group_threads_512, add_group_sum_data_type_float_num_group_threads_512 => ValueType::Float;
}
