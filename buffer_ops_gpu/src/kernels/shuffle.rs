use super::{copy_record, thread_index};
use crate::bijection::{Feistel, MAX_ROUNDS};
use cuda_std::kernel;

#[kernel]
#[allow(improper_ctypes_definitions, clippy::missing_safety_doc, clippy::too_many_arguments)]
pub unsafe fn apply_bijective_function(
    bijection_shuffle_buffer_write: *mut u32,
    flag_scan_buffer_write: *mut u32,
    num_elements: u32,
    num_pow_of_2_elements: u32,
    left_side_bits: u32,
    left_side_mask: u32,
    right_side_bits: u32,
    right_side_mask: u32,
    num_rounds: u32,
    key_0: u32,
    key_1: u32,
    key_2: u32,
    key_3: u32,
    group_offset: u32,
) {
    let i = thread_index(group_offset);
    if i >= num_pow_of_2_elements as usize {
        return;
    }
    let feistel = Feistel {
        left_bits: left_side_bits,
        left_mask: left_side_mask,
        right_bits: right_side_bits,
        right_mask: right_side_mask,
        rounds: if num_rounds > MAX_ROUNDS { MAX_ROUNDS } else { num_rounds },
        keys: [key_0, key_1, key_2, key_3],
    };
    let image = feistel.permute(i as u32);
    *bijection_shuffle_buffer_write.add(i) = image;
    *flag_scan_buffer_write.add(i) = (image < num_elements) as u32;
}

/// Moves the record each valid image names into the slot its flag scan
/// assigns.
#[kernel]
#[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
pub unsafe fn shuffle_elements(
    data_in_buffer: *const u32,
    data_out_buffer: *mut u32,
    bijection_shuffle_buffer_read: *const u32,
    flag_scan_buffer_read: *const u32,
    num_elements: u32,
    num_pow_of_2_elements: u32,
    stride_words: u32,
    group_offset: u32,
) {
    let i = thread_index(group_offset);
    if i >= num_pow_of_2_elements as usize {
        return;
    }
    let source = *bijection_shuffle_buffer_read.add(i);
    if source < num_elements {
        let slot = *flag_scan_buffer_read.add(i) as usize;
        copy_record(
            data_in_buffer,
            source as usize,
            data_out_buffer,
            slot,
            stride_words as usize,
        );
    }
}

#[kernel]
#[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
pub unsafe fn copy_buffer(
    data_in_buffer: *const u32,
    data_out_buffer: *mut u32,
    num_elements: u32,
    stride_words: u32,
    group_offset: u32,
) {
    let i = thread_index(group_offset);
    if i < num_elements as usize {
        copy_record(data_in_buffer, i, data_out_buffer, i, stride_words as usize);
    }
}
