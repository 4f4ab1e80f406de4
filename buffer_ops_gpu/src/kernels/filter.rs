use super::{copy_record, thread_index};
use cuda_std::kernel;

#[kernel]
#[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
pub unsafe fn extract_flags(
    data_buffer: *const u32,
    flag_buffer: *mut u32,
    num_elements: u32,
    stride_words: u32,
    group_offset: u32,
) {
    let i = thread_index(group_offset);
    if i < num_elements as usize {
        *flag_buffer.add(i) = (*data_buffer.add(i * stride_words as usize) != 0) as u32;
    }
}

#[kernel]
#[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
pub unsafe fn compact(
    data_in_buffer: *const u32,
    data_out_buffer: *mut u32,
    flag_scan_buffer: *const u32,
    num_elements: u32,
    stride_words: u32,
    group_offset: u32,
) {
    let i = thread_index(group_offset);
    let sw = stride_words as usize;
    if i < num_elements as usize && *data_in_buffer.add(i * sw) != 0 {
        let slot = *flag_scan_buffer.add(i) as usize;
        copy_record(data_in_buffer, i, data_out_buffer, slot, sw);
    }
}

/// Copies back the kept records; their count was left on the device by the
/// flag scan.
#[kernel]
#[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
pub unsafe fn copy_filtered(
    data_in_buffer: *const u32,
    data_out_buffer: *mut u32,
    count_buffer: *const u32,
    count_offset: u32,
    num_elements: u32,
    stride_words: u32,
    group_offset: u32,
) {
    let i = thread_index(group_offset);
    let kept = *count_buffer.add(count_offset as usize);
    if i < num_elements as usize && i < kept as usize {
        copy_record(data_in_buffer, i, data_out_buffer, i, stride_words as usize);
    }
}
