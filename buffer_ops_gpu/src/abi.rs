//! Launch ABI of the compiled kernels.
//!
//! The host binds parameters by name; backends that launch compiled code need
//! them in declaration order. Integer-array parameters are passed as one
//! scalar per element, buffers as device pointers.

/// Parameter order of every kernel entry point, by entry name.
pub const SIGNATURES: &[(&str, &[&str])] = &[
    // prefix_scan
    (
        "local_scan",
        &[
            "data_buffer",
            "group_sum_buffer",
            "num_elements",
            "is_inclusive_scan",
            "group_offset",
            "group_sum_offset",
        ],
    ),
    (
        "add_group_sum",
        &["data_buffer", "group_sum_buffer", "num_elements", "group_offset"],
    ),
    // one_sweep_prefix_scan
    (
        "clear_buffer",
        &[
            "partition_index_buffer",
            "partition_descriptor_buffer",
            "num_elements",
            "group_offset",
        ],
    ),
    (
        "one_sweep_scan",
        &[
            "data_buffer",
            "partition_index_buffer",
            "partition_descriptor_buffer",
            "num_elements",
            "is_inclusive_scan",
        ],
    ),
    // radix_sort
    (
        "compute_dispatch_size",
        &["start_end_index_buffer", "group_size_buffer_write", "num_elements"],
    ),
    (
        "radix_sort_local",
        &[
            "data_in_buffer",
            "data_out_buffer",
            "first_index_buffer",
            "group_sum_buffer",
            "group_size_buffer_read",
            "stride_words",
            "key_type",
            "sorting_order",
            "bit_shift",
            "start_end_index",
            "group_size",
        ],
    ),
    (
        "global_shuffle",
        &[
            "data_in_buffer",
            "data_out_buffer",
            "first_index_buffer",
            "global_prefix_sum_buffer",
            "group_size_buffer_read",
            "stride_words",
            "key_type",
            "sorting_order",
            "bit_shift",
            "start_end_index",
            "group_size",
        ],
    ),
    // shuffle
    (
        "apply_bijective_function",
        &[
            "bijection_shuffle_buffer_write",
            "flag_scan_buffer_write",
            "num_elements",
            "num_pow_of_2_elements",
            "left_side_bits",
            "left_side_mask",
            "right_side_bits",
            "right_side_mask",
            "num_rounds",
            "key",
            "group_offset",
        ],
    ),
    (
        "shuffle_elements",
        &[
            "data_in_buffer",
            "data_out_buffer",
            "bijection_shuffle_buffer_read",
            "flag_scan_buffer_read",
            "num_elements",
            "num_pow_of_2_elements",
            "stride_words",
            "group_offset",
        ],
    ),
    (
        "copy_buffer",
        &[
            "data_in_buffer",
            "data_out_buffer",
            "num_elements",
            "stride_words",
            "group_offset",
        ],
    ),
    // filter
    (
        "extract_flags",
        &[
            "data_buffer",
            "flag_buffer",
            "num_elements",
            "stride_words",
            "group_offset",
        ],
    ),
    (
        "compact",
        &[
            "data_in_buffer",
            "data_out_buffer",
            "flag_scan_buffer",
            "num_elements",
            "stride_words",
            "group_offset",
        ],
    ),
    (
        "copy_filtered",
        &[
            "data_in_buffer",
            "data_out_buffer",
            "count_buffer",
            "count_offset",
            "num_elements",
            "stride_words",
            "group_offset",
        ],
    ),
];

/// Threads per group of every kernel not specialized on a
/// `NUM_GROUP_THREADS_*` flag.
pub const DEFAULT_GROUP_THREADS: u32 = 128;

/// Parameter order of `entry`.
pub fn signature(entry: &str) -> Option<&'static [&'static str]> {
    SIGNATURES
        .iter()
        .find(|(name, _)| *name == entry)
        .map(|(_, params)| *params)
}

/// Threads per group implied by a `NUM_GROUP_THREADS_*` flag.
pub fn group_threads_flag(flag: &str) -> Option<u32> {
    match flag {
        "NUM_GROUP_THREADS_128" => Some(128),
        "NUM_GROUP_THREADS_256" => Some(256),
        "NUM_GROUP_THREADS_512" => Some(512),
        _ => None,
    }
}

#[cfg(all(test, not(target_os = "cuda")))]
mod tests {
    use super::*;

    #[test]
    fn entries_are_unique() {
        for (i, (a, _)) in SIGNATURES.iter().enumerate() {
            for (b, _) in &SIGNATURES[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn finds_signature() {
        assert_eq!(signature("add_group_sum").map(|s| s.len()), Some(4));
        assert!(signature("missing").is_none());
    }
}
