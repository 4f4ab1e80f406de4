//! Grid sizing shared by the host and the kernels that compute their own
//! dispatch arguments.

/// Hardware limit on the number of groups along one grid dimension.
pub const MAX_DISPATCH_SIZE: u32 = 65535;

/// Number of 32-bit words in the radix sort's indirect argument buffer:
/// `[x, y, z, group_count, start, end]`.
pub const SORT_DISPATCH_WORDS: usize = 6;

/// Specialization flag of the sort kernels that read their range and group
/// count from the indirect argument buffer instead of launch scalars.
pub const INDIRECT_DISPATCH_FLAG: &str = "USE_INDIRECT_DISPATCH";

/// Records handled by one radix-sort group, one per thread.
pub const SORT_ELEMENTS_PER_GROUP: u32 = 128;

#[inline]
pub const fn div_ceil(numerator: u32, denominator: u32) -> u32 {
    (numerator + denominator - 1) / denominator
}

/// Grid shape covering `group_count` groups without exceeding the
/// per-dimension limit. Kernels linearize `(x, y)` and skip groups past
/// `group_count`.
pub const fn sort_grid(group_count: u32) -> [u32; 3] {
    if group_count <= MAX_DISPATCH_SIZE {
        [group_count, 1, 1]
    } else if group_count <= 16 * MAX_DISPATCH_SIZE {
        [16, div_ceil(group_count, 16), 1]
    } else if group_count <= 128 * MAX_DISPATCH_SIZE {
        [128, div_ceil(group_count, 128), 1]
    } else {
        [1024, div_ceil(group_count, 1024), 1]
    }
}

/// Indirect arguments for sorting `[start, end)` of a buffer holding
/// `num_elements` records, clamping the range to the buffer.
pub fn sort_dispatch_args(
    start: u32,
    end: u32,
    num_elements: u32,
    elements_per_group: u32,
) -> [u32; SORT_DISPATCH_WORDS] {
    let end = if end < num_elements { end } else { num_elements };
    let start = if start < end { start } else { end };
    let group_count = div_ceil(end - start, elements_per_group);
    let [x, y, z] = sort_grid(group_count);
    [x, y, z, group_count, start, end]
}

#[cfg(all(test, not(target_os = "cuda")))]
mod tests {
    use super::*;

    #[test]
    fn grid_shapes_follow_thresholds() {
        assert_eq!(sort_grid(1), [1, 1, 1]);
        assert_eq!(sort_grid(MAX_DISPATCH_SIZE), [MAX_DISPATCH_SIZE, 1, 1]);
        assert_eq!(sort_grid(MAX_DISPATCH_SIZE + 1), [16, 4096, 1]);
        assert_eq!(sort_grid(16 * MAX_DISPATCH_SIZE + 1), [128, 8192, 1]);
        assert_eq!(sort_grid(128 * MAX_DISPATCH_SIZE + 1), [1024, 8192, 1]);
    }

    #[test]
    fn grids_cover_every_group() {
        for groups in [1, 70_000, 2_000_000, 9_000_000] {
            let [x, y, z] = sort_grid(groups);
            assert!(x * y * z >= groups);
            assert!(x <= MAX_DISPATCH_SIZE && y <= MAX_DISPATCH_SIZE);
        }
    }

    #[test]
    fn dispatch_args_clamp_range() {
        assert_eq!(sort_dispatch_args(10, 500, 300, 128), [3, 1, 1, 3, 10, 300]);
        assert_eq!(sort_dispatch_args(400, 500, 300, 128), [0, 1, 1, 0, 300, 300]);
        assert_eq!(sort_dispatch_args(0, 0, 300, 128), [0, 1, 1, 0, 0, 0]);
    }
}
