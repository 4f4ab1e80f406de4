use super::copy_record;
use crate::{
    dispatch::{sort_dispatch_args, SORT_DISPATCH_WORDS, SORT_ELEMENTS_PER_GROUP},
    values::{digit, sort_key, SortOrder, ValueType, NWAY},
};
use cuda_std::{kernel, shared_array, thread};

const GROUP: usize = SORT_ELEMENTS_PER_GROUP as usize;

#[kernel]
#[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
pub unsafe fn compute_dispatch_size(
    start_end_index_buffer: *const u32,
    group_size_buffer_write: *mut u32,
    num_elements: u32,
) {
    if thread::thread_idx_x() != 0 || thread::block_idx_x() != 0 {
        return;
    }
    let args = sort_dispatch_args(
        *start_end_index_buffer,
        *start_end_index_buffer.add(1),
        num_elements,
        SORT_ELEMENTS_PER_GROUP,
    );
    for (w, &value) in args.iter().enumerate().take(SORT_DISPATCH_WORDS) {
        *group_size_buffer_write.add(w) = value;
    }
}

/// Range, group count and key interpretation of one digit pass.
struct Pass {
    start: usize,
    end: usize,
    group_count: usize,
    stride_words: usize,
    key_type: ValueType,
    order: SortOrder,
    bit_shift: u32,
}

impl Pass {
    #[allow(clippy::too_many_arguments)]
    unsafe fn new(
        indirect: Option<*const u32>,
        stride_words: u32,
        key_type: u32,
        sorting_order: u32,
        bit_shift: u32,
        start: u32,
        end: u32,
        group_count: u32,
    ) -> Self {
        let (start, end, group_count) = match indirect {
            Some(args) => (*args.add(4), *args.add(5), *args.add(3)),
            None => (start, end, group_count),
        };
        Self {
            start: start as usize,
            end: end as usize,
            group_count: group_count as usize,
            stride_words: stride_words as usize,
            key_type: ValueType::from_u32(key_type).unwrap_or_default(),
            order: SortOrder::from_u32(sorting_order).unwrap_or_default(),
            bit_shift,
        }
    }

    unsafe fn digit_at(&self, data: *const u32, record: usize) -> usize {
        let word = *data.add(record * self.stride_words);
        digit(sort_key(self.key_type, self.order, word), self.bit_shift)
    }
}

/// Linear group index over a grid that may span y.
fn group() -> usize {
    (thread::block_idx_y() * thread::grid_dim_x() + thread::block_idx_x()) as usize
}

/// Stable partition of one group's records by digit, recording the group's
/// digit counts digit-major and the first local index of every digit.
unsafe fn sort_local(
    pass: Pass,
    data_in: *const u32,
    data_out: *mut u32,
    first_index: *mut u32,
    group_sums: *mut u32,
) {
    let g = group();
    if g >= pass.group_count {
        return;
    }
    let t = thread::thread_idx_x() as usize;
    let first = pass.start + g * GROUP;
    let len = (pass.end - first).min(GROUP);

    let digits = shared_array![u32; GROUP];
    let offsets = shared_array![u32; NWAY];
    if t < len {
        *digits.add(t) = pass.digit_at(data_in, first + t) as u32;
    }
    thread::sync_threads();

    if t < NWAY {
        let mut count = 0;
        for j in 0..len {
            if *digits.add(j) == t as u32 {
                count += 1;
            }
        }
        *offsets.add(t) = count;
        *group_sums.add(t * pass.group_count + g) = count;
    }
    thread::sync_threads();

    if t == 0 {
        let mut running = 0;
        for d in 0..NWAY {
            let count = *offsets.add(d);
            *offsets.add(d) = running;
            *first_index.add(NWAY * g + d) = running;
            running += count;
        }
    }
    thread::sync_threads();

    if t < len {
        let d = *digits.add(t);
        let mut rank = 0;
        for j in 0..t {
            if *digits.add(j) == d {
                rank += 1;
            }
        }
        let to = first + (*offsets.add(d as usize) + rank) as usize;
        copy_record(data_in, first + t, data_out, to, pass.stride_words);
    }
}

/// Scatters each locally sorted record to its digit's global offset.
unsafe fn scatter(
    pass: Pass,
    data_in: *const u32,
    data_out: *mut u32,
    first_index: *const u32,
    global_prefix_sum: *const u32,
) {
    let g = group();
    if g >= pass.group_count {
        return;
    }
    let t = thread::thread_idx_x() as usize;
    let record = pass.start + g * GROUP + t;
    if record >= pass.end {
        return;
    }
    let d = pass.digit_at(data_in, record);
    let local = t - *first_index.add(NWAY * g + d) as usize;
    let to = pass.start + *global_prefix_sum.add(d * pass.group_count + g) as usize + local;
    copy_record(data_in, record, data_out, to, pass.stride_words);
}

macro_rules! sort_kernels {
    ($($name:ident => $body:ident, $second:ident, $indirect:expr;)*) => {$(
        #[kernel]
        #[allow(improper_ctypes_definitions, clippy::missing_safety_doc, clippy::too_many_arguments)]
        pub unsafe fn $name(
            data_in_buffer: *const u32,
            data_out_buffer: *mut u32,
            first_index_buffer: *mut u32,
            $second: *mut u32,
            group_size_buffer_read: *const u32,
            stride_words: u32,
            key_type: u32,
            sorting_order: u32,
            bit_shift: u32,
            start_index: u32,
            end_index: u32,
            _group_size_x: u32,
            _group_size_y: u32,
            _group_size_z: u32,
            group_count: u32,
        ) {
            let indirect = if $indirect { Some(group_size_buffer_read) } else { None };
            let pass = Pass::new(
                indirect,
                stride_words,
                key_type,
                sorting_order,
                bit_shift,
                start_index,
                end_index,
                group_count,
            );
            $body(pass, data_in_buffer, data_out_buffer, first_index_buffer, $second)
        }
    )*};
}

sort_kernels! {
    radix_sort_local => sort_local, group_sum_buffer, false;
    radix_sort_local_use_indirect_dispatch => sort_local, group_sum_buffer, true;
    global_shuffle => scatter, global_prefix_sum_buffer, false;
    global_shuffle_use_indirect_dispatch => scatter, global_prefix_sum_buffer, true;
}
