use super::{EmuProgram, Launch};
use crate::error::{Error, Result};
use buffer_ops_gpu::{
    dispatch::{
        sort_dispatch_args, INDIRECT_DISPATCH_FLAG, SORT_DISPATCH_WORDS, SORT_ELEMENTS_PER_GROUP,
    },
    values::{digit, sort_key, SortOrder, ValueType, NWAY},
};
use rayon::prelude::*;

pub(super) fn program() -> EmuProgram {
    EmuProgram::new()
        .entry("compute_dispatch_size", compute_dispatch_size)
        .entry("radix_sort_local", radix_sort_local)
        .entry("global_shuffle", global_shuffle)
}

fn compute_dispatch_size(launch: &Launch<'_>) -> Result<()> {
    let num_elements = launch.uint("num_elements")?;
    let range = launch.words("start_end_index_buffer", 2)?;
    let args = sort_dispatch_args(range[0], range[1], num_elements, SORT_ELEMENTS_PER_GROUP);
    let mut out = launch.words_mut("group_size_buffer_write", SORT_DISPATCH_WORDS)?;
    out[..SORT_DISPATCH_WORDS].copy_from_slice(&args);
    Ok(())
}

/// Parameters shared by both passes of one digit.
struct DigitPass {
    start: usize,
    end: usize,
    group_count: usize,
    stride_words: usize,
    key_type: ValueType,
    order: SortOrder,
    bit_shift: u32,
}

impl DigitPass {
    fn read(launch: &Launch<'_>) -> Result<Self> {
        let (start, end, group_count) = if launch.kernel().has_flag(INDIRECT_DISPATCH_FLAG) {
            let args = launch.words("group_size_buffer_read", SORT_DISPATCH_WORDS)?;
            (args[4], args[5], args[3])
        } else {
            let range = launch.uints("start_end_index", 2)?;
            let size = launch.uints("group_size", 4)?;
            (range[0], range[1], size[3])
        };
        let key_type = launch.uint("key_type")?;
        let order = launch.uint("sorting_order")?;
        Ok(Self {
            start: start as usize,
            end: end as usize,
            group_count: group_count as usize,
            stride_words: launch.stride_words("data_in_buffer")?,
            key_type: ValueType::from_u32(key_type).ok_or_else(|| bad_param(launch, "key_type"))?,
            order: SortOrder::from_u32(order).ok_or_else(|| bad_param(launch, "sorting_order"))?,
            bit_shift: launch.uint("bit_shift")?,
        })
    }

    fn digit_of(&self, record: &[u32]) -> usize {
        digit(sort_key(self.key_type, self.order, record[0]), self.bit_shift)
    }

    /// Word range of the sorted records.
    fn words(&self) -> std::ops::Range<usize> {
        self.start * self.stride_words..self.end * self.stride_words
    }

    /// Groups that do work: launched and within the group count.
    fn active_groups(&self, launch: &Launch<'_>) -> usize {
        launch.group_count().min(self.group_count)
    }

    fn check_stride(&self, launch: &Launch<'_>, name: &str) -> Result<()> {
        let stride = launch.stride_words(name)?;
        if stride != self.stride_words {
            return Err(Error::InvalidStride {
                stride: stride * 4,
                required: self.stride_words * 4,
            });
        }
        Ok(())
    }
}

fn bad_param(launch: &Launch<'_>, name: &str) -> Error {
    Error::ParamType {
        kernel: launch.kernel().to_string(),
        name: name.to_string(),
    }
}

/// Stable partition of one group's records by digit. Returns the digit
/// histogram.
fn sort_group(pass: &DigitPass, input: &[u32], output: &mut [u32]) -> [u32; NWAY] {
    let sw = pass.stride_words;
    let mut counts = [0u32; NWAY];
    for record in input.chunks_exact(sw) {
        counts[pass.digit_of(record)] += 1;
    }

    let mut next = exclusive_prefix(&counts);
    for record in input.chunks_exact(sw) {
        let d = pass.digit_of(record);
        let at = next[d] as usize * sw;
        output[at..at + sw].copy_from_slice(record);
        next[d] += 1;
    }
    counts
}

fn exclusive_prefix(counts: &[u32; NWAY]) -> [u32; NWAY] {
    let mut prefix = [0u32; NWAY];
    for d in 1..NWAY {
        prefix[d] = prefix[d - 1] + counts[d - 1];
    }
    prefix
}

fn radix_sort_local(launch: &Launch<'_>) -> Result<()> {
    let pass = DigitPass::read(launch)?;
    pass.check_stride(launch, "data_out_buffer")?;
    let groups = pass.active_groups(launch);
    let per_group = SORT_ELEMENTS_PER_GROUP as usize * pass.stride_words;

    let input = launch.words("data_in_buffer", pass.end)?;
    let mut output = launch.words_mut("data_out_buffer", pass.end)?;
    let mut first_index = launch.words_mut("first_index_buffer", NWAY * pass.group_count)?;
    let mut counts = launch.words_mut("group_sum_buffer", NWAY * pass.group_count)?;

    let histograms: Vec<[u32; NWAY]> = input[pass.words()]
        .par_chunks(per_group)
        .zip(output[pass.words()].par_chunks_mut(per_group))
        .take(groups)
        .map(|(src, dst)| sort_group(&pass, src, dst))
        .collect();

    for (g, histogram) in histograms.iter().enumerate() {
        first_index[NWAY * g..NWAY * (g + 1)].copy_from_slice(&exclusive_prefix(histogram));
        for (d, &count) in histogram.iter().enumerate() {
            counts[d * pass.group_count + g] = count;
        }
    }
    Ok(())
}

fn global_shuffle(launch: &Launch<'_>) -> Result<()> {
    let pass = DigitPass::read(launch)?;
    pass.check_stride(launch, "data_out_buffer")?;
    let groups = pass.active_groups(launch);
    let sw = pass.stride_words;
    let per_group = SORT_ELEMENTS_PER_GROUP as usize * sw;

    let input = launch.words("data_in_buffer", pass.end)?;
    let first_index = launch.words("first_index_buffer", NWAY * pass.group_count)?;
    let offsets = launch.words("global_prefix_sum_buffer", NWAY * pass.group_count)?;
    let (first_index, offsets): (&[u32], &[u32]) = (&first_index, &offsets);

    let destinations: Vec<Vec<usize>> = input[pass.words()]
        .par_chunks(per_group)
        .take(groups)
        .enumerate()
        .map(|(g, records)| {
            records
                .chunks_exact(sw)
                .enumerate()
                .map(|(j, record)| {
                    let d = pass.digit_of(record);
                    let local = j - first_index[NWAY * g + d] as usize;
                    pass.start + offsets[d * pass.group_count + g] as usize + local
                })
                .collect()
        })
        .collect();

    let mut output = launch.words_mut("data_out_buffer", pass.end)?;
    let records = input[pass.words()].chunks_exact(sw);
    for (record, &dest) in records.zip(destinations.iter().flatten()) {
        if dest < pass.start || dest >= pass.end {
            return Err(Error::OutOfBounds {
                id: launch.buffer("data_out_buffer")?.id(),
                start: dest,
                end: dest + 1,
                count: pass.end,
            });
        }
        output[dest * sw..(dest + 1) * sw].copy_from_slice(record);
    }
    Ok(())
}
