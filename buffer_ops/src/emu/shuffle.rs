use super::{EmuProgram, Launch};
use crate::error::{Error, Result};
use buffer_ops_gpu::bijection::{Feistel, MAX_ROUNDS};
use rayon::prelude::*;

pub(super) fn program() -> EmuProgram {
    EmuProgram::new()
        .entry("apply_bijective_function", apply_bijective_function)
        .entry("shuffle_elements", shuffle_elements)
        .entry("copy_buffer", copy_buffer)
}

fn apply_bijective_function(launch: &Launch<'_>) -> Result<()> {
    let num_elements = launch.uint("num_elements")?;
    let domain = launch.index("num_pow_of_2_elements")?;
    let keys = launch.uints("key", MAX_ROUNDS as usize)?;
    let mut feistel = Feistel {
        left_bits: launch.uint("left_side_bits")?,
        left_mask: launch.uint("left_side_mask")?,
        right_bits: launch.uint("right_side_bits")?,
        right_mask: launch.uint("right_side_mask")?,
        rounds: launch.uint("num_rounds")?,
        keys: [0; MAX_ROUNDS as usize],
    };
    feistel.keys.copy_from_slice(keys);
    let range = launch.thread_range(domain)?;

    let mut bijection = launch.words_mut("bijection_shuffle_buffer_write", range.end)?;
    let mut flags = launch.words_mut("flag_scan_buffer_write", range.end)?;
    let first = range.start as u32;
    bijection[range.clone()]
        .par_iter_mut()
        .zip(flags[range].par_iter_mut())
        .enumerate()
        .for_each(|(i, (image, flag))| {
            *image = feistel.permute(first + i as u32);
            *flag = (*image < num_elements) as u32;
        });
    Ok(())
}

fn shuffle_elements(launch: &Launch<'_>) -> Result<()> {
    let num_elements = launch.index("num_elements")?;
    let domain = launch.index("num_pow_of_2_elements")?;
    let sw = launch.stride_words("data_in_buffer")?;
    let range = launch.thread_range(domain)?;

    let input = launch.words("data_in_buffer", num_elements)?;
    let bijection = launch.words("bijection_shuffle_buffer_read", range.end)?;
    let slots = launch.words("flag_scan_buffer_read", range.end)?;
    let mut output = launch.words_mut("data_out_buffer", num_elements)?;
    if launch.stride_words("data_out_buffer")? != sw {
        return Err(Error::InvalidStride {
            stride: launch.buffer("data_out_buffer")?.stride(),
            required: sw * 4,
        });
    }

    for i in range {
        let source = bijection[i] as usize;
        if source < num_elements {
            let slot = slots[i] as usize;
            output[slot * sw..(slot + 1) * sw].copy_from_slice(&input[source * sw..(source + 1) * sw]);
        }
    }
    Ok(())
}

/// Copies whole records; shared with the filter program.
pub(super) fn copy_records(
    launch: &Launch<'_>,
    input_name: &str,
    output_name: &str,
    count: usize,
) -> Result<()> {
    let sw = launch.stride_words(input_name)?;
    let range = launch.thread_range(count)?;
    let input = launch.words(input_name, range.end)?;
    let mut output = launch.words_mut(output_name, range.end)?;
    if launch.stride_words(output_name)? != sw {
        return Err(Error::InvalidStride {
            stride: launch.buffer(output_name)?.stride(),
            required: sw * 4,
        });
    }
    let words = range.start * sw..range.end * sw;
    output[words.clone()].copy_from_slice(&input[words]);
    Ok(())
}

fn copy_buffer(launch: &Launch<'_>) -> Result<()> {
    let num_elements = launch.index("num_elements")?;
    copy_records(launch, "data_in_buffer", "data_out_buffer", num_elements)
}
