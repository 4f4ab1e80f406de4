use super::{shuffle::copy_records, EmuProgram, Launch};
use crate::error::{Error, Result};
use rayon::prelude::*;

pub(super) fn program() -> EmuProgram {
    EmuProgram::new()
        .entry("extract_flags", extract_flags)
        .entry("compact", compact)
        .entry("copy_filtered", copy_filtered)
}

fn extract_flags(launch: &Launch<'_>) -> Result<()> {
    let num_elements = launch.index("num_elements")?;
    let sw = launch.stride_words("data_buffer")?;
    let range = launch.thread_range(num_elements)?;

    let data = launch.words("data_buffer", range.end)?;
    let mut flags = launch.words_mut("flag_buffer", range.end)?;
    flags[range.clone()]
        .par_iter_mut()
        .zip(data[range.start * sw..range.end * sw].par_chunks(sw))
        .for_each(|(flag, record)| *flag = (record[0] != 0) as u32);
    Ok(())
}

fn compact(launch: &Launch<'_>) -> Result<()> {
    let num_elements = launch.index("num_elements")?;
    let sw = launch.stride_words("data_in_buffer")?;
    let range = launch.thread_range(num_elements)?;
    if launch.stride_words("data_out_buffer")? != sw {
        return Err(Error::InvalidStride {
            stride: launch.buffer("data_out_buffer")?.stride(),
            required: sw * 4,
        });
    }

    let input = launch.words("data_in_buffer", num_elements)?;
    let slots = launch.words("flag_scan_buffer", range.end)?;
    let mut output = launch.words_mut("data_out_buffer", num_elements)?;
    for i in range {
        let record = &input[i * sw..(i + 1) * sw];
        if record[0] != 0 {
            let slot = slots[i] as usize;
            output[slot * sw..(slot + 1) * sw].copy_from_slice(record);
        }
    }
    Ok(())
}

/// Copies the first `count` records back, with `count` read from the device.
fn copy_filtered(launch: &Launch<'_>) -> Result<()> {
    let num_elements = launch.index("num_elements")?;
    let count_offset = launch.index("count_offset")?;
    let count = launch.words("count_buffer", count_offset + 1)?[count_offset] as usize;
    copy_records(
        launch,
        "data_in_buffer",
        "data_out_buffer",
        count.min(num_elements),
    )
}
