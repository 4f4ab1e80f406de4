use super::{EmuProgram, Launch};
use crate::error::{Error, Result};
use buffer_ops_gpu::look_back::{
    pack, unpack, ELEMENTS_PER_GROUP, FLAG_AGGREGATE, FLAG_PREFIX, GROUP_THREADS,
};
use rayon::prelude::*;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Mutex,
};

pub(super) fn program() -> EmuProgram {
    EmuProgram::new()
        .entry("clear_buffer", clear_buffer)
        .entry("one_sweep_scan", one_sweep_scan)
}

fn clear_buffer(launch: &Launch<'_>) -> Result<()> {
    let descriptors = launch.index("num_elements")?;
    let first = launch.index("group_offset")? * GROUP_THREADS as usize;
    let last = (first + launch.group_count() * GROUP_THREADS as usize).min(descriptors);

    if first == 0 {
        launch.words_mut("partition_index_buffer", 1)?[0] = 0;
    }
    if first < last {
        let mut words = launch.words_mut("partition_descriptor_buffer", last)?;
        words[2 * first..2 * last].fill(0);
    }
    Ok(())
}

/// Single-pass scan: groups claim partitions in order, publish their
/// aggregate, then walk back over predecessors until an inclusive prefix
/// resolves their own.
fn one_sweep_scan(launch: &Launch<'_>) -> Result<()> {
    let num_elements = launch.index("num_elements")?;
    let inclusive = launch.uint("is_inclusive_scan")? != 0;
    let per_group = ELEMENTS_PER_GROUP as usize;
    let partitions = (num_elements + per_group - 1) / per_group;

    let mut index = launch.words_mut("partition_index_buffer", 1)?;
    let mut descriptor_words = launch.words_mut("partition_descriptor_buffer", partitions)?;
    let mut data = launch.words_mut("data_buffer", num_elements)?;

    let next_partition = AtomicU32::new(index[0]);
    let descriptors: Vec<AtomicU64> = descriptor_words
        .chunks_exact(2)
        .take(partitions)
        .map(|w| AtomicU64::new(pack(w[0], w[1])))
        .collect();
    let chunks: Vec<Mutex<&mut [u32]>> = data[..num_elements]
        .chunks_mut(per_group)
        .map(Mutex::new)
        .collect();

    (0..launch.group_count())
        .into_par_iter()
        .try_for_each(|_| -> Result<()> {
            let partition = next_partition.fetch_add(1, Ordering::Relaxed) as usize;
            let Some(chunk) = chunks.get(partition) else {
                return Ok(());
            };
            let mut chunk = chunk
                .lock()
                .map_err(|_| Error::Internal(format!("partition {partition} lock poisoned")))?;

            let aggregate = chunk.iter().fold(0u32, |sum, &v| sum.wrapping_add(v));
            let flag = if partition == 0 {
                FLAG_PREFIX
            } else {
                FLAG_AGGREGATE
            };
            descriptors[partition].store(pack(flag, aggregate), Ordering::Release);

            let mut exclusive = 0u32;
            let mut predecessor = partition;
            while predecessor > 0 {
                let (flag, value) = unpack(descriptors[predecessor - 1].load(Ordering::Acquire));
                match flag {
                    FLAG_PREFIX => {
                        exclusive = exclusive.wrapping_add(value);
                        break;
                    }
                    FLAG_AGGREGATE => {
                        exclusive = exclusive.wrapping_add(value);
                        predecessor -= 1;
                    }
                    _ => std::hint::spin_loop(),
                }
            }
            if partition > 0 {
                descriptors[partition].store(
                    pack(FLAG_PREFIX, exclusive.wrapping_add(aggregate)),
                    Ordering::Release,
                );
            }

            let mut running = exclusive;
            for value in chunk.iter_mut() {
                let input = *value;
                if inclusive {
                    running = running.wrapping_add(input);
                    *value = running;
                } else {
                    *value = running;
                    running = running.wrapping_add(input);
                }
            }
            Ok(())
        })?;

    index[0] = next_partition.into_inner();
    for (words, descriptor) in descriptor_words.chunks_exact_mut(2).zip(descriptors) {
        let (flag, value) = unpack(descriptor.into_inner());
        words[0] = flag;
        words[1] = value;
    }
    Ok(())
}
