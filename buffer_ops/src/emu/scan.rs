use super::{EmuProgram, Launch};
use crate::device::Kernel;
use crate::error::Result;
use buffer_ops_gpu::{step, values::ValueType};
use rayon::prelude::*;

pub(super) fn program() -> EmuProgram {
    EmuProgram::new()
        .entry("local_scan", local_scan)
        .entry("add_group_sum", add_group_sum)
}

/// Value domain selected by the kernel's `DATA_TYPE_*` specialization.
pub(super) fn value_type(kernel: &Kernel) -> ValueType {
    [ValueType::Int, ValueType::Float]
        .into_iter()
        .find(|t| kernel.has_flag(t.flag()))
        .unwrap_or(ValueType::Uint)
}

/// Work-efficient scan of one group's elements, padded with zeros to
/// `lanes`. Returns the group total.
pub(super) fn scan_group(values: &mut [u32], lanes: usize, inclusive: bool, ty: ValueType) -> u32 {
    let mut tree = vec![0u32; lanes];
    tree[..values.len()].copy_from_slice(values);

    for stride in step::up_sweep(lanes) {
        for i in (2 * stride - 1..lanes).step_by(2 * stride) {
            tree[i] = ty.add(tree[i - stride], tree[i]);
        }
    }

    let total = tree[lanes - 1];
    tree[lanes - 1] = 0;

    for stride in step::down_sweep(lanes) {
        for i in (2 * stride - 1..lanes).step_by(2 * stride) {
            let left = tree[i - stride];
            tree[i - stride] = tree[i];
            tree[i] = ty.add(left, tree[i]);
        }
    }

    for (value, &prefix) in values.iter_mut().zip(&tree) {
        *value = if inclusive {
            ty.add(prefix, *value)
        } else {
            prefix
        };
    }
    total
}

fn local_scan(launch: &Launch<'_>) -> Result<()> {
    let ty = value_type(launch.kernel());
    let per_group = 2 * launch.group_threads();
    let num_elements = launch.index("num_elements")?;
    let inclusive = launch.uint("is_inclusive_scan")? != 0;
    let group_offset = launch.index("group_offset")?;
    let sum_offset = launch.index("group_sum_offset")?;
    let groups = launch.group_count();

    let start = (group_offset * per_group).min(num_elements);
    let end = ((group_offset + groups) * per_group).min(num_elements);
    let first_sum = sum_offset + group_offset;

    let mut data = launch.words_mut("data_buffer", end)?;
    let sums: Vec<u32> = data[start..end]
        .par_chunks_mut(per_group)
        .map(|chunk| scan_group(chunk, per_group, inclusive, ty))
        .collect();

    let mut group_sums = launch.words_mut("group_sum_buffer", first_sum + groups)?;
    let slots = &mut group_sums[first_sum..first_sum + groups];
    slots.fill(0);
    slots[..sums.len()].copy_from_slice(&sums);
    Ok(())
}

fn add_group_sum(launch: &Launch<'_>) -> Result<()> {
    let ty = value_type(launch.kernel());
    let per_group = 2 * launch.group_threads();
    let num_elements = launch.index("num_elements")?;
    let group_offset = launch.index("group_offset")?;
    let groups = launch.group_count();

    let start = (group_offset * per_group).min(num_elements);
    let end = ((group_offset + groups) * per_group).min(num_elements);

    let group_sums = launch.words("group_sum_buffer", group_offset + groups)?;
    let mut data = launch.words_mut("data_buffer", end)?;
    data[start..end]
        .par_chunks_mut(per_group)
        .zip(group_sums[group_offset..group_offset + groups].par_iter())
        .for_each(|(chunk, &prefix)| {
            for value in chunk {
                *value = ty.add(prefix, *value);
            }
        });
    Ok(())
}
