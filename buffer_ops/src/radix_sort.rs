//! Stable 16-way LSD radix sort of fixed-stride records.
//!
//! Each digit pass sorts every group of records locally by the current 4-bit
//! digit, scans the per-group digit counts into global offsets, and scatters
//! the locally sorted records to their final positions. Both halves keep
//! equal digits in input order, so the sort is stable.

use crate::device::{
    div_ceil, to_u32, upload, write, Args, Buffer, Device, DeviceLoader, Grid, Kernel, Param,
    ProgramLoader,
};
use crate::error::{config, internal, Result};
use crate::scan::{PrefixScan, ScanOptions};
use buffer_ops_gpu::{
    dispatch::{
        sort_dispatch_args, sort_grid, INDIRECT_DISPATCH_FLAG, SORT_DISPATCH_WORDS,
        SORT_ELEMENTS_PER_GROUP,
    },
    values::{key_bits, SortOrder, ValueType, NWAY, RADIX_BITS},
};
use tracing::{debug, trace};

/// Logical name of the program holding the sort kernels.
pub const PROGRAM: &str = "radix_sort";

/// The records to sort.
#[derive(Debug, Clone, Copy, Default)]
pub enum SortRange<'a> {
    /// Every record of the buffer.
    #[default]
    All,
    /// Records `start..end`, known on the host.
    Host { start: usize, end: usize },
    /// Records `start..end` with `[start, end]` held in the first two words of
    /// a device buffer. The range is clamped to the data buffer on device and
    /// never read back.
    Device(&'a Buffer),
}

#[derive(Debug, Clone, Copy)]
pub struct SortOptions<'a> {
    pub order: SortOrder,
    pub key_type: ValueType,
    /// Largest unsigned key present. Bounds the number of digit passes for
    /// unsigned keys; ignored for signed and float keys.
    pub max_value: u32,
    pub range: SortRange<'a>,
}

impl Default for SortOptions<'_> {
    fn default() -> Self {
        Self {
            order: SortOrder::Ascending,
            key_type: ValueType::Uint,
            max_value: u32::MAX,
            range: SortRange::All,
        }
    }
}

impl<'a> SortOptions<'a> {
    pub fn ascending(key_type: ValueType) -> Self {
        Self {
            key_type,
            ..Self::default()
        }
    }

    pub fn descending(key_type: ValueType) -> Self {
        Self {
            key_type,
            order: SortOrder::Descending,
            ..Self::default()
        }
    }

    pub fn max_value(mut self, max_value: u32) -> Self {
        self.max_value = max_value;
        self
    }

    pub fn range(mut self, range: SortRange<'a>) -> Self {
        self.range = range;
        self
    }
}

/// Kernels, parameters and launch shape shared by every digit pass of one
/// sort call.
struct Passes {
    local: Kernel,
    shuffle: Kernel,
    local_args: Args,
    shuffle_args: Args,
    dispatch: Dispatch,
    /// Digit-count slots the scan must cover.
    scan_len: usize,
}

enum Dispatch {
    Direct(Grid),
    Indirect { args: Buffer, bound: Grid },
}

pub struct RadixSort<'d, D: Device + ?Sized> {
    device: &'d D,
    compute_dispatch_size: Kernel,
    radix_sort_local: Kernel,
    global_shuffle: Kernel,
    scan: PrefixScan<'d, D>,
    temp: Option<Buffer>,
    first_index: Option<Buffer>,
    group_sums: Option<Buffer>,
    dispatch_args: Option<Buffer>,
}

impl<'d, D: Device + ?Sized> RadixSort<'d, D> {
    pub fn new(device: &'d D) -> Result<Self> {
        Self::with_loader(device, &DeviceLoader)
    }

    /// Loads the sort program and its scan through `loader`.
    pub fn with_loader<L: ProgramLoader<D> + ?Sized>(device: &'d D, loader: &L) -> Result<Self> {
        let program = loader.load(device, PROGRAM)?;
        Ok(Self {
            device,
            compute_dispatch_size: program.kernel("compute_dispatch_size")?,
            radix_sort_local: program.kernel("radix_sort_local")?,
            global_shuffle: program.kernel("global_shuffle")?,
            scan: PrefixScan::with_loader(device, loader)?,
            temp: None,
            first_index: None,
            group_sums: None,
            dispatch_args: None,
        })
    }

    /// Sorts the records of `data` in place by their leading word.
    pub fn sort(&mut self, data: &Buffer, options: &SortOptions<'_>) -> Result<()> {
        check_call(data, options)?;
        let num_elements = to_u32(data.count(), "sort length")?;
        let bits = key_bits(options.key_type, options.max_value);
        let empty_range = matches!(options.range, SortRange::Host { start, end } if start == end);
        // Zero bits means every key is zero, so the input is already sorted.
        if num_elements == 0 || empty_range || bits == 0 {
            return Ok(());
        }

        self.reserve(data)?;
        let mut passes = self.prepare(data, options, num_elements)?;
        let group_sums = present(&self.group_sums)?;
        debug!(
            records = data.count(),
            stride = data.stride(),
            key_type = ?options.key_type,
            order = ?options.order,
            passes = div_ceil(bits as usize, RADIX_BITS as usize),
            "radix sort"
        );

        for bit_shift in (0..bits).step_by(RADIX_BITS as usize) {
            passes.local_args.set_uint("bit_shift", bit_shift);
            passes.shuffle_args.set_uint("bit_shift", bit_shift);
            self.launch(&passes.local, &passes.local_args, &passes.dispatch)?;
            self.scan
                .scan(&group_sums, passes.scan_len, &ScanOptions::exclusive())?;
            self.launch(&passes.shuffle, &passes.shuffle_args, &passes.dispatch)?;
        }
        Ok(())
    }

    /// Releases every scratch buffer, including the scan's.
    pub fn dispose(&mut self) {
        for buffer in [
            self.temp.take(),
            self.first_index.take(),
            self.group_sums.take(),
            self.dispatch_args.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.device.release_buffer(&buffer);
        }
        self.scan.dispose();
    }

    /// Grows the scratch buffers to fit `data`.
    fn reserve(&mut self, data: &Buffer) -> Result<()> {
        let device = self.device;
        let counts = NWAY * div_ceil(data.count(), SORT_ELEMENTS_PER_GROUP as usize);
        grow(
            device,
            &mut self.temp,
            |b| b.count() >= data.count() && b.stride() == data.stride(),
            data.count(),
            data.stride(),
        )?;
        grow(device, &mut self.first_index, |b| b.count() >= counts, counts, 4)?;
        grow(device, &mut self.group_sums, |b| b.count() >= counts, counts, 4)?;
        grow(device, &mut self.dispatch_args, |_| true, SORT_DISPATCH_WORDS, 4)
    }

    /// Binds the parameters shared by every pass and sizes the launches.
    fn prepare(
        &mut self,
        data: &Buffer,
        options: &SortOptions<'_>,
        num_elements: u32,
    ) -> Result<Passes> {
        let temp = present(&self.temp)?;
        let first_index = present(&self.first_index)?;
        let group_sums = present(&self.group_sums)?;
        let dispatch_args = present(&self.dispatch_args)?;

        let pass_args = |input: &Buffer, output: &Buffer, sums: &'static str| {
            Args::new()
                .buffer("data_in_buffer", input)
                .buffer("data_out_buffer", output)
                .buffer("first_index_buffer", &first_index)
                .buffer(sums, &group_sums)
                .buffer("group_size_buffer_read", &dispatch_args)
                .uint("stride_words", data.stride_words() as u32)
                .uint("key_type", options.key_type as u32)
                .uint("sorting_order", options.order as u32)
                .uint("bit_shift", 0)
        };
        let mut local_args = pass_args(data, &temp, "group_sum_buffer");
        let mut shuffle_args = pass_args(&temp, data, "global_prefix_sum_buffer");

        let (range, group_size, flags, dispatch, scan_len): (_, _, &[&'static str], _, _) =
            match options.range {
                SortRange::Device(range) => {
                    let compute = Args::new()
                        .buffer("start_end_index_buffer", range)
                        .buffer("group_size_buffer_write", &dispatch_args)
                        .uint("num_elements", num_elements);
                    trace!(kernel = %self.compute_dispatch_size, "launch");
                    self.device
                        .launch(&self.compute_dispatch_size, &compute, Grid::linear(1))?;
                    let max_groups =
                        div_ceil(data.count(), SORT_ELEMENTS_PER_GROUP as usize) as u32;
                    let bound = Grid::from_shape(sort_grid(max_groups));
                    // The kernels read the range and group count on device.
                    (
                        [0, 0],
                        [0, 0, 0, 0],
                        &[INDIRECT_DISPATCH_FLAG],
                        Dispatch::Indirect {
                            args: dispatch_args.clone(),
                            bound,
                        },
                        group_sums.count(),
                    )
                }
                SortRange::All | SortRange::Host { .. } => {
                    let (start, end) = match options.range {
                        SortRange::Host { start, end } => (start as u32, end as u32),
                        _ => (0, num_elements),
                    };
                    let words =
                        sort_dispatch_args(start, end, num_elements, SORT_ELEMENTS_PER_GROUP);
                    write(self.device, &dispatch_args, 0, &words)?;
                    let [x, y, z, group_count, ..] = words;
                    (
                        [start, end],
                        [x, y, z, group_count],
                        &[],
                        Dispatch::Direct(Grid::from_shape([x, y, z])),
                        NWAY * group_count as usize,
                    )
                }
            };
        for args in [&mut local_args, &mut shuffle_args] {
            args.set("start_end_index", Param::Uints(range.to_vec()));
            args.set("group_size", Param::Uints(group_size.to_vec()));
        }

        Ok(Passes {
            local: self.radix_sort_local.specialize(flags),
            shuffle: self.global_shuffle.specialize(flags),
            local_args,
            shuffle_args,
            dispatch,
            scan_len,
        })
    }

    fn launch(&self, kernel: &Kernel, args: &Args, dispatch: &Dispatch) -> Result<()> {
        trace!(%kernel, "launch");
        match dispatch {
            Dispatch::Direct(grid) => self.device.launch(kernel, args, *grid),
            Dispatch::Indirect { args: indirect, bound } => {
                self.device.launch_indirect(kernel, args, indirect, *bound)
            }
        }
    }

    #[cfg(test)]
    fn scratch_counts(&self) -> Option<(usize, usize)> {
        Some((self.temp.as_ref()?.count(), self.group_sums.as_ref()?.count()))
    }
}

fn check_call(data: &Buffer, options: &SortOptions<'_>) -> Result<()> {
    if data.stride() == 0 || data.stride() % 4 != 0 {
        return Err(config(format!(
            "sort records must be whole 32-bit words, got a stride of {}",
            data.stride()
        )));
    }
    match options.range {
        SortRange::Host { start, end } if start > end || end > data.count() => Err(config(format!(
            "sort range {start}..{end} is outside a buffer of {} records",
            data.count()
        ))),
        SortRange::Device(range) if range.stride() != 4 || range.count() < 2 => Err(config(
            "a device sort range must hold two 4-byte words",
        )),
        SortRange::Device(range) if range.id() == data.id() => Err(config(
            "a device sort range cannot live in the sorted buffer",
        )),
        _ => Ok(()),
    }
}

fn present(slot: &Option<Buffer>) -> Result<Buffer> {
    slot.clone()
        .ok_or_else(|| internal("radix sort scratch buffer missing"))
}

/// Reallocates `slot` unless its buffer `fits`.
fn grow<D: Device + ?Sized>(
    device: &D,
    slot: &mut Option<Buffer>,
    fits: impl Fn(&Buffer) -> bool,
    count: usize,
    stride: usize,
) -> Result<()> {
    if slot.as_ref().map_or(false, |b| fits(b)) {
        return Ok(());
    }
    if let Some(old) = slot.take() {
        device.release_buffer(&old);
    }
    *slot = Some(device.create_buffer(count, stride)?);
    Ok(())
}

impl<D: Device + ?Sized> Drop for RadixSort<'_, D> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Uploads `[start, end]` as a device sort range.
pub fn upload_range<D: Device + ?Sized>(device: &D, start: u32, end: u32) -> Result<Buffer> {
    upload(device, &[start, end])
}
