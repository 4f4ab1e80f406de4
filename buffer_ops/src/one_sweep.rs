//! Single-pass prefix scan with decoupled look-back.
//!
//! One launch scans the whole buffer: groups claim partitions through a
//! shared counter, so a partition's predecessors always belong to groups
//! that are already running, and resolve their prefix from the descriptors
//! those groups publish. Only unsigned values are supported and the total
//! can only be returned, not redirected.

use crate::device::{
    div_ceil, launch_chunked, read, Args, Buffer, Device, DeviceLoader, Grid, Kernel,
    ProgramLoader, MAX_DISPATCH_SIZE,
};
use crate::error::{config, Result};
use crate::scan::{
    check_scan_call, empty_outcome, Scan, ScanMode, ScanOptions, ScanOutcome, Total,
    TotalDestination,
};
use buffer_ops_gpu::{
    look_back::{unpack, ELEMENTS_PER_GROUP, GROUP_THREADS},
    values::ValueType,
};
use tracing::{debug, trace};

/// Logical name of the program holding the look-back scan kernels.
pub const PROGRAM: &str = "one_sweep_prefix_scan";

/// Bytes per partition descriptor: a status flag and a value.
const DESCRIPTOR_STRIDE: usize = 8;

pub struct OneSweepPrefixScan<'d, D: Device + ?Sized> {
    device: &'d D,
    clear_buffer: Kernel,
    one_sweep_scan: Kernel,
    partition_index: Option<Buffer>,
    descriptors: Option<Buffer>,
}

impl<'d, D: Device + ?Sized> OneSweepPrefixScan<'d, D> {
    pub fn new(device: &'d D) -> Result<Self> {
        Self::with_loader(device, &DeviceLoader)
    }

    pub fn with_loader<L: ProgramLoader<D> + ?Sized>(device: &'d D, loader: &L) -> Result<Self> {
        let program = loader.load(device, PROGRAM)?;
        Ok(Self {
            device,
            clear_buffer: program.kernel("clear_buffer")?,
            one_sweep_scan: program.kernel("one_sweep_scan")?,
            partition_index: None,
            descriptors: None,
        })
    }

    /// Scans the first `count` unsigned elements of `data` in place.
    pub fn scan(
        &mut self,
        data: &Buffer,
        count: usize,
        options: &ScanOptions<'_>,
    ) -> Result<ScanOutcome> {
        check_scan_call(data, count, options)?;
        if options.value_type != ValueType::Uint {
            return Err(config(format!(
                "the look-back scan only sums unsigned values, not {:?}",
                options.value_type
            )));
        }
        if let TotalDestination::Buffer { .. } = options.total {
            return Err(config(
                "the look-back scan cannot redirect its total to a buffer",
            ));
        }
        if count == 0 {
            return Ok(empty_outcome(options));
        }

        let groups = div_ceil(count, ELEMENTS_PER_GROUP as usize);
        let (partition_index, descriptors) = self.scratch(groups)?;
        debug!(count, groups, mode = ?options.mode, "one-sweep scan");

        // Reset the partition counter and every descriptor to not ready.
        let mut args = Args::new()
            .buffer("partition_index_buffer", &partition_index)
            .buffer("partition_descriptor_buffer", &descriptors)
            .uint("num_elements", groups as u32);
        let clear_groups = div_ceil(groups, GROUP_THREADS as usize) as u32;
        launch_chunked(self.device, &self.clear_buffer, &mut args, "group_offset", clear_groups)?;

        let args = Args::new()
            .buffer("data_buffer", data)
            .buffer("partition_index_buffer", &partition_index)
            .buffer("partition_descriptor_buffer", &descriptors)
            .uint("num_elements", count as u32)
            .uint("is_inclusive_scan", (options.mode == ScanMode::Inclusive) as u32);
        let groups = groups as u32;
        for offset in (0..groups).step_by(MAX_DISPATCH_SIZE as usize) {
            let chunk = (groups - offset).min(MAX_DISPATCH_SIZE);
            trace!(kernel = %self.one_sweep_scan, chunk, "launch");
            self.device.launch(&self.one_sweep_scan, &args, Grid::linear(chunk))?;
        }

        match options.total {
            TotalDestination::Return => {
                let last = read::<_, u64>(self.device, &descriptors, groups as usize - 1, 1)?;
                let (_, total) = unpack(last[0]);
                Ok(ScanOutcome::Total(Total::Uint(total)))
            }
            _ => Ok(ScanOutcome::Done),
        }
    }

    pub fn dispose(&mut self) {
        for buffer in [self.partition_index.take(), self.descriptors.take()]
            .into_iter()
            .flatten()
        {
            self.device.release_buffer(&buffer);
        }
    }

    /// The partition counter and a descriptor array of at least `groups`
    /// entries.
    fn scratch(&mut self, groups: usize) -> Result<(Buffer, Buffer)> {
        if self.partition_index.is_none() {
            self.partition_index = Some(self.device.create_buffer(1, 4)?);
        }
        if self
            .descriptors
            .as_ref()
            .map_or(true, |b| b.count() < groups)
        {
            if let Some(old) = self.descriptors.take() {
                self.device.release_buffer(&old);
            }
            self.descriptors = Some(self.device.create_buffer(groups, DESCRIPTOR_STRIDE)?);
        }
        match (&self.partition_index, &self.descriptors) {
            (Some(index), Some(descriptors)) => Ok((index.clone(), descriptors.clone())),
            _ => Err(crate::error::internal("look-back scratch buffers missing")),
        }
    }
}

impl<D: Device + ?Sized> Scan for OneSweepPrefixScan<'_, D> {
    fn scan(
        &mut self,
        data: &Buffer,
        count: usize,
        options: &ScanOptions<'_>,
    ) -> Result<ScanOutcome> {
        OneSweepPrefixScan::scan(self, data, count, options)
    }

    fn dispose(&mut self) {
        OneSweepPrefixScan::dispose(self)
    }
}

impl<D: Device + ?Sized> Drop for OneSweepPrefixScan<'_, D> {
    fn drop(&mut self) {
        self.dispose();
    }
}
