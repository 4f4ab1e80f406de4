//! Prefix sums over device buffers of 32-bit values.
//!
//! [`PrefixScan`] is the recursive two-level scan: every level scans groups
//! of `2 * threads` elements locally, the group totals are scanned one level
//! down, and the scanned totals are added back on the way up. It needs no
//! cross-group synchronization inside a launch, so it runs on any device.
//! [`OneSweepPrefixScan`](crate::OneSweepPrefixScan) solves the same problem
//! in one launch when the device allows it; [`scanner`] picks between them.

use crate::device::{
    div_ceil, launch_chunked, read, to_u32, Args, Buffer, Device, DeviceLoader, Grid, Kernel,
    ProgramLoader,
};
use crate::error::{config, internal, Result};
use crate::one_sweep::OneSweepPrefixScan;
use buffer_ops_gpu::values::ValueType;
use std::cmp::Ordering;
use tracing::debug;

/// Logical name of the program holding the scan kernels.
pub const PROGRAM: &str = "prefix_scan";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScanMode {
    /// `out[i]` is the sum of the elements before `i`.
    #[default]
    Exclusive,
    /// `out[i]` is the sum of the elements up to and including `i`.
    Inclusive,
}

/// Where the sum of all scanned elements goes.
#[derive(Debug, Clone, Copy, Default)]
pub enum TotalDestination<'a> {
    #[default]
    Discard,
    /// Read back and returned in [`ScanOutcome::Total`].
    Return,
    /// Written on the device into element `offset` of a 4-byte-stride buffer.
    Buffer { buffer: &'a Buffer, offset: usize },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions<'a> {
    pub mode: ScanMode,
    pub value_type: ValueType,
    pub total: TotalDestination<'a>,
}

impl<'a> ScanOptions<'a> {
    pub fn exclusive() -> Self {
        Self::default()
    }

    pub fn inclusive() -> Self {
        Self {
            mode: ScanMode::Inclusive,
            ..Self::default()
        }
    }

    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn total(mut self, total: TotalDestination<'a>) -> Self {
        self.total = total;
        self
    }
}

/// A scan total in the scanned value domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Total {
    Uint(u32),
    Int(i32),
    Float(f32),
}

impl Total {
    pub fn from_bits(value_type: ValueType, bits: u32) -> Self {
        match value_type {
            ValueType::Uint => Total::Uint(bits),
            ValueType::Int => Total::Int(bits as i32),
            ValueType::Float => Total::Float(f32::from_bits(bits)),
        }
    }
}

/// Result of one scan call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScanOutcome {
    Done,
    Total(Total),
}

impl ScanOutcome {
    pub fn total(&self) -> Option<Total> {
        match self {
            ScanOutcome::Done => None,
            ScanOutcome::Total(total) => Some(*total),
        }
    }
}

/// An in-place prefix scan over the first `count` elements of a buffer.
pub trait Scan {
    fn scan(
        &mut self,
        data: &Buffer,
        count: usize,
        options: &ScanOptions<'_>,
    ) -> Result<ScanOutcome>;

    /// Releases scratch buffers. Safe to call more than once.
    fn dispose(&mut self);
}

/// Scan implementation selection for [`scanner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScanStrategy {
    /// The single-pass scan where the device supports it, else multi-level.
    #[default]
    Auto,
    MultiLevel,
    DecoupledLookBack,
}

/// Builds the scan selected by `strategy` for `device`.
pub fn scanner<'d, D: Device + ?Sized>(
    device: &'d D,
    strategy: ScanStrategy,
) -> Result<Box<dyn Scan + 'd>> {
    let look_back = device.supports_decoupled_look_back();
    match strategy {
        ScanStrategy::MultiLevel => Ok(Box::new(PrefixScan::new(device)?)),
        ScanStrategy::Auto if !look_back => Ok(Box::new(PrefixScan::new(device)?)),
        ScanStrategy::DecoupledLookBack if !look_back => Err(config(
            "device does not support the decoupled look-back scan",
        )),
        ScanStrategy::Auto | ScanStrategy::DecoupledLookBack => {
            Ok(Box::new(OneSweepPrefixScan::new(device)?))
        }
    }
}

/// Threads per group for a level of `count` elements, with its kernel flag.
fn group_threads(count: usize) -> (usize, &'static str) {
    match count {
        0..=65536 => (128, "NUM_GROUP_THREADS_128"),
        65537..=262144 => (256, "NUM_GROUP_THREADS_256"),
        _ => (512, "NUM_GROUP_THREADS_512"),
    }
}

/// Checks the parts of a scan call shared by both scan implementations.
pub(crate) fn check_scan_call(data: &Buffer, count: usize, options: &ScanOptions<'_>) -> Result<()> {
    if data.stride() != 4 {
        return Err(config(format!(
            "scan buffers hold 4-byte values, got a stride of {}",
            data.stride()
        )));
    }
    if count > data.count() {
        return Err(config(format!(
            "cannot scan {count} elements of a buffer holding {}",
            data.count()
        )));
    }
    to_u32(count, "scan length")?;
    if let TotalDestination::Buffer { buffer, offset } = options.total {
        if buffer.stride() != 4 || offset >= buffer.count() {
            return Err(config(format!(
                "total slot {offset} is not a 4-byte element of a buffer holding {}",
                buffer.count()
            )));
        }
        if buffer.id() == data.id() {
            return Err(config("the total cannot be written into the scanned buffer"));
        }
    }
    Ok(())
}

/// The outcome of a scan of zero elements.
pub(crate) fn empty_outcome(options: &ScanOptions<'_>) -> ScanOutcome {
    match options.total {
        TotalDestination::Return => ScanOutcome::Total(Total::from_bits(options.value_type, 0)),
        _ => ScanOutcome::Done,
    }
}

/// Recursive two-level scan.
///
/// Group sums of recursion depth `d` live in `group_sums[d]`, reallocated in
/// place whenever that depth sees a different group count.
pub struct PrefixScan<'d, D: Device + ?Sized> {
    device: &'d D,
    local_scan: Kernel,
    add_group_sum: Kernel,
    group_sums: Vec<Buffer>,
    total_buffer: Option<Buffer>,
}

impl<'d, D: Device + ?Sized> PrefixScan<'d, D> {
    pub fn new(device: &'d D) -> Result<Self> {
        Self::with_loader(device, &DeviceLoader)
    }

    pub fn with_loader<L: ProgramLoader<D> + ?Sized>(device: &'d D, loader: &L) -> Result<Self> {
        let program = loader.load(device, PROGRAM)?;
        Ok(Self {
            device,
            local_scan: program.kernel("local_scan")?,
            add_group_sum: program.kernel("add_group_sum")?,
            group_sums: Vec::new(),
            total_buffer: None,
        })
    }

    /// Scans the first `count` elements of `data` in place.
    pub fn scan(
        &mut self,
        data: &Buffer,
        count: usize,
        options: &ScanOptions<'_>,
    ) -> Result<ScanOutcome> {
        check_scan_call(data, count, options)?;
        if count == 0 {
            return Ok(empty_outcome(options));
        }
        debug!(
            count,
            mode = ?options.mode,
            value_type = ?options.value_type,
            "prefix scan"
        );

        let (total, total_offset) = match options.total {
            TotalDestination::Buffer { buffer, offset } => (buffer.clone(), offset),
            _ => (self.total_buffer()?, 0),
        };
        let inclusive = options.mode == ScanMode::Inclusive;
        self.scan_level(
            0,
            data,
            count,
            inclusive,
            options.value_type,
            &total,
            to_u32(total_offset, "total offset")?,
        )?;

        match options.total {
            TotalDestination::Return => {
                let bits = read::<_, u32>(self.device, &total, 0, 1)?;
                Ok(ScanOutcome::Total(Total::from_bits(options.value_type, bits[0])))
            }
            _ => Ok(ScanOutcome::Done),
        }
    }

    /// Releases the group-sum arena and the total slot.
    pub fn dispose(&mut self) {
        for buffer in self.group_sums.drain(..) {
            self.device.release_buffer(&buffer);
        }
        if let Some(buffer) = self.total_buffer.take() {
            self.device.release_buffer(&buffer);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_level(
        &mut self,
        depth: usize,
        data: &Buffer,
        count: usize,
        inclusive: bool,
        value_type: ValueType,
        total: &Buffer,
        total_offset: u32,
    ) -> Result<()> {
        let (threads, threads_flag) = group_threads(count);
        let per_group = 2 * threads;
        let groups = div_ceil(count, per_group);
        let group_sums = self.group_sum_buffer(depth, groups)?;
        let flags = [value_type.flag(), threads_flag];
        debug!(depth, count, groups, threads, "scan level");

        let local_scan = self.local_scan.specialize(&flags);
        let mut args = Args::new()
            .buffer("data_buffer", data)
            .buffer("group_sum_buffer", &group_sums)
            .uint("num_elements", count as u32)
            .uint("is_inclusive_scan", inclusive as u32)
            .uint("group_sum_offset", 0);
        launch_chunked(self.device, &local_scan, &mut args, "group_offset", groups as u32)?;

        if groups <= per_group {
            // One group scans every group sum and writes their total.
            let args = Args::new()
                .buffer("data_buffer", &group_sums)
                .buffer("group_sum_buffer", total)
                .uint("num_elements", groups as u32)
                .uint("is_inclusive_scan", 0)
                .uint("group_sum_offset", total_offset)
                .uint("group_offset", 0);
            self.device.launch(&local_scan, &args, Grid::linear(1))?;
        } else {
            self.scan_level(
                depth + 1,
                &group_sums,
                groups,
                false,
                value_type,
                total,
                total_offset,
            )?;
        }

        let add_group_sum = self.add_group_sum.specialize(&flags);
        let mut args = Args::new()
            .buffer("data_buffer", data)
            .buffer("group_sum_buffer", &group_sums)
            .uint("num_elements", count as u32);
        launch_chunked(self.device, &add_group_sum, &mut args, "group_offset", groups as u32)
    }

    fn group_sum_buffer(&mut self, depth: usize, groups: usize) -> Result<Buffer> {
        match self.group_sums.len().cmp(&depth) {
            Ordering::Equal => {
                let buffer = self.device.create_buffer(groups, 4)?;
                self.group_sums.push(buffer);
            }
            Ordering::Greater => {
                if self.group_sums[depth].count() != groups {
                    let buffer = self.device.create_buffer(groups, 4)?;
                    let old = std::mem::replace(&mut self.group_sums[depth], buffer);
                    self.device.release_buffer(&old);
                }
            }
            Ordering::Less => {
                return Err(internal(format!(
                    "scan reached depth {depth} with {} group-sum buffers",
                    self.group_sums.len()
                )));
            }
        }
        Ok(self.group_sums[depth].clone())
    }

    fn total_buffer(&mut self) -> Result<Buffer> {
        if let Some(buffer) = &self.total_buffer {
            return Ok(buffer.clone());
        }
        let buffer = self.device.create_buffer(1, 4)?;
        self.total_buffer = Some(buffer.clone());
        Ok(buffer)
    }

    #[cfg(test)]
    fn depth_count(&self) -> usize {
        self.group_sums.len()
    }
}

impl<D: Device + ?Sized> Scan for PrefixScan<'_, D> {
    fn scan(
        &mut self,
        data: &Buffer,
        count: usize,
        options: &ScanOptions<'_>,
    ) -> Result<ScanOutcome> {
        PrefixScan::scan(self, data, count, options)
    }

    fn dispose(&mut self) {
        PrefixScan::dispose(self)
    }
}

impl<D: Device + ?Sized> Drop for PrefixScan<'_, D> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{download, upload};
    use crate::emu::EmuDevice;
    use crate::Error;

    fn exclusive(values: &[u32]) -> Vec<u32> {
        values
            .iter()
            .scan(0u32, |sum, &v| {
                let out = *sum;
                *sum = sum.wrapping_add(v);
                Some(out)
            })
            .collect()
    }

    #[test]
    fn thread_counts_follow_thresholds() {
        assert_eq!(group_threads(65536).0, 128);
        assert_eq!(group_threads(65537).0, 256);
        assert_eq!(group_threads(262144).0, 256);
        assert_eq!(group_threads(262145).0, 512);
    }

    #[test]
    fn recursion_depth_grows_with_length() {
        let device = EmuDevice::new();
        let mut scan = PrefixScan::new(&device).unwrap();
        for (count, depths) in [(256, 1), (65536, 1), (262_145, 1), (1_048_577, 2)] {
            let values: Vec<u32> = (0..count as u32).map(|i| i % 7).collect();
            let data = upload(&device, &values).unwrap();
            scan.scan(&data, count, &ScanOptions::exclusive()).unwrap();
            assert_eq!(download::<_, u32>(&device, &data).unwrap(), exclusive(&values));
            assert_eq!(scan.depth_count(), depths);
            device.release_buffer(&data);
        }
    }

    #[test]
    fn scans_a_prefix_of_the_buffer() {
        let device = EmuDevice::new();
        let mut scan = PrefixScan::new(&device).unwrap();
        let data = upload(&device, &[1u32, 2, 3, 4, 5]).unwrap();
        let outcome = scan
            .scan(&data, 3, &ScanOptions::inclusive().total(TotalDestination::Return))
            .unwrap();
        assert_eq!(outcome, ScanOutcome::Total(Total::Uint(6)));
        assert_eq!(download::<_, u32>(&device, &data).unwrap(), vec![1, 3, 6, 4, 5]);
    }

    #[test]
    fn empty_scan_launches_nothing() {
        let device = EmuDevice::new();
        let mut scan = PrefixScan::new(&device).unwrap();
        let data = device.create_buffer(0, 4).unwrap();
        let outcome = scan
            .scan(&data, 0, &ScanOptions::exclusive().total(TotalDestination::Return))
            .unwrap();
        assert_eq!(outcome.total(), Some(Total::Uint(0)));
        assert_eq!(device.launch_count(), 0);
    }

    #[test]
    fn rejects_wide_elements() {
        let device = EmuDevice::new();
        let mut scan = PrefixScan::new(&device).unwrap();
        let data = device.create_buffer(4, 8).unwrap();
        assert!(matches!(
            scan.scan(&data, 4, &ScanOptions::exclusive()),
            Err(Error::Config(_))
        ));
        assert_eq!(device.launch_count(), 0);
    }

    #[test]
    fn rejects_total_in_scanned_buffer() {
        let device = EmuDevice::new();
        let mut scan = PrefixScan::new(&device).unwrap();
        let data = upload(&device, &[1u32, 2, 3, 0]).unwrap();
        let options = ScanOptions::exclusive().total(TotalDestination::Buffer {
            buffer: &data,
            offset: 3,
        });
        assert!(matches!(scan.scan(&data, 3, &options), Err(Error::Config(_))));
    }

    #[test]
    fn dispose_releases_scratch_and_is_idempotent() {
        let device = EmuDevice::new();
        let data = upload(&device, &vec![1u32; 70_000]).unwrap();
        let mut scan = PrefixScan::new(&device).unwrap();
        scan.scan(&data, 70_000, &ScanOptions::exclusive()).unwrap();
        assert!(device.live_buffers() > 1);
        scan.dispose();
        scan.dispose();
        assert_eq!(device.live_buffers(), 1);
    }

    #[test]
    fn strategy_falls_back_without_look_back() {
        let device = EmuDevice::new().with_look_back(false);
        assert!(scanner(&device, ScanStrategy::Auto).is_ok());
        assert!(matches!(
            scanner(&device, ScanStrategy::DecoupledLookBack).err(),
            Some(Error::Config(_))
        ));
    }
}
