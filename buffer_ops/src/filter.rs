//! Stream compaction of records with a non-zero leading word.

use crate::device::{
    launch_chunked, read, to_u32, Args, Buffer, Device, DeviceLoader, Kernel, ProgramLoader,
};
use crate::error::{config, internal, Result};
use crate::scan::{PrefixScan, ScanOptions, TotalDestination};
use buffer_ops_gpu::{abi::DEFAULT_GROUP_THREADS, dispatch::div_ceil};
use tracing::debug;

/// Logical name of the program holding the filter kernels.
pub const PROGRAM: &str = "filter";

/// Moves every record whose key is non-zero to the front of its buffer,
/// keeping their order. Records past the kept count are left as they were.
pub struct Filter<'d, D: Device + ?Sized> {
    device: &'d D,
    extract_flags: Kernel,
    compact: Kernel,
    copy_filtered: Kernel,
    scan: PrefixScan<'d, D>,
    flags: Option<Buffer>,
    temp: Option<Buffer>,
    count: Option<Buffer>,
}

impl<'d, D: Device + ?Sized> Filter<'d, D> {
    pub fn new(device: &'d D) -> Result<Self> {
        Self::with_loader(device, &DeviceLoader)
    }

    pub fn with_loader<L: ProgramLoader<D> + ?Sized>(device: &'d D, loader: &L) -> Result<Self> {
        let program = loader.load(device, PROGRAM)?;
        Ok(Self {
            device,
            extract_flags: program.kernel("extract_flags")?,
            compact: program.kernel("compact")?,
            copy_filtered: program.kernel("copy_filtered")?,
            scan: PrefixScan::with_loader(device, loader)?,
            flags: None,
            temp: None,
            count: None,
        })
    }

    /// Compacts `data` in place. The kept count is handled like a scan total:
    /// `Return` reads it back as `Some(count)`, `Buffer` leaves it on the
    /// device.
    pub fn filter(&mut self, data: &Buffer, count: TotalDestination<'_>) -> Result<Option<u32>> {
        if data.stride() == 0 || data.stride() % 4 != 0 {
            return Err(config(format!(
                "filtered records must be whole 32-bit words, got a stride of {}",
                data.stride()
            )));
        }
        if let TotalDestination::Buffer { buffer, offset } = count {
            if buffer.stride() != 4 || offset >= buffer.count() {
                return Err(config(format!(
                    "count slot {offset} is not a 4-byte element of a buffer holding {}",
                    buffer.count()
                )));
            }
            if buffer.id() == data.id() {
                return Err(config("the kept count cannot be written into the filtered buffer"));
            }
        }
        let n = to_u32(data.count(), "filter length")?;
        if n == 0 {
            return Ok(match count {
                TotalDestination::Return => Some(0),
                _ => None,
            });
        }

        let (flags, temp) = self.reserve(data)?;
        let (count_buffer, count_offset) = match count {
            TotalDestination::Buffer { buffer, offset } => (buffer.clone(), offset),
            _ => (self.count_buffer()?, 0),
        };
        let groups = div_ceil(n, DEFAULT_GROUP_THREADS);
        let stride_words = data.stride_words() as u32;
        debug!(count = n, groups, stride_words, "filter");

        let mut args = Args::new()
            .buffer("data_buffer", data)
            .buffer("flag_buffer", &flags)
            .uint("num_elements", n)
            .uint("stride_words", stride_words);
        launch_chunked(self.device, &self.extract_flags, &mut args, "group_offset", groups)?;

        let total = TotalDestination::Buffer {
            buffer: &count_buffer,
            offset: count_offset,
        };
        self.scan
            .scan(&flags, data.count(), &ScanOptions::exclusive().total(total))?;

        let mut args = Args::new()
            .buffer("data_in_buffer", data)
            .buffer("data_out_buffer", &temp)
            .buffer("flag_scan_buffer", &flags)
            .uint("num_elements", n)
            .uint("stride_words", stride_words);
        launch_chunked(self.device, &self.compact, &mut args, "group_offset", groups)?;

        let mut args = Args::new()
            .buffer("data_in_buffer", &temp)
            .buffer("data_out_buffer", data)
            .buffer("count_buffer", &count_buffer)
            .uint("count_offset", to_u32(count_offset, "count offset")?)
            .uint("num_elements", n)
            .uint("stride_words", stride_words);
        launch_chunked(self.device, &self.copy_filtered, &mut args, "group_offset", groups)?;

        match count {
            TotalDestination::Return => {
                let kept = read::<_, u32>(self.device, &count_buffer, 0, 1)?;
                Ok(Some(kept[0]))
            }
            _ => Ok(None),
        }
    }

    pub fn dispose(&mut self) {
        for buffer in [self.flags.take(), self.temp.take(), self.count.take()]
            .into_iter()
            .flatten()
        {
            self.device.release_buffer(&buffer);
        }
        self.scan.dispose();
    }

    fn reserve(&mut self, data: &Buffer) -> Result<(Buffer, Buffer)> {
        if self.flags.as_ref().map_or(true, |f| f.count() < data.count()) {
            if let Some(old) = self.flags.take() {
                self.device.release_buffer(&old);
            }
            self.flags = Some(self.device.create_buffer(data.count(), 4)?);
        }
        if self
            .temp
            .as_ref()
            .map_or(true, |t| t.count() < data.count() || t.stride() != data.stride())
        {
            if let Some(old) = self.temp.take() {
                self.device.release_buffer(&old);
            }
            self.temp = Some(self.device.create_buffer(data.count(), data.stride())?);
        }
        match (&self.flags, &self.temp) {
            (Some(flags), Some(temp)) => Ok((flags.clone(), temp.clone())),
            _ => Err(internal("filter scratch buffers missing")),
        }
    }

    fn count_buffer(&mut self) -> Result<Buffer> {
        if let Some(buffer) = &self.count {
            return Ok(buffer.clone());
        }
        let buffer = self.device.create_buffer(1, 4)?;
        self.count = Some(buffer.clone());
        Ok(buffer)
    }
}

impl<D: Device + ?Sized> Drop for Filter<'_, D> {
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

    #[test]
    fn keeps_non_zero_keys_in_order() {
        let device = EmuDevice::new();
        let mut filter = Filter::new(&device).unwrap();
        let data = upload(&device, &[0u32, 5, 0, 7, 9, 0]).unwrap();
        let kept = filter.filter(&data, TotalDestination::Return).unwrap();
        assert_eq!(kept, Some(3));
        let out = download::<_, u32>(&device, &data).unwrap();
        assert_eq!(&out[..3], &[5, 7, 9]);
        assert_eq!(&out[3..], &[7, 9, 0]);
    }

    #[test]
    fn compacts_whole_records() {
        let device = EmuDevice::new();
        let mut filter = Filter::new(&device).unwrap();
        let records: Vec<[u32; 2]> = (0..500u32).map(|i| [i % 3, i]).collect();
        let data = upload(&device, &records).unwrap();
        let kept = filter.filter(&data, TotalDestination::Return).unwrap().unwrap();

        let expected: Vec<[u32; 2]> = records.iter().copied().filter(|r| r[0] != 0).collect();
        assert_eq!(kept as usize, expected.len());
        let out = download::<_, [u32; 2]>(&device, &data).unwrap();
        assert_eq!(&out[..expected.len()], &expected[..]);
    }

    #[test]
    fn writes_count_into_caller_slot() {
        let device = EmuDevice::new();
        let mut filter = Filter::new(&device).unwrap();
        let data = upload(&device, &[1u32, 0, 1, 1]).unwrap();
        let slots = upload(&device, &[77u32, 77, 77]).unwrap();
        let count = TotalDestination::Buffer {
            buffer: &slots,
            offset: 1,
        };
        assert_eq!(filter.filter(&data, count).unwrap(), None);
        assert_eq!(download::<_, u32>(&device, &slots).unwrap(), vec![77, 3, 77]);
    }

    #[test]
    fn empty_and_invalid_calls_launch_nothing() {
        let device = EmuDevice::new();
        let mut filter = Filter::new(&device).unwrap();
        let empty = device.create_buffer(0, 4).unwrap();
        assert_eq!(filter.filter(&empty, TotalDestination::Return).unwrap(), Some(0));
        // The emulator refuses to allocate such a stride, so only the handle exists.
        let odd = Buffer::from_raw(u64::MAX, 4, 6);
        assert!(matches!(
            filter.filter(&odd, TotalDestination::Discard),
            Err(Error::Config(_))
        ));
        let data = upload(&device, &[1u32, 2]).unwrap();
        let self_count = TotalDestination::Buffer {
            buffer: &data,
            offset: 0,
        };
        assert!(matches!(filter.filter(&data, self_count), Err(Error::Config(_))));
        assert_eq!(device.launch_count(), 0);
    }

    #[test]
    fn dispose_before_first_use_is_harmless() {
        let device = EmuDevice::new();
        let mut filter = Filter::new(&device).unwrap();
        filter.dispose();
        filter.dispose();
        assert_eq!(device.live_buffers(), 0);
    }
}
