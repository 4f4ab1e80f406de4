//! Keyed random permutation of buffer records.
//!
//! A Feistel network permutes the power-of-two index domain covering the
//! records. Indices it maps past the record count are dropped by scanning
//! the validity flags, so the surviving images compact into a permutation
//! of exactly the records present.

use crate::device::{
    launch_chunked, to_u32, Args, Buffer, Device, DeviceLoader, Kernel, ProgramLoader,
};
use crate::error::{config, internal, Result};
use crate::scan::{PrefixScan, ScanOptions};
use buffer_ops_gpu::{abi::DEFAULT_GROUP_THREADS, bijection::Feistel, dispatch::div_ceil};
use tracing::debug;

/// Logical name of the program holding the shuffle kernels.
pub const PROGRAM: &str = "shuffle";

/// Largest record count the 32-bit index domain can permute.
pub const MAX_ELEMENTS: usize = 1 << 31;

#[derive(Debug, Clone, Copy)]
pub struct ShuffleOptions<'a> {
    pub key: u32,
    /// Feistel rounds, clamped to `1..=4`.
    pub rounds: u32,
    /// Receives the shuffled records instead of the input buffer. Must match
    /// the input's count and stride.
    pub output: Option<&'a Buffer>,
}

impl Default for ShuffleOptions<'_> {
    fn default() -> Self {
        Self {
            key: 0,
            rounds: 2,
            output: None,
        }
    }
}

impl<'a> ShuffleOptions<'a> {
    pub fn key(key: u32) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    pub fn rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds;
        self
    }

    pub fn output(mut self, output: &'a Buffer) -> Self {
        self.output = Some(output);
        self
    }
}

pub struct Shuffle<'d, D: Device + ?Sized> {
    device: &'d D,
    apply_bijective_function: Kernel,
    shuffle_elements: Kernel,
    copy_buffer: Kernel,
    scan: PrefixScan<'d, D>,
    temp: Option<Buffer>,
    flags: Option<Buffer>,
    bijection: Option<Buffer>,
}

impl<'d, D: Device + ?Sized> Shuffle<'d, D> {
    pub fn new(device: &'d D) -> Result<Self> {
        Self::with_loader(device, &DeviceLoader)
    }

    pub fn with_loader<L: ProgramLoader<D> + ?Sized>(device: &'d D, loader: &L) -> Result<Self> {
        let program = loader.load(device, PROGRAM)?;
        Ok(Self {
            device,
            apply_bijective_function: program.kernel("apply_bijective_function")?,
            shuffle_elements: program.kernel("shuffle_elements")?,
            copy_buffer: program.kernel("copy_buffer")?,
            scan: PrefixScan::with_loader(device, loader)?,
            temp: None,
            flags: None,
            bijection: None,
        })
    }

    /// Permutes every record of `data`.
    pub fn shuffle(&mut self, data: &Buffer, options: &ShuffleOptions<'_>) -> Result<()> {
        if let Some(output) = options.output {
            if output.count() != data.count() || output.stride() != data.stride() {
                return Err(config(format!(
                    "shuffle output holds {} records of {} bytes, input {} of {}",
                    output.count(),
                    output.stride(),
                    data.count(),
                    data.stride()
                )));
            }
            if output.id() == data.id() {
                return Err(config("shuffle output must differ from the input"));
            }
        }
        if data.stride() == 0 || data.stride() % 4 != 0 {
            return Err(config(format!(
                "shuffled records must be whole 32-bit words, got a stride of {}",
                data.stride()
            )));
        }
        if data.count() > MAX_ELEMENTS {
            return Err(config(format!(
                "cannot shuffle {} records, the limit is {MAX_ELEMENTS}",
                data.count()
            )));
        }
        let count = data.count();
        if count == 0 {
            return Ok(());
        }

        let domain = count.next_power_of_two();
        let feistel = Feistel::new(to_u32(domain, "shuffle domain")?, options.key, options.rounds);
        let (flags, bijection) = self.reserve(data, domain, options.output.is_none())?;
        debug!(
            count,
            domain,
            rounds = feistel.rounds,
            in_place = options.output.is_none(),
            "shuffle"
        );

        let domain_groups = div_ceil(domain as u32, DEFAULT_GROUP_THREADS);
        let mut args = Args::new()
            .buffer("bijection_shuffle_buffer_write", &bijection)
            .buffer("flag_scan_buffer_write", &flags)
            .uint("num_elements", count as u32)
            .uint("num_pow_of_2_elements", domain as u32)
            .uint("left_side_bits", feistel.left_bits)
            .uint("left_side_mask", feistel.left_mask)
            .uint("right_side_bits", feistel.right_bits)
            .uint("right_side_mask", feistel.right_mask)
            .uint("num_rounds", feistel.rounds)
            .uints("key", &feistel.keys);
        launch_chunked(
            self.device,
            &self.apply_bijective_function,
            &mut args,
            "group_offset",
            domain_groups,
        )?;

        self.scan.scan(&flags, domain, &ScanOptions::exclusive())?;

        let target = match (options.output, &self.temp) {
            (Some(output), _) => output.clone(),
            (None, Some(temp)) => temp.clone(),
            (None, None) => return Err(internal("shuffle temp buffer missing")),
        };
        let mut args = Args::new()
            .buffer("data_in_buffer", data)
            .buffer("data_out_buffer", &target)
            .buffer("bijection_shuffle_buffer_read", &bijection)
            .buffer("flag_scan_buffer_read", &flags)
            .uint("num_elements", count as u32)
            .uint("num_pow_of_2_elements", domain as u32)
            .uint("stride_words", data.stride_words() as u32);
        launch_chunked(
            self.device,
            &self.shuffle_elements,
            &mut args,
            "group_offset",
            domain_groups,
        )?;

        if options.output.is_none() {
            let mut args = Args::new()
                .buffer("data_in_buffer", &target)
                .buffer("data_out_buffer", data)
                .uint("num_elements", count as u32)
                .uint("stride_words", data.stride_words() as u32);
            let groups = div_ceil(count as u32, DEFAULT_GROUP_THREADS);
            launch_chunked(self.device, &self.copy_buffer, &mut args, "group_offset", groups)?;
        }
        Ok(())
    }

    pub fn dispose(&mut self) {
        for buffer in [self.temp.take(), self.flags.take(), self.bijection.take()]
            .into_iter()
            .flatten()
        {
            self.device.release_buffer(&buffer);
        }
        self.scan.dispose();
    }

    /// Sizes the index buffers to the domain and, for in-place shuffles, the
    /// temp buffer to the records. Returns the flag and bijection buffers.
    fn reserve(&mut self, data: &Buffer, domain: usize, in_place: bool) -> Result<(Buffer, Buffer)> {
        if in_place
            && !self
                .temp
                .as_ref()
                .map_or(false, |t| t.count() >= data.count() && t.stride() == data.stride())
        {
            if let Some(old) = self.temp.take() {
                self.device.release_buffer(&old);
            }
            self.temp = Some(self.device.create_buffer(data.count(), data.stride())?);
        }
        let flags = resize(self.device, &mut self.flags, domain)?;
        let bijection = resize(self.device, &mut self.bijection, domain)?;
        Ok((flags, bijection))
    }
}

/// Reallocates a word buffer unless it holds exactly `count` words.
fn resize<D: Device + ?Sized>(device: &D, slot: &mut Option<Buffer>, count: usize) -> Result<Buffer> {
    match slot {
        Some(buffer) if buffer.count() == count => Ok(buffer.clone()),
        _ => {
            if let Some(old) = slot.take() {
                device.release_buffer(&old);
            }
            let buffer = device.create_buffer(count, 4)?;
            *slot = Some(buffer.clone());
            Ok(buffer)
        }
    }
}

impl<D: Device + ?Sized> Drop for Shuffle<'_, D> {
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
    fn single_record_is_unchanged() {
        let device = EmuDevice::new();
        let mut shuffle = Shuffle::new(&device).unwrap();
        let data = upload(&device, &[42u32]).unwrap();
        shuffle.shuffle(&data, &ShuffleOptions::key(7)).unwrap();
        assert_eq!(download::<_, u32>(&device, &data).unwrap(), vec![42]);
    }

    #[test]
    fn output_buffer_leaves_input_untouched() {
        let device = EmuDevice::new();
        let mut shuffle = Shuffle::new(&device).unwrap();
        let values: Vec<u32> = (0..300).collect();
        let data = upload(&device, &values).unwrap();
        let out = device.create_buffer(300, 4).unwrap();
        shuffle
            .shuffle(&data, &ShuffleOptions::key(1).output(&out))
            .unwrap();
        assert_eq!(download::<_, u32>(&device, &data).unwrap(), values);
        let mut shuffled = download::<_, u32>(&device, &out).unwrap();
        assert_ne!(shuffled, values);
        shuffled.sort_unstable();
        assert_eq!(shuffled, values);
    }

    #[test]
    fn mismatched_output_is_rejected_before_dispatch() {
        let device = EmuDevice::new();
        let mut shuffle = Shuffle::new(&device).unwrap();
        let data = upload(&device, &[1u32, 2, 3]).unwrap();
        let short = device.create_buffer(2, 4).unwrap();
        let wide = device.create_buffer(3, 8).unwrap();
        for out in [&short, &wide, &data] {
            let result = shuffle.shuffle(&data, &ShuffleOptions::key(3).output(out));
            assert!(matches!(result, Err(Error::Config(_))));
        }
        assert_eq!(device.launch_count(), 0);
    }
}
