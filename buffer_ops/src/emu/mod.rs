//! A [`Device`] that runs every built-in kernel on the host.
//!
//! Buffers are vectors of 32-bit words. A launch runs the kernel's groups on
//! the rayon pool; group-parallel kernels split their buffers into disjoint
//! per-group slices, and the look-back scan uses real atomics for its
//! partition descriptors.

mod filter;
mod one_sweep;
mod radix_sort;
mod scan;
mod shuffle;

use crate::device::{Args, Buffer, Device, Grid, Kernel, Program};
use crate::error::{Error, Result};
use buffer_ops_gpu::abi;
use std::{
    cell::{Ref, RefCell, RefMut},
    collections::HashMap,
    ops::Range,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
};
use tracing::{debug, trace};

/// Host implementation of one kernel entry point.
pub type EntryFn = fn(&Launch<'_>) -> Result<()>;

/// Entry points of an emulated program.
#[derive(Clone, Default)]
pub struct EmuProgram {
    entries: Vec<(&'static str, EntryFn)>,
}

impl EmuProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, name: &'static str, function: EntryFn) -> Self {
        self.entries.retain(|(n, _)| *n != name);
        self.entries.push((name, function));
        self
    }

    /// The emulation of a program shipped with this crate.
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            crate::scan::PROGRAM => Some(scan::program()),
            crate::one_sweep::PROGRAM => Some(one_sweep::program()),
            crate::radix_sort::PROGRAM => Some(radix_sort::program()),
            crate::shuffle::PROGRAM => Some(shuffle::program()),
            crate::filter::PROGRAM => Some(filter::program()),
            _ => None,
        }
    }

    fn find(&self, entry: &str) -> Option<EntryFn> {
        self.entries
            .iter()
            .find(|(n, _)| *n == entry)
            .map(|(_, f)| *f)
    }
}

struct Allocation {
    count: usize,
    stride: usize,
    words: RefCell<Vec<u32>>,
}

/// Device memory: every live buffer by id.
#[derive(Default)]
struct Memory {
    buffers: HashMap<u64, Allocation>,
    next_id: u64,
}

impl Memory {
    fn allocation(&self, buffer: &Buffer) -> Result<&Allocation> {
        match self.buffers.get(&buffer.id()) {
            Some(a) if a.count == buffer.count() && a.stride == buffer.stride() => Ok(a),
            _ => Err(Error::InvalidBuffer(buffer.id())),
        }
    }

    fn check_range(buffer: &Buffer, range: &Range<usize>) -> Result<()> {
        if range.start > range.end || range.end > buffer.count() {
            return Err(Error::OutOfBounds {
                id: buffer.id(),
                start: range.start,
                end: range.end,
                count: buffer.count(),
            });
        }
        Ok(())
    }
}

/// One running launch: its kernel, bound parameters and grid.
pub struct Launch<'a> {
    memory: &'a Memory,
    kernel: &'a Kernel,
    args: &'a Args,
    grid: Grid,
}

impl<'a> Launch<'a> {
    pub fn kernel(&self) -> &Kernel {
        self.kernel
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn group_count(&self) -> usize {
        self.grid.group_count() as usize
    }

    /// Threads per group, from the `NUM_GROUP_THREADS_*` specialization.
    pub fn group_threads(&self) -> usize {
        self.kernel
            .flags()
            .iter()
            .find_map(|f| abi::group_threads_flag(f))
            .unwrap_or(abi::DEFAULT_GROUP_THREADS) as usize
    }

    pub fn uint(&self, name: &str) -> Result<u32> {
        self.args.expect_uint(self.kernel, name)
    }

    pub fn index(&self, name: &str) -> Result<usize> {
        Ok(self.uint(name)? as usize)
    }

    /// An integer-array parameter of exactly `len` values.
    pub fn uints(&self, name: &str, len: usize) -> Result<&'a [u32]> {
        let values = self.args.expect_uints(self.kernel, name)?;
        if values.len() != len {
            return Err(Error::ParamType {
                kernel: self.kernel.to_string(),
                name: name.to_string(),
            });
        }
        Ok(values)
    }

    pub fn buffer(&self, name: &str) -> Result<&'a Buffer> {
        self.args.expect_buffer(self.kernel, name)
    }

    /// Words of the buffer bound to `name`, checking that it holds at least
    /// `elements` elements.
    pub fn words(&self, name: &str, elements: usize) -> Result<Ref<'a, Vec<u32>>> {
        let buffer = self.buffer(name)?;
        Memory::check_range(buffer, &(0..elements))?;
        self.memory
            .allocation(buffer)?
            .words
            .try_borrow()
            .map_err(|_| Error::BufferBusy(buffer.id()))
    }

    /// Mutable words of the buffer bound to `name`, checking that it holds at
    /// least `elements` elements.
    pub fn words_mut(&self, name: &str, elements: usize) -> Result<RefMut<'a, Vec<u32>>> {
        let buffer = self.buffer(name)?;
        Memory::check_range(buffer, &(0..elements))?;
        self.memory
            .allocation(buffer)?
            .words
            .try_borrow_mut()
            .map_err(|_| Error::BufferBusy(buffer.id()))
    }

    /// Words per element of the buffer bound to `name`.
    pub fn stride_words(&self, name: &str) -> Result<usize> {
        Ok(self.buffer(name)?.stride_words())
    }

    /// Global thread indices of this launch clamped to `limit`, for kernels
    /// chunked with a `group_offset` parameter.
    pub fn thread_range(&self, limit: usize) -> Result<Range<usize>> {
        let threads = self.group_threads();
        let first = self.index("group_offset")?;
        let start = (first * threads).min(limit);
        let end = ((first + self.group_count()) * threads).min(limit);
        Ok(start..end)
    }
}

/// In-process emulation of a compute device.
pub struct EmuDevice {
    memory: Mutex<Memory>,
    programs: HashMap<String, EmuProgram>,
    launches: AtomicUsize,
    look_back: bool,
}

impl Default for EmuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl EmuDevice {
    /// A device with every built-in program registered.
    pub fn new() -> Self {
        let programs = [
            crate::scan::PROGRAM,
            crate::one_sweep::PROGRAM,
            crate::radix_sort::PROGRAM,
            crate::shuffle::PROGRAM,
            crate::filter::PROGRAM,
        ]
        .into_iter()
        .filter_map(|name| EmuProgram::builtin(name).map(|p| (name.to_string(), p)))
        .collect();
        Self {
            memory: Mutex::new(Memory::default()),
            programs,
            launches: AtomicUsize::new(0),
            look_back: true,
        }
    }

    /// Whether to report support for the single-pass look-back scan.
    pub fn with_look_back(mut self, enabled: bool) -> Self {
        self.look_back = enabled;
        self
    }

    /// Registers `program` under `name`, replacing any program of that name.
    pub fn register_program(&mut self, name: &str, program: EmuProgram) {
        self.programs.insert(name.to_string(), program);
    }

    /// Number of kernel launches executed so far.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }

    /// Number of buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.memory().map(|m| m.buffers.len()).unwrap_or(0)
    }

    fn memory(&self) -> Result<MutexGuard<'_, Memory>> {
        self.memory
            .lock()
            .map_err(|_| Error::Internal("device memory lock poisoned".to_string()))
    }

    fn entry(&self, kernel: &Kernel) -> Result<EntryFn> {
        let program = self
            .programs
            .get(kernel.program())
            .ok_or_else(|| Error::UnknownProgram(kernel.program().to_string()))?;
        program.find(kernel.entry()).ok_or_else(|| Error::UnknownKernel {
            program: kernel.program().to_string(),
            entry: kernel.entry().to_string(),
        })
    }

    fn run(&self, kernel: &Kernel, args: &Args, grid: Grid) -> Result<()> {
        let entry = self.entry(kernel)?;
        let memory = self.memory()?;
        self.launches.fetch_add(1, Ordering::Relaxed);
        trace!(%kernel, x = grid.x, y = grid.y, z = grid.z, "emulated launch");
        entry(&Launch {
            memory: &*memory,
            kernel,
            args,
            grid,
        })
    }

    fn element_range(buffer: &Buffer, offset: usize, bytes: usize) -> Result<Range<usize>> {
        if bytes % buffer.stride() != 0 {
            return Err(Error::Config(format!(
                "{bytes} bytes are not whole elements of {} bytes",
                buffer.stride()
            )));
        }
        let range = offset..offset + bytes / buffer.stride();
        Memory::check_range(buffer, &range)?;
        Ok(range)
    }
}

impl Device for EmuDevice {
    fn create_buffer(&self, count: usize, stride: usize) -> Result<Buffer> {
        if stride == 0 || stride % 4 != 0 {
            return Err(Error::InvalidStride {
                stride,
                required: 4,
            });
        }
        let mut memory = self.memory()?;
        memory.next_id += 1;
        let id = memory.next_id;
        memory.buffers.insert(
            id,
            Allocation {
                count,
                stride,
                words: RefCell::new(vec![0; count * stride / 4]),
            },
        );
        debug!(id, count, stride, "allocated buffer");
        Ok(Buffer::from_raw(id, count, stride))
    }

    fn release_buffer(&self, buffer: &Buffer) {
        if let Ok(mut memory) = self.memory() {
            if memory.buffers.remove(&buffer.id()).is_some() {
                debug!(id = buffer.id(), "released buffer");
            }
        }
    }

    fn write_buffer(&self, buffer: &Buffer, offset: usize, data: &[u8]) -> Result<()> {
        let range = Self::element_range(buffer, offset, data.len())?;
        let memory = self.memory()?;
        let mut words = memory
            .allocation(buffer)?
            .words
            .try_borrow_mut()
            .map_err(|_| Error::BufferBusy(buffer.id()))?;
        let words_per = buffer.stride_words();
        let target = &mut words[range.start * words_per..range.end * words_per];
        for (word, bytes) in target.iter_mut().zip(data.chunks_exact(4)) {
            *word = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: &Buffer, offset: usize, out: &mut [u8]) -> Result<()> {
        let range = Self::element_range(buffer, offset, out.len())?;
        let memory = self.memory()?;
        let words = memory
            .allocation(buffer)?
            .words
            .try_borrow()
            .map_err(|_| Error::BufferBusy(buffer.id()))?;
        let words_per = buffer.stride_words();
        let source = &words[range.start * words_per..range.end * words_per];
        for (bytes, word) in out.chunks_exact_mut(4).zip(source) {
            bytes.copy_from_slice(&word.to_ne_bytes());
        }
        Ok(())
    }

    fn load_program(&self, name: &str) -> Result<Program> {
        let program = self
            .programs
            .get(name)
            .ok_or_else(|| Error::UnknownProgram(name.to_string()))?;
        Ok(Program::new(name, program.entries.iter().map(|(n, _)| *n)))
    }

    fn launch(&self, kernel: &Kernel, args: &Args, grid: Grid) -> Result<()> {
        if grid.is_empty() {
            return Err(Error::ZeroSizedDispatch(kernel.to_string()));
        }
        self.run(kernel, args, grid)
    }

    fn launch_indirect(
        &self,
        kernel: &Kernel,
        args: &Args,
        indirect: &Buffer,
        bound: Grid,
    ) -> Result<()> {
        let grid = {
            let memory = self.memory()?;
            Memory::check_range(indirect, &(0..3))?;
            let words = memory
                .allocation(indirect)?
                .words
                .try_borrow()
                .map_err(|_| Error::BufferBusy(indirect.id()))?;
            Grid::from_shape([words[0], words[1], words[2]])
        };
        if grid.group_count() > bound.group_count() {
            return Err(Error::Internal(format!(
                "indirect grid of {} groups exceeds bound of {}",
                grid.group_count(),
                bound.group_count()
            )));
        }
        if grid.is_empty() {
            trace!(%kernel, "indirect launch of an empty grid skipped");
            return Ok(());
        }
        self.run(kernel, args, grid)
    }

    fn supports_decoupled_look_back(&self) -> bool {
        self.look_back
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{download, upload};

    #[test]
    fn buffers_round_trip_and_release() {
        let device = EmuDevice::new();
        let buffer = upload(&device, &[1u32, 2, 3]).unwrap();
        assert_eq!(download::<_, u32>(&device, &buffer).unwrap(), vec![1, 2, 3]);
        assert_eq!(device.live_buffers(), 1);
        device.release_buffer(&buffer);
        assert_eq!(device.live_buffers(), 0);
        assert!(matches!(
            download::<_, u32>(&device, &buffer),
            Err(Error::InvalidBuffer(_))
        ));
    }

    #[test]
    fn rejects_unaligned_strides() {
        let device = EmuDevice::new();
        assert!(matches!(
            device.create_buffer(4, 6),
            Err(Error::InvalidStride { stride: 6, .. })
        ));
        assert!(device.create_buffer(4, 0).is_err());
    }

    #[test]
    fn writes_are_bounds_checked() {
        let device = EmuDevice::new();
        let buffer = device.create_buffer(2, 4).unwrap();
        let result = device.write_buffer(&buffer, 1, bytemuck::cast_slice(&[7u32, 8]));
        assert!(matches!(result, Err(Error::OutOfBounds { end: 3, .. })));
    }

    #[test]
    fn rejects_empty_direct_launch() {
        let device = EmuDevice::new();
        let kernel = device
            .load_program(crate::scan::PROGRAM)
            .and_then(|p| p.kernel("local_scan"))
            .unwrap();
        let result = device.launch(&kernel, &Args::new(), Grid::linear(0));
        assert!(matches!(result, Err(Error::ZeroSizedDispatch(_))));
        assert_eq!(device.launch_count(), 0);
    }

    #[test]
    fn unknown_programs_are_reported() {
        let device = EmuDevice::new();
        assert!(matches!(
            device.load_program("bitonic_sort"),
            Err(Error::UnknownProgram(_))
        ));
    }

    #[test]
    fn registered_programs_can_be_loaded() {
        let mut device = EmuDevice::new();
        device.register_program("custom_scan", EmuProgram::builtin("prefix_scan").unwrap());
        let program = device.load_program("custom_scan").unwrap();
        assert!(program.kernel("add_group_sum").is_ok());
    }
}
