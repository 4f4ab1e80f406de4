//! A [`Device`] backed by CUDA through `cust`.
//!
//! Kernels come from the PTX built out of `buffer_ops_gpu`. A kernel's
//! specialization flags select a separate symbol, and its parameters are
//! passed in the order the kernel crate declares them.

use crate::device::{Args, Buffer, Device, Grid, Kernel, Param, Program};
use crate::error::{config, Error, Result};
use buffer_ops_gpu::abi;
use cust::prelude::*;
use itertools::Itertools;
use std::{
    collections::HashMap,
    ffi::c_void,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};
use tracing::{debug, trace};

static PTX: &str = include_str!("../../resources/buffer_ops_gpu.ptx");

/// Entry points of every program in the PTX module.
const PROGRAMS: &[(&str, &[&str])] = &[
    (crate::scan::PROGRAM, &["local_scan", "add_group_sum"]),
    (crate::one_sweep::PROGRAM, &["clear_buffer", "one_sweep_scan"]),
    (
        crate::radix_sort::PROGRAM,
        &["compute_dispatch_size", "radix_sort_local", "global_shuffle"],
    ),
    (
        crate::shuffle::PROGRAM,
        &["apply_bijective_function", "shuffle_elements", "copy_buffer"],
    ),
    (crate::filter::PROGRAM, &["extract_flags", "compact", "copy_filtered"]),
];

/// One kernel argument, kept alive while the launch reads it.
enum Slot {
    Word(u32),
    Pointer(u64),
}

impl Slot {
    fn as_arg(&mut self) -> *mut c_void {
        match self {
            Slot::Word(word) => word as *mut u32 as *mut c_void,
            Slot::Pointer(ptr) => ptr as *mut u64 as *mut c_void,
        }
    }
}

pub struct CudaDevice {
    buffers: Mutex<HashMap<u64, DeviceBuffer<u32>>>,
    next_id: AtomicU64,
    stream: Stream,
    module: Module,
    _context: Context,
}

impl CudaDevice {
    /// Initializes CUDA on the first device and loads the kernel module.
    pub fn new() -> Result<Self> {
        let context = cust::quick_init()?;
        let module = Module::from_ptx(PTX, &[])?;
        let stream = Stream::new(StreamFlags::NON_BLOCKING, None)?;
        debug!("cuda device ready");
        Ok(Self {
            buffers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stream,
            module,
            _context: context,
        })
    }

    fn buffers(&self) -> Result<MutexGuard<'_, HashMap<u64, DeviceBuffer<u32>>>> {
        self.buffers
            .lock()
            .map_err(|_| Error::Internal("device buffer table lock poisoned".to_string()))
    }

    /// Copies the whole buffer to the host.
    fn fetch(&self, buffer: &Buffer) -> Result<Vec<u32>> {
        self.stream.synchronize()?;
        let buffers = self.buffers()?;
        let device = buffers
            .get(&buffer.id())
            .ok_or(Error::InvalidBuffer(buffer.id()))?;
        let mut words = vec![0u32; device.len()];
        if !words.is_empty() {
            device.copy_to(&mut words[..])?;
        }
        Ok(words)
    }

    /// The symbol of a kernel specialization: its entry followed by its
    /// lowercased flags.
    fn symbol(kernel: &Kernel) -> String {
        if kernel.flags().is_empty() {
            kernel.entry().to_string()
        } else {
            format!(
                "{}_{}",
                kernel.entry(),
                kernel.flags().iter().map(|f| f.to_lowercase()).join("_")
            )
        }
    }

    /// Arguments of `kernel` in declaration order.
    fn slots(&self, kernel: &Kernel, args: &Args) -> Result<Vec<Slot>> {
        let names = abi::signature(kernel.entry()).ok_or_else(|| Error::UnknownKernel {
            program: kernel.program().to_string(),
            entry: kernel.entry().to_string(),
        })?;
        let buffers = self.buffers()?;
        let mut slots = Vec::with_capacity(names.len());
        for name in names {
            let param = args.get(name).ok_or_else(|| Error::MissingParam {
                kernel: kernel.to_string(),
                name: name.to_string(),
            })?;
            match param {
                Param::Uint(value) => slots.push(Slot::Word(*value)),
                Param::Uints(values) => slots.extend(values.iter().map(|&v| Slot::Word(v))),
                Param::Buffer(buffer) => {
                    let device = buffers
                        .get(&buffer.id())
                        .ok_or(Error::InvalidBuffer(buffer.id()))?;
                    slots.push(Slot::Pointer(device.as_device_ptr().as_raw()));
                }
            }
        }
        Ok(slots)
    }

    fn dispatch(&self, kernel: &Kernel, args: &Args, grid: Grid) -> Result<()> {
        let symbol = Self::symbol(kernel);
        let function = self.module.get_function(&symbol)?;
        let threads = kernel
            .flags()
            .iter()
            .find_map(|f| abi::group_threads_flag(f))
            .unwrap_or(abi::DEFAULT_GROUP_THREADS);
        let mut slots = self.slots(kernel, args)?;
        let pointers: Vec<*mut c_void> = slots.iter_mut().map(Slot::as_arg).collect();
        trace!(%symbol, x = grid.x, y = grid.y, z = grid.z, threads, "cuda launch");
        // Every pointer in `pointers` refers into `slots`, which outlives the
        // launch call.
        unsafe {
            self.stream.launch(
                &function,
                (grid.x, grid.y, grid.z),
                threads,
                0,
                &pointers,
            )?;
        }
        Ok(())
    }
}

impl Device for CudaDevice {
    fn create_buffer(&self, count: usize, stride: usize) -> Result<Buffer> {
        if stride == 0 || stride % 4 != 0 {
            return Err(Error::InvalidStride {
                stride,
                required: 4,
            });
        }
        let words = count
            .checked_mul(stride / 4)
            .ok_or_else(|| config(format!("{count} elements of {stride} bytes overflow")))?;
        let device = DeviceBuffer::from_slice(&vec![0u32; words])?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.buffers()?.insert(id, device);
        Ok(Buffer::from_raw(id, count, stride))
    }

    fn release_buffer(&self, buffer: &Buffer) {
        if let Ok(mut buffers) = self.buffers() {
            buffers.remove(&buffer.id());
        }
    }

    fn write_buffer(&self, buffer: &Buffer, offset: usize, data: &[u8]) -> Result<()> {
        let first = offset * buffer.stride_words();
        let incoming: Vec<u32> = data
            .chunks_exact(4)
            .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let total = buffer.count() * buffer.stride_words();
        if data.len() % buffer.stride() != 0 || first + incoming.len() > total {
            return Err(Error::OutOfBounds {
                id: buffer.id(),
                start: offset,
                end: offset + data.len() / buffer.stride(),
                count: buffer.count(),
            });
        }
        if incoming.is_empty() {
            return Ok(());
        }
        // The copy is synchronous but does not order against the launch stream.
        self.stream.synchronize()?;
        let buffers = self.buffers()?;
        let device = buffers
            .get(&buffer.id())
            .ok_or(Error::InvalidBuffer(buffer.id()))?;
        device
            .index(first..first + incoming.len())
            .copy_from(&incoming[..])?;
        Ok(())
    }

    fn read_buffer(&self, buffer: &Buffer, offset: usize, out: &mut [u8]) -> Result<()> {
        let words = self.fetch(buffer)?;
        let first = offset * buffer.stride_words();
        let len = out.len() / 4;
        if out.len() % buffer.stride() != 0 || first + len > words.len() {
            return Err(Error::OutOfBounds {
                id: buffer.id(),
                start: offset,
                end: offset + out.len() / buffer.stride(),
                count: buffer.count(),
            });
        }
        for (bytes, word) in out.chunks_exact_mut(4).zip(&words[first..first + len]) {
            bytes.copy_from_slice(&word.to_ne_bytes());
        }
        Ok(())
    }

    fn load_program(&self, name: &str) -> Result<Program> {
        PROGRAMS
            .iter()
            .find(|(program, _)| *program == name)
            .map(|(program, entries)| Program::new(program, entries.iter().copied()))
            .ok_or_else(|| Error::UnknownProgram(name.to_string()))
    }

    fn launch(&self, kernel: &Kernel, args: &Args, grid: Grid) -> Result<()> {
        if grid.is_empty() {
            return Err(Error::ZeroSizedDispatch(kernel.to_string()));
        }
        self.dispatch(kernel, args, grid)
    }

    /// CUDA has no indirect dispatch: the bound grid is launched and the
    /// kernels skip groups past the count in `indirect`.
    fn launch_indirect(
        &self,
        kernel: &Kernel,
        args: &Args,
        _indirect: &Buffer,
        bound: Grid,
    ) -> Result<()> {
        if bound.is_empty() {
            return Ok(());
        }
        self.dispatch(kernel, args, bound)
    }

    fn supports_decoupled_look_back(&self) -> bool {
        true
    }
}
