//! The compute device seen by the buffer operators.
//!
//! Operators never touch kernel code. They allocate buffers, load programs by
//! logical name, bind parameters by name and launch kernels through the
//! [`Device`] trait; a backend decides what a launch actually runs.

use crate::error::{config, Error, Result};
use bytemuck::Pod;
use itertools::Itertools;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::trace;

pub use buffer_ops_gpu::dispatch::MAX_DISPATCH_SIZE;

/// Handle to a device-resident buffer of `count` elements of `stride` bytes.
///
/// Handles are plain descriptions; the device owns the memory, and whoever
/// created the buffer releases it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Buffer {
    id: u64,
    count: usize,
    stride: usize,
}

impl Buffer {
    /// Wraps a backend allocation. Only backends mint handles.
    pub fn from_raw(id: u64, count: usize, stride: usize) -> Self {
        Self { id, count, stride }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of 32-bit words per element.
    pub fn stride_words(&self) -> usize {
        self.stride / 4
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Number of groups launched along each dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Grid {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Grid {
    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    pub const fn from_shape([x, y, z]: [u32; 3]) -> Self {
        Self { x, y, z }
    }

    pub fn group_count(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    pub fn is_empty(&self) -> bool {
        self.group_count() == 0
    }
}

/// A value bound to a named kernel parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Uint(u32),
    Uints(Vec<u32>),
    Buffer(Buffer),
}

/// Named parameters of one launch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    params: Vec<(&'static str, Param)>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name`, replacing any previous binding.
    pub fn set(&mut self, name: &'static str, param: Param) -> &mut Self {
        match self.params.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = param,
            None => self.params.push((name, param)),
        }
        self
    }

    pub fn set_uint(&mut self, name: &'static str, value: u32) -> &mut Self {
        self.set(name, Param::Uint(value))
    }

    pub fn uint(mut self, name: &'static str, value: u32) -> Self {
        self.set(name, Param::Uint(value));
        self
    }

    pub fn uints(mut self, name: &'static str, values: &[u32]) -> Self {
        self.set(name, Param::Uints(values.to_vec()));
        self
    }

    pub fn buffer(mut self, name: &'static str, buffer: &Buffer) -> Self {
        self.set(name, Param::Buffer(buffer.clone()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|(n, _)| *n == name).map(|(_, p)| p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Param)> {
        self.params.iter().map(|(n, p)| (*n, p))
    }

    fn require(&self, kernel: &Kernel, name: &str) -> Result<&Param> {
        self.get(name).ok_or_else(|| Error::MissingParam {
            kernel: kernel.to_string(),
            name: name.to_string(),
        })
    }

    fn wrong_type(kernel: &Kernel, name: &str) -> Error {
        Error::ParamType {
            kernel: kernel.to_string(),
            name: name.to_string(),
        }
    }

    pub fn expect_uint(&self, kernel: &Kernel, name: &str) -> Result<u32> {
        match self.require(kernel, name)? {
            Param::Uint(v) => Ok(*v),
            _ => Err(Self::wrong_type(kernel, name)),
        }
    }

    pub fn expect_uints(&self, kernel: &Kernel, name: &str) -> Result<&[u32]> {
        match self.require(kernel, name)? {
            Param::Uints(v) => Ok(v),
            _ => Err(Self::wrong_type(kernel, name)),
        }
    }

    pub fn expect_buffer(&self, kernel: &Kernel, name: &str) -> Result<&Buffer> {
        match self.require(kernel, name)? {
            Param::Buffer(b) => Ok(b),
            _ => Err(Self::wrong_type(kernel, name)),
        }
    }
}

/// A named entry point of a loaded program, specialized by feature flags.
///
/// Flags select a compile-time variant of the entry point (value domain,
/// group size, dispatch mode) rather than branching at run time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Kernel {
    program: Arc<str>,
    entry: Arc<str>,
    flags: Vec<&'static str>,
}

impl Kernel {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Enabled flags, sorted.
    pub fn flags(&self) -> &[&'static str] {
        &self.flags
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| *f == flag)
    }

    /// This entry point with exactly `flags` enabled.
    pub fn specialize(&self, flags: &[&'static str]) -> Kernel {
        let flags = flags.iter().copied().sorted().dedup().collect();
        Kernel {
            program: self.program.clone(),
            entry: self.entry.clone(),
            flags,
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.program, self.entry)?;
        if !self.flags.is_empty() {
            write!(f, "[{}]", self.flags.iter().join(","))?;
        }
        Ok(())
    }
}

/// A loaded program: a named set of kernel entry points.
#[derive(Debug, Clone)]
pub struct Program {
    name: Arc<str>,
    entries: Vec<String>,
}

impl Program {
    pub fn new<I, S>(name: &str, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: Arc::from(name),
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unspecialized kernel `entry`.
    pub fn kernel(&self, entry: &str) -> Result<Kernel> {
        if !self.entries.iter().any(|e| e == entry) {
            return Err(Error::UnknownKernel {
                program: self.name.to_string(),
                entry: entry.to_string(),
            });
        }
        Ok(Kernel {
            program: self.name.clone(),
            entry: Arc::from(entry),
            flags: Vec::new(),
        })
    }
}

/// Buffer allocation and kernel dispatch.
///
/// Element offsets and counts are in elements of the buffer's stride. All
/// calls are issued from one thread and execute in issue order; only the
/// read calls wait for the device.
pub trait Device {
    /// Allocates `count` elements of `stride` bytes. The stride must be a
    /// positive multiple of 4.
    fn create_buffer(&self, count: usize, stride: usize) -> Result<Buffer>;

    fn release_buffer(&self, buffer: &Buffer);

    /// Copies whole elements from `data` into the buffer starting at element
    /// `offset`.
    fn write_buffer(&self, buffer: &Buffer, offset: usize, data: &[u8]) -> Result<()>;

    /// Copies whole elements starting at element `offset` into `out`, waiting
    /// for all pending work.
    fn read_buffer(&self, buffer: &Buffer, offset: usize, out: &mut [u8]) -> Result<()>;

    fn load_program(&self, name: &str) -> Result<Program>;

    fn launch(&self, kernel: &Kernel, args: &Args, grid: Grid) -> Result<()>;

    /// Launches with the grid stored in the first three words of `indirect`.
    ///
    /// `bound` is a grid at least as large as any the indirect buffer can
    /// describe. Backends without indirect dispatch launch `bound` and rely
    /// on the kernels skipping groups past the count they read on device.
    fn launch_indirect(
        &self,
        kernel: &Kernel,
        args: &Args,
        indirect: &Buffer,
        bound: Grid,
    ) -> Result<()>;

    /// Whether device-wide atomics make progress across groups of one launch,
    /// which the single-pass look-back scan depends on.
    fn supports_decoupled_look_back(&self) -> bool {
        false
    }
}

/// Resolves logical program names into loaded programs.
///
/// Operators load their programs through the loader they were constructed
/// with, so a caller can route an operator to a customized program.
pub trait ProgramLoader<D: ?Sized> {
    fn load(&self, device: &D, name: &str) -> Result<Program>;
}

/// Loads programs from the device under their logical names.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceLoader;

impl<D: Device + ?Sized> ProgramLoader<D> for DeviceLoader {
    fn load(&self, device: &D, name: &str) -> Result<Program> {
        device.load_program(name)
    }
}

/// Loads some logical names from differently named programs.
#[derive(Debug, Clone, Default)]
pub struct RenamingLoader {
    routes: HashMap<String, String>,
}

impl RenamingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `target` whenever `logical` is requested.
    pub fn route(mut self, logical: &str, target: &str) -> Self {
        self.routes.insert(logical.to_string(), target.to_string());
        self
    }
}

impl<D: Device + ?Sized> ProgramLoader<D> for RenamingLoader {
    fn load(&self, device: &D, name: &str) -> Result<Program> {
        let target = self.routes.get(name).map(String::as_str).unwrap_or(name);
        device.load_program(target)
    }
}

/// Launches `groups` groups along x, split into launches of at most
/// [`MAX_DISPATCH_SIZE`] groups. Each launch gets its first group index in
/// `offset_param`. Zero groups launch nothing.
pub(crate) fn launch_chunked<D: Device + ?Sized>(
    device: &D,
    kernel: &Kernel,
    args: &mut Args,
    offset_param: &'static str,
    groups: u32,
) -> Result<()> {
    for offset in (0..groups).step_by(MAX_DISPATCH_SIZE as usize) {
        let chunk = (groups - offset).min(MAX_DISPATCH_SIZE);
        args.set_uint(offset_param, offset);
        trace!(%kernel, offset, chunk, "launch");
        device.launch(kernel, args, Grid::linear(chunk))?;
    }
    Ok(())
}

/// Ceil of `numerator / denominator` for group counts.
pub(crate) fn div_ceil(numerator: usize, denominator: usize) -> usize {
    (numerator + denominator - 1) / denominator
}

/// Converts a host-side count into the 32-bit form kernels take.
pub(crate) fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| config(format!("{what} of {value} exceeds 32 bits")))
}

/// Allocates a buffer holding a copy of `data`.
pub fn upload<D: Device + ?Sized, T: Pod>(device: &D, data: &[T]) -> Result<Buffer> {
    let buffer = device.create_buffer(data.len(), std::mem::size_of::<T>())?;
    if !data.is_empty() {
        if let Err(e) = device.write_buffer(&buffer, 0, bytemuck::cast_slice(data)) {
            device.release_buffer(&buffer);
            return Err(e);
        }
    }
    Ok(buffer)
}

/// Overwrites elements of `buffer` starting at `offset`.
pub fn write<D: Device + ?Sized, T: Pod>(
    device: &D,
    buffer: &Buffer,
    offset: usize,
    data: &[T],
) -> Result<()> {
    check_element_type::<T>(buffer)?;
    device.write_buffer(buffer, offset, bytemuck::cast_slice(data))
}

/// Reads the whole buffer back to the host.
pub fn download<D: Device + ?Sized, T: Pod>(device: &D, buffer: &Buffer) -> Result<Vec<T>> {
    read(device, buffer, 0, buffer.count())
}

/// Reads `count` elements starting at `offset` back to the host.
pub fn read<D: Device + ?Sized, T: Pod>(
    device: &D,
    buffer: &Buffer,
    offset: usize,
    count: usize,
) -> Result<Vec<T>> {
    check_element_type::<T>(buffer)?;
    let mut out = vec![T::zeroed(); count];
    if count > 0 {
        device.read_buffer(buffer, offset, bytemuck::cast_slice_mut(&mut out))?;
    }
    Ok(out)
}

fn check_element_type<T>(buffer: &Buffer) -> Result<()> {
    let size = std::mem::size_of::<T>();
    if size != buffer.stride() {
        return Err(Error::InvalidStride {
            stride: size,
            required: buffer.stride(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> Program {
        Program::new("prefix_scan", ["local_scan", "add_group_sum"])
    }

    #[test]
    fn args_replace_bindings() {
        let mut args = Args::new().uint("group_offset", 0).uint("num_elements", 9);
        args.set_uint("group_offset", 65535);
        let kernel = program().kernel("local_scan").unwrap();
        assert_eq!(args.expect_uint(&kernel, "group_offset").unwrap(), 65535);
        assert_eq!(args.iter().count(), 2);
    }

    #[test]
    fn args_report_missing_and_mistyped_params() {
        let kernel = program().kernel("local_scan").unwrap();
        let args = Args::new().uints("num_elements", &[3]);
        assert!(matches!(
            args.expect_uint(&kernel, "num_elements"),
            Err(Error::ParamType { .. })
        ));
        assert!(matches!(
            args.expect_buffer(&kernel, "data_buffer"),
            Err(Error::MissingParam { .. })
        ));
    }

    #[test]
    fn specialization_sorts_and_dedups_flags() {
        let kernel = program().kernel("local_scan").unwrap();
        let special = kernel.specialize(&["NUM_GROUP_THREADS_128", "DATA_TYPE_INT", "DATA_TYPE_INT"]);
        assert_eq!(special.flags(), ["DATA_TYPE_INT", "NUM_GROUP_THREADS_128"]);
        assert!(special.has_flag("DATA_TYPE_INT"));
        assert!(!kernel.has_flag("DATA_TYPE_INT"));
        assert_eq!(
            special.to_string(),
            "prefix_scan::local_scan[DATA_TYPE_INT,NUM_GROUP_THREADS_128]"
        );
    }

    #[test]
    fn unknown_entry_is_rejected() {
        assert!(matches!(
            program().kernel("global_shuffle"),
            Err(Error::UnknownKernel { .. })
        ));
    }

    #[test]
    fn grid_counts_groups() {
        assert_eq!(Grid::from_shape([16, 5, 1]).group_count(), 80);
        assert!(Grid::linear(0).is_empty());
    }

    /// Records the grid and group offset of every launch.
    #[derive(Default)]
    struct Recorder {
        launches: std::sync::Mutex<Vec<(Grid, u32)>>,
    }

    impl Device for Recorder {
        fn create_buffer(&self, count: usize, stride: usize) -> Result<Buffer> {
            Ok(Buffer::from_raw(0, count, stride))
        }

        fn release_buffer(&self, _: &Buffer) {}

        fn write_buffer(&self, _: &Buffer, _: usize, _: &[u8]) -> Result<()> {
            Ok(())
        }

        fn read_buffer(&self, _: &Buffer, _: usize, _: &mut [u8]) -> Result<()> {
            Ok(())
        }

        fn load_program(&self, _: &str) -> Result<Program> {
            Ok(program())
        }

        fn launch(&self, kernel: &Kernel, args: &Args, grid: Grid) -> Result<()> {
            let offset = args.expect_uint(kernel, "group_offset")?;
            self.launches.lock().unwrap().push((grid, offset));
            Ok(())
        }

        fn launch_indirect(&self, kernel: &Kernel, args: &Args, _: &Buffer, bound: Grid) -> Result<()> {
            self.launch(kernel, args, bound)
        }
    }

    #[test]
    fn chunked_launches_respect_the_dispatch_limit() {
        let device = Recorder::default();
        let kernel = program().kernel("local_scan").unwrap();
        let mut args = Args::new();
        launch_chunked(&device, &kernel, &mut args, "group_offset", 2 * MAX_DISPATCH_SIZE + 3)
            .unwrap();
        assert_eq!(
            *device.launches.lock().unwrap(),
            vec![
                (Grid::linear(65535), 0),
                (Grid::linear(65535), 65535),
                (Grid::linear(3), 131070),
            ]
        );
    }

    #[test]
    fn chunked_launch_of_exactly_the_limit_and_of_nothing() {
        let device = Recorder::default();
        let kernel = program().kernel("local_scan").unwrap();
        let mut args = Args::new();
        launch_chunked(&device, &kernel, &mut args, "group_offset", 0).unwrap();
        assert!(device.launches.lock().unwrap().is_empty());
        launch_chunked(&device, &kernel, &mut args, "group_offset", MAX_DISPATCH_SIZE).unwrap();
        assert_eq!(
            *device.launches.lock().unwrap(),
            vec![(Grid::linear(MAX_DISPATCH_SIZE), 0)]
        );
    }
}
