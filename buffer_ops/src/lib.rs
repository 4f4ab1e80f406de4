//! Parallel primitives over device-resident buffers: prefix scans, radix
//! sort, keyed shuffle and stream compaction.
//!
//! Every primitive orchestrates batched kernel launches through a [`Device`].
//! [`emu::EmuDevice`] runs the kernels on the host; with the `cuda` feature,
//! `cuda::CudaDevice` runs the kernels compiled from `buffer_ops_gpu`.

pub mod device;
pub mod emu;
mod error;
pub mod filter;
pub mod one_sweep;
pub mod radix_sort;
pub mod scan;
pub mod shuffle;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use buffer_ops_gpu::values::{SortOrder, ValueType};
pub use device::{
    download, read, upload, write, Args, Buffer, Device, DeviceLoader, Grid, Kernel, Param,
    Program, ProgramLoader, RenamingLoader, MAX_DISPATCH_SIZE,
};
pub use error::{Error, Result};
pub use filter::Filter;
pub use one_sweep::OneSweepPrefixScan;
pub use radix_sort::{upload_range, RadixSort, SortOptions, SortRange};
pub use scan::{
    scanner, PrefixScan, Scan, ScanMode, ScanOptions, ScanOutcome, ScanStrategy, Total,
    TotalDestination,
};
pub use shuffle::{Shuffle, ShuffleOptions};
