#![cfg_attr(
    target_os = "cuda",
    no_std,
    feature(register_attr),
    register_attr(nvvm_internal)
)]

pub mod abi;
pub mod bijection;
pub mod dispatch;
pub mod look_back;
pub mod step;
pub mod values;

#[cfg(target_os = "cuda")]
pub mod kernels;
