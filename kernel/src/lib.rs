//! BorealOS kernel library
//!
//! The virtual-memory core of a 64-bit RISC-V kernel: the boot-time
//! page-table bootstrap and the post-translation memory manager it hands
//! off to. The crate is `no_std` on bare metal; host builds keep the
//! standard library so the unit and integration tests run under the
//! normal harness.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod print;

pub mod arch;
pub mod devicetree;
pub mod error;
pub mod log_service;
pub mod mm;

pub use error::KernelError;
pub use mm::{BootInfo, MemoryRegion, PhysicalAddress, VirtualAddress};
