//! Boot handoff record
//!
//! Populated by the boot stage while translation is still off and
//! consumed by the post-translation entry. The record lives in the low
//! boot image, which stays identity-mapped until `mm::init` tears the
//! window down, so the kernel copies it by value on entry.

use super::{PhysicalAddress, VirtualAddress};

/// Results of the early bootstrap.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct BootInfo {
    /// Argument count passed to the boot entry.
    pub argc: usize,
    /// Relocated argument vector, valid once translation is on.
    pub argv: VirtualAddress,
    /// Frames consumed from the boot pool; the remainder is donated to
    /// the frame manager.
    pub used_bootpages: usize,
    /// Physical address of the kernel root page table.
    pub p_kernel_table: PhysicalAddress,
    /// Virtual alias of the self-referencing scratch table.
    pub v_scratch: VirtualAddress,
    /// Physical extents of the low (boot) kernel image.
    pub p_lowkernel_start: PhysicalAddress,
    pub p_lowkernel_end: PhysicalAddress,
    /// Virtual extents of the high-half kernel image.
    pub v_highkernel_start: VirtualAddress,
    pub v_highkernel_end: VirtualAddress,
    /// First physical address past the loaded kernel image; usable RAM
    /// for the frame manager starts here.
    pub p_kernel_physical_end: PhysicalAddress,
    /// Virtual extents of the driver-info section.
    pub v_driverinfo_start: VirtualAddress,
    pub v_driverinfo_end: VirtualAddress,
}

impl BootInfo {
    pub const fn empty() -> Self {
        Self {
            argc: 0,
            argv: VirtualAddress::new(0),
            used_bootpages: 0,
            p_kernel_table: PhysicalAddress::new(0),
            v_scratch: VirtualAddress::new(0),
            p_lowkernel_start: PhysicalAddress::new(0),
            p_lowkernel_end: PhysicalAddress::new(0),
            v_highkernel_start: VirtualAddress::new(0),
            v_highkernel_end: VirtualAddress::new(0),
            p_kernel_physical_end: PhysicalAddress::new(0),
            v_driverinfo_start: VirtualAddress::new(0),
            v_driverinfo_end: VirtualAddress::new(0),
        }
    }
}
