//! Device-tree consumption
//!
//! The kernel reads exactly one thing from the flattened device tree: the
//! first `reg` tuple of the memory node, which gives the base and size of
//! usable RAM. The `fdt` crate handles `#address-cells`/`#size-cells`
//! decoding; nothing beyond the memory extents is parsed.

use crate::mm::{MemoryRegion, PhysicalAddress};

/// Read the usable RAM extents from the device tree blob at `dtb`.
///
/// # Safety
///
/// `dtb` must point to a complete, readable FDT blob.
pub unsafe fn memory_extents(dtb: *const u8) -> Option<MemoryRegion> {
    let tree = unsafe { fdt::Fdt::from_ptr(dtb) }.ok()?;
    let region = tree.memory().regions().next()?;
    let size = region.size?;
    if size == 0 {
        return None;
    }
    Some(MemoryRegion::new(
        PhysicalAddress::new(region.starting_address as u64),
        size,
    ))
}
