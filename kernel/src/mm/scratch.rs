//! Scratch-window access to physical page tables
//!
//! Once the low identity map is gone the kernel can no longer dereference
//! a table's physical address. The boot stage left a self-referencing slot
//! at the top of the address space: the page at `-4096` aliases its own
//! last-level table. Writing a physical table address into one of that
//! table's entries makes the target table appear at a fixed virtual
//! window, one window per CPU.

use super::page_table::{EntryFlags, PageTable, PAGE_SIZE, PAGE_TABLE_ENTRIES};
use super::{PhysicalAddress, VirtualAddress};

/// Produces a writable virtual alias for any physical page table.
///
/// Every table walk in the virtual memory manager goes through this seam,
/// so the kernel never dereferences a raw physical pointer after the
/// identity window is torn down.
pub trait TableAccess {
    /// Return a writable alias of the table at `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must be the address of a live page table. The returned
    /// pointer is only valid until the next call on the same CPU.
    unsafe fn table_mut(&mut self, phys: PhysicalAddress) -> *mut PageTable;
}

/// Table access through the per-CPU scratch slot.
pub struct ScratchAccess {
    scratch: *mut PageTable,
}

// One scratch slot exists per CPU; the single-hart invariant serializes
// access to the shared slot table itself.
unsafe impl Send for ScratchAccess {}

impl ScratchAccess {
    /// Wrap the scratch window recorded in the handoff record.
    ///
    /// # Safety
    ///
    /// `scratch` must be the virtual alias of the self-referencing scratch
    /// table installed by the boot stage.
    pub unsafe fn new(scratch: *mut PageTable) -> Self {
        Self { scratch }
    }

    /// Virtual window reserved for CPU `cpu`.
    pub fn window_for(cpu: usize) -> VirtualAddress {
        VirtualAddress::new(0u64.wrapping_sub(((cpu + 2) * PAGE_SIZE) as u64))
    }

    /// Scratch-table slot reserved for CPU `cpu`. The last slot stays with
    /// the scratch page itself.
    pub fn slot_for(cpu: usize) -> usize {
        PAGE_TABLE_ENTRIES - cpu - 2
    }
}

impl TableAccess for ScratchAccess {
    unsafe fn table_mut(&mut self, phys: PhysicalAddress) -> *mut PageTable {
        let cpu = crate::arch::cpu_id();
        // SAFETY: the scratch alias is live per the constructor contract.
        unsafe {
            let slot = &mut (&mut (*self.scratch))[Self::slot_for(cpu)];
            slot.set_leaf(
                phys,
                EntryFlags::READ | EntryFlags::WRITE | EntryFlags::ACCESSED | EntryFlags::DIRTY,
            );
        }
        crate::arch::flush_tlb();
        Self::window_for(cpu).as_ptr()
    }
}

/// Identity table access: the physical address is the pointer.
///
/// Valid only while translation is off or the tables are identity-mapped;
/// the host-side tests use it with plain heap memory standing in for
/// physical frames.
pub struct DirectAccess;

impl TableAccess for DirectAccess {
    unsafe fn table_mut(&mut self, phys: PhysicalAddress) -> *mut PageTable {
        phys.as_u64() as *mut PageTable
    }
}
