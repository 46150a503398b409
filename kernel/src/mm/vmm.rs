//! Virtual memory manager
//!
//! Map, unmap and lookup over a root page table. Table frames come from
//! the physical frame allocator and every table dereference goes through
//! the scratch-window seam, so the code runs identically after the low
//! identity map is torn down.

use super::frame_allocator::FrameManager;
use super::page_table::{
    is_canonical, page_index, EntryFlags, PageLevel, PAGE_TABLE_ENTRIES,
};
use super::scratch::TableAccess;
use super::{PhysicalAddress, VirtualAddress};
use crate::error::KernelError;

/// Descriptor of one established mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingInfo {
    pub paddr: PhysicalAddress,
    pub vaddr: VirtualAddress,
    pub level: PageLevel,
    pub flags: EntryFlags,
}

/// Address-space manager over one root table.
pub struct Vmm<A: TableAccess> {
    root: PhysicalAddress,
    access: A,
}

impl<A: TableAccess> Vmm<A> {
    /// Wrap an existing root table.
    ///
    /// # Safety
    ///
    /// `root` must address a live page table reachable through `access`.
    pub unsafe fn new(root: PhysicalAddress, access: A) -> Self {
        Self { root, access }
    }

    /// Physical address of the root table (for `satp`).
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    fn validate(
        &self,
        paddr: PhysicalAddress,
        vaddr: VirtualAddress,
        level: PageLevel,
        flags: EntryFlags,
    ) -> Result<(), KernelError> {
        if self.root.as_u64() == 0 {
            return Err(KernelError::InvalidPageTable);
        }
        if !is_canonical(vaddr.as_u64()) {
            return Err(KernelError::InvalidVirtualAddress {
                vaddr: vaddr.as_u64(),
            });
        }
        if !paddr.is_aligned(level.alignment()) {
            return Err(KernelError::MisalignedMemoryAddress {
                addr: paddr.as_u64(),
            });
        }
        if !vaddr.is_aligned(level.alignment()) {
            return Err(KernelError::MisalignedMemoryAddress {
                addr: vaddr.as_u64(),
            });
        }
        if !EntryFlags::LEAF_ALLOWED.contains(flags) {
            return Err(KernelError::InvalidArgument);
        }
        // Write-without-read is a forbidden encoding.
        if flags.contains(EntryFlags::WRITE) && !flags.contains(EntryFlags::READ) {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    /// Establish a mapping from `vaddr` to `paddr` at `level`.
    ///
    /// Intermediate tables are allocated from `frames` and zeroed through
    /// the access seam. Meeting a leaf above the target level, or any
    /// valid entry at it, fails with `AddressAlreadyMapped`.
    pub fn map(
        &mut self,
        frames: &mut FrameManager,
        paddr: PhysicalAddress,
        vaddr: VirtualAddress,
        level: PageLevel,
        flags: EntryFlags,
    ) -> Result<MappingInfo, KernelError> {
        self.validate(paddr, vaddr, level, flags)?;

        let mut current = PageLevel::HIGHEST;
        let mut table_phys = self.root;

        loop {
            let idx = page_index(vaddr.as_u64(), current);
            // SAFETY: table_phys tracks a live table of this hierarchy.
            let table = unsafe { self.access.table_mut(table_phys) };

            if current == level {
                let entry = unsafe { &mut (&mut (*table))[idx] };
                if entry.is_valid() {
                    return Err(KernelError::AddressAlreadyMapped {
                        vaddr: vaddr.as_u64(),
                    });
                }
                entry.set_leaf(paddr, flags);
                crate::arch::flush_tlb();
                return Ok(MappingInfo {
                    paddr,
                    vaddr,
                    level,
                    flags: unsafe { (&(*table))[idx].flags() },
                });
            }

            let entry = unsafe { (&(*table))[idx] };
            if entry.is_leaf() {
                return Err(KernelError::AddressAlreadyMapped {
                    vaddr: vaddr.as_u64(),
                });
            }
            if entry.is_valid() {
                table_phys = entry.addr();
            } else {
                let child = frames.get_frame()?;
                // SAFETY: a freshly allocated frame becomes a table once
                // zeroed through its alias.
                unsafe {
                    let child_table = self.access.table_mut(child);
                    (*child_table).zero();
                    // The scratch window moved to the child; alias the
                    // parent again to install the link.
                    let table = self.access.table_mut(table_phys);
                    (&mut (*table))[idx].set_table(child);
                }
                table_phys = child;
            }
            current = current.next_lower();
        }
    }

    /// Map `paddr` at the first free virtual slot of the requested level,
    /// searching the table tree in ascending virtual address order.
    pub fn map_first_fit(
        &mut self,
        frames: &mut FrameManager,
        paddr: PhysicalAddress,
        level: PageLevel,
        flags: EntryFlags,
    ) -> Result<MappingInfo, KernelError> {
        let vaddr = self
            .find_first_free(self.root, PageLevel::HIGHEST, level, 0)
            .ok_or(KernelError::NotEnoughContiguousMemory)?;
        self.map(frames, paddr, VirtualAddress::new(vaddr), level, flags)
    }

    fn find_first_free(
        &mut self,
        table_phys: PhysicalAddress,
        current: PageLevel,
        target: PageLevel,
        base: u64,
    ) -> Option<u64> {
        for idx in 0..PAGE_TABLE_ENTRIES {
            let vaddr = sign_extend(base + (idx * current.size()) as u64);
            // SAFETY: table_phys tracks a live table; the entry is copied
            // out before any recursion reuses the scratch window.
            let entry = unsafe { (&(*self.access.table_mut(table_phys)))[idx] };

            if !entry.is_valid() {
                // The whole subtree is free, so a slot of any lower level
                // is available at its base.
                return Some(vaddr);
            }
            if current == target || entry.is_leaf() {
                continue;
            }
            if let Some(found) =
                self.find_first_free(entry.addr(), current.next_lower(), target, vaddr)
            {
                return Some(found);
            }
        }
        None
    }

    /// Translate `vaddr` to its mapping descriptor.
    pub fn lookup(&mut self, vaddr: VirtualAddress) -> Result<MappingInfo, KernelError> {
        if self.root.as_u64() == 0 {
            return Err(KernelError::InvalidPageTable);
        }
        if !is_canonical(vaddr.as_u64()) {
            return Err(KernelError::InvalidVirtualAddress {
                vaddr: vaddr.as_u64(),
            });
        }

        let mut current = PageLevel::HIGHEST;
        let mut table_phys = self.root;
        loop {
            let idx = page_index(vaddr.as_u64(), current);
            // SAFETY: table_phys tracks a live table of this hierarchy.
            let entry = unsafe { (&(*self.access.table_mut(table_phys)))[idx] };

            if !entry.is_valid() {
                return Err(KernelError::InvalidVirtualAddress {
                    vaddr: vaddr.as_u64(),
                });
            }
            if entry.is_leaf() {
                let offset = vaddr.as_u64() & (current.size() as u64 - 1);
                return Ok(MappingInfo {
                    paddr: PhysicalAddress::new(entry.addr().as_u64() + offset),
                    vaddr,
                    level: current,
                    flags: entry.flags(),
                });
            }
            if current == PageLevel::Base {
                // A valid non-leaf at the lowest level is not decodable.
                return Err(KernelError::InvalidPageEntry);
            }
            table_phys = entry.addr();
            current = current.next_lower();
        }
    }

    pub fn is_mapped(&mut self, vaddr: VirtualAddress) -> bool {
        self.lookup(vaddr).is_ok()
    }

    /// Remove the mapping at `vaddr`, releasing every intermediate table
    /// that becomes empty. Silently returns when nothing is mapped there.
    pub fn unmap(&mut self, frames: &mut FrameManager, vaddr: VirtualAddress) {
        if self.root.as_u64() == 0 || !is_canonical(vaddr.as_u64()) {
            return;
        }

        // Tables visited on the way down, root first.
        let mut path = [(PhysicalAddress::new(0), 0usize); 4];
        let mut depth = 0;
        let mut current = PageLevel::HIGHEST;
        let mut table_phys = self.root;

        loop {
            let idx = page_index(vaddr.as_u64(), current);
            path[depth] = (table_phys, idx);
            depth += 1;

            // SAFETY: table_phys tracks a live table of this hierarchy.
            let table = unsafe { self.access.table_mut(table_phys) };
            let entry = unsafe { (&(*table))[idx] };
            if !entry.is_valid() {
                return;
            }
            if entry.is_leaf() {
                unsafe {
                    (&mut (*table))[idx].clear();
                }
                break;
            }
            if current == PageLevel::Base {
                return;
            }
            table_phys = entry.addr();
            current = current.next_lower();
        }

        // Free now-empty tables bottom-up. The root is never released.
        for i in (1..depth).rev() {
            let (tphys, _) = path[i];
            // SAFETY: every path element addresses a live table.
            let empty = unsafe { (*self.access.table_mut(tphys)).is_empty() };
            if !empty {
                break;
            }
            frames.release_frame(tphys);
            let (parent_phys, parent_idx) = path[i - 1];
            unsafe {
                (&mut (*self.access.table_mut(parent_phys)))[parent_idx].clear();
            }
        }
        crate::arch::flush_tlb();
    }
}

/// Sign-extend a composed virtual address from the top translated bit.
fn sign_extend(vaddr: u64) -> u64 {
    let shift = 12 + 9 * (PageLevel::HIGHEST as u32 + 1);
    if vaddr & (1 << (shift - 1)) != 0 {
        vaddr | (u64::MAX << shift)
    } else {
        vaddr
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;
    use std::vec::Vec;

    use super::*;
    use crate::mm::frame_allocator::FrameNode;
    use crate::mm::scratch::DirectAccess;
    use crate::mm::{Frame, PAGE_SIZE};

    /// Host arena standing in for physical memory: frame addresses are
    /// real pointers, so DirectAccess table walks hit live memory.
    struct Arena {
        frames: Vec<Frame>,
        nodes: Vec<FrameNode>,
    }

    impl Arena {
        fn new(frame_count: usize) -> Self {
            let mut frames = Vec::with_capacity(frame_count);
            frames.resize_with(frame_count, Frame::zeroed);
            let mut nodes = Vec::with_capacity(frame_count + 1);
            nodes.resize_with(frame_count + 1, || unsafe { core::mem::zeroed() });
            Self { frames, nodes }
        }

        fn manager(&mut self) -> FrameManager {
            // SAFETY: arena memory outlives the manager within each test.
            unsafe {
                FrameManager::from_parts(
                    self.nodes.as_mut_ptr(),
                    PhysicalAddress::new(self.frames.as_ptr() as u64),
                    self.frames.len(),
                )
            }
        }
    }

    fn vmm_over(frames: &mut FrameManager) -> Vmm<DirectAccess> {
        let root = frames.get_frame().unwrap();
        // SAFETY: the frame is arena memory; zeroing makes it a table.
        unsafe {
            (*(root.as_u64() as *mut crate::mm::PageTable)).zero();
            Vmm::new(root, DirectAccess)
        }
    }

    const RW: EntryFlags = EntryFlags::READ.union(EntryFlags::WRITE);
    const RWAD: EntryFlags = RW
        .union(EntryFlags::ACCESSED)
        .union(EntryFlags::DIRTY);

    #[test]
    fn test_map_lookup_roundtrip() {
        let mut arena = Arena::new(16);
        let mut frames = arena.manager();
        let mut vmm = vmm_over(&mut frames);

        let paddr = PhysicalAddress::new(0x8020_0000);
        let vaddr = VirtualAddress::new(0xFFFF_FFFF_C020_0000);
        let info = vmm
            .map(&mut frames, paddr, vaddr, PageLevel::Base, RWAD)
            .unwrap();
        assert_eq!(info.paddr, paddr);

        let found = vmm.lookup(vaddr).unwrap();
        assert_eq!(found.paddr, paddr);
        assert_eq!(found.level, PageLevel::Base);
        assert!(found.flags.contains(RWAD));
        assert!(vmm.is_mapped(vaddr));
    }

    #[test]
    fn test_unmap_restores_free_tree() {
        let mut arena = Arena::new(16);
        let mut frames = arena.manager();
        let mut vmm = vmm_over(&mut frames);
        let before = frames.free_frames();

        let paddr = PhysicalAddress::new(0x8020_0000);
        let vaddr = VirtualAddress::new(0xFFFF_FFFF_C020_0000);
        vmm.map(&mut frames, paddr, vaddr, PageLevel::Base, RWAD)
            .unwrap();
        assert!(frames.free_frames() < before);

        vmm.unmap(&mut frames, vaddr);
        assert!(!vmm.is_mapped(vaddr));
        // Every intermediate table went back to the free tree.
        assert_eq!(frames.free_frames(), before);
    }

    #[test]
    fn test_unmap_is_idempotent() {
        let mut arena = Arena::new(16);
        let mut frames = arena.manager();
        let mut vmm = vmm_over(&mut frames);

        let vaddr = VirtualAddress::new(0xFFFF_FFFF_C020_0000);
        vmm.map(
            &mut frames,
            PhysicalAddress::new(0x8020_0000),
            vaddr,
            PageLevel::Base,
            RW,
        )
        .unwrap();
        vmm.unmap(&mut frames, vaddr);
        let free = frames.free_frames();
        let used = frames.used_frames();
        vmm.unmap(&mut frames, vaddr);
        assert_eq!(frames.free_frames(), free);
        assert_eq!(frames.used_frames(), used);
    }

    #[test]
    fn test_partial_unmap_keeps_shared_tables() {
        let mut arena = Arena::new(16);
        let mut frames = arena.manager();
        let mut vmm = vmm_over(&mut frames);

        let a = VirtualAddress::new(0xFFFF_FFFF_C020_0000);
        let b = VirtualAddress::new(0xFFFF_FFFF_C020_1000);
        vmm.map(&mut frames, PhysicalAddress::new(0x8020_0000), a, PageLevel::Base, RW)
            .unwrap();
        vmm.map(&mut frames, PhysicalAddress::new(0x8020_1000), b, PageLevel::Base, RW)
            .unwrap();

        vmm.unmap(&mut frames, a);
        // The shared leaf table still carries b.
        assert!(!vmm.is_mapped(a));
        assert!(vmm.is_mapped(b));
    }

    #[test]
    fn test_map_collides_with_existing_mapping() {
        let mut arena = Arena::new(16);
        let mut frames = arena.manager();
        let mut vmm = vmm_over(&mut frames);

        let vaddr = VirtualAddress::new(0xFFFF_FFFF_C020_0000);
        vmm.map(&mut frames, PhysicalAddress::new(0x8020_0000), vaddr, PageLevel::Base, RW)
            .unwrap();
        let again = vmm.map(
            &mut frames,
            PhysicalAddress::new(0x8030_0000),
            vaddr,
            PageLevel::Base,
            RW,
        );
        assert_eq!(
            again,
            Err(KernelError::AddressAlreadyMapped {
                vaddr: vaddr.as_u64()
            })
        );
    }

    #[test]
    fn test_map_through_superpage_fails() {
        let mut arena = Arena::new(16);
        let mut frames = arena.manager();
        let mut vmm = vmm_over(&mut frames);

        let giga = VirtualAddress::new(0x40000000);
        vmm.map(&mut frames, PhysicalAddress::new(0x4000_0000), giga, PageLevel::Giga, RW)
            .unwrap();
        let inside = vmm.map(
            &mut frames,
            PhysicalAddress::new(0x8020_0000),
            giga.offset(0x1000),
            PageLevel::Base,
            RW,
        );
        assert!(matches!(
            inside,
            Err(KernelError::AddressAlreadyMapped { .. })
        ));
    }

    #[test]
    fn test_map_validates_arguments() {
        let mut arena = Arena::new(16);
        let mut frames = arena.manager();
        let mut vmm = vmm_over(&mut frames);

        // Misaligned physical address.
        assert_eq!(
            vmm.map(
                &mut frames,
                PhysicalAddress::new(0x8020_0010),
                VirtualAddress::new(0xFFFF_FFFF_C020_0000),
                PageLevel::Base,
                RW,
            ),
            Err(KernelError::MisalignedMemoryAddress { addr: 0x8020_0010 })
        );
        // Base-aligned but not superpage-aligned.
        assert_eq!(
            vmm.map(
                &mut frames,
                PhysicalAddress::new(0x8020_1000),
                VirtualAddress::new(0xFFFF_FFFF_C020_0000),
                PageLevel::Mega,
                RW,
            ),
            Err(KernelError::MisalignedMemoryAddress { addr: 0x8020_1000 })
        );
        // Non-canonical virtual address.
        assert!(matches!(
            vmm.map(
                &mut frames,
                PhysicalAddress::new(0x8020_0000),
                VirtualAddress::new(0x00F0_0000_0000_0000),
                PageLevel::Base,
                RW,
            ),
            Err(KernelError::InvalidVirtualAddress { .. })
        ));
        // Write-without-read is rejected, not silently fixed up.
        assert_eq!(
            vmm.map(
                &mut frames,
                PhysicalAddress::new(0x8020_0000),
                VirtualAddress::new(0xFFFF_FFFF_C020_0000),
                PageLevel::Base,
                EntryFlags::WRITE,
            ),
            Err(KernelError::InvalidArgument)
        );
        // Valid bit is not a caller flag.
        assert_eq!(
            vmm.map(
                &mut frames,
                PhysicalAddress::new(0x8020_0000),
                VirtualAddress::new(0xFFFF_FFFF_C020_0000),
                PageLevel::Base,
                EntryFlags::VALID | EntryFlags::READ,
            ),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_lookup_unmapped_address() {
        let mut arena = Arena::new(16);
        let mut frames = arena.manager();
        let mut vmm = vmm_over(&mut frames);
        assert!(matches!(
            vmm.lookup(VirtualAddress::new(0xFFFF_FFFF_C020_0000)),
            Err(KernelError::InvalidVirtualAddress { .. })
        ));
        assert!(!vmm.is_mapped(VirtualAddress::new(0xFFFF_FFFF_C020_0000)));
    }

    #[test]
    fn test_superpage_lookup_composes_offset() {
        let mut arena = Arena::new(16);
        let mut frames = arena.manager();
        let mut vmm = vmm_over(&mut frames);

        let vaddr = VirtualAddress::new(0x8000_0000);
        vmm.map(&mut frames, PhysicalAddress::new(0x4000_0000), vaddr, PageLevel::Giga, RW)
            .unwrap();
        let inside = vmm.lookup(vaddr.offset(0x12345)).unwrap();
        assert_eq!(inside.paddr.as_u64(), 0x4000_0000 + 0x12345);
        assert_eq!(inside.level, PageLevel::Giga);
    }

    #[test]
    fn test_first_fit_takes_lowest_free_slot() {
        let mut arena = Arena::new(32);
        let mut frames = arena.manager();
        let mut vmm = vmm_over(&mut frames);

        // Occupy the very first base page of the address space.
        vmm.map(&mut frames, PhysicalAddress::new(0x8020_0000), VirtualAddress::new(0), PageLevel::Base, RW)
            .unwrap();

        let info = vmm
            .map_first_fit(&mut frames, PhysicalAddress::new(0x8030_0000), PageLevel::Base, RW)
            .unwrap();
        assert_eq!(info.vaddr.as_u64(), PAGE_SIZE as u64);
        assert_eq!(
            vmm.lookup(info.vaddr).unwrap().paddr.as_u64(),
            0x8030_0000
        );
    }
}
