//! Post-translation memory bring-up
//!
//! Runs on the high-half kernel right after `satp` is loaded, while the
//! low identity window is still alive. Brings up the frame manager over
//! all RAM past the kernel image, seeds the scratch-window mapper and the
//! kernel heap, donates the leftover boot frames and finally tears the
//! identity window down.

use core::alloc::{GlobalAlloc, Layout};

use spin::Mutex;

use super::boot_map::{self, BootFramePool};
use super::bump::BumpPool;
use super::frame_allocator::{carve_span, node_storage_size, FrameManager, FrameNode};
use super::handoff::BootInfo;
use super::heap::{Heap, HeapBackend};
use super::page_table::{EntryFlags, PageLevel, PageTable, PAGE_SIZE};
use super::scratch::ScratchAccess;
use super::vmm::Vmm;
use super::{align_down, align_up, pages_to_cover, Frame, MemoryRegion, PhysicalAddress, VirtualAddress};
use crate::error::KernelError;

/// Virtual cursor where the frame-manager node region is mapped. Sits one
/// 4 GiB window below the high kernel image so gigapage mappings stay
/// naturally aligned.
pub const NODE_REGION_BASE: u64 = 0xFFFF_FFFF_0000_0000;

/// Virtual window of the kernel heap.
pub const HEAP_BASE: u64 = 0xFFFF_FFFE_0000_0000;
pub const HEAP_LIMIT: u64 = 0xFFFF_FFFF_0000_0000;

/// Global frame manager, constructed once at the hand-off point.
pub static FRAME_MANAGER: Mutex<Option<FrameManager>> = Mutex::new(None);

/// Kernel address space, constructed once at the hand-off point.
pub static KERNEL_SPACE: Mutex<Option<Vmm<ScratchAccess>>> = Mutex::new(None);

/// Backing store of the global allocator: frames from the frame manager,
/// mapped page by page into the heap window.
pub struct KernelBackend;

impl HeapBackend for KernelBackend {
    fn map_pages(&mut self, vaddr: u64, pages: usize) -> Result<(), KernelError> {
        let mut frames = FRAME_MANAGER.lock();
        let frames = frames.as_mut().ok_or(KernelError::OperationNotAllowed)?;
        let mut space = KERNEL_SPACE.lock();
        let space = space.as_mut().ok_or(KernelError::OperationNotAllowed)?;

        let flags = EntryFlags::READ | EntryFlags::WRITE | EntryFlags::ACCESSED | EntryFlags::DIRTY;
        for i in 0..pages {
            let page = VirtualAddress::new(vaddr + (i * PAGE_SIZE) as u64);
            let frame = match frames.get_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    roll_back(space, frames, vaddr, i);
                    return Err(e);
                }
            };
            if let Err(e) = space.map(frames, frame, page, PageLevel::Base, flags) {
                frames.release_frame(frame);
                roll_back(space, frames, vaddr, i);
                return Err(e);
            }
        }
        Ok(())
    }

    fn unmap_pages(&mut self, vaddr: u64, pages: usize) {
        let mut frames = FRAME_MANAGER.lock();
        let Some(frames) = frames.as_mut() else {
            return;
        };
        let mut space = KERNEL_SPACE.lock();
        let Some(space) = space.as_mut() else {
            return;
        };
        roll_back(space, frames, vaddr, pages);
    }
}

fn roll_back(
    space: &mut Vmm<ScratchAccess>,
    frames: &mut FrameManager,
    vaddr: u64,
    pages: usize,
) {
    for i in 0..pages {
        let page = VirtualAddress::new(vaddr + (i * PAGE_SIZE) as u64);
        if let Ok(info) = space.lookup(page) {
            space.unmap(frames, page);
            frames.release_frame(info.paddr);
        }
    }
}

/// The kernel heap behind a spin lock, installed as `#[global_allocator]`
/// on bare metal.
pub struct LockedKernelHeap(Mutex<Option<Heap<KernelBackend>>>);

impl LockedKernelHeap {
    pub const fn empty() -> Self {
        Self(Mutex::new(None))
    }

    fn install(&self) {
        *self.0.lock() = Some(Heap::new(KernelBackend, HEAP_BASE, HEAP_LIMIT));
    }

    pub fn allocate(&self, size: usize) -> Result<*mut u8, KernelError> {
        crate::arch::without_interrupts(|| {
            self.0
                .lock()
                .as_mut()
                .ok_or(KernelError::OperationNotAllowed)?
                .malloc(size)
        })
    }

    pub fn release(&self, ptr: *mut u8) -> Result<(), KernelError> {
        crate::arch::without_interrupts(|| {
            self.0
                .lock()
                .as_mut()
                .ok_or(KernelError::OperationNotAllowed)?
                .free(ptr)
        })
    }
}

unsafe impl GlobalAlloc for LockedKernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Payloads are max_align_t aligned; larger alignments have no
        // caller in the kernel.
        if layout.align() > 16 {
            return core::ptr::null_mut();
        }
        self.allocate(layout.size().max(layout.align()))
            .unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Err(e) = self.release(ptr) {
            panic!("kernel heap free failed: {}", e);
        }
    }
}

/// Global kernel heap instance, the allocator of the bare-metal build.
#[cfg_attr(
    all(target_arch = "riscv64", target_os = "none"),
    global_allocator
)]
pub static KERNEL_HEAP: LockedKernelHeap = LockedKernelHeap::empty();

/// Bring the memory subsystem up from the boot handoff.
///
/// `early` is the boot frame pool reconstructed around its leftover
/// frames; they feed the node-region mapping and the remainder is donated
/// to the frame manager. Returns with the low identity window torn down.
///
/// # Safety
///
/// Must run exactly once, on the high-half kernel, with the identity
/// window still mapped and `info` describing the live boot results.
pub unsafe fn init(
    info: &BootInfo,
    ram: MemoryRegion,
    early: &mut BootFramePool,
) -> Result<(), KernelError> {
    let managed_start = info.p_kernel_physical_end;
    if ram.end().as_u64() <= managed_start.as_u64() {
        return Err(KernelError::InvalidArgument);
    }
    let managed = (ram.end().as_u64() - managed_start.as_u64()) as usize;

    // Carve the span into node storage at the bottom and frames on top.
    let (frame_base, frame_count) = carve_span(managed_start, managed);
    if frame_count == 0 {
        return Err(KernelError::OutOfMemory);
    }
    let nodes_phys = align_up(managed_start.as_u64(), PAGE_SIZE);
    let node_bytes = node_storage_size(frame_count);

    // Map the node region at the fixed cursor with the largest covering
    // level. The root table and the fresh child tables all live in the
    // identity-mapped low image, so the boot mapper still applies.
    let level = PageLevel::fit_for(node_bytes).min(PageLevel::Giga);
    let map_phys = align_down(nodes_phys, level.alignment());
    let pages = pages_to_cover(nodes_phys, node_bytes, level);
    let root = info.p_kernel_table.as_u64() as *mut PageTable;
    let flags = EntryFlags::READ | EntryFlags::WRITE | EntryFlags::ACCESSED | EntryFlags::DIRTY;
    for i in 0..pages {
        let offset = (i * level.size()) as u64;
        // SAFETY: the identity window covers the boot tables; see above.
        unsafe {
            boot_map::boot_map(
                early,
                root,
                PhysicalAddress::new(map_phys + offset),
                VirtualAddress::new(NODE_REGION_BASE + offset),
                level,
                flags,
            )
            .map_err(|_| KernelError::OutOfMemory)?;
        }
    }
    crate::arch::flush_tlb();

    let v_nodes = (NODE_REGION_BASE + (nodes_phys - map_phys)) as *mut FrameNode;
    // SAFETY: the node region was just mapped writable and is unaliased.
    let mut frames = unsafe { FrameManager::from_parts(v_nodes, frame_base, frame_count) };
    log::info!(
        "frame manager over {:#x}..{:#x}, {} frames",
        frame_base.as_u64(),
        frame_base.as_u64() + (frame_count * PAGE_SIZE) as u64,
        frame_count
    );

    // SAFETY: the boot stage installed the self-referencing scratch slot.
    let mut space = unsafe {
        Vmm::new(
            info.p_kernel_table,
            ScratchAccess::new(info.v_scratch.as_ptr()),
        )
    };

    // Seed the spare-node pool from the first managed frame, mapped just
    // past the node-region window (the window itself is covered by the
    // large-page leaves above).
    let spare_frame = frames.get_frame()?;
    let spare_vaddr = VirtualAddress::new(NODE_REGION_BASE + (pages * level.size()) as u64);
    space.map(&mut frames, spare_frame, spare_vaddr, PageLevel::Base, flags)?;
    // SAFETY: the frame was mapped writable at spare_vaddr above.
    let pool = unsafe {
        BumpPool::new(
            spare_vaddr.as_ptr::<Frame>(),
            core::mem::size_of::<FrameNode>(),
        )
    };
    frames.set_spare_nodes(pool);

    // Donate the leftover boot frames. Their physical addresses equal
    // their pool pointers while the identity window is still up.
    let mut donated = 0;
    while let Some(frame) = early.alloc() {
        frames.adopt(PhysicalAddress::new(frame.as_ptr() as u64))?;
        donated += 1;
    }
    log::debug!("donated {} leftover boot frames", donated);

    *FRAME_MANAGER.lock() = Some(frames);
    *KERNEL_SPACE.lock() = Some(space);

    // The low identity window served its purpose; tear it down page by
    // page so only the high mappings remain.
    {
        let mut frames = FRAME_MANAGER.lock();
        let frames = frames.as_mut().ok_or(KernelError::OperationNotAllowed)?;
        let mut space = KERNEL_SPACE.lock();
        let space = space.as_mut().ok_or(KernelError::OperationNotAllowed)?;
        let mut low = info.p_lowkernel_start.as_u64();
        while low < info.p_lowkernel_end.as_u64() {
            space.unmap(frames, VirtualAddress::new(low));
            low += PAGE_SIZE as u64;
        }
    }
    log::info!(
        "identity window {:#x}..{:#x} torn down",
        info.p_lowkernel_start.as_u64(),
        info.p_lowkernel_end.as_u64()
    );

    KERNEL_HEAP.install();
    log::info!("kernel heap at {:#x}..{:#x}", HEAP_BASE, HEAP_LIMIT);
    Ok(())
}
