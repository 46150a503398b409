//! Early page-table construction
//!
//! Everything here runs (or models what runs) before address translation
//! is enabled: code executes from physical addresses and a table's
//! physical address is also its pointer. The boot frame pool hands out
//! statically reserved frames linearly; the boot mapper walks and creates
//! tables with them. Failures are fatal at the boot entry, which prints a
//! fixed diagnostic on the firmware console and halts.

use core::ptr::NonNull;

use super::page_table::{page_index, EntryFlags, PageLevel, PageTable, PAGE_SIZE};
use super::{align_up, Frame, PhysicalAddress, VirtualAddress};

/// Frames statically reserved for boot-time page tables.
pub const BOOTPAGES: usize = 64;

/// Frames statically reserved for the relocated argument buffer.
pub const ARGPAGES: usize = 2;

/// Errors of the boot mapping stage. The boot entry turns each of these
/// into a diagnostic line and a halt; nothing here is recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMapError {
    /// The boot frame pool ran dry; the kernel must be built with a
    /// higher `BOOTPAGES` count.
    PoolExhausted,
    /// A walk hit an existing superpage leaf above the target level.
    MappingCollision,
    /// The argument buffer cannot hold the relocated strings; the kernel
    /// must be built with a higher `ARGPAGES` count.
    ArgumentOverflow,
}

/// Linear sub-allocator over the statically reserved boot frames.
///
/// Allocation is linear and irrevocable for the lifetime of boot. The
/// whole pool is zeroed once at construction, so frames handed out can be
/// used as page tables without further clearing.
pub struct BootFramePool {
    base: NonNull<Frame>,
    capacity: usize,
    used: usize,
}

impl BootFramePool {
    /// Build the pool over `capacity` frames at `base` and zero them.
    ///
    /// # Safety
    ///
    /// `base` must point to `capacity` contiguous, writable, 4 KiB-aligned
    /// frames owned exclusively by the pool.
    #[cfg_attr(target_arch = "riscv64", link_section = ".boot.text")]
    pub unsafe fn new(base: NonNull<Frame>, capacity: usize) -> Self {
        // Open-coded zeroing: boot code must not call into the high-half
        // image, which rules out the builtin memset.
        let mut word = base.as_ptr().cast::<u64>();
        for _ in 0..capacity * (PAGE_SIZE / core::mem::size_of::<u64>()) {
            unsafe {
                word.write_volatile(0);
                word = word.add(1);
            }
        }
        Self {
            base,
            capacity,
            used: 0,
        }
    }

    /// Reconstruct a pool whose first `used` frames are already in service
    /// as page tables. Nothing is zeroed. The post-translation kernel uses
    /// this to drain the leftover boot frames.
    ///
    /// # Safety
    ///
    /// Same requirements as [`BootFramePool::new`], and `used` must be the
    /// exact count previously reported by [`BootFramePool::used`].
    pub unsafe fn from_used(base: NonNull<Frame>, capacity: usize, used: usize) -> Self {
        debug_assert!(used <= capacity);
        Self {
            base,
            capacity,
            used,
        }
    }

    /// The next unused frame, or `None` when the pool is exhausted.
    #[cfg_attr(target_arch = "riscv64", link_section = ".boot.text")]
    pub fn alloc(&mut self) -> Option<NonNull<Frame>> {
        if self.used < self.capacity {
            // SAFETY: used < capacity keeps the offset inside the pool.
            let frame = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.used)) };
            self.used += 1;
            Some(frame)
        } else {
            None
        }
    }

    /// Frames handed out so far; recorded in the handoff record so the
    /// post-translation allocator can reclaim the remainder.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Map `vaddr` to `paddr` at `target` level, creating intermediate tables
/// from `pool` as needed.
///
/// The walk starts at the root level. Meeting a leaf above the target
/// level is a collision with an existing superpage and fails. At the
/// target the leaf is written unconditionally, which lets the scratch
/// primitive re-point an existing entry. Returns the table the leaf was
/// written into.
///
/// # Safety
///
/// Translation must be off (or the tables identity-mapped): every table
/// physical address is dereferenced directly. `root` must point to a
/// valid table and `pool` frames must be usable as tables.
#[cfg_attr(target_arch = "riscv64", link_section = ".boot.text")]
pub unsafe fn boot_map(
    pool: &mut BootFramePool,
    root: *mut PageTable,
    paddr: PhysicalAddress,
    vaddr: VirtualAddress,
    target: PageLevel,
    flags: EntryFlags,
) -> Result<*mut PageTable, BootMapError> {
    let mut level = PageLevel::HIGHEST;
    let mut table = root;

    while level != target {
        let idx = page_index(vaddr.as_u64(), level);
        // SAFETY: table is a live table per the function contract.
        let entry = unsafe { &mut (&mut (*table))[idx] };

        if entry.is_leaf() {
            return Err(BootMapError::MappingCollision);
        }
        if !entry.is_valid() {
            let frame = pool.alloc().ok_or(BootMapError::PoolExhausted)?;
            // Pool frames are pre-zeroed, so the fresh table is empty.
            entry.set_table(PhysicalAddress::new(frame.as_ptr() as u64));
        }

        table = entry.addr().as_u64() as *mut PageTable;
        level = level.next_lower();
    }

    let idx = page_index(vaddr.as_u64(), level);
    // SAFETY: table is the live table at the target level.
    unsafe {
        (&mut (*table))[idx].set_leaf(paddr, flags);
    }
    Ok(table)
}

/// Map `len` bytes one base frame at a time, returning the physical and
/// virtual cursors one past the span.
///
/// # Safety
///
/// Same requirements as [`boot_map`].
#[cfg_attr(target_arch = "riscv64", link_section = ".boot.text")]
pub unsafe fn map_span(
    pool: &mut BootFramePool,
    root: *mut PageTable,
    mut paddr: PhysicalAddress,
    mut vaddr: VirtualAddress,
    len: usize,
    flags: EntryFlags,
) -> Result<(PhysicalAddress, VirtualAddress), BootMapError> {
    let end = paddr.as_u64() + len as u64;
    while paddr.as_u64() < end {
        unsafe {
            boot_map(pool, root, paddr, vaddr, PageLevel::Base, flags)?;
        }
        paddr = paddr.offset(PAGE_SIZE as u64);
        vaddr = vaddr.offset(PAGE_SIZE as u64);
    }
    Ok((paddr, vaddr))
}

/// Reserve the scratch slot at the top of the address space.
///
/// The page at `vaddr = -4096` is first mapped onto itself, then the leaf
/// is re-pointed at the table that contains it. After translation is on,
/// that virtual page aliases its own last-level table: writing a physical
/// table address into one of its entries makes that table appear at a
/// known virtual window. Returns the scratch window address for the
/// handoff record.
///
/// # Safety
///
/// Same requirements as [`boot_map`].
#[cfg_attr(target_arch = "riscv64", link_section = ".boot.text")]
pub unsafe fn force_scratch_page(
    pool: &mut BootFramePool,
    root: *mut PageTable,
) -> Result<VirtualAddress, BootMapError> {
    let vaddr = VirtualAddress::new(0u64.wrapping_sub(PAGE_SIZE as u64));
    let flags = EntryFlags::READ | EntryFlags::WRITE;

    let table = unsafe {
        boot_map(
            pool,
            root,
            PhysicalAddress::new(vaddr.as_u64()),
            vaddr,
            PageLevel::Base,
            flags,
        )?
    };
    unsafe {
        boot_map(
            pool,
            root,
            PhysicalAddress::new(table as u64),
            vaddr,
            PageLevel::Base,
            flags,
        )?;
    }
    Ok(vaddr)
}

/// Result of relocating the boot arguments into the reserved buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelocatedArgs {
    /// Bytes of the buffer in use, pointer array included.
    pub consumed: usize,
    /// Future virtual address of the relocated pointer array.
    pub argv: VirtualAddress,
}

#[cfg_attr(target_arch = "riscv64", link_section = ".boot.text")]
unsafe fn c_strlen(mut s: *const u8) -> usize {
    let mut len = 0;
    // SAFETY: s points to a nul-terminated string per the caller.
    unsafe {
        while !s.is_null() && *s != 0 {
            s = s.add(1);
            len += 1;
        }
    }
    len
}

/// Copy the `argc` argument strings into `buffer` and append a pointer
/// array whose entries refer to the strings' future virtual addresses at
/// `future_base`. Fails when either the strings or the pointer array
/// overflow the buffer.
///
/// # Safety
///
/// `argv` must point to `argc` nul-terminated strings and `buffer` to
/// `capacity` writable bytes.
#[cfg_attr(target_arch = "riscv64", link_section = ".boot.text")]
pub unsafe fn relocate_args(
    argc: usize,
    argv: *const *const u8,
    buffer: *mut u8,
    capacity: usize,
    future_base: VirtualAddress,
) -> Result<RelocatedArgs, BootMapError> {
    let mut strings_len = 0usize;
    for i in 0..argc {
        // SAFETY: argv holds argc valid string pointers.
        let arg = unsafe { *argv.add(i) };
        // Memory length, not string length.
        let len = unsafe { c_strlen(arg) } + 1;
        strings_len += len;
        if strings_len > capacity {
            return Err(BootMapError::ArgumentOverflow);
        }
    }

    let array_offset = align_up(strings_len as u64, core::mem::size_of::<u64>()) as usize;
    let consumed = array_offset + argc * core::mem::size_of::<u64>();
    if consumed > capacity {
        return Err(BootMapError::ArgumentOverflow);
    }

    let mut cursor = 0usize;
    for i in 0..argc {
        // SAFETY: bounds were checked against capacity above. The copy is
        // open-coded for the same reason pool zeroing is.
        unsafe {
            let arg = *argv.add(i);
            let len = c_strlen(arg) + 1;
            for j in 0..len {
                buffer.add(cursor + j).write(*arg.add(j));
            }
            let future = future_base.as_u64() + cursor as u64;
            buffer
                .add(array_offset + i * core::mem::size_of::<u64>())
                .cast::<u64>()
                .write_unaligned(future);
            cursor += len;
        }
    }

    Ok(RelocatedArgs {
        consumed,
        argv: future_base.offset(array_offset as u64),
    })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;
    use std::{vec, vec::Vec};

    use super::*;
    use crate::mm::page_table::PAGE_TABLE_ENTRIES;

    struct PoolMemory {
        frames: Vec<Frame>,
    }

    impl PoolMemory {
        fn new(capacity: usize) -> Self {
            let mut frames = Vec::with_capacity(capacity);
            frames.resize_with(capacity, Frame::zeroed);
            Self { frames }
        }

        fn pool(&mut self) -> BootFramePool {
            // SAFETY: the Vec owns the frames for the test's lifetime.
            unsafe {
                BootFramePool::new(
                    NonNull::new(self.frames.as_mut_ptr()).unwrap(),
                    self.frames.len(),
                )
            }
        }
    }

    fn root_of(pool: &mut BootFramePool) -> *mut PageTable {
        pool.alloc().unwrap().as_ptr().cast()
    }

    unsafe fn walk_to_leaf(root: *mut PageTable, vaddr: u64) -> Option<(PageLevel, *mut PageTable)> {
        let mut level = PageLevel::HIGHEST;
        let mut table = root;
        loop {
            let entry = unsafe { (&(*table))[page_index(vaddr, level)] };
            if !entry.is_valid() {
                return None;
            }
            if entry.is_leaf() {
                return Some((level, table));
            }
            table = entry.addr().as_u64() as *mut PageTable;
            level = level.next_lower();
        }
    }

    #[test]
    fn test_linear_allocation() {
        let mut memory = PoolMemory::new(4);
        let mut pool = memory.pool();
        let first = pool.alloc().unwrap();
        let second = pool.alloc().unwrap();
        assert_eq!(
            second.as_ptr() as usize - first.as_ptr() as usize,
            PAGE_SIZE
        );
        assert_eq!(pool.used(), 2);
        pool.alloc().unwrap();
        pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        assert_eq!(pool.used(), 4);
    }

    #[test]
    fn test_boot_map_creates_intermediate_tables() {
        let mut memory = PoolMemory::new(8);
        let mut pool = memory.pool();
        let root = root_of(&mut pool);
        let vaddr = VirtualAddress::new(0xFFFF_FFFF_C000_0000);
        let paddr = PhysicalAddress::new(0x8020_0000);

        let table = unsafe {
            boot_map(
                &mut pool,
                root,
                paddr,
                vaddr,
                PageLevel::Base,
                EntryFlags::READ | EntryFlags::EXECUTE,
            )
        }
        .unwrap();

        // One table per level below the root.
        assert_eq!(pool.used(), 1 + PageLevel::HIGHEST as usize);
        let (level, leaf_table) = unsafe { walk_to_leaf(root, vaddr.as_u64()) }.unwrap();
        assert_eq!(level, PageLevel::Base);
        assert_eq!(leaf_table, table);
        let entry = unsafe { (&(*leaf_table))[page_index(vaddr.as_u64(), level)] };
        assert_eq!(entry.addr(), paddr);
        assert!(entry.is_executable());
    }

    #[test]
    fn test_boot_map_rejects_superpage_collision() {
        let mut memory = PoolMemory::new(8);
        let mut pool = memory.pool();
        let root = root_of(&mut pool);
        let vaddr = VirtualAddress::new(0x4000_0000);

        unsafe {
            boot_map(
                &mut pool,
                root,
                PhysicalAddress::new(0x8000_0000),
                vaddr,
                PageLevel::Giga,
                EntryFlags::READ | EntryFlags::WRITE,
            )
            .unwrap();
        }
        // A 4 KiB mapping inside the gigapage must not walk through it.
        let result = unsafe {
            boot_map(
                &mut pool,
                root,
                PhysicalAddress::new(0x9000_0000),
                vaddr.offset(0x1000),
                PageLevel::Base,
                EntryFlags::READ,
            )
        };
        assert_eq!(result, Err(BootMapError::MappingCollision));
    }

    #[test]
    fn test_boot_map_halts_on_exhausted_pool() {
        // One frame total: the root table consumes it, the first child
        // table allocation must fail loudly rather than corrupt memory.
        let mut memory = PoolMemory::new(1);
        let mut pool = memory.pool();
        let root = root_of(&mut pool);

        let result = unsafe {
            boot_map(
                &mut pool,
                root,
                PhysicalAddress::new(0x8000_0000),
                VirtualAddress::new(0x8000_0000),
                PageLevel::Base,
                EntryFlags::READ | EntryFlags::WRITE,
            )
        };
        assert_eq!(result, Err(BootMapError::PoolExhausted));
    }

    #[test]
    fn test_map_span_advances_both_cursors() {
        let mut memory = PoolMemory::new(16);
        let mut pool = memory.pool();
        let root = root_of(&mut pool);
        let paddr = PhysicalAddress::new(0x8000_0000);
        let vaddr = VirtualAddress::new(0xFFFF_FFFF_C000_0000);

        let (p_end, v_end) = unsafe {
            map_span(
                &mut pool,
                root,
                paddr,
                vaddr,
                3 * PAGE_SIZE,
                EntryFlags::READ | EntryFlags::WRITE,
            )
        }
        .unwrap();
        assert_eq!(p_end.as_u64(), paddr.as_u64() + 3 * PAGE_SIZE as u64);
        assert_eq!(v_end.as_u64(), vaddr.as_u64() + 3 * PAGE_SIZE as u64);
        for i in 0..3 {
            let v = vaddr.offset(i * PAGE_SIZE as u64);
            let (_, table) = unsafe { walk_to_leaf(root, v.as_u64()) }.unwrap();
            let entry = unsafe { (&(*table))[page_index(v.as_u64(), PageLevel::Base)] };
            assert_eq!(entry.addr().as_u64(), paddr.as_u64() + i * PAGE_SIZE as u64);
        }
    }

    #[test]
    fn test_scratch_page_self_reference_is_closed() {
        let mut memory = PoolMemory::new(8);
        let mut pool = memory.pool();
        let root = root_of(&mut pool);

        let scratch = unsafe { force_scratch_page(&mut pool, root) }.unwrap();
        assert_eq!(scratch.as_u64(), 0u64.wrapping_sub(PAGE_SIZE as u64));

        // The leaf for the scratch address must point back at the very
        // table that holds it.
        let (level, table) = unsafe { walk_to_leaf(root, scratch.as_u64()) }.unwrap();
        assert_eq!(level, PageLevel::Base);
        let entry = unsafe { (&(*table))[page_index(scratch.as_u64(), level)] };
        assert_eq!(entry.addr().as_u64(), table as u64);
        assert_eq!(
            page_index(scratch.as_u64(), PageLevel::Base),
            PAGE_TABLE_ENTRIES - 1
        );
    }

    #[test]
    fn test_relocate_args() {
        let args: [&[u8]; 2] = [b"kernel\0", b"--fdt=0x82200000\0"];
        let argv = [args[0].as_ptr(), args[1].as_ptr()];
        let mut buffer = vec![0u8; 2 * PAGE_SIZE];
        let future_base = VirtualAddress::new(0xFFFF_FFFF_C080_0000);

        let relocated = unsafe {
            relocate_args(
                2,
                argv.as_ptr(),
                buffer.as_mut_ptr(),
                buffer.len(),
                future_base,
            )
        }
        .unwrap();

        assert_eq!(&buffer[..7], b"kernel\0");
        assert_eq!(&buffer[7..24], b"--fdt=0x82200000\0");
        let array_offset = align_up(24, 8) as usize;
        assert_eq!(relocated.argv.as_u64(), future_base.as_u64() + array_offset as u64);
        assert_eq!(relocated.consumed, array_offset + 2 * 8);
        let p0 = u64::from_le_bytes(buffer[array_offset..array_offset + 8].try_into().unwrap());
        let p1 =
            u64::from_le_bytes(buffer[array_offset + 8..array_offset + 16].try_into().unwrap());
        assert_eq!(p0, future_base.as_u64());
        assert_eq!(p1, future_base.as_u64() + 7);
    }

    #[test]
    fn test_relocate_args_overflow() {
        let long = vec![b'a'; PAGE_SIZE];
        let mut arg = long.clone();
        arg.push(0);
        let argv = [arg.as_ptr()];
        let mut buffer = vec![0u8; PAGE_SIZE];

        let result = unsafe {
            relocate_args(
                1,
                argv.as_ptr(),
                buffer.as_mut_ptr(),
                buffer.len(),
                VirtualAddress::new(0xFFFF_FFFF_C080_0000),
            )
        };
        assert_eq!(result, Err(BootMapError::ArgumentOverflow));
    }
}
