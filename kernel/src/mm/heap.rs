//! Kernel heap allocator
//!
//! `malloc`/`free` built from major and minor blocks. A major is a run of
//! mapped pages holding a header and a payload; majors form a singly
//! linked list ordered by address, placed into the gaps between their
//! neighbors. A minor is a sub-range of one major's payload, either
//! entirely free or entirely owned by a single caller; adjacent free
//! minors merge on free. Allocation failure is fatal in kernel context,
//! so the `GlobalAlloc` wrapper panics on error while the typed API
//! surfaces it for the tests.

use core::ptr;

use super::page_table::PAGE_SIZE;
use crate::error::KernelError;

/// Pages of a freshly grown major when the request does not demand more.
const INIT_BLOCKS: usize = 16;

/// Payload alignment, the `max_align_t` of the kernel ABI.
const ALIGNMENT: usize = 16;

const MAGIC_FREE: u64 = 0xBEEF_F00D_DEAD_0001;
const MAGIC_USED: u64 = 0xBEEF_F00D_DEAD_0002;

/// Maps and unmaps the page runs backing major blocks.
///
/// The kernel implementation feeds on the frame manager and the kernel
/// address-space mapper; the tests substitute an arena.
pub trait HeapBackend {
    /// Make `pages` writable pages appear at `vaddr`.
    fn map_pages(&mut self, vaddr: u64, pages: usize) -> Result<(), KernelError>;
    /// Release the pages previously mapped at `vaddr`.
    fn unmap_pages(&mut self, vaddr: u64, pages: usize);
}

#[repr(C)]
struct MajorHeader {
    next: *mut MajorHeader,
    first: *mut MinorHeader,
    /// Sum of the free minors' payload bytes.
    free_bytes: usize,
    pages: usize,
}

#[repr(C)]
struct MinorHeader {
    magic: u64,
    major: *mut MajorHeader,
    next: *mut MinorHeader,
    /// Total size, header included.
    size: usize,
}

const MAJOR_HEADER: usize = core::mem::size_of::<MajorHeader>();
const MINOR_HEADER: usize = core::mem::size_of::<MinorHeader>();

impl MajorHeader {
    fn start(&self) -> u64 {
        self as *const _ as u64
    }

    fn end(&self) -> u64 {
        self.start() + (self.pages * PAGE_SIZE) as u64
    }

    fn payload(&self) -> usize {
        self.pages * PAGE_SIZE - MAJOR_HEADER
    }
}

impl MinorHeader {
    fn payload(&self) -> usize {
        self.size - MINOR_HEADER
    }

    fn payload_ptr(&mut self) -> *mut u8 {
        // The header size is a multiple of the payload alignment.
        unsafe { (self as *mut MinorHeader).add(1).cast() }
    }
}

/// The major/minor heap over a virtual window `[base, limit)`.
pub struct Heap<B: HeapBackend> {
    backend: B,
    base: u64,
    limit: u64,
    head: *mut MajorHeader,
    /// Major most likely to satisfy the next request.
    best_bet: *mut MajorHeader,
}

// Heap block pointers never escape the owning heap; the single-hart
// invariant (and the spin lock of the global wrapper) serializes use.
unsafe impl<B: HeapBackend + Send> Send for Heap<B> {}

impl<B: HeapBackend> Heap<B> {
    /// Create an empty heap; the first allocation grows the first major.
    pub const fn new(backend: B, base: u64, limit: u64) -> Self {
        Self {
            backend,
            base,
            limit,
            head: ptr::null_mut(),
            best_bet: ptr::null_mut(),
        }
    }

    /// Allocate `size` bytes aligned to `max_align_t`.
    pub fn malloc(&mut self, size: usize) -> Result<*mut u8, KernelError> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let need = super::align_up(size as u64, ALIGNMENT) as usize;

        // Best-known major first, then every major in address order.
        if !self.best_bet.is_null() {
            // SAFETY: best_bet is a live major of this heap.
            if let Some(p) = unsafe { self.alloc_in_major(self.best_bet, need) } {
                return Ok(p);
            }
        }
        let mut major = self.head;
        while !major.is_null() {
            // SAFETY: the list links live majors.
            if let Some(p) = unsafe { self.alloc_in_major(major, need) } {
                return Ok(p);
            }
            major = unsafe { (*major).next };
        }

        let grown = self.grow(need)?;
        // SAFETY: grow returned a live major with a whole-payload minor.
        unsafe { self.alloc_in_major(grown, need) }.ok_or(KernelError::OutOfMemory)
    }

    /// Release an allocation obtained from [`Heap::malloc`].
    pub fn free(&mut self, ptr: *mut u8) -> Result<(), KernelError> {
        if ptr.is_null() {
            return Ok(());
        }
        // SAFETY: a valid allocation is preceded by its minor header; the
        // magic check below catches foreign or stale pointers.
        let minor = unsafe { ptr.cast::<MinorHeader>().sub(1) };
        let magic = unsafe { (*minor).magic };
        if magic == MAGIC_FREE {
            // Double free.
            return Err(KernelError::CorruptedDataStructure);
        }
        if magic != MAGIC_USED {
            return Err(KernelError::CorruptedDataStructure);
        }

        let major = unsafe { (*minor).major };
        unsafe {
            (*minor).magic = MAGIC_FREE;
            (*major).free_bytes += (*minor).payload();
            self.coalesce(major);
        }

        // A fully free major collapses back to a single whole-payload
        // minor. Release it unless it is the pinned first major.
        let fully_free = unsafe {
            let first = (*major).first;
            (*first).magic == MAGIC_FREE && (*first).next.is_null()
        };
        if fully_free && major != self.head {
            unsafe {
                self.unlink(major);
            }
            if self.best_bet == major {
                self.best_bet = ptr::null_mut();
            }
            let (start, pages) = unsafe { ((*major).start(), (*major).pages) };
            self.backend.unmap_pages(start, pages);
        } else if self.best_bet.is_null()
            || unsafe { (*major).free_bytes > (*self.best_bet).free_bytes }
        {
            // The freed space may make this major the best candidate.
            self.best_bet = major;
        }
        Ok(())
    }

    /// Bytes currently free across all majors.
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut major = self.head;
        while !major.is_null() {
            // SAFETY: the list links live majors.
            unsafe {
                total += (*major).free_bytes;
                major = (*major).next;
            }
        }
        total
    }

    /// Pick the smallest fitting free minor of `major`, split it when the
    /// tail is worth keeping, and hand out its payload.
    unsafe fn alloc_in_major(
        &mut self,
        major: *mut MajorHeader,
        need: usize,
    ) -> Option<*mut u8> {
        unsafe {
            if (*major).free_bytes < need {
                return None;
            }

            let mut best: *mut MinorHeader = ptr::null_mut();
            let mut minor = (*major).first;
            while !minor.is_null() {
                if (*minor).magic == MAGIC_FREE
                    && (*minor).payload() >= need
                    && (best.is_null() || (*minor).size < (*best).size)
                {
                    best = minor;
                }
                minor = (*minor).next;
            }
            let best = if best.is_null() {
                return None;
            } else {
                best
            };

            let spare = (*best).payload() - need;
            if spare > MINOR_HEADER + core::mem::size_of::<u64>() {
                // Split: the tail becomes a new free minor.
                let tail = (best as *mut u8)
                    .add(MINOR_HEADER + need)
                    .cast::<MinorHeader>();
                (*tail).magic = MAGIC_FREE;
                (*tail).major = major;
                (*tail).next = (*best).next;
                (*tail).size = spare;
                (*best).next = tail;
                (*best).size = MINOR_HEADER + need;
                (*major).free_bytes -= need + MINOR_HEADER;
            } else {
                (*major).free_bytes -= (*best).payload();
            }
            (*best).magic = MAGIC_USED;
            Some((*best).payload_ptr())
        }
    }

    /// Merge every run of adjacent free minors in `major`.
    unsafe fn coalesce(&mut self, major: *mut MajorHeader) {
        unsafe {
            let mut minor = (*major).first;
            while !minor.is_null() {
                let next = (*minor).next;
                if next.is_null() {
                    break;
                }
                if (*minor).magic == MAGIC_FREE && (*next).magic == MAGIC_FREE {
                    // Minors partition the payload, so list neighbors are
                    // memory neighbors as well.
                    (*minor).size += (*next).size;
                    (*minor).next = (*next).next;
                    // The swallowed header turns into payload.
                    (*major).free_bytes += MINOR_HEADER;
                    continue;
                }
                minor = next;
            }
        }
    }

    /// Map a new major able to hold `need` bytes and splice it into the
    /// address-ordered list.
    fn grow(&mut self, need: usize) -> Result<*mut MajorHeader, KernelError> {
        let pages = (need / PAGE_SIZE + 1).max(INIT_BLOCKS);
        let bytes = (pages * PAGE_SIZE) as u64;

        // First predecessor whose trailing gap fits the new major.
        let mut prev: *mut MajorHeader = ptr::null_mut();
        let mut vaddr = self.base;
        let mut cursor = self.head;
        while !cursor.is_null() {
            // SAFETY: the list links live majors.
            let end = unsafe { (*cursor).end() };
            let next = unsafe { (*cursor).next };
            let gap_end = if next.is_null() {
                self.limit
            } else {
                next as u64
            };
            prev = cursor;
            vaddr = end;
            if gap_end - end >= bytes {
                break;
            }
            cursor = next;
        }
        if vaddr + bytes > self.limit {
            return Err(KernelError::NotEnoughContiguousMemory);
        }

        self.backend.map_pages(vaddr, pages)?;

        let major = vaddr as *mut MajorHeader;
        // SAFETY: the backend just made these pages writable.
        unsafe {
            let first = (major as *mut u8).add(MAJOR_HEADER).cast::<MinorHeader>();
            (*first).magic = MAGIC_FREE;
            (*first).major = major;
            (*first).next = ptr::null_mut();
            (*first).size = pages * PAGE_SIZE - MAJOR_HEADER;
            (*major).first = first;
            (*major).free_bytes = (*first).payload();
            (*major).pages = pages;
            if prev.is_null() {
                (*major).next = self.head;
                self.head = major;
            } else {
                (*major).next = (*prev).next;
                (*prev).next = major;
            }
        }
        self.best_bet = major;
        Ok(major)
    }

    unsafe fn unlink(&mut self, major: *mut MajorHeader) {
        unsafe {
            if self.head == major {
                self.head = (*major).next;
                return;
            }
            let mut cursor = self.head;
            while !cursor.is_null() {
                if (*cursor).next == major {
                    (*cursor).next = (*major).next;
                    return;
                }
                cursor = (*cursor).next;
            }
        }
    }
}
