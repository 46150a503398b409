//! Kernel error types
//!
//! A single typed error enum replaces string literals throughout the
//! memory subsystem. Boot-stage code never sees these: every boot failure
//! prints a fixed diagnostic on the firmware console and halts.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// The physical frame allocator has no free frames left
    OutOfMemory,
    /// No virtual window large enough for the requested mapping
    NotEnoughContiguousMemory,
    /// The target virtual address already carries a mapping
    AddressAlreadyMapped { vaddr: u64 },
    /// The virtual address is non-canonical or not mapped
    InvalidVirtualAddress { vaddr: u64 },
    /// A table pointer was null or not a table
    InvalidPageTable,
    /// A walk met an entry in a state it cannot interpret
    InvalidPageEntry,
    /// An address missed the alignment its page level requires
    MisalignedMemoryAddress { addr: u64 },
    /// A walk reached the lowest level and cannot descend further
    ValueLimitReached,
    /// The operation is not permitted in the current state
    OperationNotAllowed,
    /// An internal structure failed a consistency check
    CorruptedDataStructure,
    /// The requested item is not present
    NotFound,
    /// A caller-supplied argument failed validation
    InvalidArgument,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of physical memory"),
            KernelError::NotEnoughContiguousMemory => {
                write!(f, "not enough contiguous memory")
            }
            KernelError::AddressAlreadyMapped { vaddr } => {
                write!(f, "address {:#x} is already mapped", vaddr)
            }
            KernelError::InvalidVirtualAddress { vaddr } => {
                write!(f, "invalid virtual address {:#x}", vaddr)
            }
            KernelError::InvalidPageTable => write!(f, "invalid page table"),
            KernelError::InvalidPageEntry => write!(f, "invalid page entry"),
            KernelError::MisalignedMemoryAddress { addr } => {
                write!(f, "misaligned memory address {:#x}", addr)
            }
            KernelError::ValueLimitReached => write!(f, "value limit reached"),
            KernelError::OperationNotAllowed => write!(f, "operation not allowed"),
            KernelError::CorruptedDataStructure => {
                write!(f, "corrupted data structure")
            }
            KernelError::NotFound => write!(f, "not found"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

/// Convenience alias used across the memory subsystem.
pub type Result<T> = core::result::Result<T, KernelError>;
