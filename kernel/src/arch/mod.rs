//! Architecture support

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

#[cfg(target_arch = "riscv64")]
pub use riscv64::{cpu_id, flush_tlb, halt, without_interrupts};

// Host stand-ins so the memory core and its tests build anywhere.

#[cfg(not(target_arch = "riscv64"))]
pub fn cpu_id() -> usize {
    0
}

#[cfg(not(target_arch = "riscv64"))]
pub fn flush_tlb() {}

#[cfg(not(target_arch = "riscv64"))]
pub fn without_interrupts<T>(f: impl FnOnce() -> T) -> T {
    f()
}
