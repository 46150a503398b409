//! Boot stage: physical-address execution before translation is enabled
//!
//! Everything reachable from `boot_entry` lives in the `.boot.*` sections
//! of the low kernel image, because the rest of the kernel is linked at
//! its high-half virtual addresses and cannot be called until `satp` is
//! loaded. The boot console is the bare firmware putchar; every failure
//! prints one fixed diagnostic and halts.

use core::arch::global_asm;
use core::ptr::{addr_of, addr_of_mut, NonNull};

use crate::mm::boot_map::{
    self, BootFramePool, BootMapError, ARGPAGES, BOOTPAGES,
};
use crate::mm::page_table::{EntryFlags, PageTable, PAGE_SIZE};
use crate::mm::{BootInfo, Frame, PhysicalAddress, VirtualAddress};

global_asm!(include_str!("boot.S"));

// High-half landing pad: leaves the boot stack for the kernel stack and
// terminates the frame-pointer chain before entering the kernel proper.
global_asm!(
    r"
    .section .text
    .global _high_entry
_high_entry:
    la sp, _stack_end
    mv s0, zero
    mv ra, zero
    j kernel_entry
"
);

// Linker-script symbols delimiting the kernel layout.
extern "C" {
    static _load_address: u8;
    static _kload_begin: u8;
    static _text_begin: u8;
    static _text_end: u8;
    static _rodata_begin: u8;
    static _rodata_end: u8;
    static _data_begin: u8;
    static _stack_end: u8;
    static _driverinfo_begin: u8;
    static _driverinfo_end: u8;
}

extern "C" {
    fn _high_entry(info: &'static BootInfo) -> !;
}

// Statically reserved boot memory, all of it in the low image.

#[link_section = ".boot.bss"]
static mut INITIAL_FRAMES: [Frame; BOOTPAGES] = [const { Frame::zeroed() }; BOOTPAGES];

#[link_section = ".boot.bss"]
static mut ARGCV: [Frame; ARGPAGES] = [const { Frame::zeroed() }; ARGPAGES];

#[link_section = ".boot.data"]
static mut BOOT_INFO: BootInfo = BootInfo::empty();

/// `"0x"`, sixteen digits, terminator.
#[link_section = ".boot.data"]
static mut FDT_HEX: [u8; 19] = [0; 19];

#[link_section = ".boot.rodata"]
static KERNEL_NAME: [u8; 7] = *b"kernel\0";

#[link_section = ".boot.rodata"]
static FDT_FLAG: [u8; 6] = *b"--fdt\0";

#[link_section = ".boot.rodata"]
static NEEDPAGES: [u8; 71] =
    *b"Not enough pages. Please, compile kernel with higher BOOTPAGES option.\n";

#[link_section = ".boot.rodata"]
static NEEDARGCV: [u8; 84] =
    *b"Not enough pages for arguments. Please, compile kernel with higher ARGPAGES option.\n";

#[link_section = ".boot.rodata"]
static COLLISION: [u8; 48] = *b"Boot mapping collided with an existing mapping.\n";

/// High-half entry, stored as data so the call goes through an absolute
/// relocation instead of a pc-relative one the boot image cannot reach.
#[link_section = ".boot.data"]
static KERNEL_ENTRY: unsafe extern "C" fn(&'static BootInfo) -> ! = _high_entry;

#[link_section = ".boot.text"]
fn bputc(c: u8) {
    unsafe {
        core::arch::asm!(
            "ecall",
            in("a0") c as usize,
            in("a6") 0usize,
            in("a7") 0x01usize,
            lateout("a0") _,
            lateout("a1") _,
        );
    }
}

#[link_section = ".boot.text"]
fn bputs(s: &[u8]) {
    for &c in s {
        if c == 0 {
            break;
        }
        bputc(c);
    }
}

#[link_section = ".boot.text"]
fn boot_fail(msg: &[u8]) -> ! {
    bputs(msg);
    loop {
        unsafe { core::arch::asm!("wfi", options(nomem, nostack)) };
    }
}

#[link_section = ".boot.text"]
fn fail_with(err: BootMapError) -> ! {
    match err {
        BootMapError::PoolExhausted => boot_fail(&NEEDPAGES),
        BootMapError::ArgumentOverflow => boot_fail(&NEEDARGCV),
        BootMapError::MappingCollision => boot_fail(&COLLISION),
    }
}

/// Map the kernel image high: `.text` RX, `.rodata` R, `.data`/`.bss`/
/// stack RW. The physical cursor starts at the load address of the high
/// image and advances one frame per mapped page. Returns the physical end
/// of the image and the virtual cursor past the stack.
#[link_section = ".boot.text"]
unsafe fn map_high_kernel(
    pool: &mut BootFramePool,
    root: *mut PageTable,
) -> Result<(PhysicalAddress, VirtualAddress), BootMapError> {
    let ad = EntryFlags::ACCESSED | EntryFlags::DIRTY;
    let rx = EntryFlags::READ | EntryFlags::EXECUTE | ad;
    let r = EntryFlags::READ | ad;
    let rw = EntryFlags::READ | EntryFlags::WRITE | ad;

    let text_begin = addr_of!(_text_begin) as u64;
    let text_end = addr_of!(_text_end) as u64;
    let rodata_begin = addr_of!(_rodata_begin) as u64;
    let rodata_end = addr_of!(_rodata_end) as u64;
    let data_begin = addr_of!(_data_begin) as u64;
    let stack_end = addr_of!(_stack_end) as u64;

    let mut phys = PhysicalAddress::new(addr_of!(_kload_begin) as u64);
    let (next, _) = unsafe {
        boot_map::map_span(
            pool,
            root,
            phys,
            VirtualAddress::new(text_begin),
            (text_end - text_begin) as usize,
            rx,
        )?
    };
    phys = next;
    let (next, _) = unsafe {
        boot_map::map_span(
            pool,
            root,
            phys,
            VirtualAddress::new(rodata_begin),
            (rodata_end - rodata_begin) as usize,
            r,
        )?
    };
    phys = next;
    // Data, bss, driver info and the stack are one contiguous RW span.
    let (next, vend) = unsafe {
        boot_map::map_span(
            pool,
            root,
            phys,
            VirtualAddress::new(data_begin),
            (stack_end - data_begin) as usize,
            rw,
        )?
    };
    Ok((next, vend))
}

/// Identity-map the low boot image RWX. The window stays valid until the
/// post-translation kernel tears it down.
#[link_section = ".boot.text"]
unsafe fn identity_map(
    pool: &mut BootFramePool,
    root: *mut PageTable,
) -> Result<(), BootMapError> {
    let load = addr_of!(_load_address) as u64;
    let kload = addr_of!(_kload_begin) as u64;
    let flags = EntryFlags::READ
        | EntryFlags::WRITE
        | EntryFlags::EXECUTE
        | EntryFlags::ACCESSED
        | EntryFlags::DIRTY;
    unsafe {
        boot_map::map_span(
            pool,
            root,
            PhysicalAddress::new(load),
            VirtualAddress::new(load),
            (kload - load) as usize,
            flags,
        )?;
    }
    Ok(())
}

/// Relocate the argument strings into the reserved buffer and map it
/// read-only at the virtual cursor. Returns the future argv pointer and
/// the advanced cursor.
#[link_section = ".boot.text"]
unsafe fn map_args(
    pool: &mut BootFramePool,
    root: *mut PageTable,
    argc: usize,
    argv: *const *const u8,
    mut kvaddress: VirtualAddress,
) -> Result<(VirtualAddress, VirtualAddress), BootMapError> {
    let buffer = addr_of_mut!(ARGCV).cast::<u8>();
    let relocated = unsafe {
        boot_map::relocate_args(argc, argv, buffer, ARGPAGES * PAGE_SIZE, kvaddress)?
    };

    let flags = EntryFlags::READ | EntryFlags::ACCESSED | EntryFlags::DIRTY;
    for i in 0..ARGPAGES {
        unsafe {
            boot_map::boot_map(
                pool,
                root,
                PhysicalAddress::new(buffer as u64 + (i * PAGE_SIZE) as u64),
                kvaddress,
                crate::mm::PageLevel::Base,
                flags,
            )?;
        }
        kvaddress = kvaddress.offset(PAGE_SIZE as u64);
    }
    Ok((relocated.argv, kvaddress))
}

/// The fixed boot order: pool, root table, high map, scratch slot,
/// identity window, argument relocation, handoff record.
#[link_section = ".boot.text"]
unsafe fn bootmain(argc: usize, argv: *const *const u8, info: &mut BootInfo) {
    // SAFETY: the boot statics are referenced exactly once, here.
    let mut pool = unsafe {
        BootFramePool::new(
            NonNull::new_unchecked(addr_of_mut!(INITIAL_FRAMES).cast::<Frame>()),
            BOOTPAGES,
        )
    };

    let root = match pool.alloc() {
        Some(frame) => frame.as_ptr().cast::<PageTable>(),
        None => boot_fail(&NEEDPAGES),
    };

    let (p_kernel_end, kvaddress) = match unsafe { map_high_kernel(&mut pool, root) } {
        Ok(v) => v,
        Err(e) => fail_with(e),
    };
    let scratch = match unsafe { boot_map::force_scratch_page(&mut pool, root) } {
        Ok(v) => v,
        Err(e) => fail_with(e),
    };
    if let Err(e) = unsafe { identity_map(&mut pool, root) } {
        fail_with(e);
    }
    let (argv, kvaddress) = match unsafe { map_args(&mut pool, root, argc, argv, kvaddress) } {
        Ok(v) => v,
        Err(e) => fail_with(e),
    };

    info.argc = argc;
    info.argv = argv;
    info.used_bootpages = pool.used();
    info.p_kernel_table = PhysicalAddress::new(root as u64);
    info.v_scratch = scratch;
    info.p_lowkernel_start = PhysicalAddress::new(addr_of!(_load_address) as u64);
    info.p_lowkernel_end = PhysicalAddress::new(addr_of!(_kload_begin) as u64);
    info.v_highkernel_start = VirtualAddress::new(addr_of!(_text_begin) as u64);
    info.v_highkernel_end = kvaddress;
    info.p_kernel_physical_end = p_kernel_end;
    info.v_driverinfo_start = VirtualAddress::new(addr_of!(_driverinfo_begin) as u64);
    info.v_driverinfo_end = VirtualAddress::new(addr_of!(_driverinfo_end) as u64);
}

#[link_section = ".boot.text"]
unsafe fn write_fdt_hex(dtb: usize) {
    let buf = unsafe { &mut *addr_of_mut!(FDT_HEX) };
    buf[0] = b'0';
    buf[1] = b'x';
    for i in 0..16 {
        let digit = ((dtb >> ((15 - i) * 4)) & 0xF) as u8;
        buf[2 + i] = if digit < 10 {
            b'0' + digit
        } else {
            b'a' + digit - 10
        };
    }
    buf[18] = 0;
}

#[link_section = ".boot.text"]
unsafe fn enable_paging(root: PhysicalAddress) {
    #[cfg(not(feature = "sv39"))]
    const MODE: u64 = 9;
    #[cfg(feature = "sv39")]
    const MODE: u64 = 8;
    let satp = (MODE << 60) | (root.as_u64() >> 12);
    unsafe {
        core::arch::asm!(
            "sfence.vma x0, x0",
            "csrw satp, {}",
            "sfence.vma x0, x0",
            in(reg) satp,
        );
    }
}

/// Rust-side boot entry, called from the assembly stub with the hart id
/// and the firmware's device-tree pointer.
#[no_mangle]
#[link_section = ".boot.text"]
unsafe extern "C" fn boot_entry(hartid: usize, dtb: usize) -> ! {
    unsafe {
        core::arch::asm!("mv tp, {}", in(reg) hartid, options(nomem, nostack));
        write_fdt_hex(dtb);
    }

    let argv = [
        KERNEL_NAME.as_ptr(),
        FDT_FLAG.as_ptr(),
        addr_of!(FDT_HEX).cast::<u8>(),
    ];
    // SAFETY: single hart, single call; the record lives in the low image
    // and stays identity-mapped for the post-translation consumer.
    unsafe {
        let info = &mut *addr_of_mut!(BOOT_INFO);
        bootmain(argv.len(), argv.as_ptr(), info);
        enable_paging(info.p_kernel_table);
        (KERNEL_ENTRY)(&*addr_of!(BOOT_INFO))
    }
}

/// Reconstruct the boot pool around its leftover frames so the memory
/// bring-up can drain and donate them.
///
/// # Safety
///
/// `used` must be the handoff record's `used_bootpages`, and the identity
/// window must still be mapped.
pub unsafe fn leftover_pool(used: usize) -> BootFramePool {
    unsafe {
        BootFramePool::from_used(
            NonNull::new_unchecked(addr_of_mut!(INITIAL_FRAMES).cast::<Frame>()),
            BOOTPAGES,
            used,
        )
    }
}
