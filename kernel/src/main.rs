//! BorealOS kernel binary
//!
//! The post-translation entry: copies the handoff record out of the low
//! image, installs the trap vector and the logger, sizes memory from the
//! device tree and brings the memory subsystem up.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod kmain {
    use core::ffi::CStr;
    use core::panic::PanicInfo;

    use boreal_kernel::{arch, devicetree, log_service, mm, println};

    const USAGE: &str = "usage: kernel [-f|--fdt <hex address>] [-h|--help]";

    #[no_mangle]
    pub extern "C" fn kernel_entry(info: &'static mm::BootInfo) -> ! {
        // The record lives in the low image; copy it out before the
        // identity window is torn down.
        let info = *info;

        arch::riscv64::init();
        log_service::init();
        println!("BorealOS v{}", env!("CARGO_PKG_VERSION"));
        println!(
            "kernel image {:#x}..{:#x}, {} boot pages used",
            info.v_highkernel_start.as_u64(),
            info.v_highkernel_end.as_u64(),
            info.used_bootpages
        );

        let Some(dtb) = fdt_argument(&info) else {
            panic!("no device tree address on the command line");
        };
        let Some(ram) = (unsafe { devicetree::memory_extents(dtb as *const u8) }) else {
            panic!("device tree at {:#x} has no usable memory node", dtb);
        };
        log::info!(
            "RAM {:#x}..{:#x}",
            ram.start.as_u64(),
            ram.end().as_u64()
        );

        // SAFETY: the identity window is still live and used_bootpages is
        // the pool count recorded by the boot stage.
        let mut early = unsafe { arch::riscv64::boot::leftover_pool(info.used_bootpages) };
        let result = arch::without_interrupts(|| unsafe { mm::init(&info, ram, &mut early) });
        if let Err(e) = result {
            panic!("memory bring-up failed: {}", e);
        }
        log::info!("memory subsystem online");

        // Driver and scheduler stages hook in here.
        arch::halt()
    }

    /// Walk the relocated argument vector for `-f`/`--fdt`; `-h` prints
    /// the usage line and powers off.
    fn fdt_argument(info: &mm::BootInfo) -> Option<usize> {
        let argv = info.argv.as_ptr::<*const u8>();
        let mut fdt = None;
        let mut index = 1;
        while index < info.argc {
            // SAFETY: the boot stage relocated argc nul-terminated
            // strings and mapped them read-only.
            let arg = unsafe { CStr::from_ptr(argv.add(index).read().cast()) };
            match arg.to_str().ok()? {
                "-h" | "--help" => {
                    println!("{}", USAGE);
                    arch::riscv64::sbi::shutdown();
                }
                "-f" | "--fdt" if index + 1 < info.argc => {
                    index += 1;
                    let value = unsafe { CStr::from_ptr(argv.add(index).read().cast()) };
                    fdt = parse_hex(value.to_str().ok()?);
                }
                _ => {}
            }
            index += 1;
        }
        fdt
    }

    fn parse_hex(s: &str) -> Option<usize> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.is_empty() {
            return None;
        }
        let mut value = 0usize;
        for c in digits.chars() {
            value = value.checked_mul(16)?.checked_add(c.to_digit(16)? as usize)?;
        }
        Some(value)
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        println!("[KERNEL PANIC] {}", info);
        arch::riscv64::trap::stack_trace();
        arch::halt()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
