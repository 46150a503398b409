// Print macros for kernel output

#[cfg(target_arch = "riscv64")]
pub mod console {
    use core::fmt;

    use spin::Mutex;

    /// Firmware console writer. The SBI putchar call is the only output
    /// primitive the kernel uses.
    struct SbiConsole;

    impl fmt::Write for SbiConsole {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for byte in s.bytes() {
                crate::arch::riscv64::sbi::console_putchar(byte);
            }
            Ok(())
        }
    }

    static CONSOLE: Mutex<SbiConsole> = Mutex::new(SbiConsole);

    #[doc(hidden)]
    pub fn _print(args: fmt::Arguments) {
        use core::fmt::Write;
        let _ = CONSOLE.lock().write_fmt(args);
    }
}

#[cfg(target_arch = "riscv64")]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::console::_print(format_args!($($arg)*)));
}

#[cfg(target_arch = "riscv64")]
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

// Stub implementations for host builds
#[cfg(not(target_arch = "riscv64"))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

#[cfg(not(target_arch = "riscv64"))]
#[macro_export]
macro_rules! println {
    () => {};
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}
