//! SBI debug console output and the kernel logger.

use crate::kernel::{Kernel, Machine};
use core::fmt::Write;

static CONSOLE: spin::once::Once<&'static dyn Console> = spin::once::Once::new();
const LEVEL_FILTER: log::LevelFilter = log::LevelFilter::Debug;

#[allow(unused_macros)]
macro_rules! print {
    ($($arg:tt)*) => { use core::fmt::Write; core::write!($crate::println::DebugWriter, $($arg)*).expect("Unable to write!"); }
}

macro_rules! println {
    ($($arg:tt)*) => { use core::fmt::Write; core::writeln!($crate::println::DebugWriter, $($arg)*).expect("Unable to write!"); }
}

/// Routes `log` output to the SBI console, through the Debug Console extension when the
/// firmware has it and the legacy putchar call otherwise. Later calls do nothing.
pub fn init() {
    if CONSOLE.is_completed() {
        return;
    }
    if sbi_rt::probe_extension(sbi_rt::Console).is_available() {
        CONSOLE.call_once(|| &DebugConsole);
    } else {
        CONSOLE.call_once(|| &LegacyConsole);
    }
    log::set_logger(&DebugWriter)
        .map(|()| log::set_max_level(LEVEL_FILTER))
        .expect("Unable to set logger");
}

/// Prints the process listing to the console. Meant for a console control key, so it takes no
/// locks and works even when the process table is wedged.
/// # Panics
/// Panics if the console has not been set up with [`init`]
pub fn dump_processes<M: Machine>(kernel: &Kernel<M>) {
    kernel.dump(&mut DebugWriter).expect("Unable to write!");
}

trait Console: Sync {
    fn print_byte(&self, byte: u8) -> core::fmt::Result;

    fn print_str(&self, string: &str) -> core::fmt::Result {
        for byte in string.bytes() {
            self.print_byte(byte)?;
        }
        Ok(())
    }
}

struct LegacyConsole;

impl Console for LegacyConsole {
    #[allow(deprecated)]
    fn print_byte(&self, byte: u8) -> core::fmt::Result {
        if sbi_rt::legacy::console_putchar(byte as usize) != 0 {
            Err(core::fmt::Error)
        } else {
            Ok(())
        }
    }
}

struct DebugConsole;

impl Console for DebugConsole {
    fn print_byte(&self, byte: u8) -> core::fmt::Result {
        if sbi_rt::console_write_byte(byte).is_ok() {
            Ok(())
        } else {
            Err(core::fmt::Error)
        }
    }

    fn print_str(&self, string: &str) -> core::fmt::Result {
        let string_bytes = string.as_bytes();
        if sbi_rt::console_write(sbi_rt::Physical::new(
            string_bytes.len(),
            string_bytes.as_ptr() as _,
            0,
        ))
        .is_ok()
        {
            Ok(())
        } else {
            Err(core::fmt::Error)
        }
    }
}

pub(crate) struct DebugWriter;

impl Write for DebugWriter {
    fn write_str(&mut self, string: &str) -> core::fmt::Result {
        CONSOLE.get().ok_or(core::fmt::Error)?.print_str(string)
    }
}

impl log::Log for DebugWriter {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let file = record.file().unwrap_or("");
            let line = record.line().unwrap_or(0);

            println!(
                "[{}] ({}:{}:{}): {}",
                record.level(),
                record.target(),
                file,
                line,
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

#[allow(unused_imports)]
pub(crate) use print;
#[allow(unused_imports)]
pub(crate) use println;
