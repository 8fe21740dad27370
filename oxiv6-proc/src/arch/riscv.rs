use super::{Arch, Interrupts, KernelEntry, Nesting};
use crate::param::NCPU;
use core::arch::{asm, global_asm};
use riscv::register::sstatus;

/// Saved registers for kernel context switches
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    // callee-saved
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

extern "C" {
    fn swtch(save: *mut Context, load: *const Context);
    fn context_entry();
    // Provided by the trap code: restores the trapframe and `sret`s
    fn usertrapret() -> !;
}

/// RISC-V harts in supervisor mode, with the hart id kept in `tp`
pub struct Riscv {
    nesting: [Nesting; NCPU],
}

impl Riscv {
    pub const fn new() -> Self {
        Self {
            nesting: [const { Nesting::new() }; NCPU],
        }
    }
}

impl Default for Riscv {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupts for Riscv {
    #[inline]
    fn cpu_id(&self) -> usize {
        let id: usize;
        unsafe { asm!("mv {0}, tp", out(reg) id) };
        id
    }

    #[inline]
    fn interrupts_enabled(&self) -> bool {
        sstatus::read().sie()
    }

    #[inline]
    fn enable_interrupts(&self) {
        unsafe { sstatus::set_sie() };
    }

    #[inline]
    fn disable_interrupts(&self) {
        unsafe { sstatus::clear_sie() };
    }

    fn nesting(&self) -> &Nesting {
        &self.nesting[self.cpu_id()]
    }
}

impl Arch for Riscv {
    type Context = Context;

    fn wait_for_interrupt(&self) {
        unsafe { asm!("wfi", options(nomem, nostack)) };
    }

    fn seed_context(
        &self,
        context: &mut Context,
        stack_top: usize,
        entry: KernelEntry,
        arg: usize,
    ) {
        // `context_entry` moves s0 into a0 and jumps to s1
        *context = Context {
            ra: context_entry as usize,
            sp: stack_top,
            s0: arg,
            s1: entry as usize,
            ..Context::default()
        };
    }

    unsafe fn switch(&self, save: *mut Context, load: *const Context) {
        unsafe { swtch(save, load) };
    }

    fn return_to_user(&self) -> ! {
        unsafe { usertrapret() }
    }
}

global_asm!(
    ".globl swtch",
    "swtch:",
    "sd ra, 0(a0)",
    "sd sp, 8(a0)",
    "sd s0, 16(a0)",
    "sd s1, 24(a0)",
    "sd s2, 32(a0)",
    "sd s3, 40(a0)",
    "sd s4, 48(a0)",
    "sd s5, 56(a0)",
    "sd s6, 64(a0)",
    "sd s7, 72(a0)",
    "sd s8, 80(a0)",
    "sd s9, 88(a0)",
    "sd s10, 96(a0)",
    "sd s11, 104(a0)",
    "ld ra, 0(a1)",
    "ld sp, 8(a1)",
    "ld s0, 16(a1)",
    "ld s1, 24(a1)",
    "ld s2, 32(a1)",
    "ld s3, 40(a1)",
    "ld s4, 48(a1)",
    "ld s5, 56(a1)",
    "ld s6, 64(a1)",
    "ld s7, 72(a1)",
    "ld s8, 80(a1)",
    "ld s9, 88(a1)",
    "ld s10, 96(a1)",
    "ld s11, 104(a1)",
    "ret",
    ".globl context_entry",
    "context_entry:",
    "mv a0, s0",
    "jr s1",
);
