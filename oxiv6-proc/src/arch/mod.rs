//! The interrupt, trap and context-switch collaborator.
//!
//! Everything the process core needs from the hardware goes through the two traits in this
//! module. [`Interrupts`] is all a [`Spinlock`](crate::spinlock::Spinlock) needs, so locks hold
//! it as a trait object. [`Arch`] adds the kernel-thread switch and the way back to user mode.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[cfg(target_arch = "riscv64")]
pub mod riscv;

/// Function a freshly seeded context starts executing, with the argument given to
/// [`Arch::seed_context`]
pub type KernelEntry = extern "C" fn(usize) -> !;

/// Interrupt-disable nesting of a single CPU.
///
/// Only ever touched by its own CPU while interrupts are disabled, so relaxed atomics suffice.
#[derive(Debug, Default)]
pub struct Nesting {
    depth: AtomicUsize,
    enabled_before: AtomicBool,
}

impl Nesting {
    pub const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            enabled_before: AtomicBool::new(false),
        }
    }

    /// Number of outstanding [`Interrupts::push_off`] calls
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Were interrupts enabled before the outermost [`Interrupts::push_off`]?
    #[inline]
    pub fn enabled_before(&self) -> bool {
        self.enabled_before.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_enabled_before(&self, enabled: bool) {
        self.enabled_before.store(enabled, Ordering::Relaxed);
    }
}

/// Per-CPU interrupt control
pub trait Interrupts: Sync {
    /// Identifier of the calling CPU. Only stable while interrupts are disabled.
    fn cpu_id(&self) -> usize;

    fn interrupts_enabled(&self) -> bool;

    fn enable_interrupts(&self);

    fn disable_interrupts(&self);

    /// The calling CPU's nesting record. Must be called with interrupts disabled.
    fn nesting(&self) -> &Nesting;

    /// Disables interrupts, remembering whether they were on if this is the outermost call.
    /// It takes two `pop_off`s to undo two `push_off`s.
    fn push_off(&self) {
        let old = self.interrupts_enabled();
        self.disable_interrupts();
        let nesting = self.nesting();
        if nesting.depth() == 0 {
            nesting.set_enabled_before(old);
        }
        nesting.depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Undoes one [`Interrupts::push_off`], re-enabling interrupts once the outermost one is undone
    /// and they were enabled to begin with.
    /// # Panics
    /// Panics if interrupts are enabled or there is no matching `push_off`
    fn pop_off(&self) {
        assert!(!self.interrupts_enabled(), "pop_off - interruptible");
        let nesting = self.nesting();
        let depth = nesting.depth();
        assert!(depth >= 1, "pop_off");
        nesting.depth.store(depth - 1, Ordering::Relaxed);
        if depth == 1 && nesting.enabled_before() {
            self.enable_interrupts();
        }
    }
}

/// Kernel-thread switching and the return path to user mode
pub trait Arch: Interrupts + Send + 'static {
    /// Saved kernel-thread state: enough to resume a suspended kernel execution path
    type Context: Default + Send;

    /// Idles the calling CPU until something may have become runnable
    fn wait_for_interrupt(&self);

    /// Prepares `context` so that the first [`Arch::switch`] into it runs `entry(arg)` on the
    /// stack ending at `stack_top`, instead of resuming mid-function.
    fn seed_context(
        &self,
        context: &mut Self::Context,
        stack_top: usize,
        entry: KernelEntry,
        arg: usize,
    );

    /// Saves the running kernel thread into `save` and resumes the one in `load`.
    /// Returns when something later switches back into `save`.
    /// # Safety
    /// Both pointers must be valid for the duration of the switch, interrupts must be disabled,
    /// and `load` must have been saved by a previous switch or seeded by [`Arch::seed_context`].
    unsafe fn switch(&self, save: *mut Self::Context, load: *const Self::Context);

    /// Leaves the kernel for the current process's user code, as described by its trapframe
    fn return_to_user(&self) -> !;
}
