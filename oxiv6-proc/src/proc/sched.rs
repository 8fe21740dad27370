use super::{Channel, Proc, ProcInner, ProcState};
use crate::arch::{Arch, Interrupts};
use crate::fs::Fs;
use crate::kernel::{Kernel, Machine};
use crate::spinlock::{Spinlock, SpinlockGuard};
use core::sync::atomic::Ordering;
use log::trace;

impl<M: Machine> Kernel<M> {
    /// Per-CPU process scheduler. Each CPU calls `scheduler` after setting itself up, and it
    /// never returns. It loops, doing:
    ///  - choose a process to run.
    ///  - switch to start running that process.
    ///  - eventually that process transfers control back via switch to the scheduler.
    pub fn scheduler(&self) -> ! {
        self.arch.disable_interrupts();
        // The CPU does not change throughout the lifetime of the scheduler
        let cpu = self.my_cpu();
        cpu.proc.set(None);

        loop {
            // The most recent process to run may have had interrupts turned off; enable them
            // to avoid a deadlock if all processes are waiting.
            self.arch.enable_interrupts();
            self.arch.disable_interrupts();

            let mut found = false;
            for proc in &self.procs {
                let mut inner = proc.inner.lock();
                if inner.state == ProcState::Runnable {
                    // It is the process's job to release its lock and then reacquire it
                    // before switching back to us.
                    inner.state = ProcState::Running;
                    cpu.proc.set(Some(proc.slot()));
                    unsafe { self.arch.switch(cpu.context.get(), proc.context_ptr()) };

                    // The process has changed its state before coming back
                    cpu.proc.set(None);
                    found = true;
                }
            }

            if !found {
                // Nothing to run; stop running on this core until an interrupt
                self.arch.enable_interrupts();
                self.arch.wait_for_interrupt();
            }
        }
    }

    /// Switches to the scheduler.
    ///
    /// Must hold only the process's own lock, and have already moved it out of RUNNING.
    /// Saves and restores the interrupts-were-enabled flag, since that is a property of this
    /// kernel thread rather than of the CPU.
    /// # Panics
    /// Any of the above not holding is fatal
    pub(crate) fn sched<'a>(
        &self,
        proc: &Proc<M>,
        inner: SpinlockGuard<'a, ProcInner>,
    ) -> SpinlockGuard<'a, ProcInner> {
        assert!(
            core::ptr::eq(inner.spinlock(), &proc.inner) && proc.inner.holding(),
            "sched p->lock"
        );
        assert_eq!(self.arch.nesting().depth(), 1, "sched locks");
        assert_ne!(inner.state, ProcState::Running, "sched running");
        assert!(!self.arch.interrupts_enabled(), "sched interruptible");

        let enabled_before = self.arch.nesting().enabled_before();
        let cpu = self.my_cpu();
        unsafe { self.arch.switch(proc.context_ptr(), cpu.context.get()) };

        // Possibly on another CPU by now
        self.arch.nesting().set_enabled_before(enabled_before);
        inner
    }

    /// Gives up the CPU for one scheduling round
    pub fn yield_now(&self) {
        let proc = self.my_proc();
        let mut inner = proc.inner.lock();
        inner.state = ProcState::Runnable;
        drop(self.sched(proc, inner));
    }

    /// Atomically releases `condition` and sleeps on `channel`, re-acquiring `condition` once
    /// woken. Wakeups can be spurious: callers re-check their predicate in a loop.
    pub fn sleep<'a, T>(
        &self,
        channel: Channel,
        condition: SpinlockGuard<'a, T>,
    ) -> SpinlockGuard<'a, T> {
        let proc = self.my_proc();

        // Take our own lock before letting go of the condition lock. `wakeup` needs our lock to
        // mark us runnable, so it cannot slip in between the caller's check and our sleep.
        let mut inner = proc.inner.lock();
        let condition_lock: &'a Spinlock<T> = Spinlock::unlock(condition);

        inner.channel = Some(channel);
        inner.state = ProcState::Sleeping;
        trace!("pid {} sleeping on {:?}", inner.pid, channel);

        let mut inner = self.sched(proc, inner);

        inner.channel = None;
        drop(inner);

        condition_lock.lock()
    }

    /// Wakes every process sleeping on `channel`.
    /// Must be called without holding any process lock.
    pub fn wakeup(&self, channel: Channel) {
        // May be called from the scheduler's context, where there is no current process
        let current = self.current_proc().map(Proc::slot);

        for proc in &self.procs {
            if Some(proc.slot()) == current {
                continue;
            }
            let mut inner = proc.inner.lock();
            if inner.state == ProcState::Sleeping && inner.channel == Some(channel) {
                trace!("waking pid {} on {:?}", inner.pid, channel);
                inner.state = ProcState::Runnable;
            }
        }
    }

    /// First code every new process runs, by way of its seeded context
    fn fork_ret(&self) -> ! {
        let proc = self.my_proc();
        // Still holding the process lock from the scheduler
        unsafe { proc.inner.force_unlock() };

        // File system initialization may sleep, so it has to run in the context of a regular
        // process, and exactly once.
        if self
            .fs_ready
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.fs.init();
        }

        self.arch.return_to_user()
    }
}

/// Entry point seeded into every new process's context. `kernel` is the address of the
/// `Kernel` that allocated the process.
pub(crate) extern "C" fn fork_entry<M: Machine>(kernel: usize) -> ! {
    let kernel = unsafe { &*(kernel as *const Kernel<M>) };
    kernel.fork_ret()
}
