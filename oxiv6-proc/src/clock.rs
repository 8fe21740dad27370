use crate::error::KernelError;
use crate::kernel::{Kernel, Machine};
use crate::proc::Channel;

impl<M: Machine> Kernel<M> {
    /// Advances the tick count and wakes every sleeper waiting on it. Called from the timer
    /// interrupt of one CPU.
    pub fn clock_tick(&self) {
        let mut ticks = self.ticks.lock();
        *ticks += 1;
        self.wakeup(Channel::of(&*ticks));
    }

    /// Ticks since boot
    pub fn uptime(&self) -> u64 {
        *self.ticks.lock()
    }

    /// Sleeps the current process for at least `n` ticks
    /// # Errors
    /// `Killed` if the process is asked to terminate in the meantime
    pub fn sleep_ticks(&self, n: u64) -> Result<(), KernelError> {
        let mut ticks = self.ticks.lock();
        let start = *ticks;
        while *ticks - start < n {
            if self.killed() {
                return Err(KernelError::Killed);
            }
            let channel = Channel::of(&*ticks);
            ticks = self.sleep(channel, ticks);
        }
        Ok(())
    }
}
