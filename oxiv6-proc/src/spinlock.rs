use crate::arch::Interrupts;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const NO_CPU: usize = usize::MAX;

/// Busy-waiting mutual exclusion.
///
/// Interrupts stay disabled on the holding CPU for as long as the lock is held, through
/// [`Interrupts::push_off`], so nested acquisitions compose and interrupts come back only when
/// the outermost lock is released. Nothing may suspend inside the critical section: blocking is
/// expressed with `Kernel::sleep` instead.
pub struct Spinlock<T> {
    locked: AtomicBool,
    cpu: AtomicUsize,
    name: &'static str,
    interrupts: &'static dyn Interrupts,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub fn new(name: &'static str, interrupts: &'static dyn Interrupts, data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(NO_CPU),
            name,
            interrupts,
            data: UnsafeCell::new(data),
        }
    }

    /// Spins until the lock is acquired.
    /// # Panics
    /// Panics if the calling CPU already holds this lock
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        self.interrupts.push_off();
        assert!(!self.holding(), "acquire: {}", self.name);

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.cpu.store(self.interrupts.cpu_id(), Ordering::Relaxed);

        SpinlockGuard { lock: self }
    }

    /// Is this lock held by the calling CPU? Interrupts must be disabled.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
            && self.cpu.load(Ordering::Relaxed) == self.interrupts.cpu_id()
    }

    /// Releases the lock behind `guard`, handing back the lock so it can be re-acquired later
    pub fn unlock(guard: SpinlockGuard<'_, T>) -> &'_ Spinlock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }

    /// Releases a lock whose guard lives on another kernel thread's stack.
    /// # Safety
    /// The calling CPU must hold the lock, and the guard that acquired it must never be dropped
    /// as a release of this acquisition.
    pub unsafe fn force_unlock(&self) {
        self.release();
    }

    /// Reads the protected data without taking the lock.
    /// # Safety
    /// The result may be torn or stale; only suitable for best-effort diagnostics.
    pub unsafe fn peek(&self) -> &T {
        unsafe { &*self.data.get() }
    }

    fn release(&self) {
        assert!(self.holding(), "release: {}", self.name);
        self.cpu.store(NO_CPU, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        self.interrupts.pop_off();
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Spinlock")
            .field("name", &self.name)
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<'a, T> SpinlockGuard<'a, T> {
    #[inline]
    pub fn spinlock(&self) -> &'a Spinlock<T> {
        self.lock
    }
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
