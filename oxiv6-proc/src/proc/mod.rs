//! Process control blocks and the process table.
//!
//! Each [`Proc`] splits its fields in two. [`ProcInner`] holds what other CPUs may look at
//! (state, wait channel, kill flag, exit status, pid) and is protected by the slot's spinlock.
//! [`ProcData`] is private to the process itself, or to whoever holds the slot while it is not
//! yet runnable or already a zombie.

mod lifecycle;
mod sched;
mod trapframe;

pub use lifecycle::{Destination, Source};
pub use trapframe::TrapFrame;

use crate::arch::Interrupts;
use crate::file::File;
use crate::kernel::{AddressSpace, Context, Inode, Kernel, Machine};
use crate::param::{KSTACK_SIZE, NOFILE};
use crate::spinlock::Spinlock;
use alloc::boxed::Box;
use alloc::string::String;
use core::cell::UnsafeCell;
use core::fmt;

/// Process identifier, unique over the life of the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(usize);

impl Pid {
    #[inline]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Rendezvous key between a sleeping process and whoever will wake it: the address of
/// something that outlives the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel(usize);

impl Channel {
    /// The channel named by `target`'s address
    #[inline]
    pub fn of<T: ?Sized>(target: &T) -> Self {
        Self(core::ptr::from_ref(target).cast::<u8>() as usize)
    }

    #[inline]
    pub const fn from_raw(address: usize) -> Self {
        Self(address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcState {
    #[default]
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcState {
    /// Fixed-width label used by the process listing
    pub fn label(self) -> &'static str {
        match self {
            Self::Unused => "unused",
            Self::Used => "used  ",
            Self::Sleeping => "sleep ",
            Self::Runnable => "runble",
            Self::Running => "run   ",
            Self::Zombie => "zombie",
        }
    }
}

/// Fields shared with other CPUs. The slot lock must be held when accessing these.
#[derive(Debug, Default)]
pub struct ProcInner {
    pub state: ProcState,
    /// If some, sleeping on this channel
    pub channel: Option<Channel>,
    /// Termination has been requested
    pub killed: bool,
    /// Exit status to be returned to the parent's `wait`
    pub xstate: i32,
    pub pid: Pid,
}

/// Fields private to the process
pub struct ProcData<M: Machine> {
    /// Top of this slot's kernel stack
    pub kstack: usize,
    /// Size of user memory in bytes
    pub size: usize,
    pub space: Option<AddressSpace<M>>,
    pub trapframe: Option<Box<TrapFrame>>,
    /// `switch` here to run the process
    pub context: Context<M>,
    pub open_files: [Option<File<M>>; NOFILE],
    pub cwd: Option<Inode<M>>,
    pub name: String,
}

impl<M: Machine> ProcData<M> {
    fn new(kstack: usize) -> Self {
        Self {
            kstack,
            size: 0,
            space: None,
            trapframe: None,
            context: Default::default(),
            open_files: core::array::from_fn(|_| None),
            cwd: None,
            name: String::new(),
        }
    }

    pub fn trapframe(&self) -> &TrapFrame {
        self.trapframe.as_ref().expect("trapframe")
    }

    pub fn trapframe_mut(&mut self) -> &mut TrapFrame {
        self.trapframe.as_mut().expect("trapframe")
    }

    pub fn space(&self) -> &AddressSpace<M> {
        self.space.as_ref().expect("address space")
    }

    pub fn space_mut(&mut self) -> &mut AddressSpace<M> {
        self.space.as_mut().expect("address space")
    }

    /// Top of the kernel stack a seeded context starts on
    #[inline]
    pub(crate) fn stack_top(&self) -> usize {
        self.kstack + KSTACK_SIZE
    }
}

/// Process control block: one slot of the process table
pub struct Proc<M: Machine> {
    slot: usize,
    pub(crate) inner: Spinlock<ProcInner>,
    data: UnsafeCell<ProcData<M>>,
}

unsafe impl<M: Machine> Sync for Proc<M> {}
unsafe impl<M: Machine> Send for Proc<M> {}

impl<M: Machine> Proc<M> {
    pub(crate) fn new(slot: usize, interrupts: &'static dyn Interrupts, kstack: usize) -> Self {
        Self {
            slot,
            inner: Spinlock::new("proc", interrupts, ProcInner::default()),
            data: UnsafeCell::new(ProcData::new(kstack)),
        }
    }

    /// Index of this slot in the process table
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Acquires and releases the slot lock
    pub fn pid(&self) -> Pid {
        self.inner.lock().pid
    }

    pub(crate) fn data(&self) -> &ProcData<M> {
        unsafe { &*self.data.get() }
    }

    /// # Safety
    /// The caller must have exclusive access to the private fields: it is the process itself,
    /// or the slot is not yet runnable (allocation, fork), or it is a zombie being reaped.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_mut(&self) -> &mut ProcData<M> {
        unsafe { &mut *self.data.get() }
    }

    pub(crate) fn context_ptr(&self) -> *mut Context<M> {
        unsafe { core::ptr::addr_of_mut!((*self.data.get()).context) }
    }
}

impl<M: Machine> Kernel<M> {
    /// The process running on this CPU, if any
    pub fn current_proc(&self) -> Option<&Proc<M>> {
        self.arch.push_off();
        let slot = self.my_cpu().proc.get();
        self.arch.pop_off();
        slot.map(|slot| &self.procs[slot])
    }

    /// The process running on this CPU.
    /// # Panics
    /// Panics when called outside of process context
    pub fn my_proc(&self) -> &Proc<M> {
        self.current_proc().expect("my_proc: no current process")
    }

    pub fn getpid(&self) -> Pid {
        self.my_proc().pid()
    }

    /// Has the current process been asked to terminate?
    pub fn killed(&self) -> bool {
        self.my_proc().inner.lock().killed
    }

    pub fn set_killed(&self) {
        self.my_proc().inner.lock().killed = true;
    }

    /// Runs `f` on the current process's saved user registers
    pub fn with_trapframe<R>(&self, f: impl FnOnce(&mut TrapFrame) -> R) -> R {
        let data = unsafe { self.my_proc().data_mut() };
        f(data.trapframe_mut())
    }

    /// Process listing for debugging. Takes no locks, so that it still works on a wedged
    /// machine; the output may be inconsistent.
    /// # Errors
    /// Fails only if `out` does
    pub fn dump(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(out)?;
        for proc in &self.procs {
            let inner = unsafe { proc.inner.peek() };
            if inner.state == ProcState::Unused {
                continue;
            }
            // The owner may be renaming itself; read the field without borrowing its data
            let name = unsafe { &*core::ptr::addr_of!((*proc.data.get()).name) };
            writeln!(out, "{} {} {}", inner.pid, inner.state.label(), name)?;
        }
        Ok(())
    }

    /// Slot of the init process.
    /// # Panics
    /// Panics before `user_init`
    pub(crate) fn init_slot(&self) -> usize {
        *self.init_proc.get().expect("init process not created")
    }
}
