use crate::arch::{Arch, Interrupts};
use crate::fs::Fs;
use crate::param::{NCPU, NPROC};
use crate::proc::Proc;
use crate::spinlock::Spinlock;
use crate::vm::Vm;
use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicBool, AtomicUsize};
use log::info;
use spin::once::Once;

/// The collaborators a kernel is built from
pub trait Machine: Sized + Send + Sync + 'static {
    type Arch: Arch;
    type Vm: Vm;
    type Fs: Fs;
}

pub type Context<M> = <<M as Machine>::Arch as Arch>::Context;
pub type AddressSpace<M> = <<M as Machine>::Vm as Vm>::AddressSpace;
pub type Inode<M> = <<M as Machine>::Fs as Fs>::Inode;

/// Per-CPU state
pub(crate) struct Cpu<M: Machine> {
    /// Slot of the process running on this CPU, if any
    pub(crate) proc: Cell<Option<usize>>,
    /// `switch` here to enter the scheduler
    pub(crate) context: UnsafeCell<Context<M>>,
}

// Only ever touched by the owning CPU with interrupts disabled
unsafe impl<M: Machine> Sync for Cpu<M> {}

impl<M: Machine> Cpu<M> {
    fn new() -> Self {
        Self {
            proc: Cell::new(None),
            context: UnsafeCell::new(Default::default()),
        }
    }
}

/// Process-management core of one running kernel.
///
/// Constructed once at boot and never dropped; every CPU's scheduler loop and every process's
/// kernel thread share it.
pub struct Kernel<M: Machine> {
    pub(crate) arch: &'static M::Arch,
    pub(crate) vm: M::Vm,
    pub(crate) fs: M::Fs,
    pub(crate) cpus: [Cpu<M>; NCPU],
    pub(crate) procs: [Proc<M>; NPROC],
    /// Parent of each slot, by slot index. Doubles as the wait lock: taken before any process
    /// lock, so that exit-time reparenting and wait-time scanning never invert.
    pub(crate) parents: Spinlock<[Option<usize>; NPROC]>,
    pub(crate) init_proc: Once<usize>,
    pub(crate) next_pid: AtomicUsize,
    pub(crate) ticks: Spinlock<u64>,
    pub(crate) open_files: AtomicUsize,
    pub(crate) fs_ready: AtomicBool,
}

impl<M: Machine> Kernel<M> {
    pub fn new(arch: &'static M::Arch, vm: M::Vm, fs: M::Fs) -> Self {
        let interrupts: &'static dyn Interrupts = arch;
        let procs = core::array::from_fn(|slot| Proc::new(slot, interrupts, vm.kernel_stack(slot)));
        info!("Process table initialized: {} slots, {} cpus", NPROC, NCPU);

        Self {
            arch,
            vm,
            fs,
            cpus: core::array::from_fn(|_| Cpu::new()),
            procs,
            parents: Spinlock::new("wait_lock", interrupts, [None; NPROC]),
            init_proc: Once::new(),
            next_pid: AtomicUsize::new(1),
            ticks: Spinlock::new("time", interrupts, 0),
            open_files: AtomicUsize::new(0),
            fs_ready: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn arch(&self) -> &'static M::Arch {
        self.arch
    }

    #[inline]
    pub fn vm(&self) -> &M::Vm {
        &self.vm
    }

    #[inline]
    pub fn fs(&self) -> &M::Fs {
        &self.fs
    }

    /// This CPU's state. Interrupts must be disabled, or the caller could move CPUs.
    pub(crate) fn my_cpu(&self) -> &Cpu<M> {
        assert!(!self.arch.interrupts_enabled(), "my_cpu: interruptible");
        &self.cpus[self.arch.cpu_id()]
    }
}
