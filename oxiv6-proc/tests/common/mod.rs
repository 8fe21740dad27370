//! A host machine for running the process core under `cargo test`.
//!
//! Every simulated CPU's scheduler and every process's kernel thread is a host thread. A context
//! is a baton: `switch` hands the CPU id to the thread being resumed and parks the current one
//! until something switches back to it, so at most one thread per simulated CPU runs at a time.
//! User programs are closures, picked by the trapframe's `epc`. Timer interrupts are simulated
//! by idle CPUs, which tick the clock each time they wait.

#![allow(dead_code)]

use oxiv6_proc::arch::{Arch, Interrupts, KernelEntry, Nesting};
use oxiv6_proc::fs::{Fs, FsError};
use oxiv6_proc::param::{KSTACK_SIZE, NCPU};
use oxiv6_proc::proc::TrapFrame;
use oxiv6_proc::syscall::SyscallNumber;
use oxiv6_proc::vm::{Vm, VmError};
use oxiv6_proc::{Kernel, Machine};
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// Where the test programs keep things in user memory
pub const FDS: usize = 0x10;
pub const STATUS: usize = 0x20;
pub const BUF: usize = 0x100;
pub const OUT: usize = 0x800;
/// Never mapped
pub const UNMAPPED: usize = 0xdead_0000;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Largest user memory a host address space will grow to
const MAX_USER_MEMORY: usize = 1 << 20;

pub struct HostMachine;

impl Machine for HostMachine {
    type Arch = HostArch;
    type Vm = HostVm;
    type Fs = HostFs;
}

pub type HostKernel = Kernel<HostMachine>;

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
}

#[derive(Default)]
struct Baton {
    cpu: Mutex<Option<usize>>,
    ready: Condvar,
}

impl Baton {
    fn pass(&self, cpu: usize) {
        *self.cpu.lock().unwrap() = Some(cpu);
        self.ready.notify_one();
    }

    fn take(&self) -> usize {
        let mut cpu = self.cpu.lock().unwrap();
        loop {
            if let Some(id) = cpu.take() {
                return id;
            }
            cpu = self.ready.wait(cpu).unwrap();
        }
    }
}

#[derive(Default)]
pub struct HostContext {
    baton: Arc<Baton>,
}

type Program = Arc<dyn Fn(&User) + Send + Sync>;

pub struct HostArch {
    enabled: [AtomicBool; NCPU],
    nesting: [Nesting; NCPU],
    kernel: OnceLock<&'static HostKernel>,
    programs: Mutex<Vec<Program>>,
    halted: AtomicBool,
}

impl HostArch {
    fn new() -> Self {
        Self {
            enabled: std::array::from_fn(|_| AtomicBool::new(false)),
            nesting: std::array::from_fn(|_| Nesting::new()),
            kernel: OnceLock::new(),
            programs: Mutex::new(Vec::new()),
            halted: AtomicBool::new(false),
        }
    }

    fn kernel(&self) -> &'static HostKernel {
        self.kernel.get().expect("host kernel not attached")
    }
}

impl Interrupts for HostArch {
    fn cpu_id(&self) -> usize {
        CPU.with(Cell::get)
    }

    fn interrupts_enabled(&self) -> bool {
        self.enabled[self.cpu_id()].load(Ordering::SeqCst)
    }

    fn enable_interrupts(&self) {
        self.enabled[self.cpu_id()].store(true, Ordering::SeqCst);
    }

    fn disable_interrupts(&self) {
        self.enabled[self.cpu_id()].store(false, Ordering::SeqCst);
    }

    fn nesting(&self) -> &Nesting {
        &self.nesting[self.cpu_id()]
    }
}

impl Arch for HostArch {
    type Context = HostContext;

    fn wait_for_interrupt(&self) {
        if self.halted.load(Ordering::SeqCst) {
            loop {
                thread::park();
            }
        }
        thread::sleep(Duration::from_micros(100));
        self.kernel().clock_tick();
    }

    fn seed_context(
        &self,
        context: &mut HostContext,
        _stack_top: usize,
        entry: KernelEntry,
        arg: usize,
    ) {
        let baton = Arc::new(Baton::default());
        context.baton = Arc::clone(&baton);
        thread::spawn(move || {
            CPU.with(|cpu| cpu.set(baton.take()));
            entry(arg)
        });
    }

    unsafe fn switch(&self, save: *mut HostContext, load: *const HostContext) {
        let (save, load) = unsafe { (Arc::clone(&(*save).baton), Arc::clone(&(*load).baton)) };
        load.pass(self.cpu_id());
        let cpu = save.take();
        CPU.with(|id| id.set(cpu));
    }

    fn return_to_user(&self) -> ! {
        let kernel = self.kernel();
        let epc = kernel.with_trapframe(|tf| tf.epc);
        let program = Arc::clone(&self.programs.lock().unwrap()[epc]);
        let init = kernel.getpid().as_usize() == 1;

        self.enable_interrupts();
        let user = User { kernel };
        let _ = catch_unwind(AssertUnwindSafe(|| program(&user)));

        if init {
            // Like init: reap orphans forever
            loop {
                if kernel.wait(None).is_err() {
                    let _ = kernel.sleep_ticks(1);
                }
            }
        }
        kernel.exit(0)
    }
}

#[derive(Default)]
pub struct HostSpace {
    memory: Vec<u8>,
}

#[derive(Default)]
pub struct HostVm {
    pub destroyed: AtomicUsize,
}

impl HostSpace {
    fn range(&self, addr: usize, len: usize) -> Result<std::ops::Range<usize>, VmError> {
        let end = addr.checked_add(len).ok_or(VmError::BadAddress)?;
        if end > self.memory.len() {
            return Err(VmError::BadAddress);
        }
        Ok(addr..end)
    }
}

impl Vm for HostVm {
    type AddressSpace = HostSpace;

    fn kernel_stack(&self, slot: usize) -> usize {
        (slot + 1) * 2 * KSTACK_SIZE
    }

    fn create(&self, _trapframe: &TrapFrame) -> Result<HostSpace, VmError> {
        Ok(HostSpace::default())
    }

    fn copy(&self, from: &HostSpace, to: &mut HostSpace, size: usize) -> Result<(), VmError> {
        to.memory = from.memory[..size].to_vec();
        Ok(())
    }

    fn resize(
        &self,
        space: &mut HostSpace,
        _old_size: usize,
        new_size: usize,
    ) -> Result<usize, VmError> {
        if new_size > MAX_USER_MEMORY {
            return Err(VmError::OutOfMemory);
        }
        space.memory.resize(new_size, 0);
        Ok(new_size)
    }

    fn destroy(&self, _space: HostSpace, _size: usize) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn copy_out(&self, space: &mut HostSpace, dst: usize, src: &[u8]) -> Result<(), VmError> {
        let range = space.range(dst, src.len())?;
        space.memory[range].copy_from_slice(src);
        Ok(())
    }

    fn copy_in(&self, space: &HostSpace, dst: &mut [u8], src: usize) -> Result<(), VmError> {
        let range = space.range(src, dst.len())?;
        dst.copy_from_slice(&space.memory[range]);
        Ok(())
    }
}

pub struct HostInode {
    path: String,
}

/// A flat file system: `/` plus whatever files the tests create
#[derive(Default)]
pub struct HostFs {
    files: Mutex<HashMap<String, Vec<u8>>>,
    /// Inode references currently held by the kernel
    pub live: AtomicIsize,
    pub init_calls: AtomicUsize,
}

impl HostFs {
    pub fn create(&self, path: &str) {
        self.files.lock().unwrap().insert(path.to_owned(), Vec::new());
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

impl Fs for HostFs {
    type Inode = HostInode;

    fn init(&self) {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn lookup(&self, path: &str) -> Result<HostInode, FsError> {
        if path != "/" && !self.files.lock().unwrap().contains_key(path) {
            return Err(FsError::NotFound);
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(HostInode {
            path: path.to_owned(),
        })
    }

    fn dup(&self, inode: &HostInode) -> HostInode {
        self.live.fetch_add(1, Ordering::SeqCst);
        HostInode {
            path: inode.path.clone(),
        }
    }

    fn put(&self, _inode: HostInode) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn read(&self, inode: &HostInode, offset: usize, dst: &mut [u8]) -> Result<usize, FsError> {
        let files = self.files.lock().unwrap();
        let data = files.get(&inode.path).ok_or(FsError::Io)?;
        let available = data.len().saturating_sub(offset).min(dst.len());
        dst[..available].copy_from_slice(&data[offset..offset + available]);
        Ok(available)
    }

    fn write(&self, inode: &HostInode, offset: usize, src: &[u8]) -> Result<usize, FsError> {
        let mut files = self.files.lock().unwrap();
        let data = files.get_mut(&inode.path).ok_or(FsError::Io)?;
        if data.len() < offset + src.len() {
            data.resize(offset + src.len(), 0);
        }
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(src.len())
    }
}

/// One booted kernel, torn down (its CPUs parked) on drop
pub struct Host {
    pub kernel: &'static HostKernel,
    arch: &'static HostArch,
}

impl Host {
    pub fn new() -> Self {
        let arch: &'static HostArch = Box::leak(Box::new(HostArch::new()));
        let kernel: &'static HostKernel = Box::leak(Box::new(Kernel::new(
            arch,
            HostVm::default(),
            HostFs::default(),
        )));
        assert!(arch.kernel.set(kernel).is_ok());
        Self { kernel, arch }
    }

    /// Registers a user program, returning the `epc` that runs it
    pub fn program(&self, program: impl Fn(&User) + Send + Sync + 'static) -> usize {
        let mut programs = self.arch.programs.lock().unwrap();
        programs.push(Arc::new(program));
        programs.len() - 1
    }

    /// Creates init running `init` and starts `cpus` schedulers
    pub fn boot(&self, init: usize, cpus: usize) {
        self.kernel.user_init(b"\x73\x00\x00\x00", init);
        for id in 0..cpus {
            let kernel = self.kernel;
            thread::spawn(move || {
                CPU.with(|cpu| cpu.set(id));
                kernel.scheduler()
            });
        }
    }

    pub fn fs(&self) -> &HostFs {
        self.kernel.fs()
    }

    pub fn vm(&self) -> &HostVm {
        self.kernel.vm()
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.kernel.dump(&mut out).unwrap();
        out
    }

    /// Polls the process listing until `done` holds for it
    pub fn wait_until(&self, done: impl Fn(&str) -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < TIMEOUT {
            if done(&self.dump()) {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.arch.halted.store(true, Ordering::SeqCst);
    }
}

/// What a user program can do: memory access and system calls on its own process
pub struct User {
    kernel: &'static HostKernel,
}

impl User {
    pub fn kernel(&self) -> &'static HostKernel {
        self.kernel
    }

    /// Traps into the kernel, and on the way back out exits if killed
    pub fn raw_syscall(&self, number: usize, args: &[usize]) -> isize {
        self.kernel.with_trapframe(|tf| {
            tf.a7 = number;
            let mut regs = [0; 3];
            regs[..args.len()].copy_from_slice(args);
            [tf.a0, tf.a1, tf.a2] = regs;
        });
        self.kernel.syscall();
        if self.kernel.killed() {
            self.kernel.exit(-1);
        }
        self.a0() as isize
    }

    pub fn syscall(&self, number: SyscallNumber, args: &[usize]) -> isize {
        self.raw_syscall(number.into(), args)
    }

    /// Forks, with the child running program `child`
    pub fn fork(&self, child: usize) -> isize {
        let epc = self.kernel.with_trapframe(|tf| std::mem::replace(&mut tf.epc, child));
        let pid = self.syscall(SyscallNumber::Fork, &[]);
        self.kernel.with_trapframe(|tf| tf.epc = epc);
        pid
    }

    pub fn exit(&self, status: i32) -> ! {
        self.syscall(SyscallNumber::Exit, &[status as usize]);
        unreachable!("exit returned");
    }

    /// Waits for a child, returning its pid and exit status
    pub fn wait(&self) -> (isize, i32) {
        let pid = self.syscall(SyscallNumber::Wait, &[STATUS]);
        let status = self.read_mem(STATUS, 4);
        (pid, i32::from_le_bytes(status.try_into().unwrap()))
    }

    /// Creates a pipe, leaving its descriptors at `FDS` for forked children to find
    pub fn pipe(&self) -> (usize, usize) {
        assert_eq!(self.syscall(SyscallNumber::Pipe, &[FDS]), 0);
        self.fds()
    }

    /// The pipe descriptors stored at `FDS`
    pub fn fds(&self) -> (usize, usize) {
        let fds = self.read_mem(FDS, 8);
        let read = i32::from_le_bytes(fds[..4].try_into().unwrap());
        let write = i32::from_le_bytes(fds[4..].try_into().unwrap());
        (read as usize, write as usize)
    }

    pub fn write(&self, fd: usize, addr: usize, n: usize) -> isize {
        self.syscall(SyscallNumber::Write, &[fd, addr, n])
    }

    pub fn read(&self, fd: usize, addr: usize, n: usize) -> isize {
        self.syscall(SyscallNumber::Read, &[fd, addr, n])
    }

    pub fn close(&self, fd: usize) -> isize {
        self.syscall(SyscallNumber::Close, &[fd])
    }

    pub fn sleep(&self, ticks: usize) -> isize {
        self.syscall(SyscallNumber::Sleep, &[ticks])
    }

    pub fn getpid(&self) -> isize {
        self.syscall(SyscallNumber::Getpid, &[])
    }

    pub fn a0(&self) -> usize {
        self.kernel.with_trapframe(|tf| tf.a0)
    }

    pub fn read_mem(&self, addr: usize, len: usize) -> Vec<u8> {
        let mut bytes = vec![0; len];
        self.kernel.copy_in_user(&mut bytes, addr).unwrap();
        bytes
    }

    pub fn write_mem(&self, addr: usize, bytes: &[u8]) {
        self.kernel.copy_out_user(addr, bytes).unwrap();
    }

    /// The process listing, as seen from inside
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.kernel.dump(&mut out).unwrap();
        out
    }
}
