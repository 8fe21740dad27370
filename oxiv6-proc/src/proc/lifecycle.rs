use super::sched::fork_entry;
use super::{Channel, Pid, Proc, ProcInner, ProcState, TrapFrame};
use crate::arch::Arch;
use crate::error::KernelError;
use crate::fs::Fs;
use crate::kalloc::try_box;
use crate::kernel::{Kernel, Machine};
use crate::param::{INIT_NAME, NPROC, PAGE_SIZE, ROOT_PATH};
use crate::spinlock::SpinlockGuard;
use crate::vm::Vm;
use alloc::string::String;
use core::sync::atomic::Ordering;
use log::{debug, info, warn};

impl<M: Machine> Kernel<M> {
    fn alloc_pid(&self) -> Pid {
        Pid::new(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    /// Looks in the process table for an UNUSED slot. If found, initializes the state required
    /// to run in the kernel and returns it still locked.
    fn alloc_proc(
        &'static self,
    ) -> Result<(&'static Proc<M>, SpinlockGuard<'static, ProcInner>), KernelError> {
        for proc in &self.procs {
            let mut inner = proc.inner.lock();
            if inner.state != ProcState::Unused {
                continue;
            }

            inner.pid = self.alloc_pid();
            inner.state = ProcState::Used;

            // Not yet runnable, so nobody else looks at the private fields
            let data = unsafe { proc.data_mut() };

            match try_box(TrapFrame::default()) {
                Ok(trapframe) => data.trapframe = Some(trapframe),
                Err(err) => {
                    self.free_proc(proc, inner);
                    return Err(err);
                }
            }

            match self.vm.create(data.trapframe()) {
                Ok(space) => data.space = Some(space),
                Err(err) => {
                    warn!("alloc_proc: unable to create address space: {:?}", err);
                    self.free_proc(proc, inner);
                    return Err(err.into());
                }
            }

            // The first switch into this process lands in fork_ret, which returns to user space
            let stack_top = data.stack_top();
            self.arch.seed_context(
                &mut data.context,
                stack_top,
                fork_entry::<M>,
                core::ptr::from_ref(self) as usize,
            );

            return Ok((proc, inner));
        }

        warn!("alloc_proc: process table full");
        Err(KernelError::OutOfProcesses)
    }

    /// Frees a slot and everything hanging from it, returning it to UNUSED.
    /// The parent link is the caller's business, under the wait lock.
    fn free_proc(&self, proc: &Proc<M>, mut inner: SpinlockGuard<'_, ProcInner>) {
        // The slot is being torn down by whoever holds its lock
        let data = unsafe { proc.data_mut() };

        if let Some(space) = data.space.take() {
            self.vm.destroy(space, data.size);
        }
        data.trapframe = None;
        data.size = 0;
        data.name.clear();

        inner.pid = Pid::default();
        inner.channel = None;
        inner.killed = false;
        inner.xstate = 0;
        inner.state = ProcState::Unused;
    }

    /// Sets up the first user process, running `image` from `entry`.
    /// # Panics
    /// Panics if called twice, or if the process, its memory, or the root directory cannot be
    /// set up: there is no going on without init.
    pub fn user_init(&'static self, image: &[u8], entry: usize) -> Pid {
        assert!(self.init_proc.get().is_none(), "user_init: init exists");

        let (proc, mut inner) = self.alloc_proc().expect("user_init: alloc_proc");
        self.init_proc.call_once(|| proc.slot());

        // Not yet runnable
        let data = unsafe { proc.data_mut() };

        let size = image.len().max(1).next_multiple_of(PAGE_SIZE);
        data.size = self
            .vm
            .resize(data.space_mut(), 0, size)
            .expect("user_init: memory");
        self.vm
            .copy_out(data.space_mut(), 0, image)
            .expect("user_init: image");

        let trapframe = data.trapframe_mut();
        trapframe.epc = entry;
        trapframe.sp = size;

        data.cwd = Some(self.fs.lookup(ROOT_PATH).expect("user_init: root directory"));
        data.name = String::from(INIT_NAME);

        inner.state = ProcState::Runnable;
        info!("init process {} created", inner.pid);
        inner.pid
    }

    /// Grows or shrinks the current process's memory by `delta` bytes, returning the new size
    /// # Errors
    /// `InvalidArgument` when shrinking below zero, or whatever the address space reports
    pub fn grow(&self, delta: isize) -> Result<usize, KernelError> {
        // Only the process itself changes its memory
        let data = unsafe { self.my_proc().data_mut() };

        let old_size = data.size;
        let new_size = old_size
            .checked_add_signed(delta)
            .ok_or(KernelError::InvalidArgument)?;
        data.size = self.vm.resize(data.space_mut(), old_size, new_size)?;
        Ok(data.size)
    }

    /// Creates a new process copying the current one. The child resumes from the same user
    /// program counter, seeing 0 as the result.
    /// # Errors
    /// Fails when no slot is free or memory runs out; the half-built child is freed
    pub fn fork(&'static self) -> Result<Pid, KernelError> {
        let proc = self.my_proc();
        let data = unsafe { proc.data_mut() };

        let (child, child_inner) = self.alloc_proc()?;
        let child_data = unsafe { child.data_mut() };

        if let Err(err) = self.vm.copy(data.space(), child_data.space_mut(), data.size) {
            warn!("fork: unable to copy address space: {:?}", err);
            self.free_proc(child, child_inner);
            return Err(err.into());
        }
        child_data.size = data.size;

        // Saved user registers, with fork returning 0 in the child
        child_data.trapframe_mut().clone_from(data.trapframe());
        child_data.trapframe_mut().a0 = 0;

        // Bump reference counts on open files
        for (child_file, file) in child_data.open_files.iter_mut().zip(&data.open_files) {
            child_file.clone_from(file);
        }
        child_data.cwd = data.cwd.as_ref().map(|cwd| self.fs.dup(cwd));
        child_data.name.clone_from(&data.name);

        let pid = child_inner.pid;
        drop(child_inner);

        self.parents.lock()[child.slot()] = Some(proc.slot());

        child.inner.lock().state = ProcState::Runnable;
        debug!("fork: {} -> {}", proc.pid(), pid);
        Ok(pid)
    }

    /// Passes `proc`'s abandoned children to init, which the held wait lock proves safe
    fn reparent(&self, proc: &Proc<M>, parents: &mut SpinlockGuard<'_, [Option<usize>; NPROC]>) {
        let init = self.init_slot();
        for parent in parents.iter_mut() {
            if *parent == Some(proc.slot()) {
                *parent = Some(init);
                self.wakeup(Channel::of(&self.procs[init]));
            }
        }
    }

    /// Exits the current process. It stays a zombie until its parent reaps it in `wait`.
    /// # Panics
    /// Panics if called by init, or if the zombie is ever scheduled again
    pub fn exit(&self, status: i32) -> ! {
        let proc = self.my_proc();
        assert_ne!(Some(proc.slot()), self.init_proc.get().copied(), "init exiting");

        let data = unsafe { proc.data_mut() };
        for file in &mut data.open_files {
            if let Some(file) = file.take() {
                self.file_close(file);
            }
        }
        if let Some(cwd) = data.cwd.take() {
            self.fs.put(cwd);
        }

        let mut parents = self.parents.lock();

        self.reparent(proc, &mut parents);

        // The parent might be sleeping in wait
        let parent = parents[proc.slot()].expect("exit: no parent");
        self.wakeup(Channel::of(&self.procs[parent]));

        let mut inner = proc.inner.lock();
        inner.xstate = status;
        inner.state = ProcState::Zombie;
        debug!("exit: {} with status {}", inner.pid, status);

        drop(parents);

        // Jump into the scheduler, never to return
        let _inner = self.sched(proc, inner);
        panic!("zombie exit");
    }

    /// Waits for a child to exit, copying its exit status to user address `status_addr` if
    /// given, and returns its pid.
    /// # Errors
    /// `NoChildren` if there is nothing to wait for, `Killed` if the caller has been asked to
    /// terminate, or the failed status copy
    pub fn wait(&self, status_addr: Option<usize>) -> Result<Pid, KernelError> {
        let proc = self.my_proc();
        let mut parents = self.parents.lock();

        loop {
            let mut have_kids = false;
            for child in &self.procs {
                if parents[child.slot()] != Some(proc.slot()) {
                    continue;
                }

                // Make sure the child isn't still in exit or switch
                let inner = child.inner.lock();
                have_kids = true;

                if inner.state == ProcState::Zombie {
                    let pid = inner.pid;
                    if let Some(addr) = status_addr {
                        if let Err(err) = self.copy_out_user(addr, &inner.xstate.to_le_bytes()) {
                            warn!("wait: unable to copy out status of {}", pid);
                            return Err(err);
                        }
                    }
                    parents[child.slot()] = None;
                    self.free_proc(child, inner);
                    debug!("wait: {} reaped {}", proc.pid(), pid);
                    return Ok(pid);
                }
            }

            if !have_kids {
                return Err(KernelError::NoChildren);
            }
            if self.killed() {
                return Err(KernelError::Killed);
            }

            // Wait for a child to exit
            parents = self.sleep(Channel::of(proc), parents);
        }
    }

    /// Asks the process with `pid` to terminate. It won't exit until it next checks its flag,
    /// at the latest on its way back to user space.
    /// # Errors
    /// `NoSuchProcess` if no live process has `pid`
    pub fn kill(&self, pid: Pid) -> Result<(), KernelError> {
        for proc in &self.procs {
            let mut inner = proc.inner.lock();
            if inner.state != ProcState::Unused && inner.pid == pid {
                inner.killed = true;
                if inner.state == ProcState::Sleeping {
                    // Wake it from sleep so it notices
                    inner.state = ProcState::Runnable;
                }
                debug!("kill: {}", pid);
                return Ok(());
            }
        }
        Err(KernelError::NoSuchProcess)
    }

    /// Copies `src` to user address `dst` in the current process
    /// # Errors
    /// `BadAddress` if `dst` is not mapped
    pub fn copy_out_user(&self, dst: usize, src: &[u8]) -> Result<(), KernelError> {
        let data = unsafe { self.my_proc().data_mut() };
        Ok(self.vm.copy_out(data.space_mut(), dst, src)?)
    }

    /// Fills `dst` from user address `src` in the current process
    /// # Errors
    /// `BadAddress` if `src` is not mapped
    pub fn copy_in_user(&self, dst: &mut [u8], src: usize) -> Result<(), KernelError> {
        let data = self.my_proc().data();
        Ok(self.vm.copy_in(data.space(), dst, src)?)
    }

    /// Copies to either a user address or a kernel buffer
    /// # Errors
    /// `BadAddress` if a user destination is not mapped or a kernel one is too short
    pub fn either_copy_out(&self, dst: Destination<'_>, src: &[u8]) -> Result<(), KernelError> {
        match dst {
            Destination::User(addr) => self.copy_out_user(addr, src),
            Destination::Kernel(buf) => {
                buf.get_mut(..src.len())
                    .ok_or(KernelError::BadAddress)?
                    .copy_from_slice(src);
                Ok(())
            }
        }
    }

    /// Copies from either a user address or a kernel buffer
    /// # Errors
    /// `BadAddress` if a user source is not mapped or a kernel one is too short
    pub fn either_copy_in(&self, dst: &mut [u8], src: Source<'_>) -> Result<(), KernelError> {
        match src {
            Source::User(addr) => self.copy_in_user(dst, addr),
            Source::Kernel(buf) => {
                dst.copy_from_slice(buf.get(..dst.len()).ok_or(KernelError::BadAddress)?);
                Ok(())
            }
        }
    }
}

/// Where copied bytes go
#[derive(Debug)]
pub enum Destination<'a> {
    User(usize),
    Kernel(&'a mut [u8]),
}

/// Where copied bytes come from
#[derive(Debug, Clone, Copy)]
pub enum Source<'a> {
    User(usize),
    Kernel(&'a [u8]),
}
