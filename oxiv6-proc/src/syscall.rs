//! System call dispatch for the process-management calls.
//!
//! Arguments arrive in `a0..a2` of the caller's trapframe and the number in `a7`; the result
//! goes back in `a0`, with any error flattened to -1.

use crate::error::KernelError;
use crate::kernel::{Kernel, Machine};
use crate::proc::Pid;
use log::warn;
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, PartialEq, Eq, Copy, Clone, IntoPrimitive, TryFromPrimitive)]
#[repr(usize)]
pub enum SyscallNumber {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Pipe = 4,
    Read = 5,
    Kill = 6,
    Dup = 10,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Write = 16,
    Close = 21,
}

impl<M: Machine> Kernel<M> {
    /// Handles the system call the current process trapped with
    pub fn syscall(&'static self) {
        let (number, args) = self.with_trapframe(|tf| (tf.a7, [tf.a0, tf.a1, tf.a2]));

        let result = match SyscallNumber::try_from(number) {
            Ok(number) => self.dispatch(number, args),
            Err(_) => {
                let proc = self.my_proc();
                warn!(
                    "{} {}: unknown sys call {}",
                    proc.pid(),
                    proc.data().name,
                    number
                );
                Err(KernelError::InvalidArgument)
            }
        };

        let value = match result {
            #[allow(clippy::cast_possible_wrap)]
            Ok(value) => value as isize,
            Err(_) => -1,
        };
        self.with_trapframe(|tf| tf.a0 = value as usize);
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn dispatch(&'static self, number: SyscallNumber, args: [usize; 3]) -> Result<usize, KernelError> {
        let [a0, a1, a2] = args;
        match number {
            SyscallNumber::Fork => self.sys_fork(),
            SyscallNumber::Exit => self.sys_exit(a0 as i32),
            SyscallNumber::Wait => self.sys_wait(a0),
            SyscallNumber::Pipe => self.sys_pipe(a0),
            SyscallNumber::Read => self.sys_read(a0, a1, a2),
            SyscallNumber::Kill => self.sys_kill(a0),
            SyscallNumber::Dup => self.sys_dup(a0),
            SyscallNumber::Getpid => Ok(self.getpid().as_usize()),
            SyscallNumber::Sbrk => self.sys_sbrk(a0 as isize),
            SyscallNumber::Sleep => self.sys_sleep(a0),
            SyscallNumber::Uptime => Ok(self.uptime() as usize),
            SyscallNumber::Write => self.sys_write(a0, a1, a2),
            SyscallNumber::Close => self.sys_close(a0),
        }
    }

    /// # Errors
    /// See [`Kernel::fork`]
    pub fn sys_fork(&'static self) -> Result<usize, KernelError> {
        self.fork().map(Pid::as_usize)
    }

    pub fn sys_exit(&self, status: i32) -> ! {
        self.exit(status)
    }

    /// Reaps a child, storing its exit status at `status_addr` unless that is 0
    /// # Errors
    /// See [`Kernel::wait`]
    pub fn sys_wait(&self, status_addr: usize) -> Result<usize, KernelError> {
        let status_addr = (status_addr != 0).then_some(status_addr);
        self.wait(status_addr).map(Pid::as_usize)
    }

    /// Creates a pipe, storing the read and write descriptors as two `i32`s at `fds_addr`
    /// # Errors
    /// Out of files or descriptors, or `fds_addr` is not writable; nothing stays open
    pub fn sys_pipe(&self, fds_addr: usize) -> Result<usize, KernelError> {
        let (read_end, write_end) = self.pipe_alloc()?;

        let read_fd = match self.fd_alloc(read_end) {
            Ok(fd) => fd,
            Err(read_end) => {
                self.file_close(read_end);
                self.file_close(write_end);
                return Err(KernelError::OutOfFiles);
            }
        };
        let write_fd = match self.fd_alloc(write_end) {
            Ok(fd) => fd,
            Err(write_end) => {
                self.file_close(self.fd_take(read_fd)?);
                self.file_close(write_end);
                return Err(KernelError::OutOfFiles);
            }
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let copied = self
            .copy_out_user(fds_addr, &(read_fd as i32).to_le_bytes())
            .and_then(|()| self.copy_out_user(fds_addr + 4, &(write_fd as i32).to_le_bytes()));
        if let Err(err) = copied {
            self.file_close(self.fd_take(read_fd)?);
            self.file_close(self.fd_take(write_fd)?);
            return Err(err);
        }
        Ok(0)
    }

    /// # Errors
    /// See [`Kernel::file_read`]
    pub fn sys_read(&self, fd: usize, addr: usize, n: usize) -> Result<usize, KernelError> {
        let file = self.fd_file(fd)?;
        self.file_read(file, addr, n)
    }

    /// # Errors
    /// See [`Kernel::file_write`]
    pub fn sys_write(&self, fd: usize, addr: usize, n: usize) -> Result<usize, KernelError> {
        let file = self.fd_file(fd)?;
        self.file_write(file, addr, n)
    }

    /// # Errors
    /// `BadFileDescriptor` if `fd` is not open
    pub fn sys_close(&self, fd: usize) -> Result<usize, KernelError> {
        let file = self.fd_take(fd)?;
        self.file_close(file);
        Ok(0)
    }

    /// # Errors
    /// `BadFileDescriptor` if `fd` is not open, `OutOfFiles` if no descriptor is free
    pub fn sys_dup(&self, fd: usize) -> Result<usize, KernelError> {
        let file = self.file_dup(self.fd_file(fd)?);
        self.fd_alloc(file).map_err(|file| {
            self.file_close(file);
            KernelError::OutOfFiles
        })
    }

    /// # Errors
    /// See [`Kernel::kill`]
    pub fn sys_kill(&self, pid: usize) -> Result<usize, KernelError> {
        self.kill(Pid::new(pid)).map(|()| 0)
    }

    /// Grows memory by `delta` bytes, returning the previous size
    /// # Errors
    /// See [`Kernel::grow`]
    pub fn sys_sbrk(&self, delta: isize) -> Result<usize, KernelError> {
        let old_size = self.my_proc().data().size;
        self.grow(delta)?;
        Ok(old_size)
    }

    /// # Errors
    /// See [`Kernel::sleep_ticks`]
    pub fn sys_sleep(&self, ticks: usize) -> Result<usize, KernelError> {
        self.sleep_ticks(ticks as u64).map(|()| 0)
    }
}
