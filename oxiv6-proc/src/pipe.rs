//! Bounded in-kernel byte channel between two file ends.
//!
//! Readers sleep on the read count, writers on the write count. Both counts only ever grow
//! (wrapping), so `nwrite - nread` is the number of buffered bytes and positions are taken
//! modulo [`PIPESIZE`].

use crate::arch::Interrupts;
use crate::error::KernelError;
use crate::file::{File, FileKind, OpenMode};
use crate::kernel::{Kernel, Machine};
use crate::param::PIPESIZE;
use crate::proc::Channel;
use crate::spinlock::Spinlock;
use alloc::sync::Arc;
use log::{debug, trace};

pub struct PipeState {
    data: [u8; PIPESIZE],
    /// Number of bytes read
    nread: usize,
    /// Number of bytes written
    nwrite: usize,
    read_open: bool,
    write_open: bool,
}

impl PipeState {
    const fn new() -> Self {
        Self {
            data: [0; PIPESIZE],
            nread: 0,
            nwrite: 0,
            read_open: true,
            write_open: true,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nwrite.wrapping_sub(self.nread)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == PIPESIZE
    }

    fn push(&mut self, byte: u8) {
        assert!(!self.is_full(), "pipe push: full");
        self.data[self.nwrite % PIPESIZE] = byte;
        self.nwrite = self.nwrite.wrapping_add(1);
    }

    fn peek(&self) -> Option<u8> {
        (!self.is_empty()).then(|| self.data[self.nread % PIPESIZE])
    }

    fn consume(&mut self) {
        assert!(!self.is_empty(), "pipe consume: empty");
        self.nread = self.nread.wrapping_add(1);
    }

    fn read_channel(&self) -> Channel {
        Channel::of(&self.nread)
    }

    fn write_channel(&self) -> Channel {
        Channel::of(&self.nwrite)
    }
}

pub struct Pipe {
    state: Spinlock<PipeState>,
}

impl Pipe {
    pub fn new(interrupts: &'static dyn Interrupts) -> Self {
        Self {
            state: Spinlock::new("pipe", interrupts, PipeState::new()),
        }
    }

    /// Copies `n` bytes from user address `addr` into the pipe, sleeping while it is full.
    /// Stops early, without error, at the first byte that cannot be copied in.
    /// # Errors
    /// `BrokenPipe` once the read end is closed, `Killed` if the writer is asked to terminate
    pub fn write<M: Machine>(
        &self,
        kernel: &Kernel<M>,
        addr: usize,
        n: usize,
    ) -> Result<usize, KernelError> {
        let mut state = self.state.lock();
        let mut written = 0;

        while written < n {
            if !state.read_open {
                return Err(KernelError::BrokenPipe);
            }
            if kernel.killed() {
                return Err(KernelError::Killed);
            }

            if state.is_full() {
                kernel.wakeup(state.read_channel());
                let channel = state.write_channel();
                state = kernel.sleep(channel, state);
            } else {
                let mut byte = [0];
                if kernel.copy_in_user(&mut byte, addr + written).is_err() {
                    break;
                }
                state.push(byte[0]);
                written += 1;
            }
        }

        kernel.wakeup(state.read_channel());
        trace!("pipe write: {} of {} bytes", written, n);
        Ok(written)
    }

    /// Copies up to `n` buffered bytes to user address `addr`, sleeping while the pipe is empty
    /// and the write end is open. Returns 0 at end of stream.
    /// # Errors
    /// `Killed` if the reader is asked to terminate while waiting
    pub fn read<M: Machine>(
        &self,
        kernel: &Kernel<M>,
        addr: usize,
        n: usize,
    ) -> Result<usize, KernelError> {
        let mut state = self.state.lock();

        while state.is_empty() && state.write_open {
            if kernel.killed() {
                return Err(KernelError::Killed);
            }
            let channel = state.read_channel();
            state = kernel.sleep(channel, state);
        }

        let mut read = 0;
        while read < n {
            let Some(byte) = state.peek() else {
                break;
            };
            if kernel.copy_out_user(addr + read, &[byte]).is_err() {
                break;
            }
            state.consume();
            read += 1;
        }

        kernel.wakeup(state.write_channel());
        trace!("pipe read: {} of {} bytes", read, n);
        Ok(read)
    }

    /// Closes one end, waking whoever waits on the other
    pub fn close<M: Machine>(&self, kernel: &Kernel<M>, writable: bool) {
        let mut state = self.state.lock();
        if writable {
            state.write_open = false;
            kernel.wakeup(state.read_channel());
        } else {
            state.read_open = false;
            kernel.wakeup(state.write_channel());
        }
        debug!(
            "pipe close: {} end, read open: {}, write open: {}",
            if writable { "write" } else { "read" },
            state.read_open,
            state.write_open
        );
    }
}

impl<M: Machine> Kernel<M> {
    /// Creates a pipe, returning its read and write ends
    /// # Errors
    /// `OutOfFiles` if the file table cannot hold both ends
    pub fn pipe_alloc(&self) -> Result<(File<M>, File<M>), KernelError> {
        let pipe = Arc::new(Pipe::new(self.arch));

        let read_end = self.file_alloc(FileKind::Pipe(Arc::clone(&pipe)), OpenMode::READABLE)?;
        let write_end = match self.file_alloc(FileKind::Pipe(pipe), OpenMode::WRITABLE) {
            Ok(file) => file,
            Err(err) => {
                self.file_close(read_end);
                return Err(err);
            }
        };

        Ok((read_end, write_end))
    }
}
