//! Open files and per-process descriptor tables.
//!
//! An open file is shared by reference count between every descriptor that names it, across
//! `dup` and `fork`; the underlying pipe end or inode is released when the last one goes away.

use crate::error::KernelError;
use crate::fs::Fs;
use crate::kernel::{Inode, Kernel, Machine};
use crate::param::{NFILE, NOFILE};
use crate::pipe::Pipe;
use crate::proc::{Channel, Destination, Source};
use crate::spinlock::Spinlock;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::Ordering;
use log::{trace, warn};

/// Bytes moved per step of an inode transfer. The staging buffer lives on the kernel stack.
const CHUNK: usize = 512;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

pub enum FileKind<M: Machine> {
    Pipe(Arc<Pipe>),
    Inode {
        inode: Inode<M>,
        cursor: Spinlock<Cursor>,
    },
}

/// Offset of an inode-backed open file. A transfer marks it busy from the moment it reads the
/// offset until it has advanced it, so sharers of the file never start at the same offset.
#[derive(Debug, Default)]
pub struct Cursor {
    offset: usize,
    busy: bool,
}

pub struct OpenFile<M: Machine> {
    kind: FileKind<M>,
    mode: OpenMode,
}

/// A reference to an open file
pub struct File<M: Machine>(Arc<OpenFile<M>>);

impl<M: Machine> Clone for File<M> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<M: Machine> File<M> {
    #[inline]
    pub fn mode(&self) -> OpenMode {
        self.0.mode
    }

    #[inline]
    pub fn kind(&self) -> &FileKind<M> {
        &self.0.kind
    }
}

impl<M: Machine> core::fmt::Debug for File<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match self.kind() {
            FileKind::Pipe(_) => "pipe",
            FileKind::Inode { .. } => "inode",
        };
        f.debug_struct("File")
            .field("kind", &kind)
            .field("mode", &self.mode())
            .field("refs", &Arc::strong_count(&self.0))
            .finish()
    }
}

impl<M: Machine> Kernel<M> {
    /// Reserves one of the NFILE system-wide open file entries
    fn file_reserve(&self) -> Result<(), KernelError> {
        self.open_files
            .try_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < NFILE).then_some(open + 1)
            })
            .map(|_| ())
            .map_err(|_| {
                warn!("file table full");
                KernelError::OutOfFiles
            })
    }

    /// Opens a new file, counting against the system-wide table
    /// # Errors
    /// `OutOfFiles` if the table is full
    pub(crate) fn file_alloc(
        &self,
        kind: FileKind<M>,
        mode: OpenMode,
    ) -> Result<File<M>, KernelError> {
        self.file_reserve()?;
        Ok(File(Arc::new(OpenFile { kind, mode })))
    }

    /// Opens `inode` at offset 0, taking over the caller's reference to it
    /// # Errors
    /// `OutOfFiles` if the table is full, in which case the inode reference is put back
    pub fn file_open_inode(&self, inode: Inode<M>, mode: OpenMode) -> Result<File<M>, KernelError> {
        if let Err(err) = self.file_reserve() {
            self.fs.put(inode);
            return Err(err);
        }
        let kind = FileKind::Inode {
            inode,
            cursor: Spinlock::new("file", self.arch, Cursor::default()),
        };
        Ok(File(Arc::new(OpenFile { kind, mode })))
    }

    /// Another reference to the same open file
    pub fn file_dup(&self, file: &File<M>) -> File<M> {
        file.clone()
    }

    /// Drops a reference; the last one closes the underlying object
    pub fn file_close(&self, file: File<M>) {
        let Some(open) = Arc::into_inner(file.0) else {
            return;
        };

        self.open_files.fetch_sub(1, Ordering::AcqRel);
        match open.kind {
            FileKind::Pipe(pipe) => pipe.close(self, open.mode.contains(OpenMode::WRITABLE)),
            FileKind::Inode { inode, .. } => self.fs.put(inode),
        }
    }

    /// Reads up to `n` bytes from `file` to user address `addr`
    /// # Errors
    /// `BadFileDescriptor` if not open for reading, `Killed` if killed while waiting on a pipe,
    /// `BadAddress` if nothing could be copied from an inode
    pub fn file_read(&self, file: &File<M>, addr: usize, n: usize) -> Result<usize, KernelError> {
        if !file.mode().contains(OpenMode::READABLE) {
            return Err(KernelError::BadFileDescriptor);
        }

        match file.kind() {
            FileKind::Pipe(pipe) => pipe.read(self, addr, n),
            FileKind::Inode { inode, cursor } => {
                let start = self.cursor_begin(cursor);
                let read = self.inode_read(inode, start, addr, n);
                self.cursor_end(cursor, read.as_ref().map_or(0, |read| *read));
                trace!("file_read: {:?} at offset {}", read, start);
                read
            }
        }
    }

    /// Writes `n` bytes from user address `addr` to `file`
    /// # Errors
    /// `BadFileDescriptor` if not open for writing, `BrokenPipe` if the read side is gone,
    /// `Killed` if killed while waiting on a full pipe
    pub fn file_write(&self, file: &File<M>, addr: usize, n: usize) -> Result<usize, KernelError> {
        if !file.mode().contains(OpenMode::WRITABLE) {
            return Err(KernelError::BadFileDescriptor);
        }

        match file.kind() {
            FileKind::Pipe(pipe) => pipe.write(self, addr, n),
            FileKind::Inode { inode, cursor } => {
                let start = self.cursor_begin(cursor);
                let written = self.inode_write(inode, start, addr, n);
                self.cursor_end(cursor, written.as_ref().map_or(0, |written| *written));
                written
            }
        }
    }

    /// Waits for exclusive use of an inode file's offset and returns it
    fn cursor_begin(&self, cursor: &Spinlock<Cursor>) -> usize {
        let mut guard = cursor.lock();
        while guard.busy {
            guard = self.sleep(Channel::of(cursor), guard);
        }
        guard.busy = true;
        guard.offset
    }

    fn cursor_end(&self, cursor: &Spinlock<Cursor>, moved: usize) {
        let mut guard = cursor.lock();
        guard.offset += moved;
        guard.busy = false;
        drop(guard);
        self.wakeup(Channel::of(cursor));
    }

    /// Copies up to `n` bytes at `start` out to user address `addr`, one chunk at a time.
    /// Stops at end of file or at the first failure after some bytes have moved.
    fn inode_read(
        &self,
        inode: &Inode<M>,
        start: usize,
        addr: usize,
        n: usize,
    ) -> Result<usize, KernelError> {
        let mut buf = [0; CHUNK];
        let mut total = 0;

        while total < n {
            let chunk = (n - total).min(CHUNK);
            let read = match self.fs.read(inode, start + total, &mut buf[..chunk]) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if total == 0 => return Err(err.into()),
                Err(_) => break,
            };
            if let Err(err) = self.either_copy_out(Destination::User(addr + total), &buf[..read]) {
                if total == 0 {
                    return Err(err);
                }
                break;
            }
            total += read;
            if read < chunk {
                break;
            }
        }
        Ok(total)
    }

    /// Copies up to `n` bytes from user address `addr` into the inode at `start`, one chunk at
    /// a time. Stops at a short write or at the first failure after some bytes have moved.
    fn inode_write(
        &self,
        inode: &Inode<M>,
        start: usize,
        addr: usize,
        n: usize,
    ) -> Result<usize, KernelError> {
        let mut buf = [0; CHUNK];
        let mut total = 0;

        while total < n {
            let chunk = (n - total).min(CHUNK);
            if let Err(err) = self.either_copy_in(&mut buf[..chunk], Source::User(addr + total)) {
                if total == 0 {
                    return Err(err);
                }
                break;
            }
            let written = match self.fs.write(inode, start + total, &buf[..chunk]) {
                Ok(written) => written,
                Err(err) if total == 0 => return Err(err.into()),
                Err(_) => break,
            };
            total += written;
            if written < chunk {
                break;
            }
        }
        Ok(total)
    }

    /// Installs `file` in the lowest free descriptor of the current process
    /// # Errors
    /// Hands `file` back if the descriptor table is full
    pub fn fd_alloc(&self, file: File<M>) -> Result<usize, File<M>> {
        let data = unsafe { self.my_proc().data_mut() };
        match data.open_files.iter().position(Option::is_none) {
            Some(fd) => {
                data.open_files[fd] = Some(file);
                Ok(fd)
            }
            None => Err(file),
        }
    }

    /// The open file behind descriptor `fd` of the current process
    /// # Errors
    /// `BadFileDescriptor` if `fd` is out of range or not open
    pub fn fd_file(&self, fd: usize) -> Result<&File<M>, KernelError> {
        self.my_proc()
            .data()
            .open_files
            .get(fd)
            .and_then(Option::as_ref)
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Removes descriptor `fd` from the current process, handing back its file
    /// # Errors
    /// `BadFileDescriptor` if `fd` is out of range or not open
    pub fn fd_take(&self, fd: usize) -> Result<File<M>, KernelError> {
        let data = unsafe { self.my_proc().data_mut() };
        data.open_files
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(KernelError::BadFileDescriptor)
    }
}

const _: () = assert!(NOFILE <= NFILE);
