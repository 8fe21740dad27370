//! The file system collaborator.
//!
//! The process core never looks inside an inode: it takes references, drops them, and moves
//! bytes in and out for inode-backed open files.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    Io,
}

pub trait Fs: Send + Sync + 'static {
    /// A counted reference to an in-memory inode
    type Inode: Send + Sync;

    /// Called once, from the first process to run, since initialization may need to sleep
    fn init(&self);

    /// Resolves `path` to a new inode reference
    fn lookup(&self, path: &str) -> Result<Self::Inode, FsError>;

    /// Takes another reference to `inode`
    fn dup(&self, inode: &Self::Inode) -> Self::Inode;

    /// Drops a reference, freeing the inode once nothing refers to it
    fn put(&self, inode: Self::Inode);

    fn read(&self, inode: &Self::Inode, offset: usize, dst: &mut [u8]) -> Result<usize, FsError>;

    fn write(&self, inode: &Self::Inode, offset: usize, src: &[u8]) -> Result<usize, FsError>;
}
