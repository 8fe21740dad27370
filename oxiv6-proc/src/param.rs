//! Compile-time kernel parameters

/// Maximum number of processes
pub const NPROC: usize = 64;
/// Maximum number of CPUs
pub const NCPU: usize = 8;
/// Open files per process
pub const NOFILE: usize = 16;
/// Open files per system
pub const NFILE: usize = 100;
/// Bytes buffered by a pipe before writers block
pub const PIPESIZE: usize = 512;
/// Maximum file path name
pub const MAXPATH: usize = 128;
/// The size of pages used in oxiv6
pub const PAGE_SIZE: usize = 4096;
/// Size of each process's kernel stack
pub const KSTACK_SIZE: usize = PAGE_SIZE;
/// Name given to the first user process
pub const INIT_NAME: &str = "initcode";
/// Where the first user process starts out
pub const ROOT_PATH: &str = "/";
