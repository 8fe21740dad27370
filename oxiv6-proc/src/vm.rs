//! The virtual memory collaborator.
//!
//! Page tables, user memory and kernel stacks are owned by the implementation of [`Vm`]; the
//! process core only holds an opaque [`Vm::AddressSpace`] per process and its size.

use crate::proc::TrapFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    OutOfMemory,
    /// The user virtual address is not mapped, or not accessible
    BadAddress,
}

pub trait Vm: Send + Sync + 'static {
    type AddressSpace: Send;

    /// Lowest address of the kernel stack reserved for process slot `slot`
    fn kernel_stack(&self, slot: usize) -> usize;

    /// Creates an address space with no user memory, but with the trap-handling code page and
    /// `trapframe` mapped at the reserved high addresses.
    fn create(&self, trapframe: &TrapFrame) -> Result<Self::AddressSpace, VmError>;

    /// Copies the first `size` bytes of user memory in `from` into `to`, page tables and contents
    fn copy(
        &self,
        from: &Self::AddressSpace,
        to: &mut Self::AddressSpace,
        size: usize,
    ) -> Result<(), VmError>;

    /// Grows or shrinks user memory from `old_size` to `new_size` bytes, returning the new size
    fn resize(
        &self,
        space: &mut Self::AddressSpace,
        old_size: usize,
        new_size: usize,
    ) -> Result<usize, VmError>;

    /// Frees user memory, the page tables, and unmaps the trap pages
    fn destroy(&self, space: Self::AddressSpace, size: usize);

    /// Copies `src` to user virtual address `dst`
    fn copy_out(
        &self,
        space: &mut Self::AddressSpace,
        dst: usize,
        src: &[u8],
    ) -> Result<(), VmError>;

    /// Fills `dst` from user virtual address `src`
    fn copy_in(&self, space: &Self::AddressSpace, dst: &mut [u8], src: usize)
        -> Result<(), VmError>;
}
