use crate::error::KernelError;
use alloc::alloc::{alloc, Layout};
use alloc::boxed::Box;
use log::warn;

/// Moves `value` into a fresh kernel heap allocation.
/// Unlike `Box::new`, running out of memory is reported instead of aborting.
pub(crate) fn try_box<T>(value: T) -> Result<Box<T>, KernelError> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Ok(Box::new(value));
    }

    let ptr = unsafe { alloc(layout) }.cast::<T>();
    if ptr.is_null() {
        warn!(
            "try_box: unable to allocate {} bytes aligned to {}",
            layout.size(),
            layout.align()
        );
        return Err(KernelError::OutOfMemory);
    }

    unsafe {
        ptr.write(value);
        Ok(Box::from_raw(ptr))
    }
}
