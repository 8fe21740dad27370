#![cfg_attr(not(test), no_std)]

/*
   Copyright 2024 Claire Moore

   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

       http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

extern crate alloc;

pub mod arch;
mod clock;
pub mod error;
pub mod file;
pub mod fs;
mod kalloc;
pub mod kernel;
pub mod param;
pub mod pipe;
#[cfg(target_arch = "riscv64")]
pub mod println;
pub mod proc;
pub mod spinlock;
pub mod syscall;
pub mod vm;

pub use error::KernelError;
pub use kernel::{Kernel, Machine};
pub use proc::{Channel, Destination, Pid, ProcState, Source};
