//! Ember core: task lifecycle and scheduling
//!
//! Architecture-independent half of the kernel. It owns the PCB registry,
//! the round-robin scheduler, fork/exit, threads, block/unblock and stack
//! growth. Page tables are reached through [`mm::AddressSpaces`], and
//! context switches are handed back to the caller as [`sched::Dispatch`]
//! values, so the whole crate runs (and is tested) on the host.

#![no_std]

#[cfg(test)]
extern crate std;

extern crate alloc;

pub mod config;
pub mod context;
pub mod error;
pub mod kernel;
pub mod mm;
pub mod process;
pub mod sched;
pub mod stack;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod thread;

#[cfg(test)]
mod testing;

pub use config::{KernelConfig, MemoryLayout};
pub use error::{KernelError, KernelResult};
pub use kernel::Kernel;
pub use process::ProcessImage;
pub use sched::Dispatch;
pub use syscall::SyscallOutcome;
pub use task::{Pid, TaskHandle, TaskStatus, Tid};
