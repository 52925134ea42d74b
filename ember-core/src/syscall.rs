//! Syscall decoding
//!
//! Turns a trapped `(eax, ebx, ecx, edx)` tuple into a kernel operation and
//! a result word. The switch (if any) is left to the caller, which must
//! store `result` in the caller's frame *before* switching away.

use ember_abi::{errno, numbers};

use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::mm::AddressSpaces;
use crate::sched::Dispatch;

/// What the trap handler has to do after a syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallOutcome {
    /// Value for `eax` (negative errno on failure)
    pub result: isize,
    pub dispatch: Option<Dispatch>,
}

impl SyscallOutcome {
    fn value(result: isize) -> Self {
        Self { result, dispatch: None }
    }

    fn from_result(result: KernelResult<isize>) -> Self {
        Self::value(result.unwrap_or_else(|error| error.as_syscall_result()))
    }

    fn switch(result: isize, dispatch: Option<Dispatch>) -> Self {
        Self { result, dispatch }
    }
}

impl<M: AddressSpaces> Kernel<M> {
    /// Main syscall dispatcher
    pub fn syscall(&mut self, nr: usize, arg0: usize, arg1: usize, arg2: usize) -> SyscallOutcome {
        log::trace!(
            "[Syscall] pid {} tid {}: {} ({:#x}, {:#x}, {:#x})",
            self.getpid(),
            self.gettid(),
            nr,
            arg0,
            arg1,
            arg2
        );
        match nr {
            numbers::SYS_FORK => SyscallOutcome::from_result(self.fork().map(|pid| pid as isize)),
            numbers::SYS_EXIT => SyscallOutcome::switch(0, self.exit()),
            numbers::SYS_CREATE_THREAD => {
                SyscallOutcome::from_result(self.create_thread(arg0, arg1, arg2).map(|tid| tid as isize))
            }
            numbers::SYS_EXIT_THREAD => SyscallOutcome::switch(0, self.exit_thread()),
            numbers::SYS_BLOCK => SyscallOutcome::switch(0, self.block()),
            numbers::SYS_UNBLOCK => SyscallOutcome::from_result(self.unblock(arg0 as u32).map(|()| 0)),
            numbers::SYS_YIELD => SyscallOutcome::switch(0, self.yield_now()),
            numbers::SYS_GETPID => SyscallOutcome::value(self.getpid() as isize),
            numbers::SYS_GETTID => SyscallOutcome::value(self.gettid() as isize),
            _ => SyscallOutcome::value(-errno::ENOSYS),
        }
    }
}
