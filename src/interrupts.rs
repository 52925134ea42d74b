//! Timer and page-fault hooks
//!
//! The IDT stubs that land here belong to the boot code. Each hook takes the
//! kernel lock, asks the core what to do, drops the lock and only then
//! switches.

use log::{error, warn};

use crate::globals;
use crate::multitasking::resume;

/// Timer tick: account the quantum and preempt if it ran out
pub fn timer_interrupt() {
    // Ticks that race a syscall holding the lock are dropped.
    let dispatch = match globals::KERNEL.try_lock() {
        Some(mut guard) => guard.as_mut().and_then(|kernel| kernel.tick()),
        None => None,
    };
    if let Some(dispatch) = dispatch {
        resume(dispatch);
    }
}

/// Page fault at `addr` while in user mode
///
/// A fault one page below a thread's stack grows it. Anything else kills
/// the faulting process.
pub fn page_fault(addr: usize) {
    let grown = match globals::with_kernel(|kernel| kernel.grow_stack(addr)) {
        Some(grown) => grown,
        None => panic!("[EXCEPTION] PAGE FAULT at {:#x} before the kernel is up", addr),
    };
    let Err(reason) = grown else {
        return;
    };

    warn!("[Fault] {:#x}: {}, killing the process", addr, reason);
    match globals::with_kernel(|kernel| kernel.exit()).flatten() {
        Some(dispatch) => resume(dispatch),
        None => error!("[Fault] exit produced no switch"),
    }
}
