//! Syscall entry glue

use ember_core::Dispatch;

use crate::globals;

pub use ember_abi::numbers;

/// Main syscall dispatcher
///
/// Runs the call under the kernel lock and returns the value for `eax`
/// together with the switch it asked for. The trap stub must store the
/// value in the user frame before acting on the switch.
pub fn dispatch(nr: usize, arg0: usize, arg1: usize, arg2: usize) -> (isize, Option<Dispatch>) {
    match globals::with_kernel(|kernel| kernel.syscall(nr, arg0, arg1, arg2)) {
        Some(outcome) => (outcome.result, outcome.dispatch),
        None => {
            log::error!("[Syscall] {} before the kernel is up", nr);
            (-ember_abi::errno::ENOSYS, None)
        }
    }
}
