use alloc::boxed::Box;
use ember_core::mm::AddressSpaces;
use ember_core::Kernel;
use lazy_static::lazy_static;
use spin::{Mutex, Once};

use crate::Platform;

/// Page-table backend chosen by the boot code
pub type BootMemory = Box<dyn AddressSpaces + Send>;

lazy_static! {
    pub static ref KERNEL: Mutex<Option<Kernel<BootMemory>>> = Mutex::new(None);
}

pub static PLATFORM: Once<Platform> = Once::new();

/// Run `f` against the kernel with the lock held.
///
/// Returns `None` before [`crate::init`]. Never switch context inside `f`:
/// hand the [`ember_core::Dispatch`] out and switch after the lock is gone.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel<BootMemory>) -> R) -> Option<R> {
    let mut guard = KERNEL.lock();
    guard.as_mut().map(f)
}
