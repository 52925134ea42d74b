//! Ember kernel glue
//!
//! Holds the one [`Kernel`] instance and connects it to the machine: the
//! syscall, timer and page-fault entry points, the context-switch primitive
//! and (on i386) the page-table backend. Boot code (GDT/IDT/TSS set-up,
//! frame discovery) calls [`init`] once and then parks in [`idle_loop`],
//! which becomes the idle task.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod globals;
pub mod interrupts;
pub mod multitasking;
pub mod syscall;

#[cfg(target_arch = "x86")]
pub mod mm;

use ember_core::{Kernel, KernelConfig, KernelResult, Pid, ProcessImage};

pub use globals::BootMemory;

/// Services the boot code owns but the scheduler needs
#[derive(Clone, Copy)]
pub struct Platform {
    /// Load the ring-0 stack pointer used on the next trap from user mode
    pub set_kernel_stack: fn(usize),
}

/// Build the task core, load the init image and publish the kernel.
///
/// The calling thread becomes the idle task; init runs from the first
/// timer tick onward.
pub fn init(config: KernelConfig, memory: BootMemory, platform: Platform, image: &ProcessImage<'_>) -> KernelResult<Pid> {
    #[cfg(target_arch = "x86")]
    let config = KernelConfig {
        user_return: multitasking::user_return_address(),
        ..config
    };

    log::info!("[Kernel] Initializing task core...");
    let mut kernel = Kernel::new(config, memory);
    let pid = kernel.spawn_init(image)?;

    globals::PLATFORM.call_once(|| platform);
    *globals::KERNEL.lock() = Some(kernel);
    log::info!("[Kernel] init is pid {}", pid);
    Ok(pid)
}

/// Body of the idle task: wait for interrupts forever
pub fn idle_loop() -> ! {
    loop {
        #[cfg(target_arch = "x86")]
        unsafe {
            core::arch::asm!("sti", "hlt", options(nomem, nostack));
        }
        #[cfg(not(target_arch = "x86"))]
        core::hint::spin_loop();
    }
}
