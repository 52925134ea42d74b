#![no_std]
#![no_main]

use core::arch::asm;
use core::panic::PanicInfo;

use ember_abi::numbers::*;

/// Minimal Syscall Wrapper (i386 `int 0x80`: eax = nr, ebx/ecx/edx = args)
unsafe fn syscall3(nr: usize, arg0: usize, arg1: usize, arg2: usize) -> isize {
    let ret: isize;
    // ebx is reserved by LLVM on i386, so swap it in and out by hand.
    asm!(
        "xchg {arg0}, ebx",
        "int 0x80",
        "xchg {arg0}, ebx",
        arg0 = inout(reg) arg0 => _,
        inlateout("eax") nr as isize => ret,
        in("ecx") arg1,
        in("edx") arg2,
    );
    ret
}

unsafe fn syscall0(nr: usize) -> isize {
    syscall3(nr, 0, 0, 0)
}

/// Threads return here when their entry function returns
extern "C" fn thread_exit() -> ! {
    unsafe { syscall0(SYS_EXIT_THREAD) };
    loop {}
}

extern "C" fn worker(_arg: usize) -> usize {
    for _ in 0..3 {
        unsafe { syscall0(SYS_YIELD) };
    }
    0
}

#[no_mangle]
pub extern "C" fn _start() -> ! {
    unsafe {
        let child = syscall0(SYS_FORK);
        if child == 0 {
            // Child: start a worker, then sleep until the parent wakes us.
            syscall3(SYS_CREATE_THREAD, worker as usize, 0, thread_exit as usize);
            syscall0(SYS_BLOCK);
            syscall0(SYS_EXIT);
        }
        if child > 0 {
            // An early wakeup is remembered, so ordering does not matter.
            syscall3(SYS_UNBLOCK, child as usize, 0, 0);
        }
        loop {
            syscall0(SYS_YIELD);
        }
    }
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    loop {}
}
