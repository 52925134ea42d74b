//! Ember Application Binary Interface
//!
//! Shared between the kernel and user programs. A syscall is issued with
//! `int 0x80`: `eax` holds the number, `ebx`/`ecx`/`edx` the arguments, and
//! the result comes back in `eax` (negative values are `-errno`).

#![no_std]

/// Syscall numbers
///
/// The classic calls keep their i386 Linux numbers; the thread and
/// synchronization calls live in a private range.
pub mod numbers {
    pub const SYS_EXIT: usize = 1;
    pub const SYS_FORK: usize = 2;
    pub const SYS_GETPID: usize = 20;
    pub const SYS_YIELD: usize = 158;
    pub const SYS_GETTID: usize = 224;

    pub const SYS_CREATE_THREAD: usize = 400;
    pub const SYS_EXIT_THREAD: usize = 401;
    pub const SYS_BLOCK: usize = 402;
    pub const SYS_UNBLOCK: usize = 403;
}

/// Error numbers returned (negated) from syscalls
pub mod errno {
    pub const ESRCH: isize = 3;
    pub const EAGAIN: isize = 11;
    pub const ENOMEM: isize = 12;
    pub const EFAULT: isize = 14;
    pub const EINVAL: isize = 22;
    pub const ENOSYS: isize = 38;
}

/// Interrupt vector used for system calls
pub const SYSCALL_VECTOR: u8 = 0x80;
