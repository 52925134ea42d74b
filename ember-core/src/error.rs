//! Kernel error kinds

use core::fmt::Display;

use ember_abi::errno;

/// Why a lifecycle operation was refused.
///
/// Every operation that returns one of these has already undone its own
/// partial work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Free queue, TID table or frame pool exhausted
    NoMemory,
    /// Frames ran out part-way through a fork
    TryAgain,
    /// Null or otherwise unusable argument
    InvalidArgument,
    /// Address not accessible to the caller, or a fault outside the stack contract
    BadAddress,
    /// Target process is not a child of the caller
    NoSuchProcess,
}

pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Positive errno value for this error
    pub fn errno(self) -> isize {
        match self {
            KernelError::NoMemory => errno::ENOMEM,
            KernelError::TryAgain => errno::EAGAIN,
            KernelError::InvalidArgument => errno::EINVAL,
            KernelError::BadAddress => errno::EFAULT,
            KernelError::NoSuchProcess => errno::ESRCH,
        }
    }

    /// Value handed back to user space in `eax`
    pub fn as_syscall_result(self) -> isize {
        -self.errno()
    }
}

impl Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let message = match self {
            KernelError::NoMemory => "out of memory",
            KernelError::TryAgain => "resource temporarily unavailable",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::BadAddress => "bad address",
            KernelError::NoSuchProcess => "no such process",
        };
        write!(f, "{} ({})", message, self.errno())
    }
}

impl core::error::Error for KernelError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn errors_map_to_negative_errno() {
        assert_eq!(KernelError::NoMemory.as_syscall_result(), -12);
        assert_eq!(KernelError::TryAgain.as_syscall_result(), -11);
        assert_eq!(KernelError::NoSuchProcess.as_syscall_result(), -3);
        assert_eq!(KernelError::BadAddress.to_string(), "bad address (14)");
    }
}
