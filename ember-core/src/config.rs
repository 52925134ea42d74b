//! Kernel tunables and user address-space layout

use crate::mm::PAGE_SIZE;

/// Default time slice (in timer ticks)
pub const DEFAULT_QUANTUM: u32 = 5;

/// Default number of PCB slots, not counting the idle task
pub const DEFAULT_TASK_CAPACITY: usize = 64;

/// Fixed virtual layout shared by every user process.
///
/// ```text
/// 0x0000_0000 .. user_base          kernel, identity mapped, shared by all roots
/// code_start  .. +code_pages        program image, shared read-only across fork
/// data_start  .. +data_pages        data + initial stack, copied on fork
/// thread_stack_base ..              per-thread stack windows, mapped lazily
/// scratch                           one page used to reach foreign frames
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub user_base: usize,
    pub code_start: usize,
    pub code_pages: usize,
    pub data_start: usize,
    pub data_pages: usize,
    pub thread_stack_base: usize,
    pub scratch: usize,
}

impl MemoryLayout {
    /// One past the last byte of the data + stack window (initial stack top)
    pub fn data_end(&self) -> usize {
        self.data_start + self.data_pages * PAGE_SIZE
    }

    pub fn code_end(&self) -> usize {
        self.code_start + self.code_pages * PAGE_SIZE
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            user_base: 0x0040_0000,
            code_start: 0x0040_0000,
            code_pages: 1024,
            data_start: 0x0080_0000,
            data_pages: 16,
            thread_stack_base: 0x4000_0000,
            scratch: 0xFFBF_F000,
        }
    }
}

/// Everything the core needs to know that is not discovered at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of schedulable PCBs (the idle task is extra)
    pub task_capacity: usize,
    /// Ticks a task may run before it is preempted
    pub quantum: u32,
    /// Size of every PCB's kernel stack, in machine words
    pub kernel_stack_words: usize,
    /// TID slots per process; slot 0 is never used, slot 1 is the initial thread
    pub tid_capacity: usize,
    /// Pages reserved for each thread stack window
    pub thread_stack_pages: usize,
    /// Pages mapped eagerly at the top of a new thread stack
    pub initial_stack_pages: usize,
    /// Address of the stub that restores a `UserFrame` and drops to ring 3
    pub user_return: usize,
    pub layout: MemoryLayout,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            task_capacity: DEFAULT_TASK_CAPACITY,
            quantum: DEFAULT_QUANTUM,
            kernel_stack_words: 1024,
            tid_capacity: 32,
            thread_stack_pages: 16,
            initial_stack_pages: 1,
            user_return: 0,
            layout: MemoryLayout::default(),
        }
    }
}
