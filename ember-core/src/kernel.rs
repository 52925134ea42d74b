//! The kernel object
//!
//! All scheduling state lives in one [`Kernel`] value that every lifecycle
//! operation borrows mutably. The glue crate keeps the single instance.

use crate::config::KernelConfig;
use crate::mm::{AddressSpaces, PageRoot, VirtPage};
use crate::task::registry::Registry;
use crate::task::{Pcb, Pid, TaskHandle, TaskStatus, ThreadGroup, TidTable, IDLE, MASTER_TID};

pub struct Kernel<M: AddressSpaces> {
    pub(crate) config: KernelConfig,
    pub(crate) registry: Registry,
    pub(crate) memory: M,
    pub(crate) current: TaskHandle,
    /// Ticks left in the running task's quantum
    pub(crate) remaining: i64,
    pub(crate) next_pid: Pid,
    pub(crate) kernel_root: PageRoot,
}

impl<M: AddressSpaces> Kernel<M> {
    /// Build the registry and adopt the calling (boot) thread as the idle task.
    ///
    /// The active root at this point becomes the kernel root that idle runs in.
    pub fn new(config: KernelConfig, memory: M) -> Self {
        let kernel_root = memory.active_root();
        let mut registry = Registry::new(config.task_capacity, config.kernel_stack_words, kernel_root);

        let idle = registry.get_mut(IDLE);
        idle.pid = 0;
        idle.tid = MASTER_TID;
        idle.status = TaskStatus::Running;
        idle.quantum = config.quantum;
        idle.group = ThreadGroup {
            tids: TidTable::new(config.tid_capacity, IDLE),
            ..ThreadGroup::default()
        };
        registry.link_sibling(IDLE, IDLE);

        log::info!(
            "[Kernel] task registry ready: {} slots, quantum {} ticks",
            config.task_capacity,
            config.quantum
        );

        Self {
            config,
            registry,
            memory,
            current: IDLE,
            remaining: i64::from(config.quantum),
            next_pid: 1,
            kernel_root,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    pub fn current(&self) -> TaskHandle {
        self.current
    }

    pub fn task(&self, handle: TaskHandle) -> &Pcb {
        self.registry.get(handle)
    }

    pub fn getpid(&self) -> Pid {
        self.task(self.current).pid
    }

    pub fn gettid(&self) -> crate::task::Tid {
        self.task(self.current).tid
    }

    /// Master PCB of the process `handle` belongs to
    pub fn master_of(&self, handle: TaskHandle) -> TaskHandle {
        self.task(handle).master
    }

    /// Next unused pid; wraps at `i32::MAX` so pids stay positive syscall results
    pub(crate) fn allocate_pid(&mut self) -> Pid {
        loop {
            let pid = self.next_pid;
            self.next_pid = match self.next_pid.checked_add(1) {
                Some(next) if next <= i32::MAX as Pid => next,
                _ => 1,
            };
            if self.registry.find_process(pid).is_none() {
                return pid;
            }
        }
    }

    pub(crate) fn scratch_page(&self) -> VirtPage {
        VirtPage::containing(self.config.layout.scratch)
    }

    /// Whether `addr` is mapped user memory in `root`
    pub(crate) fn is_user_address(&self, root: PageRoot, addr: usize) -> bool {
        if addr < self.config.layout.user_base {
            return false;
        }
        match self.memory.translate(root, VirtPage::containing(addr)) {
            Some((_, flags)) => flags.contains(crate::mm::PageFlags::USER),
            None => false,
        }
    }
}
