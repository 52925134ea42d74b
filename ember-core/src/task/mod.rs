//! Task / Process Control Block
//!
//! Every schedulable entity (a process's first thread and each thread it
//! creates later) has its own [`Pcb`]. A process has no record of its own:
//! it is its master PCB plus that PCB's [`ThreadGroup`].

pub mod list;
pub mod registry;

use alloc::vec;
use alloc::vec::Vec;

use crate::context::KernelStack;
use crate::mm::{PageRoot, VirtPage};
use list::{Chain, Link, ListHead};

/// Process ID, shared by all threads of a process
pub type Pid = u32;
/// Thread ID, unique within a process
pub type Tid = u32;

/// TID of a process's initial thread
pub const MASTER_TID: Tid = 1;

/// Stable index of a PCB in the registry arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskHandle(pub(crate) usize);

impl TaskHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// The idle task always occupies the first arena slot
pub const IDLE: TaskHandle = TaskHandle(0);

/// Task State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Ready,
    Blocked,
    /// Parked on the free queue
    Unused,
}

/// A thread's private stack window.
///
/// The whole window is reserved up front; only `[first_mapped, end)` is
/// backed by frames. It grows down one page at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    pub first_page: VirtPage,
    pub total_pages: usize,
    pub mapped_pages: usize,
    pub first_mapped: VirtPage,
}

impl StackRegion {
    /// A fully unmapped window of `total_pages` starting at `first_page`
    pub fn reserve(first_page: VirtPage, total_pages: usize) -> Self {
        Self {
            first_page,
            total_pages,
            mapped_pages: 0,
            first_mapped: first_page.add(total_pages),
        }
    }

    /// One past the last page of the window
    pub fn end(&self) -> VirtPage {
        self.first_page.add(self.total_pages)
    }

    /// Highest user address of the stack (initial stack pointer)
    pub fn top(&self) -> usize {
        self.end().start_address()
    }

    pub fn contains(&self, page: VirtPage) -> bool {
        page >= self.first_page && page < self.end()
    }

    pub fn overlaps(&self, other: &StackRegion) -> bool {
        self.first_page < other.end() && other.first_page < self.end()
    }

    pub fn is_fully_mapped(&self) -> bool {
        self.mapped_pages == self.total_pages
    }

    /// Pages currently backed by frames, lowest first
    pub fn mapped(&self) -> impl Iterator<Item = VirtPage> {
        let first = self.first_mapped.0;
        (first..self.end().0).map(VirtPage)
    }

    /// Record one more page mapped directly below the current bottom
    pub fn extend_down(&mut self) {
        debug_assert!(!self.is_fully_mapped());
        self.first_mapped = VirtPage(self.first_mapped.0 - 1);
        self.mapped_pages += 1;
    }
}

/// TID slots of one process; index is the TID
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TidTable {
    slots: Vec<Option<TaskHandle>>,
}

impl TidTable {
    /// A table for a fresh process whose initial thread is `master`
    pub fn new(capacity: usize, master: TaskHandle) -> Self {
        let mut slots = vec![None; capacity.max(MASTER_TID as usize + 1)];
        slots[MASTER_TID as usize] = Some(master);
        Self { slots }
    }

    /// Hand out the lowest free TID. The master slot only comes free once
    /// its first owner has exited.
    pub fn allocate(&mut self, handle: TaskHandle) -> Option<Tid> {
        let (tid, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .skip(MASTER_TID as usize)
            .find(|(_, slot)| slot.is_none())?;
        *slot = Some(handle);
        Some(tid as Tid)
    }

    pub fn release(&mut self, tid: Tid) {
        if let Some(slot) = self.slots.get_mut(tid as usize) {
            *slot = None;
        }
    }

    pub fn lookup(&self, tid: Tid) -> Option<TaskHandle> {
        self.slots.get(tid as usize).copied().flatten()
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Per-process thread bookkeeping, owned by whichever PCB is master
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadGroup {
    pub members: ListHead,
    pub tids: TidTable,
}

impl ThreadGroup {
    pub fn count(&self) -> usize {
        self.members.len()
    }
}

/// A Process / Thread Control Block
pub struct Pcb {
    pub(crate) handle: TaskHandle,
    pub pid: Pid,
    pub tid: Tid,
    pub status: TaskStatus,
    pub quantum: u32,
    pub kernel_sp: usize,
    pub kernel_stack: KernelStack,
    pub root: PageRoot,
    pub parent: Option<TaskHandle>,
    pub children: Vec<TaskHandle>,
    pub master: TaskHandle,
    pub group: ThreadGroup,
    pub pending_unblocks: u32,
    pub stack_region: Option<StackRegion>,
    pub(crate) queue_link: Link,
    pub(crate) sibling_link: Link,
}

impl Pcb {
    pub(crate) fn new(handle: TaskHandle, kernel_stack_words: usize, root: PageRoot) -> Self {
        Self {
            handle,
            pid: 0,
            tid: 0,
            status: TaskStatus::Unused,
            quantum: 0,
            kernel_sp: 0,
            kernel_stack: KernelStack::new(kernel_stack_words),
            root,
            parent: None,
            children: Vec::new(),
            master: handle,
            group: ThreadGroup::default(),
            pending_unblocks: 0,
            stack_region: None,
            queue_link: Link::default(),
            sibling_link: Link::default(),
        }
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    pub fn is_master(&self) -> bool {
        self.master == self.handle
    }

    /// Clear identity and bookkeeping before the slot goes back on the free queue
    pub(crate) fn reset(&mut self) {
        self.pid = 0;
        self.tid = 0;
        self.kernel_sp = 0;
        self.parent = None;
        self.children.clear();
        self.master = self.handle;
        self.group = ThreadGroup::default();
        self.pending_unblocks = 0;
        self.stack_region = None;
    }

    pub(crate) fn link(&self, chain: Chain) -> &Link {
        match chain {
            Chain::Queue => &self.queue_link,
            Chain::Siblings => &self.sibling_link,
        }
    }

    pub(crate) fn link_mut(&mut self, chain: Chain) -> &mut Link {
        match chain {
            Chain::Queue => &mut self.queue_link,
            Chain::Siblings => &mut self.sibling_link,
        }
    }
}
