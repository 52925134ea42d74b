//! Task Registry
//!
//! Fixed PCB arena plus the free, ready and blocked queues. A PCB that is
//! not running sits on exactly one queue; the running PCB sits on none.
//! The idle task (slot 0) is the exception: it is never queued.

use alloc::vec::Vec;

use super::list::{Chain, ListHead, ListIter};
use super::{Pcb, TaskHandle, TaskStatus, IDLE};
use crate::error::{KernelError, KernelResult};
use crate::mm::PageRoot;

/// Scheduler queue a PCB can be parked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Free,
    Ready,
    Blocked,
}

impl QueueKind {
    fn status(self) -> TaskStatus {
        match self {
            QueueKind::Free => TaskStatus::Unused,
            QueueKind::Ready => TaskStatus::Ready,
            QueueKind::Blocked => TaskStatus::Blocked,
        }
    }
}

pub struct Registry {
    pcbs: Vec<Pcb>,
    free: ListHead,
    ready: ListHead,
    blocked: ListHead,
}

impl Registry {
    /// Arena with the idle task in slot 0 and `capacity` free slots after it
    pub fn new(capacity: usize, kernel_stack_words: usize, kernel_root: PageRoot) -> Self {
        let mut registry = Self {
            pcbs: (0..=capacity)
                .map(|index| Pcb::new(TaskHandle(index), kernel_stack_words, kernel_root))
                .collect(),
            free: ListHead::new(),
            ready: ListHead::new(),
            blocked: ListHead::new(),
        };
        for index in 1..=capacity {
            registry.free.push_back(&mut registry.pcbs, TaskHandle(index), Chain::Queue);
        }
        registry
    }

    /// Number of slots available to tasks other than idle
    pub fn capacity(&self) -> usize {
        self.pcbs.len() - 1
    }

    pub fn get(&self, handle: TaskHandle) -> &Pcb {
        &self.pcbs[handle.index()]
    }

    pub fn get_mut(&mut self, handle: TaskHandle) -> &mut Pcb {
        &mut self.pcbs[handle.index()]
    }

    /// Two distinct PCBs borrowed mutably at once
    pub fn pair_mut(&mut self, a: TaskHandle, b: TaskHandle) -> (&mut Pcb, &mut Pcb) {
        debug_assert_ne!(a, b, "pair_mut on a single task");
        if a.index() < b.index() {
            let (low, high) = self.pcbs.split_at_mut(b.index());
            (&mut low[a.index()], &mut high[0])
        } else {
            let (low, high) = self.pcbs.split_at_mut(a.index());
            (&mut high[0], &mut low[b.index()])
        }
    }

    fn queue(&self, kind: QueueKind) -> &ListHead {
        match kind {
            QueueKind::Free => &self.free,
            QueueKind::Ready => &self.ready,
            QueueKind::Blocked => &self.blocked,
        }
    }

    /// Split borrow: one queue head and the whole arena
    fn queue_and_pcbs(&mut self, kind: QueueKind) -> (&mut ListHead, &mut [Pcb]) {
        let queue = match kind {
            QueueKind::Free => &mut self.free,
            QueueKind::Ready => &mut self.ready,
            QueueKind::Blocked => &mut self.blocked,
        };
        (queue, &mut self.pcbs)
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        self.queue(kind).len()
    }

    pub fn is_empty(&self, kind: QueueKind) -> bool {
        self.queue(kind).is_empty()
    }

    pub fn iter(&self, kind: QueueKind) -> ListIter<'_> {
        self.queue(kind).iter(&self.pcbs, Chain::Queue)
    }

    /// Queue `handle` is parked on, derived from its status
    pub fn queue_of(&self, handle: TaskHandle) -> Option<QueueKind> {
        if handle == IDLE {
            return None;
        }
        match self.get(handle).status {
            TaskStatus::Running => None,
            TaskStatus::Ready => Some(QueueKind::Ready),
            TaskStatus::Blocked => Some(QueueKind::Blocked),
            TaskStatus::Unused => Some(QueueKind::Free),
        }
    }

    /// Take the head of the free queue
    pub fn allocate_pcb(&mut self) -> KernelResult<TaskHandle> {
        let (free, pcbs) = self.queue_and_pcbs(QueueKind::Free);
        let handle = free.pop_front(pcbs, Chain::Queue).ok_or(KernelError::NoMemory)?;
        self.get_mut(handle).status = TaskStatus::Running;
        Ok(handle)
    }

    /// Wipe a PCB and append it to the free queue, pulling it off any other
    /// queue first
    pub fn release_pcb(&mut self, handle: TaskHandle) {
        debug_assert_ne!(handle, IDLE, "idle task cannot be released");
        self.get_mut(handle).reset();
        self.enqueue(handle, QueueKind::Free);
    }

    /// Move `handle` to the tail of `kind`, updating its status to match
    pub fn enqueue(&mut self, handle: TaskHandle, kind: QueueKind) {
        debug_assert_ne!(handle, IDLE, "idle task is never queued");
        self.dequeue(handle);
        let (queue, pcbs) = self.queue_and_pcbs(kind);
        queue.push_back(pcbs, handle, Chain::Queue);
        self.get_mut(handle).status = kind.status();
    }

    /// Take `handle` off whatever queue it is on and mark it running
    pub fn dequeue(&mut self, handle: TaskHandle) {
        if let Some(kind) = self.queue_of(handle) {
            let (queue, pcbs) = self.queue_and_pcbs(kind);
            queue.remove(pcbs, handle, Chain::Queue);
        }
        self.get_mut(handle).status = TaskStatus::Running;
    }

    /// Oldest task on `kind`, removed and marked running
    pub fn pop_front(&mut self, kind: QueueKind) -> Option<TaskHandle> {
        let (queue, pcbs) = self.queue_and_pcbs(kind);
        let handle = queue.pop_front(pcbs, Chain::Queue)?;
        self.get_mut(handle).status = TaskStatus::Running;
        Some(handle)
    }

    /// Threads of the process mastered by `master`, in creation order
    pub fn siblings(&self, master: TaskHandle) -> Vec<TaskHandle> {
        self.get(master).group.members.to_vec(&self.pcbs, Chain::Siblings)
    }

    pub fn link_sibling(&mut self, master: TaskHandle, handle: TaskHandle) {
        let mut members = self.get(master).group.members;
        members.push_back(&mut self.pcbs, handle, Chain::Siblings);
        self.get_mut(master).group.members = members;
    }

    pub fn unlink_sibling(&mut self, master: TaskHandle, handle: TaskHandle) {
        let mut members = self.get(master).group.members;
        members.remove(&mut self.pcbs, handle, Chain::Siblings);
        self.get_mut(master).group.members = members;
    }

    /// Live (non-free) task whose pid matches, preferring the master
    pub fn find_process(&self, pid: super::Pid) -> Option<TaskHandle> {
        self.pcbs
            .iter()
            .find(|pcb| pcb.status != TaskStatus::Unused && pcb.pid == pid && pcb.is_master())
            .map(Pcb::handle)
    }
}
