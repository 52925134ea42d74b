//! Index-linked lists threaded through the PCB arena
//!
//! A PCB can sit on two lists at once: one scheduler queue and its
//! process's thread-sibling list. Each has its own [`Link`] inside the PCB,
//! selected with [`Chain`].

use alloc::vec::Vec;

use super::{Pcb, TaskHandle};

/// Which embedded link a list walks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Queue,
    Siblings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Link {
    pub prev: Option<TaskHandle>,
    pub next: Option<TaskHandle>,
}

/// Anchor of one list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListHead {
    head: Option<TaskHandle>,
    tail: Option<TaskHandle>,
    len: usize,
}

impl ListHead {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<TaskHandle> {
        self.head
    }

    pub fn push_back(&mut self, pcbs: &mut [Pcb], handle: TaskHandle, chain: Chain) {
        let link = pcbs[handle.index()].link_mut(chain);
        debug_assert_eq!(*link, Link::default(), "task {:?} already linked", handle);
        link.prev = self.tail;
        link.next = None;

        match self.tail {
            Some(tail) => pcbs[tail.index()].link_mut(chain).next = Some(handle),
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        self.len += 1;
    }

    pub fn pop_front(&mut self, pcbs: &mut [Pcb], chain: Chain) -> Option<TaskHandle> {
        let head = self.head?;
        self.remove(pcbs, head, chain);
        Some(head)
    }

    /// Unlink `handle`; it must currently be on this list
    pub fn remove(&mut self, pcbs: &mut [Pcb], handle: TaskHandle, chain: Chain) {
        let Link { prev, next } = *pcbs[handle.index()].link(chain);

        match prev {
            Some(prev) => pcbs[prev.index()].link_mut(chain).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => pcbs[next.index()].link_mut(chain).prev = prev,
            None => self.tail = prev,
        }

        *pcbs[handle.index()].link_mut(chain) = Link::default();
        self.len -= 1;
    }

    pub fn contains(&self, pcbs: &[Pcb], handle: TaskHandle, chain: Chain) -> bool {
        self.iter(pcbs, chain).any(|h| h == handle)
    }

    pub fn iter<'a>(&self, pcbs: &'a [Pcb], chain: Chain) -> ListIter<'a> {
        ListIter {
            pcbs,
            chain,
            next: self.head,
        }
    }

    /// Snapshot of the members, for walks that mutate the arena
    pub fn to_vec(&self, pcbs: &[Pcb], chain: Chain) -> Vec<TaskHandle> {
        self.iter(pcbs, chain).collect()
    }
}

pub struct ListIter<'a> {
    pcbs: &'a [Pcb],
    chain: Chain,
    next: Option<TaskHandle>,
}

impl Iterator for ListIter<'_> {
    type Item = TaskHandle;

    fn next(&mut self) -> Option<TaskHandle> {
        let current = self.next?;
        self.next = self.pcbs[current.index()].link(self.chain).next;
        Some(current)
    }
}
