//! Process Scheduler
//!
//! Round-robin over a strict FIFO ready queue with a fixed quantum.
//!
//! # Scheduling Algorithm
//!
//! 1. Every scheduling opportunity (tick, blocking call, exit, yield) costs
//!    the running task one unit of quantum
//! 2. Reschedule when the quantum is spent and someone is ready, or when the
//!    running task stopped running (blocked / exited)
//! 3. Next task is the head of the ready queue, or idle if it is empty
//! 4. Dispatch reloads the quantum and switches address space if needed
//!
//! The scheduler only *decides*. It returns a [`Dispatch`] describing the
//! switch, and the caller performs it once it has dropped any locks.

use crate::kernel::Kernel;
use crate::mm::AddressSpaces;
use crate::task::registry::QueueKind;
use crate::task::{TaskHandle, TaskStatus, IDLE};

/// A context switch the caller must carry out with `switch_context`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub from: TaskHandle,
    pub to: TaskHandle,
    /// Where `switch_context` stores the outgoing stack pointer
    pub save_sp: *mut usize,
    /// Stack pointer to resume
    pub resume_sp: usize,
    /// Top of the incoming task's kernel stack (for the TSS)
    pub kernel_stack_top: usize,
}

impl<M: AddressSpaces> Kernel<M> {
    /// Timer interrupt
    pub fn tick(&mut self) -> Option<Dispatch> {
        self.schedule()
    }

    /// Give up the rest of the quantum if anyone else is ready
    pub fn yield_now(&mut self) -> Option<Dispatch> {
        self.remaining = 0;
        self.schedule()
    }

    /// One scheduling opportunity; see the module docs for the rules
    pub fn schedule(&mut self) -> Option<Dispatch> {
        self.remaining -= 1;

        let current = self.current;
        let still_running = self.registry.get(current).status == TaskStatus::Running;
        let anyone_ready = !self.registry.is_empty(QueueKind::Ready);

        let expired = self.remaining <= 0 && anyone_ready;
        let idle_displaced = current == IDLE && anyone_ready;
        if still_running && !expired && !idle_displaced {
            return None;
        }

        if still_running && current != IDLE {
            self.registry.enqueue(current, QueueKind::Ready);
        }

        let next = self.registry.pop_front(QueueKind::Ready).unwrap_or(IDLE);
        self.dispatch(next)
    }

    /// Make `next` the running task
    pub(crate) fn dispatch(&mut self, next: TaskHandle) -> Option<Dispatch> {
        let from = self.current;

        let incoming = self.registry.get_mut(next);
        incoming.status = TaskStatus::Running;
        self.remaining = i64::from(incoming.quantum);
        let root = incoming.root;

        if from == next {
            return None;
        }
        if from == IDLE {
            // Idle is never queued; while parked it is simply "ready"
            self.registry.get_mut(IDLE).status = TaskStatus::Ready;
        }

        if self.memory.active_root() != root {
            self.memory.switch_root(root);
        }
        self.current = next;

        let incoming = self.registry.get(next);
        let resume_sp = incoming.kernel_sp;
        let kernel_stack_top = incoming.kernel_stack.top();
        let dispatch = Dispatch {
            from,
            to: next,
            save_sp: &mut self.registry.get_mut(from).kernel_sp as *mut usize,
            resume_sp,
            kernel_stack_top,
        };
        log::trace!("[Sched] switching {:?} -> {:?}", from, next);
        Some(dispatch)
    }
}
