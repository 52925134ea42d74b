//! Block / unblock
//!
//! `unblock` may arrive before the matching `block`. Such early wakeups are
//! banked in `pending_unblocks` and spent by later `block` calls, so no
//! wakeup is ever lost.

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::mm::AddressSpaces;
use crate::sched::Dispatch;
use crate::task::registry::QueueKind;
use crate::task::{Pid, TaskStatus, IDLE};

impl<M: AddressSpaces> Kernel<M> {
    /// Put the caller to sleep until a parent unblocks it.
    ///
    /// Returns `None` when a banked wakeup was consumed and the caller keeps
    /// running.
    pub fn block(&mut self) -> Option<Dispatch> {
        let current = self.current;
        if current == IDLE {
            return None;
        }

        let pcb = self.registry.get_mut(current);
        if pcb.pending_unblocks > 0 {
            pcb.pending_unblocks -= 1;
            log::debug!("[Sync] pid {} consumed an early unblock", pcb.pid);
            return None;
        }

        self.registry.enqueue(current, QueueKind::Blocked);
        self.schedule()
    }

    /// Wake the child process `pid` of the caller, or bank the wakeup if it
    /// is not blocked yet
    pub fn unblock(&mut self, pid: Pid) -> KernelResult<()> {
        let master = self.master_of(self.current);
        let target = self
            .registry
            .get(master)
            .children
            .iter()
            .copied()
            .find(|&child| self.registry.get(child).pid == pid)
            .ok_or(KernelError::NoSuchProcess)?;

        if self.registry.get(target).status == TaskStatus::Blocked {
            self.registry.enqueue(target, QueueKind::Ready);
        } else {
            let pcb = self.registry.get_mut(target);
            pcb.pending_unblocks = pcb.pending_unblocks.saturating_add(1);
            log::debug!("[Sync] pid {} banked unblock #{}", pid, pcb.pending_unblocks);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::boot;

    #[test]
    fn unblock_before_block_is_not_lost() {
        let mut kernel = boot();
        let init = kernel.current();
        let pid = kernel.fork().unwrap();
        let child = kernel.registry().find_process(pid).unwrap();

        kernel.unblock(pid).unwrap();
        assert_eq!(kernel.task(child).pending_unblocks, 1);

        while kernel.current() != child {
            kernel.yield_now();
        }
        assert_eq!(kernel.block(), None);
        assert_eq!(kernel.current(), child);
        assert_eq!(kernel.task(child).status, TaskStatus::Running);
        assert!(kernel.registry().is_empty(QueueKind::Blocked));
        assert_eq!(kernel.task(child).pending_unblocks, 0);

        // the next block really sleeps
        let dispatch = kernel.block().unwrap();
        assert_eq!(dispatch.to, init);
        assert_eq!(kernel.task(child).status, TaskStatus::Blocked);
    }

    #[test]
    fn unblock_wakes_a_blocked_child() {
        let mut kernel = boot();
        let init = kernel.current();
        let pid = kernel.fork().unwrap();
        let child = kernel.registry().find_process(pid).unwrap();

        kernel.yield_now().unwrap();
        assert_eq!(kernel.current(), child);
        kernel.block().unwrap();
        assert_eq!(kernel.current(), init);

        kernel.unblock(pid).unwrap();
        assert_eq!(kernel.task(child).status, TaskStatus::Ready);
        assert_eq!(kernel.task(child).pending_unblocks, 0);
        assert_eq!(kernel.yield_now().unwrap().to, child);
    }

    #[test]
    fn early_unblocks_accumulate() {
        let mut kernel = boot();
        let pid = kernel.fork().unwrap();
        let child = kernel.registry().find_process(pid).unwrap();
        for _ in 0..3 {
            kernel.unblock(pid).unwrap();
        }
        assert_eq!(kernel.task(child).pending_unblocks, 3);
    }

    #[test]
    fn unblock_only_reaches_children() {
        let mut kernel = boot();
        let own = kernel.getpid();
        assert_eq!(kernel.unblock(own), Err(KernelError::NoSuchProcess));
        assert_eq!(kernel.unblock(4242), Err(KernelError::NoSuchProcess));
    }
}
