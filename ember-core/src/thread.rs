//! Thread Lifecycle
//!
//! Threads share their process's address space but each gets its own PCB,
//! TID and stack window. Windows are reserved whole and mapped from the top
//! down; [`Kernel::grow_stack`](crate::kernel::Kernel::grow_stack) extends
//! them on fault.

use alloc::vec::Vec;

use crate::context::{build_initial_context, EntryKind};
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::mm::{self, AddressSpaces, Frame, PageFlags, PageRoot, VirtPage, WORD_SIZE};
use crate::sched::Dispatch;
use crate::task::registry::QueueKind;
use crate::task::{StackRegion, TaskHandle, Tid};

impl<M: AddressSpaces> Kernel<M> {
    /// Start a new thread in the caller's process.
    ///
    /// The thread begins at `entry` with `arg` as its only cdecl argument;
    /// returning from `entry` lands in `exit_trampoline`.
    pub fn create_thread(&mut self, entry: usize, arg: usize, exit_trampoline: usize) -> KernelResult<Tid> {
        let creator = self.current;
        let master = self.registry.get(creator).master;
        let root = self.registry.get(creator).root;

        if entry == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if !self.is_user_address(root, entry) || !self.is_user_address(root, exit_trampoline) {
            return Err(KernelError::BadAddress);
        }
        if arg != 0 && !self.is_user_address(root, arg) {
            return Err(KernelError::BadAddress);
        }

        let thread = self.registry.allocate_pcb()?;
        let tid = match self.registry.get_mut(master).group.tids.allocate(thread) {
            Some(tid) => tid,
            None => {
                self.registry.release_pcb(thread);
                log::warn!("[Thread] pid {} is out of TIDs", self.registry.get(master).pid);
                return Err(KernelError::NoMemory);
            }
        };

        let mut region = match self.find_stack_window(master) {
            Some(region) => region,
            None => {
                self.registry.get_mut(master).group.tids.release(tid);
                self.registry.release_pcb(thread);
                log::warn!("[Thread] no free stack window");
                return Err(KernelError::NoMemory);
            }
        };

        let mut mapped: Vec<(VirtPage, Frame)> = Vec::new();
        let prepared = self
            .map_initial_stack(root, &mut region, &mut mapped)
            .and_then(|()| self.write_initial_stack(&region, &mapped, arg, exit_trampoline));
        if let Err(error) = prepared {
            self.unmap_and_free(root, &mapped);
            self.registry.get_mut(master).group.tids.release(tid);
            self.registry.release_pcb(thread);
            return Err(error);
        }

        let user_sp = region.top() - 2 * WORD_SIZE;
        let user_return = self.config.user_return;
        let (creator_pcb, pcb) = self.registry.pair_mut(creator, thread);
        pcb.pid = creator_pcb.pid;
        pcb.tid = tid;
        pcb.quantum = creator_pcb.quantum;
        pcb.root = root;
        pcb.master = master;
        pcb.pending_unblocks = 0;
        pcb.stack_region = Some(region);
        pcb.kernel_sp =
            build_initial_context(&mut pcb.kernel_stack, EntryKind::User { entry, user_sp }, user_return).kernel_sp;

        self.registry.link_sibling(master, thread);
        self.registry.enqueue(thread, QueueKind::Ready);

        log::debug!(
            "[Thread] pid {} tid {} at {:#x}, stack {:#x}",
            self.registry.get(thread).pid,
            tid,
            entry,
            region.top()
        );
        Ok(tid)
    }

    /// First stack window above `thread_stack_base` that no sibling uses.
    ///
    /// Windows sit one page apart; that page is never mapped, so a full stack
    /// faults instead of running into the window below it.
    fn find_stack_window(&self, master: TaskHandle) -> Option<StackRegion> {
        let pages = self.config.thread_stack_pages;
        let stride = pages + 1;
        let base = VirtPage::containing(self.config.layout.thread_stack_base);
        let siblings = self.registry.siblings(master);

        (0..self.config.tid_capacity)
            .map(|index| StackRegion::reserve(base.add(index * stride + 1), pages))
            .find(|candidate| {
                siblings.iter().all(|&sibling| match self.registry.get(sibling).stack_region {
                    Some(region) => !region.overlaps(candidate),
                    None => true,
                })
            })
    }

    /// Back the top `initial_stack_pages` of `region` with fresh frames
    fn map_initial_stack(
        &mut self,
        root: PageRoot,
        region: &mut StackRegion,
        mapped: &mut Vec<(VirtPage, Frame)>,
    ) -> KernelResult<()> {
        let pages = self.config.initial_stack_pages.clamp(1, region.total_pages);
        for _ in 0..pages {
            let page = VirtPage(region.first_mapped.0 - 1);
            let frame = self.memory.allocate_frame().ok_or(KernelError::NoMemory)?;
            if self.memory.map(root, page, frame, PageFlags::USER_DATA).is_err() {
                self.memory.free_frame(frame);
                return Err(KernelError::NoMemory);
            }
            mapped.push((page, frame));
            region.extend_down();
        }
        Ok(())
    }

    /// Lay out `[exit_trampoline, arg]` at the top of the new stack
    fn write_initial_stack(
        &mut self,
        region: &StackRegion,
        mapped: &[(VirtPage, Frame)],
        arg: usize,
        exit_trampoline: usize,
    ) -> KernelResult<()> {
        // the first page mapped is the topmost one
        let &(_, top_frame) = mapped.first().ok_or(KernelError::NoMemory)?;
        let offset = mm::PAGE_SIZE - 2 * WORD_SIZE;
        let mut words = [0u8; 2 * WORD_SIZE];
        words[..WORD_SIZE].copy_from_slice(&(exit_trampoline as u32).to_le_bytes());
        words[WORD_SIZE..].copy_from_slice(&(arg as u32).to_le_bytes());

        let scratch = self.scratch_page();
        debug_assert_eq!(region.top() % mm::PAGE_SIZE, 0);
        mm::with_scratch(&mut self.memory, scratch, top_frame, |memory, addr| {
            memory.write(addr + offset, &words)
        })
        .map_err(|_| KernelError::NoMemory)
    }

    /// Unmap and free every mapped page of a thread's stack window
    pub(crate) fn release_stack_region(&mut self, thread: TaskHandle) {
        let pcb = self.registry.get_mut(thread);
        let Some(region) = pcb.stack_region.take() else {
            return;
        };
        let root = pcb.root;
        let active = self.memory.active_root() == root;
        for page in region.mapped() {
            if let Some(frame) = self.memory.unmap(root, page) {
                self.memory.free_frame(frame);
            }
            if active {
                self.memory.flush(page);
            }
        }
    }

    /// Terminate the calling thread; the last thread takes its process with it
    pub fn exit_thread(&mut self) -> Option<Dispatch> {
        let current = self.current;
        let mut master = self.registry.get(current).master;
        if self.registry.get(master).group.count() <= 1 {
            return self.exit();
        }

        let tid = self.registry.get(current).tid;
        self.release_stack_region(current);
        if current == master {
            master = self.reassign_master(current);
        }

        self.registry.get_mut(master).group.tids.release(tid);
        self.registry.unlink_sibling(master, current);
        self.registry.release_pcb(current);

        log::debug!("[Thread] tid {} exited, {} left", tid, self.registry.get(master).group.count());
        self.schedule()
    }

    /// Hand the process over from `old` to another of its threads.
    ///
    /// The thread group, TID table, banked unblocks and place in the process
    /// tree all move to the new master; `old` keeps only its own sibling link.
    fn reassign_master(&mut self, old: TaskHandle) -> TaskHandle {
        let siblings = self.registry.siblings(old);
        let Some(new) = siblings.iter().copied().find(|&sibling| sibling != old) else {
            return old;
        };

        let group = core::mem::take(&mut self.registry.get_mut(old).group);
        let children = core::mem::take(&mut self.registry.get_mut(old).children);
        let parent = self.registry.get_mut(old).parent.take();
        let pending = core::mem::take(&mut self.registry.get_mut(old).pending_unblocks);
        {
            let pcb = self.registry.get_mut(new);
            pcb.group = group;
            pcb.children = children;
            pcb.parent = parent;
            pcb.pending_unblocks = pcb.pending_unblocks.saturating_add(pending);
        }
        for &sibling in &siblings {
            self.registry.get_mut(sibling).master = new;
        }

        let children = self.registry.get(new).children.clone();
        for child in children {
            self.registry.get_mut(child).parent = Some(new);
        }
        if let Some(parent) = parent {
            for child in self.registry.get_mut(parent).children.iter_mut() {
                if *child == old {
                    *child = new;
                }
            }
        }

        log::debug!(
            "[Thread] pid {}: master tid {} -> tid {}",
            self.registry.get(new).pid,
            self.registry.get(old).tid,
            self.registry.get(new).tid
        );
        new
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskStatus, MASTER_TID};
    use crate::testing::{boot, boot_with, test_config};
    use std::vec;

    fn entry(kernel: &Kernel<crate::testing::MockMemory>) -> usize {
        kernel.config().layout.code_start
    }

    #[test]
    fn create_thread_shares_root_and_queues() {
        let mut kernel = boot();
        let init = kernel.current();
        let code = entry(&kernel);
        let tid = kernel.create_thread(code + 0x10, code + 0x40, code + 0x20).unwrap();
        assert_eq!(tid, 2);

        let thread = kernel.registry().get(init).group.tids.lookup(tid).unwrap();
        let pcb = kernel.task(thread);
        assert_eq!(pcb.pid, kernel.task(init).pid);
        assert_eq!(pcb.root, kernel.task(init).root);
        assert_eq!(pcb.master, init);
        assert_eq!(pcb.status, TaskStatus::Ready);
        assert_eq!(kernel.task(init).group.count(), 2);

        let region = pcb.stack_region.unwrap();
        assert_eq!(region.mapped_pages, 1);
        let frame = pcb.kernel_stack.user_frame();
        assert_eq!(frame.eip, code + 0x10);
        assert_eq!(frame.esp, region.top() - 8);

        let mut words = [0u8; 8];
        kernel.memory().read(region.top() - 8, &mut words);
        assert_eq!(u32::from_le_bytes(words[..4].try_into().unwrap()) as usize, code + 0x20);
        assert_eq!(u32::from_le_bytes(words[4..].try_into().unwrap()) as usize, code + 0x40);
    }

    #[test]
    fn create_thread_validates_pointers() {
        let mut kernel = boot();
        let code = entry(&kernel);
        assert_eq!(kernel.create_thread(0, 0, code), Err(KernelError::InvalidArgument));
        assert_eq!(kernel.create_thread(0x1000, 0, code), Err(KernelError::BadAddress));
        assert_eq!(kernel.create_thread(code, 0, 0x7000_0000), Err(KernelError::BadAddress));
        assert_eq!(kernel.create_thread(code, 0x0000_0010, code), Err(KernelError::BadAddress));
        assert_eq!(kernel.registry().len(QueueKind::Free), test_config().task_capacity - 1);
    }

    #[test]
    fn stack_windows_never_overlap() {
        let mut kernel = boot();
        let init = kernel.current();
        let code = entry(&kernel);
        for _ in 0..4 {
            kernel.create_thread(code, 0, code).unwrap();
        }
        let regions: Vec<_> = kernel
            .registry()
            .siblings(init)
            .into_iter()
            .filter_map(|t| kernel.task(t).stack_region)
            .collect();
        assert_eq!(regions.len(), 4);
        for (i, a) in regions.iter().enumerate() {
            for b in &regions[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
    }

    #[test]
    fn freed_tid_is_reused_first() {
        let mut kernel = boot();
        let init = kernel.current();
        let code = entry(&kernel);
        for expected in 2..=4 {
            assert_eq!(kernel.create_thread(code, 0, code).unwrap(), expected);
        }

        // run tid 3 and let it exit
        let t3 = kernel.task(init).group.tids.lookup(3).unwrap();
        while kernel.current() != t3 {
            kernel.yield_now();
        }
        kernel.exit_thread().unwrap();
        while kernel.current() != init {
            kernel.yield_now();
        }

        assert_eq!(kernel.create_thread(code, 0, code).unwrap(), 3);
        assert_eq!(kernel.create_thread(code, 0, code).unwrap(), 5);
    }

    #[test]
    fn tid_exhaustion_is_no_memory() {
        let mut config = test_config();
        config.tid_capacity = 3;
        let mut kernel = boot_with(config);
        let code = config.layout.code_start;
        assert_eq!(kernel.create_thread(code, 0, code), Ok(2));
        let free = kernel.registry().len(QueueKind::Free);
        assert_eq!(kernel.create_thread(code, 0, code), Err(KernelError::NoMemory));
        assert_eq!(kernel.registry().len(QueueKind::Free), free);
    }

    #[test]
    fn stack_mapping_failure_rolls_back() {
        let mut config = test_config();
        config.initial_stack_pages = 2;
        let mut kernel = boot_with(config);
        let init = kernel.current();
        let code = config.layout.code_start;
        let frames = kernel.memory().free_frames();

        kernel.memory_mut().fail_maps_after(1);
        assert_eq!(kernel.create_thread(code, 0, code), Err(KernelError::NoMemory));
        kernel.memory_mut().fail_maps_after(usize::MAX);

        assert_eq!(kernel.memory().free_frames(), frames);
        assert_eq!(kernel.task(init).group.count(), 1);
        assert_eq!(kernel.task(init).group.tids.in_use(), 1);
        assert_eq!(kernel.create_thread(code, 0, code), Ok(2));
    }

    #[test]
    fn exiting_thread_frees_its_stack() {
        let mut kernel = boot();
        let init = kernel.current();
        let code = entry(&kernel);
        let frames = kernel.memory().free_frames();
        kernel.create_thread(code, 0, code).unwrap();
        kernel.yield_now().unwrap();
        let thread = kernel.current();
        let region = kernel.task(thread).stack_region.unwrap();

        let dispatch = kernel.exit_thread().unwrap();
        assert_eq!(dispatch.to, init);
        assert_eq!(kernel.task(thread).status, TaskStatus::Unused);
        assert_eq!(kernel.memory().free_frames(), frames);
        let top = VirtPage::containing(region.top() - 1);
        assert_eq!(kernel.memory().translate(kernel.task(init).root, top), None);
        assert_eq!(kernel.task(init).group.count(), 1);
    }

    #[test]
    fn master_exit_hands_process_to_a_sibling() {
        let mut kernel = boot();
        let init = kernel.current();
        let code = entry(&kernel);
        kernel.create_thread(code, 0, code).unwrap();
        kernel.create_thread(code, 0, code).unwrap();
        let child_pid = kernel.fork().unwrap();
        let child = kernel.registry().find_process(child_pid).unwrap();
        let siblings = kernel.registry().siblings(init);
        let (t2, t3) = (siblings[1], siblings[2]);

        kernel.exit_thread().unwrap();

        let masters: Vec<_> = [t2, t3].iter().filter(|&&t| kernel.task(t).is_master()).copied().collect();
        assert_eq!(masters.len(), 1);
        let new_master = masters[0];
        let other = if new_master == t2 { t3 } else { t2 };
        assert_eq!(kernel.task(other).master, new_master);
        assert_eq!(kernel.task(new_master).group.count(), 2);
        assert_eq!(kernel.task(new_master).group.tids.lookup(MASTER_TID), None);
        assert_eq!(kernel.task(init).status, TaskStatus::Unused);

        // the process keeps its place in the tree
        assert_eq!(kernel.task(new_master).children, vec![child]);
        assert_eq!(kernel.task(child).parent, Some(new_master));
        assert!(kernel.task(crate::task::IDLE).children.contains(&new_master));
        assert!(!kernel.task(crate::task::IDLE).children.contains(&init));
    }

    #[test]
    fn banked_unblock_survives_master_hand_over() {
        let mut kernel = boot();
        let code = entry(&kernel);
        let pid = kernel.fork().unwrap();
        let child = kernel.registry().find_process(pid).unwrap();
        kernel.unblock(pid).unwrap();

        while kernel.current() != child {
            kernel.yield_now();
        }
        let tid = kernel.create_thread(code, 0, code).unwrap();
        let worker = kernel.task(child).group.tids.lookup(tid).unwrap();
        kernel.exit_thread().unwrap();

        assert!(kernel.task(worker).is_master());
        assert_eq!(kernel.task(worker).pending_unblocks, 1);

        while kernel.current() != worker {
            kernel.yield_now();
        }
        assert_eq!(kernel.block(), None);
        assert_eq!(kernel.current(), worker);
        assert_eq!(kernel.task(worker).pending_unblocks, 0);
    }

    #[test]
    fn master_tid_is_handed_out_after_master_exits() {
        let mut kernel = boot();
        let code = entry(&kernel);
        let tid = kernel.create_thread(code, 0, code).unwrap();
        let init = kernel.current();
        let worker = kernel.task(init).group.tids.lookup(tid).unwrap();
        kernel.exit_thread().unwrap();
        assert_eq!(kernel.current(), worker);

        assert_eq!(kernel.create_thread(code, 0, code), Ok(MASTER_TID));
        assert_eq!(kernel.task(worker).group.tids.in_use(), 2);
    }

    #[test]
    fn last_thread_exit_ends_the_process() {
        let mut kernel = boot();
        let init = kernel.current();
        let dispatch = kernel.exit_thread().unwrap();
        assert_eq!(dispatch.to, crate::task::IDLE);
        assert_eq!(kernel.task(init).status, TaskStatus::Unused);
        assert!(kernel.task(crate::task::IDLE).children.is_empty());
    }
}
