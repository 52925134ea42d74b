//! Process Lifecycle
//!
//! A process is a master PCB, its thread group and one address space.
//! Processes come into being through [`Kernel::spawn_init`] (once, at boot)
//! or [`Kernel::fork`], and go away through [`Kernel::exit`].

use alloc::vec::Vec;

use crate::context::{build_initial_context, EntryKind};
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::mm::{self, AddressSpaces, Frame, PageFlags, PageRoot, VirtPage, PAGE_SIZE};
use crate::sched::Dispatch;
use crate::task::registry::QueueKind;
use crate::task::{Pid, TaskHandle, ThreadGroup, TidTable, IDLE, MASTER_TID};

/// Program image handed to [`Kernel::spawn_init`]
#[derive(Debug, Clone, Copy)]
pub struct ProcessImage<'a> {
    /// Bytes loaded at `MemoryLayout::code_start`
    pub code: &'a [u8],
    /// Initial instruction pointer
    pub entry: usize,
}

impl<M: AddressSpaces> Kernel<M> {
    /// Load the first user process as a child of idle and make it ready
    pub fn spawn_init(&mut self, image: &ProcessImage<'_>) -> KernelResult<Pid> {
        let layout = self.config.layout;
        let code_pages = image.code.len().div_ceil(PAGE_SIZE);
        if code_pages > layout.code_pages || image.entry < layout.code_start || image.entry >= layout.code_end() {
            return Err(KernelError::InvalidArgument);
        }

        let task = self.registry.allocate_pcb()?;
        let root = match self.memory.create_root() {
            Some(root) => root,
            None => {
                self.registry.release_pcb(task);
                return Err(KernelError::NoMemory);
            }
        };

        let mut mapped: Vec<(VirtPage, Frame)> = Vec::new();
        let loaded = self.load_image(root, image, code_pages, &mut mapped);
        if let Err(error) = loaded {
            log::warn!("[Kernel] init image does not fit in memory");
            self.unmap_and_free(root, &mapped);
            self.memory.destroy_root(root);
            self.registry.release_pcb(task);
            return Err(error);
        }

        let pid = self.allocate_pid();
        let quantum = self.config.quantum;
        let tid_capacity = self.config.tid_capacity;
        let user_return = self.config.user_return;

        let pcb = self.registry.get_mut(task);
        pcb.pid = pid;
        pcb.tid = MASTER_TID;
        pcb.quantum = quantum;
        pcb.root = root;
        pcb.parent = Some(IDLE);
        pcb.master = task;
        pcb.group = ThreadGroup {
            tids: TidTable::new(tid_capacity, task),
            ..ThreadGroup::default()
        };
        pcb.kernel_sp = build_initial_context(
            &mut pcb.kernel_stack,
            EntryKind::User {
                entry: image.entry,
                user_sp: layout.data_end(),
            },
            user_return,
        )
        .kernel_sp;

        self.registry.link_sibling(task, task);
        self.registry.get_mut(IDLE).children.push(task);
        self.registry.enqueue(task, QueueKind::Ready);

        log::info!("[Kernel] spawned init: pid {} ({} code pages)", pid, code_pages);
        Ok(pid)
    }

    /// Map and fill the code and data windows of a fresh root
    fn load_image(
        &mut self,
        root: PageRoot,
        image: &ProcessImage<'_>,
        code_pages: usize,
        mapped: &mut Vec<(VirtPage, Frame)>,
    ) -> KernelResult<()> {
        let layout = self.config.layout;
        let scratch = self.scratch_page();

        let code = VirtPage::containing(layout.code_start);
        for (index, chunk) in image.code.chunks(PAGE_SIZE).enumerate().take(code_pages) {
            let frame = self.memory.allocate_frame().ok_or(KernelError::NoMemory)?;
            let filled = mm::zero_frame(&mut self.memory, scratch, frame).and_then(|()| {
                mm::with_scratch(&mut self.memory, scratch, frame, |memory, addr| memory.write(addr, chunk))
            });
            if filled.is_err() || self.memory.map(root, code.add(index), frame, PageFlags::USER_CODE).is_err() {
                self.memory.free_frame(frame);
                return Err(KernelError::NoMemory);
            }
            mapped.push((code.add(index), frame));
        }

        let data = VirtPage::containing(layout.data_start);
        for index in 0..layout.data_pages {
            let frame = self.memory.allocate_frame().ok_or(KernelError::NoMemory)?;
            let zeroed = mm::zero_frame(&mut self.memory, scratch, frame);
            if zeroed.is_err() || self.memory.map(root, data.add(index), frame, PageFlags::USER_DATA).is_err() {
                self.memory.free_frame(frame);
                return Err(KernelError::NoMemory);
            }
            mapped.push((data.add(index), frame));
        }
        Ok(())
    }

    /// Duplicate the calling process.
    ///
    /// Returns the child's pid; the child itself later resumes from the same
    /// trap with a zero result.
    pub fn fork(&mut self) -> KernelResult<Pid> {
        let parent = self.current;
        let parent_master = self.registry.get(parent).master;
        let parent_root = self.registry.get(parent).root;

        let child = self.registry.allocate_pcb()?;
        let child_root = match self.memory.create_root() {
            Some(root) => root,
            None => {
                self.registry.release_pcb(child);
                log::warn!("[Fork] no frame for a page directory");
                return Err(KernelError::NoMemory);
            }
        };

        // Mutable pages to duplicate: the data + stack window, plus the
        // forking thread's own stack if it is not running on the main one.
        let layout = self.config.layout;
        let data = VirtPage::containing(layout.data_start);
        let mut private: Vec<VirtPage> = (0..layout.data_pages).map(|index| data.add(index)).collect();
        let stack_region = self.registry.get(parent).stack_region;
        if let Some(region) = stack_region {
            private.extend(region.mapped());
        }

        let mut frames: Vec<Frame> = Vec::with_capacity(private.len());
        for _ in 0..private.len() {
            match self.memory.allocate_frame() {
                Some(frame) => frames.push(frame),
                None => {
                    log::warn!("[Fork] out of frames after {} of {}", frames.len(), private.len());
                    self.abandon_fork(child, child_root, &frames);
                    return Err(KernelError::TryAgain);
                }
            }
        }

        if self.populate_child(parent_root, child_root, &private, &frames).is_err() {
            self.abandon_fork(child, child_root, &frames);
            return Err(KernelError::TryAgain);
        }
        if self.copy_private_pages(&private, &frames).is_err() {
            self.abandon_fork(child, child_root, &frames);
            return Err(KernelError::TryAgain);
        }

        let pid = self.allocate_pid();
        let tid_capacity = self.config.tid_capacity;
        let user_return = self.config.user_return;
        {
            let (parent_pcb, child_pcb) = self.registry.pair_mut(parent, child);
            child_pcb.kernel_stack.copy_from(&parent_pcb.kernel_stack);
            child_pcb.quantum = parent_pcb.quantum;
            child_pcb.pid = pid;
            child_pcb.tid = MASTER_TID;
            child_pcb.root = child_root;
            child_pcb.parent = Some(parent_master);
            child_pcb.children.clear();
            child_pcb.master = child;
            child_pcb.group = ThreadGroup {
                tids: TidTable::new(tid_capacity, child),
                ..ThreadGroup::default()
            };
            child_pcb.pending_unblocks = 0;
            child_pcb.stack_region = stack_region;
            child_pcb.kernel_sp =
                build_initial_context(&mut child_pcb.kernel_stack, EntryKind::ForkReturn, user_return).kernel_sp;
        }
        self.registry.link_sibling(child, child);
        self.registry.get_mut(parent_master).children.push(child);
        self.registry.enqueue(child, QueueKind::Ready);

        log::info!(
            "[Fork] pid {} -> pid {} ({} private pages)",
            self.registry.get(parent).pid,
            pid,
            private.len()
        );
        Ok(pid)
    }

    /// Fill the child's page tables: code shared with the parent, private
    /// pages on the fresh frames
    fn populate_child(
        &mut self,
        parent_root: PageRoot,
        child_root: PageRoot,
        private: &[VirtPage],
        frames: &[Frame],
    ) -> Result<(), mm::MapError> {
        let layout = self.config.layout;
        let code = VirtPage::containing(layout.code_start);
        for index in 0..layout.code_pages {
            let page = code.add(index);
            if let Some((frame, flags)) = self.memory.translate(parent_root, page) {
                self.memory.map(child_root, page, frame, flags)?;
            }
        }
        for (&page, &frame) in private.iter().zip(frames) {
            self.memory.map(child_root, page, frame, PageFlags::USER_DATA)?;
        }
        Ok(())
    }

    /// Copy each private page of the running process into the matching
    /// child frame, reaching the frame through the scratch slot
    fn copy_private_pages(&mut self, private: &[VirtPage], frames: &[Frame]) -> Result<(), mm::MapError> {
        let scratch = self.scratch_page();
        for (&page, &frame) in private.iter().zip(frames) {
            mm::with_scratch(&mut self.memory, scratch, frame, |memory, _| memory.copy_page(page, scratch))?;
        }
        Ok(())
    }

    /// Undo a fork in reverse order of acquisition
    fn abandon_fork(&mut self, child: TaskHandle, child_root: PageRoot, frames: &[Frame]) {
        for &frame in frames.iter().rev() {
            self.memory.free_frame(frame);
        }
        self.memory.destroy_root(child_root);
        self.registry.release_pcb(child);
    }

    /// Unmap each page from `root` and give its frame back
    pub(crate) fn unmap_and_free(&mut self, root: PageRoot, pages: &[(VirtPage, Frame)]) {
        for &(page, frame) in pages.iter().rev() {
            self.memory.unmap(root, page);
            self.memory.free_frame(frame);
        }
    }

    /// Tear down the calling process: every thread, its memory and its PCBs.
    ///
    /// Never fails. The returned dispatch (always present) leaves the dead
    /// process for good.
    pub fn exit(&mut self) -> Option<Dispatch> {
        let current = self.current;
        if current == IDLE {
            log::error!("[Exit] idle task cannot exit");
            return None;
        }
        let master = self.registry.get(current).master;
        let root = self.registry.get(master).root;
        let pid = self.registry.get(master).pid;

        // Threads first, so no sibling refers to a freed PCB while we work
        let threads = self.registry.siblings(master);
        for &thread in &threads {
            self.release_stack_region(thread);
        }
        for &thread in &threads {
            if thread != master {
                self.registry.unlink_sibling(master, thread);
                self.registry.release_pcb(thread);
            }
        }

        // Orphans go to idle
        let orphans = core::mem::take(&mut self.registry.get_mut(master).children);
        for &orphan in &orphans {
            self.registry.get_mut(orphan).parent = Some(IDLE);
        }
        self.registry.get_mut(IDLE).children.extend_from_slice(&orphans);

        if let Some(parent) = self.registry.get(master).parent {
            self.registry.get_mut(parent).children.retain(|&child| child != master);
        }

        let data = VirtPage::containing(self.config.layout.data_start);
        for index in 0..self.config.layout.data_pages {
            if let Some(frame) = self.memory.unmap(root, data.add(index)) {
                self.memory.free_frame(frame);
            }
        }
        if self.memory.active_root() == root {
            self.memory.switch_root(self.kernel_root);
        }
        self.memory.destroy_root(root);

        self.registry.unlink_sibling(master, master);
        self.registry.release_pcb(master);

        log::info!(
            "[Exit] pid {} gone: {} threads, {} orphans reparented to idle",
            pid,
            threads.len(),
            orphans.len()
        );
        self.schedule()
    }
}
