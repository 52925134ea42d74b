//! On-demand stack growth
//!
//! Thread stacks start with a page or two mapped at the top of their
//! window. A fault on the page directly below the lowest mapped one is a
//! growth request; any other fault is a real error.

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::mm::{AddressSpaces, PageFlags, VirtPage};

impl<M: AddressSpaces> Kernel<M> {
    /// Handle a not-present fault at `addr` in the running task
    pub fn grow_stack(&mut self, addr: usize) -> KernelResult<()> {
        let current = self.current;
        let pcb = self.registry.get(current);
        let root = pcb.root;
        let Some(region) = pcb.stack_region else {
            log::warn!("[Stack] fault at {:#x} in pid {} without a stack window", addr, pcb.pid);
            return Err(KernelError::BadAddress);
        };

        let page = VirtPage::containing(addr);
        if region.first_mapped.checked_sub(1) != Some(page) {
            log::warn!(
                "[Stack] fault at {:#x} outside the growth edge {:#x} (pid {})",
                addr,
                region.first_mapped.start_address(),
                pcb.pid
            );
            return Err(KernelError::BadAddress);
        }
        if region.is_fully_mapped() {
            log::warn!("[Stack] pid {} overflowed its {}-page stack", pcb.pid, region.total_pages);
            return Err(KernelError::NoMemory);
        }

        let frame = self.memory.allocate_frame().ok_or(KernelError::NoMemory)?;
        if self.memory.map(root, page, frame, PageFlags::USER_DATA).is_err() {
            self.memory.free_frame(frame);
            return Err(KernelError::NoMemory);
        }
        if self.memory.active_root() == root {
            self.memory.flush(page);
        }

        let pcb = self.registry.get_mut(current);
        if let Some(region) = pcb.stack_region.as_mut() {
            region.extend_down();
            log::debug!("[Stack] tid {} grew to {} pages", pcb.tid, region.mapped_pages);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PAGE_SIZE;
    use crate::testing::{boot_with, test_config};

    fn running_thread(pages: usize) -> Kernel<crate::testing::MockMemory> {
        let mut config = test_config();
        config.thread_stack_pages = pages;
        let mut kernel = boot_with(config);
        let code = config.layout.code_start;
        kernel.create_thread(code, 0, code).unwrap();
        kernel.yield_now().unwrap();
        kernel
    }

    #[test]
    fn fault_one_page_below_grows_the_stack() {
        let mut kernel = running_thread(4);
        let thread = kernel.current();
        let before = kernel.task(thread).stack_region.unwrap();

        let addr = before.first_mapped.start_address() - 4;
        kernel.grow_stack(addr).unwrap();

        let after = kernel.task(thread).stack_region.unwrap();
        assert_eq!(after.mapped_pages, before.mapped_pages + 1);
        assert_eq!(after.first_mapped, VirtPage::containing(addr));
        assert!(kernel.memory().translate(kernel.task(thread).root, after.first_mapped).is_some());
    }

    #[test]
    fn fault_two_pages_below_is_bad_address() {
        let mut kernel = running_thread(4);
        let thread = kernel.current();
        let region = kernel.task(thread).stack_region.unwrap();
        let addr = region.first_mapped.start_address() - PAGE_SIZE - 4;
        assert_eq!(kernel.grow_stack(addr), Err(KernelError::BadAddress));
        assert_eq!(kernel.task(thread).stack_region, Some(region));
    }

    #[test]
    fn full_window_is_no_memory() {
        let mut kernel = running_thread(3);
        let thread = kernel.current();
        for _ in 0..2 {
            let edge = kernel.task(thread).stack_region.unwrap().first_mapped;
            kernel.grow_stack(edge.start_address() - 1).unwrap();
        }
        let region = kernel.task(thread).stack_region.unwrap();
        assert!(region.is_fully_mapped());
        let below = region.first_page.start_address() - 1;
        assert_eq!(kernel.grow_stack(below), Err(KernelError::NoMemory));
    }

    #[test]
    fn full_upper_window_faults_on_its_guard_page() {
        let mut config = test_config();
        config.thread_stack_pages = 2;
        let mut kernel = boot_with(config);
        let code = config.layout.code_start;
        let init = kernel.current();
        kernel.create_thread(code, 0, code).unwrap();
        let tid = kernel.create_thread(code, 0, code).unwrap();
        let upper = kernel.task(init).group.tids.lookup(tid).unwrap();
        while kernel.current() != upper {
            kernel.yield_now();
        }

        let edge = kernel.task(upper).stack_region.unwrap().first_mapped;
        kernel.grow_stack(edge.start_address() - 1).unwrap();
        let region = kernel.task(upper).stack_region.unwrap();
        assert!(region.is_fully_mapped());

        let guard = region.first_page.checked_sub(1).unwrap();
        assert_eq!(kernel.memory().translate(kernel.task(upper).root, guard), None);
        assert_eq!(kernel.grow_stack(guard.start_address() + 8), Err(KernelError::NoMemory));
    }

    #[test]
    fn task_without_window_cannot_grow() {
        let mut kernel = boot_with(test_config());
        let addr = test_config().layout.data_start - 4;
        assert_eq!(kernel.grow_stack(addr), Err(KernelError::BadAddress));
    }

    #[test]
    fn exhausted_frames_are_no_memory() {
        let mut kernel = running_thread(4);
        let thread = kernel.current();
        let edge = kernel.task(thread).stack_region.unwrap().first_mapped;
        kernel.memory_mut().limit_free_frames(0);
        assert_eq!(kernel.grow_stack(edge.start_address() - 1), Err(KernelError::NoMemory));
        assert_eq!(kernel.task(thread).stack_region.unwrap().first_mapped, edge);
    }
}
