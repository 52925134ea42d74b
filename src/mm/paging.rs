//! Paging Support
//!
//! Two-level i386 page tables. Directory slots below `user_base` are copied
//! from the boot directory into every new root, so the kernel image, the
//! heap and the frame pool stay mapped (identity) in all address spaces.
//! Page tables are edited through their physical address for that reason.

use alloc::vec::Vec;
use core::arch::asm;
use core::ops::Range;
use core::ptr;

use ember_core::mm::{AddressSpaces, Frame, MapError, PageFlags, PageRoot, VirtPage, PAGE_SIZE};

const ENTRIES: usize = 1024;
const ADDR_MASK: u32 = !0xFFF;
const FLAG_MASK: u32 = 0b111;

type Table = [u32; ENTRIES];

pub struct X86Paging {
    free: Vec<Frame>,
    /// First directory slot owned by the user half
    user_pde_start: usize,
}

fn pde_index(page: VirtPage) -> usize {
    page.0 / ENTRIES
}

fn pte_index(page: VirtPage) -> usize {
    page.0 % ENTRIES
}

fn entry(frame: Frame, flags: PageFlags) -> u32 {
    frame.start_address() as u32 | flags.0 | PageFlags::PRESENT.0
}

fn table_at(phys: u32) -> *mut Table {
    (phys & ADDR_MASK) as usize as *mut Table
}

impl X86Paging {
    /// Take over the frames in `frames` (by frame number).
    ///
    /// # Safety
    /// Every frame in the pool must be identity-mapped below `user_base` in
    /// the boot directory, and unused by anything else.
    pub unsafe fn new(frames: Range<usize>, user_base: usize) -> Self {
        log::info!("[Paging] {} frames in the pool", frames.len());
        Self {
            free: frames.rev().map(Frame).collect(),
            user_pde_start: user_base / (ENTRIES * PAGE_SIZE),
        }
    }

    fn zeroed_frame(&mut self) -> Option<Frame> {
        let frame = self.allocate_frame()?;
        unsafe { ptr::write_bytes(frame.start_address() as *mut u8, 0, PAGE_SIZE) };
        Some(frame)
    }
}

impl AddressSpaces for X86Paging {
    fn allocate_frame(&mut self) -> Option<Frame> {
        self.free.pop()
    }

    fn free_frame(&mut self, frame: Frame) {
        self.free.push(frame);
    }

    fn create_root(&mut self) -> Option<PageRoot> {
        let dir = self.zeroed_frame()?;
        let boot = table_at(self.active_root().0 as u32);
        let new = table_at(dir.start_address() as u32);
        unsafe {
            for slot in 0..self.user_pde_start {
                (*new)[slot] = (*boot)[slot];
            }
        }
        Some(PageRoot(dir.start_address()))
    }

    fn destroy_root(&mut self, root: PageRoot) {
        let dir = table_at(root.0 as u32);
        for slot in self.user_pde_start..ENTRIES {
            let pde = unsafe { (*dir)[slot] };
            if pde & PageFlags::PRESENT.0 != 0 {
                self.free_frame(Frame((pde >> 12) as usize));
            }
        }
        self.free_frame(Frame(root.0 / PAGE_SIZE));
    }

    fn map(&mut self, root: PageRoot, page: VirtPage, frame: Frame, flags: PageFlags) -> Result<(), MapError> {
        let slot = pde_index(page);
        if slot < self.user_pde_start {
            return Err(MapError);
        }
        let dir = table_at(root.0 as u32);
        let mut pde = unsafe { (*dir)[slot] };
        if pde & PageFlags::PRESENT.0 == 0 {
            let table = self.zeroed_frame().ok_or(MapError)?;
            // Leaf entries carry the real permissions.
            pde = entry(table, PageFlags::USER_DATA);
            unsafe { (*dir)[slot] = pde };
        }
        unsafe { (*table_at(pde))[pte_index(page)] = entry(frame, flags) };
        Ok(())
    }

    fn unmap(&mut self, root: PageRoot, page: VirtPage) -> Option<Frame> {
        let pde = unsafe { (*table_at(root.0 as u32))[pde_index(page)] };
        if pde & PageFlags::PRESENT.0 == 0 {
            return None;
        }
        let table = table_at(pde);
        let pte = unsafe { (*table)[pte_index(page)] };
        if pte & PageFlags::PRESENT.0 == 0 {
            return None;
        }
        unsafe { (*table)[pte_index(page)] = 0 };
        Some(Frame((pte >> 12) as usize))
    }

    fn translate(&self, root: PageRoot, page: VirtPage) -> Option<(Frame, PageFlags)> {
        let pde = unsafe { (*table_at(root.0 as u32))[pde_index(page)] };
        if pde & PageFlags::PRESENT.0 == 0 {
            return None;
        }
        let pte = unsafe { (*table_at(pde))[pte_index(page)] };
        if pte & PageFlags::PRESENT.0 == 0 {
            return None;
        }
        Some((Frame((pte >> 12) as usize), PageFlags(pte & FLAG_MASK)))
    }

    fn active_root(&self) -> PageRoot {
        let cr3: usize;
        unsafe { asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags)) };
        PageRoot(cr3 & ADDR_MASK as usize)
    }

    fn switch_root(&mut self, root: PageRoot) {
        unsafe { asm!("mov cr3, {}", in(reg) root.0, options(nostack, preserves_flags)) };
    }

    fn flush(&mut self, page: VirtPage) {
        unsafe { asm!("invlpg [{}]", in(reg) page.start_address(), options(nostack, preserves_flags)) };
    }

    fn read(&self, addr: usize, buf: &mut [u8]) {
        unsafe { ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
    }

    fn write(&mut self, addr: usize, bytes: &[u8]) {
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
    }

    fn copy_page(&mut self, src: VirtPage, dst: VirtPage) {
        unsafe {
            ptr::copy_nonoverlapping(
                src.start_address() as *const u8,
                dst.start_address() as *mut u8,
                PAGE_SIZE,
            )
        };
    }
}
