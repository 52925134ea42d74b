//! Frame / page interface
//!
//! The core never touches page tables itself. Everything that changes the
//! shape of an address space goes through [`AddressSpaces`], which the
//! architecture layer implements (and the tests mock).

use alloc::boxed::Box;
use core::ops::BitOr;

pub const PAGE_SIZE: usize = 4096;

/// Size of a machine word on the target (i386: 4 bytes)
pub const WORD_SIZE: usize = core::mem::size_of::<u32>();

/// A physical frame, by frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(pub usize);

impl Frame {
    pub fn start_address(self) -> usize {
        self.0 * PAGE_SIZE
    }
}

/// A virtual page, by page number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPage(pub usize);

impl VirtPage {
    pub fn containing(addr: usize) -> Self {
        VirtPage(addr / PAGE_SIZE)
    }

    pub fn start_address(self) -> usize {
        self.0 * PAGE_SIZE
    }

    /// Page `n` pages above this one
    pub fn add(self, n: usize) -> Self {
        VirtPage(self.0 + n)
    }

    /// Page `n` pages below this one, if it exists
    pub fn checked_sub(self, n: usize) -> Option<Self> {
        self.0.checked_sub(n).map(VirtPage)
    }
}

/// Handle for a page-table root (the physical address loaded into CR3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRoot(pub usize);

/// Leaf mapping permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(pub u32);

impl PageFlags {
    pub const PRESENT: PageFlags = PageFlags(1 << 0);
    pub const WRITABLE: PageFlags = PageFlags(1 << 1);
    pub const USER: PageFlags = PageFlags(1 << 2);

    /// User read/write data
    pub const USER_DATA: PageFlags = PageFlags(0b111);
    /// User read-only code
    pub const USER_CODE: PageFlags = PageFlags(0b101);
    /// Kernel-only read/write (scratch mappings)
    pub const KERNEL_DATA: PageFlags = PageFlags(0b011);

    pub fn contains(self, other: PageFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PageFlags {
    type Output = PageFlags;

    fn bitor(self, rhs: PageFlags) -> PageFlags {
        PageFlags(self.0 | rhs.0)
    }
}

/// Mapping could not be installed (no frame for an intermediate table)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapError;

/// Physical memory and page-table primitives consumed by the core.
///
/// `read`, `write` and `copy_page` address memory through the *active*
/// root; the caller guarantees the pages involved are mapped there.
pub trait AddressSpaces {
    /// Take one free physical frame
    fn allocate_frame(&mut self) -> Option<Frame>;

    /// Return a frame to the free pool
    fn free_frame(&mut self, frame: Frame);

    /// Build an empty root that already shares the kernel mappings
    fn create_root(&mut self) -> Option<PageRoot>;

    /// Release a root and its intermediate tables (leaf frames are the caller's)
    fn destroy_root(&mut self, root: PageRoot);

    fn map(&mut self, root: PageRoot, page: VirtPage, frame: Frame, flags: PageFlags) -> Result<(), MapError>;

    /// Remove a leaf mapping, returning the frame it pointed at
    fn unmap(&mut self, root: PageRoot, page: VirtPage) -> Option<Frame>;

    fn translate(&self, root: PageRoot, page: VirtPage) -> Option<(Frame, PageFlags)>;

    fn active_root(&self) -> PageRoot;

    fn switch_root(&mut self, root: PageRoot);

    /// Drop any cached translation for `page` in the active root
    fn flush(&mut self, page: VirtPage);

    fn read(&self, addr: usize, buf: &mut [u8]);

    fn write(&mut self, addr: usize, bytes: &[u8]);

    fn copy_page(&mut self, src: VirtPage, dst: VirtPage);
}

impl<T: AddressSpaces + ?Sized> AddressSpaces for Box<T> {
    fn allocate_frame(&mut self) -> Option<Frame> {
        (**self).allocate_frame()
    }

    fn free_frame(&mut self, frame: Frame) {
        (**self).free_frame(frame)
    }

    fn create_root(&mut self) -> Option<PageRoot> {
        (**self).create_root()
    }

    fn destroy_root(&mut self, root: PageRoot) {
        (**self).destroy_root(root)
    }

    fn map(&mut self, root: PageRoot, page: VirtPage, frame: Frame, flags: PageFlags) -> Result<(), MapError> {
        (**self).map(root, page, frame, flags)
    }

    fn unmap(&mut self, root: PageRoot, page: VirtPage) -> Option<Frame> {
        (**self).unmap(root, page)
    }

    fn translate(&self, root: PageRoot, page: VirtPage) -> Option<(Frame, PageFlags)> {
        (**self).translate(root, page)
    }

    fn active_root(&self) -> PageRoot {
        (**self).active_root()
    }

    fn switch_root(&mut self, root: PageRoot) {
        (**self).switch_root(root)
    }

    fn flush(&mut self, page: VirtPage) {
        (**self).flush(page)
    }

    fn read(&self, addr: usize, buf: &mut [u8]) {
        (**self).read(addr, buf)
    }

    fn write(&mut self, addr: usize, bytes: &[u8]) {
        (**self).write(addr, bytes)
    }

    fn copy_page(&mut self, src: VirtPage, dst: VirtPage) {
        (**self).copy_page(src, dst)
    }
}

/// Map `frame` at the scratch page of the active root, run `f` with the
/// scratch address, then tear the mapping down again.
///
/// This is how the kernel reaches frames that belong to an address space
/// other than the one it is running in.
pub fn with_scratch<M: AddressSpaces + ?Sized, R>(
    memory: &mut M,
    scratch: VirtPage,
    frame: Frame,
    f: impl FnOnce(&mut M, usize) -> R,
) -> Result<R, MapError> {
    let root = memory.active_root();
    memory.map(root, scratch, frame, PageFlags::KERNEL_DATA)?;
    memory.flush(scratch);
    let result = f(memory, scratch.start_address());
    memory.unmap(root, scratch);
    memory.flush(scratch);
    Ok(result)
}

/// Zero a frame through the scratch page
pub fn zero_frame<M: AddressSpaces + ?Sized>(memory: &mut M, scratch: VirtPage, frame: Frame) -> Result<(), MapError> {
    with_scratch(memory, scratch, frame, |memory, addr| {
        let zeros = [0u8; 256];
        for offset in (0..PAGE_SIZE).step_by(zeros.len()) {
            memory.write(addr + offset, &zeros);
        }
    })
}
