//! Host-side test doubles

use std::boxed::Box;
use std::collections::BTreeMap;
use std::vec;
use std::vec::Vec;

use crate::config::{KernelConfig, MemoryLayout};
use crate::kernel::Kernel;
use crate::mm::{AddressSpaces, Frame, MapError, PageFlags, PageRoot, VirtPage, PAGE_SIZE};
use crate::process::ProcessImage;

/// One page of "code" for the init image
pub const INIT_CODE: &[u8] = &[0x90; 64];

/// Simulated physical memory with one page table per root
pub struct MockMemory {
    frames: Vec<Box<[u8]>>,
    free: Vec<Frame>,
    withheld: Vec<Frame>,
    roots: BTreeMap<usize, BTreeMap<VirtPage, (Frame, PageFlags)>>,
    next_root: usize,
    active: PageRoot,
    maps_left: usize,
}

impl MockMemory {
    pub fn new(frames: usize) -> Self {
        let mut roots = BTreeMap::new();
        roots.insert(1, BTreeMap::new());
        Self {
            frames: (0..frames).map(|_| vec![0u8; PAGE_SIZE].into_boxed_slice()).collect(),
            free: (0..frames).rev().map(Frame).collect(),
            withheld: Vec::new(),
            roots,
            next_root: 2,
            active: PageRoot(1),
            maps_left: usize::MAX,
        }
    }

    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    /// Hide all but `n` free frames from the allocator
    pub fn limit_free_frames(&mut self, n: usize) {
        while self.free.len() > n {
            if let Some(frame) = self.free.pop() {
                self.withheld.push(frame);
            }
        }
    }

    /// Let `n` more `map` calls succeed, then fail every one after
    pub fn fail_maps_after(&mut self, n: usize) {
        self.maps_left = n;
    }

    pub fn live_roots(&self) -> usize {
        self.roots.len()
    }

    /// Read through an arbitrary (not necessarily active) root
    pub fn read_frame(&self, root: PageRoot, page: VirtPage, offset: usize, buf: &mut [u8]) {
        let (frame, _) = self.translate(root, page).expect("page not mapped");
        buf.copy_from_slice(&self.frames[frame.0][offset..offset + buf.len()]);
    }

    fn resolve(&self, addr: usize) -> (Frame, usize) {
        let page = VirtPage::containing(addr);
        let (frame, _) = self
            .translate(self.active, page)
            .unwrap_or_else(|| panic!("access to unmapped address {:#x}", addr));
        (frame, addr % PAGE_SIZE)
    }
}

impl AddressSpaces for MockMemory {
    fn allocate_frame(&mut self) -> Option<Frame> {
        self.free.pop()
    }

    fn free_frame(&mut self, frame: Frame) {
        assert!(!self.free.contains(&frame), "double free of {:?}", frame);
        self.frames[frame.0].fill(0xCC);
        self.free.push(frame);
    }

    fn create_root(&mut self) -> Option<PageRoot> {
        let root = self.next_root;
        self.next_root += 1;
        self.roots.insert(root, BTreeMap::new());
        Some(PageRoot(root))
    }

    fn destroy_root(&mut self, root: PageRoot) {
        assert_ne!(root, self.active, "destroying the active root");
        self.roots.remove(&root.0);
    }

    fn map(&mut self, root: PageRoot, page: VirtPage, frame: Frame, flags: PageFlags) -> Result<(), MapError> {
        if self.maps_left == 0 {
            return Err(MapError);
        }
        if self.maps_left != usize::MAX {
            self.maps_left -= 1;
        }
        let table = self.roots.get_mut(&root.0).ok_or(MapError)?;
        table.insert(page, (frame, flags | PageFlags::PRESENT));
        Ok(())
    }

    fn unmap(&mut self, root: PageRoot, page: VirtPage) -> Option<Frame> {
        self.roots.get_mut(&root.0)?.remove(&page).map(|(frame, _)| frame)
    }

    fn translate(&self, root: PageRoot, page: VirtPage) -> Option<(Frame, PageFlags)> {
        self.roots.get(&root.0)?.get(&page).copied()
    }

    fn active_root(&self) -> PageRoot {
        self.active
    }

    fn switch_root(&mut self, root: PageRoot) {
        assert!(self.roots.contains_key(&root.0), "switch to unknown root");
        self.active = root;
    }

    fn flush(&mut self, _page: VirtPage) {}

    fn read(&self, addr: usize, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            let (frame, offset) = self.resolve(addr + i);
            *byte = self.frames[frame.0][offset];
        }
    }

    fn write(&mut self, addr: usize, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            let (frame, offset) = self.resolve(addr + i);
            self.frames[frame.0][offset] = *byte;
        }
    }

    fn copy_page(&mut self, src: VirtPage, dst: VirtPage) {
        let (from, _) = self.resolve(src.start_address());
        let (to, _) = self.resolve(dst.start_address());
        let bytes = self.frames[from.0].clone();
        self.frames[to.0].copy_from_slice(&bytes);
    }
}

/// Small configuration so tests stay quick
pub fn test_config() -> KernelConfig {
    KernelConfig {
        task_capacity: 8,
        quantum: 3,
        kernel_stack_words: 64,
        tid_capacity: 8,
        thread_stack_pages: 4,
        initial_stack_pages: 1,
        user_return: 0xC000_1000,
        layout: MemoryLayout {
            code_pages: 16,
            data_pages: 4,
            ..MemoryLayout::default()
        },
    }
}

/// Kernel with init loaded and running
pub fn boot_with(config: KernelConfig) -> Kernel<MockMemory> {
    let mut kernel = Kernel::new(config, MockMemory::new(256));
    kernel
        .spawn_init(&ProcessImage {
            code: INIT_CODE,
            entry: config.layout.code_start,
        })
        .expect("init fits");
    kernel.schedule().expect("init dispatched");
    kernel
}

pub fn boot() -> Kernel<MockMemory> {
    boot_with(test_config())
}
