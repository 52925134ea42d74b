//! Saved register context and kernel stacks
//!
//! A task that is not running is fully described by its saved kernel stack
//! pointer. Whatever sits on the kernel stack below that pointer is private
//! to the context-switch primitive and the user-return stub:
//!
//! ```text
//!   high  +---------------------+ <- KernelStack::top()
//!         | UserFrame           |    restored by `user_return`, ends in iretd
//!         +---------------------+
//!         | SwitchFrame         |    popped by `switch_context`, then `ret`
//!   low   +---------------------+ <- saved kernel_sp
//! ```
//!
//! Nothing outside this module looks at the layout; the rest of the kernel
//! only asks for a context to be built and passes the resulting stack
//! pointer around.

use alloc::boxed::Box;
use alloc::vec;
use core::mem::size_of;

/// User code segment selector (GDT index 3, RPL 3)
pub const USER_CS: usize = 0x1B;
/// User data segment selector (GDT index 4, RPL 3)
pub const USER_DS: usize = 0x23;
/// EFLAGS for a fresh user task: IF set, reserved bit 1 set
pub const USER_EFLAGS: usize = 0x202;

/// Register image pushed on syscall / interrupt entry from ring 3.
///
/// Field order is memory order, lowest address first: the entry stub pushes
/// the general registers below the CPU's iret frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserFrame {
    pub edi: usize,
    pub esi: usize,
    pub ebp: usize,
    pub ebx: usize,
    pub edx: usize,
    pub ecx: usize,
    pub eax: usize,
    pub eip: usize,
    pub cs: usize,
    pub eflags: usize,
    pub esp: usize,
    pub ss: usize,
}

impl UserFrame {
    /// Frame that starts user execution at `eip` with stack `esp`
    pub fn entry(eip: usize, esp: usize) -> Self {
        Self {
            eip,
            esp,
            cs: USER_CS,
            ss: USER_DS,
            eflags: USER_EFLAGS,
            ..Self::default()
        }
    }
}

/// Callee-saved registers and return address consumed by `switch_context`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SwitchFrame {
    edi: usize,
    esi: usize,
    ebx: usize,
    ebp: usize,
    ret: usize,
}

const USER_FRAME_WORDS: usize = size_of::<UserFrame>() / size_of::<usize>();
const SWITCH_FRAME_WORDS: usize = size_of::<SwitchFrame>() / size_of::<usize>();

/// How a never-run task should begin executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Resume where the parent trapped into `fork`, with a zero result.
    /// The parent's `UserFrame` must already be at the top of the stack.
    ForkReturn,
    /// Start user code at `entry` with the user stack pointer at `user_sp`
    User { entry: usize, user_sp: usize },
}

/// Opaque saved continuation of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedContext {
    pub kernel_sp: usize,
}

/// Kernel stack owned by a PCB
pub struct KernelStack {
    words: Box<[usize]>,
}

impl KernelStack {
    pub fn new(words: usize) -> Self {
        debug_assert!(words >= USER_FRAME_WORDS + SWITCH_FRAME_WORDS);
        Self {
            words: vec![0usize; words].into_boxed_slice(),
        }
    }

    /// Address one past the highest word (what the TSS `esp0` should hold)
    pub fn top(&self) -> usize {
        self.words.as_ptr() as usize + self.words.len() * size_of::<usize>()
    }

    fn address_of(&self, index: usize) -> usize {
        self.words.as_ptr() as usize + index * size_of::<usize>()
    }

    fn user_frame_index(&self) -> usize {
        self.words.len() - USER_FRAME_WORDS
    }

    /// The user register image saved at the top of this stack
    pub fn user_frame(&self) -> UserFrame {
        let base = self.user_frame_index();
        let w = &self.words[base..];
        UserFrame {
            edi: w[0],
            esi: w[1],
            ebp: w[2],
            ebx: w[3],
            edx: w[4],
            ecx: w[5],
            eax: w[6],
            eip: w[7],
            cs: w[8],
            eflags: w[9],
            esp: w[10],
            ss: w[11],
        }
    }

    pub fn set_user_frame(&mut self, frame: &UserFrame) {
        let base = self.user_frame_index();
        let w = &mut self.words[base..];
        w.copy_from_slice(&[
            frame.edi,
            frame.esi,
            frame.ebp,
            frame.ebx,
            frame.edx,
            frame.ecx,
            frame.eax,
            frame.eip,
            frame.cs,
            frame.eflags,
            frame.esp,
            frame.ss,
        ]);
    }

    /// Whole-stack copy, used when forking
    pub fn copy_from(&mut self, other: &KernelStack) {
        self.words.copy_from_slice(&other.words);
    }

    /// Word at a saved stack pointer inside this stack, if it lies here
    pub fn word_at(&self, addr: usize) -> Option<usize> {
        let base = self.words.as_ptr() as usize;
        if addr < base || addr >= self.top() {
            return None;
        }
        self.words.get((addr - base) / size_of::<usize>()).copied()
    }
}

/// Prepare `stack` so that the first `switch_context` into it lands in the
/// user-return stub, which then drops to user mode as `kind` describes.
pub fn build_initial_context(stack: &mut KernelStack, kind: EntryKind, user_return: usize) -> SavedContext {
    match kind {
        EntryKind::ForkReturn => {
            let mut frame = stack.user_frame();
            frame.eax = 0;
            stack.set_user_frame(&frame);
        }
        EntryKind::User { entry, user_sp } => {
            stack.set_user_frame(&UserFrame::entry(entry, user_sp));
        }
    }

    let base = stack.user_frame_index() - SWITCH_FRAME_WORDS;
    let switch = SwitchFrame {
        ret: user_return,
        ..SwitchFrame::default()
    };
    stack.words[base..base + SWITCH_FRAME_WORDS].copy_from_slice(&[
        switch.edi,
        switch.esi,
        switch.ebx,
        switch.ebp,
        switch.ret,
    ]);

    SavedContext {
        kernel_sp: stack.address_of(base),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER_RETURN: usize = 0xC010_0000;

    #[test]
    fn user_entry_context_returns_into_stub() {
        let mut stack = KernelStack::new(256);
        let ctx = build_initial_context(
            &mut stack,
            EntryKind::User { entry: 0x0040_1000, user_sp: 0x4000_FFF8 },
            USER_RETURN,
        );

        // ret slot is the fifth word above the saved pointer
        assert_eq!(stack.word_at(ctx.kernel_sp + 4 * size_of::<usize>()), Some(USER_RETURN));
        assert_eq!(ctx.kernel_sp + (SWITCH_FRAME_WORDS + USER_FRAME_WORDS) * size_of::<usize>(), stack.top());

        let frame = stack.user_frame();
        assert_eq!(frame.eip, 0x0040_1000);
        assert_eq!(frame.esp, 0x4000_FFF8);
        assert_eq!(frame.cs, USER_CS);
        assert_eq!(frame.ss, USER_DS);
        assert_eq!(frame.eflags, USER_EFLAGS);
    }

    #[test]
    fn fork_return_keeps_registers_but_zeroes_eax() {
        let mut parent = KernelStack::new(256);
        let mut trapped = UserFrame::entry(0x0040_2000, 0x0080_FF00);
        trapped.eax = 2; // SYS_FORK
        trapped.ebx = 77;
        parent.set_user_frame(&trapped);

        let mut child = KernelStack::new(256);
        child.copy_from(&parent);
        build_initial_context(&mut child, EntryKind::ForkReturn, USER_RETURN);

        let frame = child.user_frame();
        assert_eq!(frame.eax, 0);
        assert_eq!(frame.ebx, 77);
        assert_eq!(frame.eip, trapped.eip);
        assert_eq!(parent.user_frame().eax, 2);
    }
}
