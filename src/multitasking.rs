//! Context switching
//!
//! Every parked task's kernel stack ends in the frame `switch_context` pops:
//! `edi, esi, ebx, ebp, ret`. Fresh tasks "return" into `user_return`,
//! which pops the saved user registers and `iretd`s to ring 3.

use ember_core::Dispatch;

use crate::globals;

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    r#"
.global switch_context
switch_context:
    // cdecl: [esp + 4] = new_sp, [esp + 8] = old_sp_ptr
    mov eax, [esp + 4]
    mov edx, [esp + 8]

    push ebp
    push ebx
    push esi
    push edi

    mov [edx], esp
    mov esp, eax

    pop edi
    pop esi
    pop ebx
    pop ebp
    ret

.global user_return
user_return:
    mov ax, 0x23
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax

    pop edi
    pop esi
    pop ebp
    pop ebx
    pop edx
    pop ecx
    pop eax
    iretd

.global syscall_entry
syscall_entry:
    push eax
    push ecx
    push edx
    push ebx
    push ebp
    push esi
    push edi

    mov ax, 0x10
    mov ds, ax
    mov es, ax

    push esp
    call syscall_handler
    add esp, 4
    jmp user_return
"#
);

#[cfg(target_arch = "x86")]
extern "C" {
    pub fn switch_context(new_sp: usize, old_sp_ptr: *mut usize);
    fn user_return();
    /// IDT gate target for `int 0x80`
    pub fn syscall_entry();
}

/// Where fresh kernel stacks return to
#[cfg(target_arch = "x86")]
pub fn user_return_address() -> usize {
    user_return as usize
}

#[cfg(target_arch = "x86")]
#[no_mangle]
extern "C" fn syscall_handler(frame: *mut ember_core::context::UserFrame) {
    // The frame sits on this task's kernel stack, which outlives the call.
    let frame = unsafe { &mut *frame };
    let (result, dispatch) = crate::syscall::dispatch(frame.eax, frame.ebx, frame.ecx, frame.edx);
    frame.eax = result as usize;
    if let Some(dispatch) = dispatch {
        resume(dispatch);
    }
}

/// Carry out a switch the core decided on. The kernel lock must be free.
pub fn resume(dispatch: Dispatch) {
    if let Some(platform) = globals::PLATFORM.get() {
        (platform.set_kernel_stack)(dispatch.kernel_stack_top);
    }

    #[cfg(target_arch = "x86")]
    unsafe {
        switch_context(dispatch.resume_sp, dispatch.save_sp);
    }

    #[cfg(not(target_arch = "x86"))]
    log::error!(
        "[Sched] no switch primitive on this target ({:?} -> {:?})",
        dispatch.from,
        dispatch.to
    );
}
