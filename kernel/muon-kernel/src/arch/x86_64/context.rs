//! Context switch, fork-child resume, and the ring-3 entry.
//!
//! The switch saves the six callee-saved registers and the return address
//! on the outgoing kernel stack, parks the stack pointer in the outgoing
//! task's context slot, and resumes the incoming task by restoring its
//! parked stack. A freshly created task's stack is seeded with six zeroed
//! register slots and a trampoline address, so its first resume "returns"
//! into the trampoline (see [`seed_initial_stack`]).

use muon_core::addr::VirtAddr;

/// GDT selector for the user data segment with RPL 3 (index 3).
pub const USER_DATA_SELECTOR: u64 = 0x1B;

/// GDT selector for the user code segment with RPL 3 (index 4).
pub const USER_CODE_SELECTOR: u64 = 0x23;

/// Initial user RFLAGS: interrupts on, reserved bit 1 set.
pub const USER_RFLAGS: u64 = 0x202;

/// Number of seeded slots: six callee-saved registers plus the return
/// address.
pub const SEED_SLOTS: usize = 7;

/// Switches kernel stacks.
///
/// Pushes rbp/rbx/r12-r15 and stores RSP into `*old_context` (skipped when
/// null), then loads `new_context` as RSP, pops the same registers, and
/// returns on the new stack.
///
/// # Safety
///
/// - Interrupts must be disabled across the call.
/// - `new_context` must be a stack pointer produced by this function or by
///   [`seed_initial_stack`]-style seeding.
/// - No kernel lock may be held.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old_context: *mut u64, new_context: u64) {
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // First ever switch has no outgoing task.
        "test rdi, rdi",
        "jz 2f",
        "mov [rdi], rsp",
        "2:",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// Writes the initial stack frame a new task resumes through.
///
/// Layout (ascending addresses from the returned RSP): r15, r14, r13, r12,
/// rbx, rbp; all zero; then the trampoline address that
/// [`context_switch`]'s `ret` consumes.
///
/// Returns the seeded stack pointer to store in the task's context slot.
///
/// # Safety
///
/// `stack_top` must be the 16-aligned top of a writable kernel stack with
/// at least `SEED_SLOTS * 8` bytes below it.
pub unsafe fn seed_initial_stack(stack_top: u64, trampoline: unsafe extern "C" fn() -> !) -> u64 {
    let sp = stack_top - (SEED_SLOTS * 8) as u64;
    let slots = sp as *mut u64;
    // SAFETY: In bounds per the caller contract.
    unsafe {
        for i in 0..6 {
            slots.add(i).write(0);
        }
        slots.add(6).write(trampoline as usize as u64);
    }
    sp
}

/// Resume point for a forked child.
///
/// The child's seeded frame sits directly below its copy of the parent's
/// syscall frame, so after [`context_switch`] returns here the stack holds,
/// in pop order: r15, r14, r13, r12, rbx, rbp, user RFLAGS (r11), user RIP
/// (rcx), user RSP. RAX is zeroed (fork's return value in the child), the
/// frame is unwound, and control drops back to ring 3 exactly like the
/// parent's syscall return path.
#[unsafe(naked)]
pub unsafe extern "C" fn fork_child_return() -> ! {
    core::arch::naked_asm!(
        "xor eax, eax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "pop r11",
        "pop rcx",
        "pop rsp",
        "sysretq",
    );
}

/// Performs the initial transition to ring 3 via `iretq`.
///
/// Never returns. General-purpose registers are zeroed so no kernel state
/// leaks into user mode.
///
/// # Safety
///
/// - `entry` must be mapped user-executable in the current address space.
/// - `user_rsp` must point into a mapped user stack.
/// - The GDT must carry user data at index 3 and user code at index 4.
#[unsafe(naked)]
pub unsafe extern "C" fn jump_to_userspace(entry: u64, user_rsp: u64) -> ! {
    core::arch::naked_asm!(
        // Build the iretq frame: SS, RSP, RFLAGS, CS, RIP.
        "push {user_ds}",
        "push rsi",
        "push {rflags}",
        "push {user_cs}",
        "push rdi",

        "xor rax, rax",
        "xor rbx, rbx",
        "xor rcx, rcx",
        "xor rdx, rdx",
        "xor rsi, rsi",
        "xor rdi, rdi",
        "xor rbp, rbp",
        "xor r8, r8",
        "xor r9, r9",
        "xor r10, r10",
        "xor r11, r11",
        "xor r12, r12",
        "xor r13, r13",
        "xor r14, r14",
        "xor r15, r15",

        "iretq",

        user_ds = const USER_DATA_SELECTOR,
        user_cs = const USER_CODE_SELECTOR,
        rflags = const USER_RFLAGS,
    );
}

/// Flushes the TLB entry for one page.
pub fn invalidate_page(addr: VirtAddr) {
    muon_core::arch::x86_64::tlb::flush(addr);
}
