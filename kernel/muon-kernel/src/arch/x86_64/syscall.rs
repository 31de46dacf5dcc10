//! SYSCALL/SYSRET setup and the fast-path entry stub.
//!
//! `syscall` from ring 3 lands on [`syscall_entry`] with the return RIP in
//! RCX and RFLAGS in R11. The stub swaps to the current task's kernel
//! stack, saves the user frame (which doubles as fork's template), remaps
//! the arguments to the SysV convention, and calls the dispatcher. SFMASK
//! clears IF, so the whole kernel side of a syscall runs with interrupts
//! masked; scheduler entry points are the only suspension points.

use core::sync::atomic::{AtomicU64, Ordering};

use muon_core::arch::x86_64::msr::{EferFlags, IA32_EFER, MSR_LSTAR, MSR_SFMASK, MSR_STAR};
use muon_core::kdebug;

/// RFLAGS bits cleared on SYSCALL entry: IF (bit 9) and DF (bit 10).
const SFMASK_VALUE: u64 = 0x600;

/// Top of the current task's kernel stack. The context switch keeps this in
/// lock-step with TSS.RSP0; the entry stub loads it as its stack pointer.
pub static CURRENT_KERNEL_STACK: AtomicU64 = AtomicU64::new(0);

/// The caller's RSP, parked while the stub switches stacks.
static USER_RSP_SCRATCH: AtomicU64 = AtomicU64::new(0);

/// Kernel RSP just after the user frame was pushed. Fork reads this to
/// locate the frame it must replicate onto the child stack.
pub static SYSCALL_FRAME_RSP: AtomicU64 = AtomicU64::new(0);

/// Bytes the entry stub pushes onto the kernel stack: user RSP, RIP (rcx),
/// RFLAGS (r11), and the six callee-saved registers.
pub const SYSCALL_FRAME_BYTES: u64 = 9 * 8;

/// Programs EFER.SCE, STAR, LSTAR, and SFMASK.
///
/// STAR encodes the selector bases: SYSCALL loads CS=0x08/SS=0x10, SYSRET
/// loads SS=0x18|3 and CS=0x20|3; matching the GDT layout.
///
/// # Safety
///
/// The GDT must already be loaded with the expected descriptor order.
pub unsafe fn init() {
    // SAFETY: Standard MSR programming on a CPU in long mode.
    unsafe {
        let efer = IA32_EFER.read();
        IA32_EFER.write(efer | EferFlags::SYSTEM_CALL_ENABLE.bits());

        let star = (0x08u64 << 32) | (0x10u64 << 48);
        MSR_STAR.write(star);
        MSR_LSTAR.write(syscall_entry as *const () as u64);
        MSR_SFMASK.write(SFMASK_VALUE);
    }
    kdebug!("syscall: MSRs programmed");
}

/// Updates the kernel-stack-top variable the entry stub reads.
pub fn set_kernel_stack(top: u64) {
    CURRENT_KERNEL_STACK.store(top, Ordering::Release);
}

unsafe extern "C" {
    /// Rust-side dispatcher (`crate::syscall`).
    fn syscall_dispatch(nr: u64, a1: u64, a2: u64, a3: u64) -> i64;
}

/// The SYSCALL entry stub.
///
/// On entry: RAX = number, RDI/RSI/RDX = arguments, RCX = return RIP,
/// R11 = return RFLAGS, RSP = the *user* stack (the CPU does not switch
/// it). The pushed frame, bottom-up from the parked RSP: r15 r14 r13 r12
/// rbx rbp r11 rcx user_rsp; [`fork_child_return`]
/// (super::context::fork_child_return) unwinds exactly this shape.
#[unsafe(naked)]
unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        // Swap to the kernel stack, parking the user RSP.
        "mov [rip + {user_rsp}], rsp",
        "mov rsp, [rip + {kstack}]",

        // User return state + callee-saved registers.
        "push qword ptr [rip + {user_rsp}]",
        "push rcx",
        "push r11",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",

        // Anchor for fork's stack replication.
        "mov [rip + {frame}], rsp",

        // Remap to SysV: dispatch(nr=RDI, a1=RSI, a2=RDX, a3=RCX).
        "mov rcx, rdx",
        "mov rdx, rsi",
        "mov rsi, rdi",
        "mov rdi, rax",
        "call {dispatch}",

        // Unwind and drop back to ring 3; RAX carries the result.
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

        user_rsp = sym USER_RSP_SCRATCH,
        kstack = sym CURRENT_KERNEL_STACK,
        frame = sym SYSCALL_FRAME_RSP,
        dispatch = sym syscall_dispatch,
    );
}
