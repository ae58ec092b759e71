use core::arch::global_asm;

use super::context::{call_rust_fn, Context};

#[allow(improper_ctypes)]
extern "sysv64" {
    pub fn coro_stub();
    pub fn swap_context(current: *mut Context, next: *const Context, val: usize) -> usize;
}

// coro_stub
// assume when start, the boxed entry is in (%rsp) and the
// context to fall back to is in 8(%rsp)
global_asm!(
    ".global {0}",
    "{0}:",
    "mov rdi, [rsp]",
    "mov rbx, [rsp + 8]",
    "add rsp, 16",
    "call {call_rust_fn}", // call_rust_fn(*%rsp)
    "mov rsp, [rbx + 8]",  // the entry returned: %rsp = on_return.resume_sp
    "mov rax, 1",
    "jmp [rbx]",           // goto on_return.resume_addr
    sym coro_stub,
    call_rust_fn = sym call_rust_fn,
);

// swap_context
// current: %rdi
// next: %rsi
// val: %rdx
// -> %rax
global_asm!(
    ".global {0}",
    "{0}:",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "push rbx",
    "push rbp",
    "mov [rdi + 8], rsp",               // current.resume_sp = %rsp
    "lea rax, [rip + .Lco_ret_addr]",
    "mov [rdi], rax",                   // current.resume_addr = &&co_ret_addr
    "mov rsp, [rsi + 8]",               // %rsp = next.resume_sp
    "mov rax, rdx",                     // %rax = val
    "jmp [rsi]",                        // goto next.resume_addr
    ".Lco_ret_addr:",
    "pop rbp",
    "pop rbx",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "ret",                              // return %rax
    sym swap_context,
);
