use core::arch::global_asm;

use super::context::{call_rust_fn, Context};

#[allow(improper_ctypes)]
extern "cdecl" {
    pub fn coro_stub();
    pub fn swap_context(current: *mut Context, next: *const Context, val: usize) -> usize;
}

// coro_stub
// assume when start, the boxed entry is in (%esp) and the
// context to fall back to is in 4(%esp)
global_asm!(
    ".global {0}",
    "{0}:",
    "pop eax",
    "pop ebx",
    "sub esp, 16",
    "mov [esp], eax",
    "call {call_rust_fn}", // call_rust_fn(...)
    "mov esp, [ebx + 4]",  // the entry returned: %esp = on_return.resume_sp
    "mov eax, 1",
    "jmp [ebx]",           // goto on_return.resume_addr
    sym coro_stub,
    call_rust_fn = sym call_rust_fn,
);

// swap_context
// current: 4(%esp)
// next: 8(%esp)
// val: 12(%esp)
// -> %eax
global_asm!(
    ".global {0}",
    "{0}:",
    "push ebp",
    "mov ebp, esp",
    "push ebx",
    "push edi",
    "push esi",
    "mov eax, [ebp + 8]",               // current
    "mov [eax + 4], esp",               // current.resume_sp = %esp
    "lea ecx, .Lco_ret_addr",
    "mov [eax], ecx",                   // current.resume_addr = &&co_ret_addr
    "mov ecx, [ebp + 12]",              // next
    "mov esp, [ecx + 4]",               // %esp = next.resume_sp
    "mov eax, [ebp + 16]",              // %eax = val
    "jmp [ecx]",                        // goto next.resume_addr
    ".Lco_ret_addr:",
    "pop esi",
    "pop edi",
    "pop ebx",
    "pop ebp",
    "ret",                              // return %eax
    sym swap_context,
);
