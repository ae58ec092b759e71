use std::mem::{offset_of, size_of};

use static_assertions::{assert_eq_size, const_assert_eq};

use super::platform::coro_stub;
use super::stack::Stack;

type Address = usize;

/// A suspended execution flow: where to jump and which stack pointer to
/// restore. Callee-saved registers live on the suspended stack itself,
/// pushed by `swap_context`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    resume_addr: Address,
    resume_sp: Address,
}

// the assembly addresses the fields by word offset
assert_eq_size!(Context, [usize; 2]);
const_assert_eq!(offset_of!(Context, resume_addr), 0);
const_assert_eq!(offset_of!(Context, resume_sp), size_of::<usize>());

impl Context {
    /// Builds the context that starts `entry` on `stack` the first time it
    /// is switched to.
    ///
    /// `coro_stub` finds two words at the stack pointer: the boxed entry,
    /// then the context to switch to should the entry ever return.
    ///
    /// # Safety
    ///
    /// `stack` must stay mapped for as long as the returned context may be
    /// switched to, and `on_return` must still be valid if `entry` returns.
    pub unsafe fn prepare(
        stack: &Stack,
        entry: Box<dyn FnOnce()>,
        on_return: *const Context,
    ) -> Context {
        let entry = Box::into_raw(Box::new(entry));
        // `top` is page aligned, so the stub's stack is 16-byte aligned once
        // it has popped both words.
        let sp = stack.top().sub(2 * size_of::<usize>()).cast::<usize>();
        sp.write(entry as Address);
        sp.add(1).write(on_return as Address);
        Context {
            resume_addr: coro_stub as *const () as Address,
            resume_sp: sp as Address,
        }
    }
}

/// Called by `coro_stub` on the fresh stack.
///
/// A panic cannot unwind out of here; it aborts the process.
pub(super) unsafe extern "C" fn call_rust_fn(entry: *mut Box<dyn FnOnce()>) {
    let entry = Box::from_raw(entry);
    entry()
}
