//! Single-threaded, cooperative, stackful coroutines.
//!
//! A [`Manager`] hands out [`Coroutine`]s, each running on its own mapped
//! stack with guard pages on both sides. Control moves explicitly: the
//! owner calls [`Coroutine::resume`], the coroutine gives it back with
//! [`Coroutine::yield_now`] or by returning. Finished coroutines keep their
//! stack in an idle pool and pick up the next task bound with
//! [`Manager::get`].

pub mod coroutine;
mod error;

pub use coroutine::{
    schedule, Config, Coroutine, CoroutineState, Manager, DEFAULT_POOL_CEILING,
    DEFAULT_STACK_SIZE,
};
pub use error::AllocationError;
