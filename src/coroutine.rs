#[cfg_attr(target_arch = "x86", path = "coroutine/platform/i686.rs")]
#[cfg_attr(target_arch = "x86_64", path = "coroutine/platform/sysv64.rs")]
mod platform;

#[cfg(not(all(unix, any(target_arch = "x86", target_arch = "x86_64"))))]
compile_error!("stackful coroutines need a unix x86 or x86_64 target");

mod context;
mod list;
mod manager;
pub mod stack;

use std::ops::Range;
use std::rc::Weak;

use manager::Inner;

pub use manager::{Config, Manager, DEFAULT_POOL_CEILING, DEFAULT_STACK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoroutineState {
    /// The task this handle named is gone: its record was re-acquired,
    /// evicted, or its manager was closed.
    Dead,
    /// Freshly allocated, never resumed.
    Ready,
    Running,
    Suspended,
    /// Task finished, or the stack came from the idle pool and has not been
    /// resumed for its new task yet.
    Idle,
}

/// Handle to a coroutine acquired with [`Manager::get`].
///
/// Handles are cheap to clone. They hold no ownership of the manager and
/// go stale once the task they were acquired for has finished and the
/// coroutine has been handed out again or released.
#[derive(Debug, Clone)]
pub struct Coroutine {
    manager: Weak<Inner>,
    key: usize,
    generation: u64,
}

impl Coroutine {
    pub(crate) fn new(manager: Weak<Inner>, key: usize, generation: u64) -> Self {
        Coroutine {
            manager,
            key,
            generation,
        }
    }

    /// Switches onto this coroutine's stack until it yields or its task
    /// finishes.
    ///
    /// # Panics
    ///
    /// When called from inside a running coroutine of the same manager, or
    /// when the task this handle names has already finished.
    pub fn resume(&self) {
        let manager = self
            .manager
            .upgrade()
            .unwrap_or_else(|| panic!("resumed a coroutine whose manager is closed"));
        Inner::resume(&manager, self.key, self.generation);
    }

    /// Suspends the running coroutine and switches back to whoever resumed
    /// it. Must be called by the coroutine itself.
    pub fn yield_now(&self) {
        assert!(
            self.manager.strong_count() > 0,
            "yield from a coroutine whose manager is closed"
        );
        let manager = Weak::as_ptr(&self.manager);
        // SAFETY: the manager is alive (checked above). No strong reference
        // is held here, so a parked stack never keeps it alive.
        unsafe { Inner::suspend(manager, self.key, self.generation) }
    }

    pub fn state(&self) -> CoroutineState {
        match self.manager.upgrade() {
            Some(manager) => manager.state(self.key, self.generation),
            None => CoroutineState::Dead,
        }
    }

    /// Whether the task this handle was acquired for has returned.
    pub fn is_finished(&self) -> bool {
        match self.manager.upgrade() {
            Some(manager) => manager.is_finished(self.key, self.generation),
            None => true,
        }
    }

    /// Usable address range of the coroutine's stack, while the handle is live.
    pub fn stack_bounds(&self) -> Option<Range<usize>> {
        self.manager
            .upgrade()?
            .stack_bounds(self.key, self.generation)
    }
}

impl PartialEq for Coroutine {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.generation == other.generation
            && Weak::ptr_eq(&self.manager, &other.manager)
    }
}

impl Eq for Coroutine {}

/// Resumes every unfinished coroutine in turn until all of them are finished.
pub fn schedule(coros: &[Coroutine]) {
    let mut all_finished = false;
    while !all_finished {
        all_finished = true;
        for co in coros.iter() {
            if !co.is_finished() {
                all_finished = false;
                co.resume();
            }
        }
    }
}
