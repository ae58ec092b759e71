use std::cell::{RefCell, UnsafeCell};
use std::mem::{self, ManuallyDrop};
use std::ops::Range;
use std::ptr;
use std::rc::Rc;

use log::{debug, trace, warn};
use slab::Slab;

use super::context::Context;
use super::list::{Linked, Links, List, Membership};
use super::platform::swap_context;
use super::stack::Stack;
use super::{Coroutine, CoroutineState};
use crate::error::AllocationError;

/// Usable stack size of each coroutine unless configured otherwise.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
/// Finished coroutines kept for reuse unless configured otherwise.
pub const DEFAULT_POOL_CEILING: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Requested usable bytes per stack, rounded up to whole pages.
    pub stack_size: usize,
    /// Idle coroutines retained after an acquisition; the rest are unmapped.
    pub pool_ceiling: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_size: DEFAULT_STACK_SIZE,
            pool_ceiling: DEFAULT_POOL_CEILING,
        }
    }
}

impl Config {
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_pool_ceiling(mut self, pool_ceiling: usize) -> Self {
        self.pool_ceiling = pool_ceiling;
        self
    }
}

type Entry = Box<dyn FnOnce(&Coroutine)>;

struct Record {
    state: CoroutineState,
    generation: u64,
    stack: Stack,
    context: Context,
    entry: Option<Entry>,
    links: Links,
}

impl Linked for Record {
    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

struct Pool {
    config: Config,
    current: Option<usize>,
    records: Slab<Record>,
    // acquired and not yet finished, suspended ones included
    running: List,
    // finished, stack kept for the next `get`
    idle: List,
    generation: u64,
}

impl Pool {
    fn live(&self, key: usize, generation: u64) -> Option<&Record> {
        self.records
            .get(key)
            .filter(|record| record.generation == generation)
    }

    fn live_mut(&mut self, key: usize, generation: u64) -> Option<&mut Record> {
        self.records
            .get_mut(key)
            .filter(|record| record.generation == generation)
    }

    fn release(&mut self, key: usize) {
        let record = self.records.remove(key);
        debug!("releasing coroutine {} from the idle pool", key);
        drop(record);
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let mut leaked = 0;
        for record in self.records.drain() {
            match record.state {
                // frames parked mid-task stay mapped; their memory is never
                // handed back while something on it might still be pinned
                CoroutineState::Suspended | CoroutineState::Running => {
                    leaked += 1;
                    mem::forget(record.stack);
                }
                _ => drop(record),
            }
        }
        if leaked > 0 {
            warn!(
                "coroutine manager dropped with {} suspended coroutines, leaking their stacks",
                leaked
            );
        }
    }
}

pub(crate) struct Inner {
    // where `resume` returns to; stable for the life of the `Rc`
    outer: UnsafeCell<Context>,
    pool: RefCell<Pool>,
}

/// Owns every coroutine stack it hands out and drives them from one thread.
///
/// ```no_run
/// use stackful_coroutine::Manager;
///
/// let manager = Manager::open();
/// let co = manager.get(|co| {
///     println!("first half");
///     co.yield_now();
///     println!("second half");
/// })?;
/// co.resume();
/// co.resume();
/// assert!(co.is_finished());
/// manager.close();
/// # Ok::<(), stackful_coroutine::AllocationError>(())
/// ```
pub struct Manager {
    inner: Rc<Inner>,
}

impl Manager {
    pub fn open() -> Manager {
        Manager::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Manager {
        Manager {
            inner: Rc::new(Inner {
                outer: UnsafeCell::new(Context::default()),
                pool: RefCell::new(Pool {
                    config,
                    current: None,
                    records: Slab::new(),
                    running: List::new(Membership::Running),
                    idle: List::new(Membership::Idle),
                    generation: 0,
                }),
            }),
        }
    }

    /// Releases every pooled stack.
    ///
    /// # Panics
    ///
    /// If a coroutine is running, or any acquired coroutine has not
    /// finished its task.
    pub fn close(self) {
        {
            let pool = self.inner.pool.borrow();
            assert!(
                pool.current.is_none(),
                "coroutine manager closed from inside a running coroutine"
            );
            assert!(
                pool.running.is_empty(),
                "coroutine manager closed with {} coroutines still acquired",
                pool.running.len()
            );
            debug!(
                "closing coroutine manager, releasing {} idle stacks",
                pool.idle.len()
            );
        }
        drop(self);
    }

    /// Binds `entry` to a coroutine, reusing an idle stack when there is one.
    ///
    /// The coroutine is counted as running from here on, even before its
    /// first `resume`. `entry` receives the coroutine's own handle.
    pub fn get<F>(&self, entry: F) -> Result<Coroutine, AllocationError>
    where
        F: FnOnce(&Coroutine) + 'static,
    {
        let mut pool = self.inner.pool.borrow_mut();
        let pool = &mut *pool;

        let key = match pool.idle.pop_front(&mut pool.records) {
            Some(key) => {
                assert_eq!(
                    pool.records[key].state,
                    CoroutineState::Idle,
                    "pooled coroutine {} is not idle",
                    key
                );
                while pool.idle.len() > pool.config.pool_ceiling {
                    let Some(evicted) = pool.idle.pop_front(&mut pool.records) else {
                        break;
                    };
                    pool.release(evicted);
                }
                key
            }
            None => {
                let stack = Stack::new(pool.config.stack_size)?;
                pool.records.insert(Record {
                    state: CoroutineState::Ready,
                    generation: 0,
                    stack,
                    context: Context::default(),
                    entry: None,
                    links: Links::default(),
                })
            }
        };

        pool.generation += 1;
        let generation = pool.generation;
        pool.running.push_front(&mut pool.records, key);
        let record = &mut pool.records[key];
        record.generation = generation;
        record.entry = Some(Box::new(entry));
        trace!("acquired coroutine {} ({:?})", key, record.state);

        Ok(Coroutine::new(Rc::downgrade(&self.inner), key, generation))
    }

    /// The coroutine executing right now, if any.
    pub fn current(&self) -> Option<Coroutine> {
        let pool = self.inner.pool.borrow();
        pool.current.map(|key| {
            Coroutine::new(
                Rc::downgrade(&self.inner),
                key,
                pool.records[key].generation,
            )
        })
    }

    pub fn idle_count(&self) -> usize {
        self.inner.pool.borrow().idle.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.pool.borrow().running.len()
    }

    pub fn config(&self) -> Config {
        self.inner.pool.borrow().config
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pool = self.inner.pool.borrow();
        f.debug_struct("Manager")
            .field("config", &pool.config)
            .field("current", &pool.current)
            .field("running", &pool.running.len())
            .field("idle", &pool.idle.len())
            .finish()
    }
}

impl Inner {
    pub(super) fn resume(this: &Rc<Inner>, key: usize, generation: u64) {
        let outer = this.outer.get();
        let (outer, next) = {
            let mut pool = this.pool.borrow_mut();
            assert!(
                pool.current.is_none(),
                "resume called from inside a running coroutine"
            );
            let manager = Rc::as_ptr(this);
            let record = match pool.live_mut(key, generation) {
                Some(record) => record,
                None => panic!("resumed a dead coroutine"),
            };
            assert_eq!(
                record.links.membership(),
                Some(Membership::Running),
                "resumed a coroutine whose task has finished"
            );
            trace!("resuming coroutine {} ({:?})", key, record.state);
            match record.state {
                CoroutineState::Ready => {
                    let start: Box<dyn FnOnce()> =
                        Box::new(move || unsafe { trampoline(manager, key) });
                    // SAFETY: the stack lives as long as the record, and the
                    // outer context as long as the manager.
                    record.context = unsafe { Context::prepare(&record.stack, start, outer) };
                }
                CoroutineState::Idle | CoroutineState::Suspended => {}
                state => panic!("cannot resume a coroutine in state {:?}", state),
            }
            record.state = CoroutineState::Running;
            let next = ptr::addr_of!(record.context);
            pool.current = Some(key);
            (outer, next)
        };
        // SAFETY: no borrow of the pool is held across the switch; the
        // coroutine's stack is mapped while its record exists.
        unsafe {
            swap_context(outer, next, 0);
        }
    }

    /// Parks the current coroutine and switches back to the outer context.
    ///
    /// # Safety
    ///
    /// `manager` must point to a live `Inner`, and this must run on the
    /// stack of coroutine `key`.
    pub(super) unsafe fn suspend(manager: *const Inner, key: usize, generation: u64) {
        let (current, outer) = {
            let this = &*manager;
            let mut pool = this.pool.borrow_mut();
            let pool = &mut *pool;
            assert!(
                pool.live(key, generation).is_some() && pool.current == Some(key),
                "yield called from outside the coroutine"
            );
            // a nested coroutine of another manager can be current here too;
            // only a frame on this coroutine's own stack may park it
            let marker = 0u8;
            let sp = std::hint::black_box(ptr::addr_of!(marker)) as usize;
            assert!(
                pool.records[key].stack.bounds().contains(&sp),
                "yield called from outside the coroutine's own stack"
            );
            match pool.records[key].state {
                CoroutineState::Running => {
                    pool.records[key].state = CoroutineState::Suspended;
                    trace!("coroutine {} suspended", key);
                }
                CoroutineState::Idle => {
                    pool.running.remove(&mut pool.records, key);
                    pool.idle.push_front(&mut pool.records, key);
                    trace!("coroutine {} finished, {} idle", key, pool.idle.len());
                }
                state => panic!("cannot yield a coroutine in state {:?}", state),
            }
            pool.current = None;
            (ptr::addr_of_mut!(pool.records[key].context), this.outer.get())
        };
        swap_context(current, outer, 0);
    }

    pub(super) fn state(&self, key: usize, generation: u64) -> CoroutineState {
        self.pool
            .borrow()
            .live(key, generation)
            .map_or(CoroutineState::Dead, |record| record.state)
    }

    pub(super) fn is_finished(&self, key: usize, generation: u64) -> bool {
        self.pool
            .borrow()
            .live(key, generation)
            .map_or(true, |record| {
                record.links.membership() != Some(Membership::Running)
            })
    }

    pub(super) fn stack_bounds(&self, key: usize, generation: u64) -> Option<Range<usize>> {
        self.pool
            .borrow()
            .live(key, generation)
            .map(|record| record.stack.bounds())
    }
}

/// Runs once per stack for the whole life of the stack: call whatever entry
/// is bound, mark the coroutine idle, yield, and go round again when a later
/// `get` + `resume` hands it a new task.
unsafe fn trampoline(manager: *const Inner, key: usize) {
    loop {
        let (entry, handle) = {
            let mut pool = (*manager).pool.borrow_mut();
            let record = &mut pool.records[key];
            let entry = match record.entry.take() {
                Some(entry) => entry,
                None => panic!("coroutine {} resumed without an entry", key),
            };
            // the `Rc` is borrowed, not owned: never drop it here
            let rc = ManuallyDrop::new(Rc::from_raw(manager));
            (entry, Coroutine::new(Rc::downgrade(&rc), key, record.generation))
        };
        let generation = handle.generation;
        entry(&handle);
        drop(handle);

        {
            let mut pool = (*manager).pool.borrow_mut();
            let record = &mut pool.records[key];
            record.entry = None;
            record.state = CoroutineState::Idle;
        }
        Inner::suspend(manager, key, generation);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::coroutine::stack::page_size;

    fn check_invariants(manager: &Manager) {
        let pool = manager.inner.pool.borrow();
        let running: Vec<usize> = pool
            .records
            .iter()
            .filter(|(_, record)| record.state == CoroutineState::Running)
            .map(|(key, _)| key)
            .collect();
        assert!(running.len() <= 1);
        assert_eq!(pool.current, running.first().copied());
        assert_eq!(pool.idle.iter(&pool.records).count(), pool.idle.len());
        assert_eq!(pool.running.iter(&pool.records).count(), pool.running.len());
        assert_eq!(pool.records.len(), pool.idle.len() + pool.running.len());
        for key in pool.idle.iter(&pool.records) {
            assert_eq!(pool.records[key].state, CoroutineState::Idle);
            assert!(pool.records[key].entry.is_none());
        }
    }

    #[test]
    fn open_then_close() {
        let manager = Manager::open();
        assert_eq!(manager.config(), Config::default());
        check_invariants(&manager);
        manager.close();
    }

    #[test]
    fn lifecycle_moves_between_lists() {
        let manager = Manager::open();
        let co = manager.get(|co| co.yield_now()).unwrap();
        assert_eq!(co.state(), CoroutineState::Ready);
        assert_eq!(manager.running_count(), 1);
        check_invariants(&manager);

        co.resume();
        assert_eq!(co.state(), CoroutineState::Suspended);
        assert_eq!(manager.running_count(), 1);
        check_invariants(&manager);

        co.resume();
        assert_eq!(co.state(), CoroutineState::Idle);
        assert!(co.is_finished());
        assert_eq!(manager.running_count(), 0);
        assert_eq!(manager.idle_count(), 1);
        check_invariants(&manager);
        manager.close();
    }

    #[test]
    fn current_is_set_only_inside() {
        let manager = Rc::new(Manager::open());
        let seen = Rc::new(Cell::new(false));
        let (inner, flag) = (manager.clone(), seen.clone());
        let co = manager
            .get(move |co| {
                assert_eq!(inner.current().as_ref(), Some(co));
                assert_eq!(co.state(), CoroutineState::Running);
                flag.set(true);
            })
            .unwrap();
        assert!(manager.current().is_none());
        co.resume();
        assert!(seen.get());
        assert!(manager.current().is_none());
        check_invariants(&manager);
    }

    #[test]
    fn reused_coroutine_starts_idle() {
        let manager = Manager::open();
        let first = manager.get(|_| {}).unwrap();
        first.resume();
        let second = manager.get(|_| {}).unwrap();
        assert_eq!(second.state(), CoroutineState::Idle);
        assert!(!second.is_finished());
        assert_eq!(first.state(), CoroutineState::Dead);
        assert_ne!(first, second);
        second.resume();
        assert!(second.is_finished());
        check_invariants(&manager);
        manager.close();
    }

    #[test]
    fn pool_is_trimmed_to_the_ceiling_on_get() {
        let manager = Manager::with_config(Config::default().with_pool_ceiling(2));
        let coros: Vec<Coroutine> = (0..5).map(|_| manager.get(|_| {}).unwrap()).collect();
        for co in &coros {
            co.resume();
        }
        // finishing never trims
        assert_eq!(manager.idle_count(), 5);
        check_invariants(&manager);

        let co = manager.get(|_| {}).unwrap();
        assert_eq!(manager.idle_count(), 2);
        check_invariants(&manager);
        co.resume();
        assert_eq!(manager.idle_count(), 3);
        manager.close();
    }

    #[test]
    fn zero_ceiling_keeps_nothing_after_get() {
        let manager = Manager::with_config(Config::default().with_pool_ceiling(0));
        let a = manager.get(|_| {}).unwrap();
        let b = manager.get(|_| {}).unwrap();
        a.resume();
        b.resume();
        assert_eq!(manager.idle_count(), 2);
        let c = manager.get(|_| {}).unwrap();
        assert_eq!(manager.idle_count(), 0);
        c.resume();
        check_invariants(&manager);
        manager.close();
    }

    #[test]
    fn configured_stack_size_is_page_rounded() {
        let manager = Manager::with_config(Config::default().with_stack_size(1));
        let co = manager.get(|_| {}).unwrap();
        let bounds = co.stack_bounds().unwrap();
        assert_eq!(bounds.len(), page_size());
        co.resume();
        manager.close();
    }

    #[test]
    fn get_from_inside_a_coroutine() {
        let manager = Rc::new(Manager::open());
        let spawned = Rc::new(RefCell::new(None));
        let (inner, slot) = (manager.clone(), spawned.clone());
        let parent = manager
            .get(move |_| {
                let child = inner.get(|co| co.yield_now()).unwrap();
                *slot.borrow_mut() = Some(child);
            })
            .unwrap();
        parent.resume();
        let child = spawned.borrow_mut().take().unwrap();
        assert_eq!(child.state(), CoroutineState::Ready);
        child.resume();
        child.resume();
        assert!(child.is_finished());
        check_invariants(&manager);
    }

    #[test]
    #[should_panic(expected = "still acquired")]
    fn close_with_acquired_coroutine_panics() {
        let manager = Manager::open();
        let _co = manager.get(|_| {}).unwrap();
        manager.close();
    }

    #[test]
    fn drop_with_suspended_coroutine_leaks_quietly() {
        let manager = Manager::open();
        let co = manager.get(|co| co.yield_now()).unwrap();
        co.resume();
        drop(manager);
        assert_eq!(co.state(), CoroutineState::Dead);
        assert!(co.is_finished());
    }
}
