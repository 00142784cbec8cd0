//! Per-test scope.
//!
//! The scope caches lazily created values per running test. Which test is
//! running is tracked per thread: publishing a test with [`TestScope::enter`]
//! makes it current on the calling thread, and every scoped resolution on
//! that thread lands in that test's cache. When the test ends
//! [`TestScope::finish_scope`] drops the whole cache at once; the test is
//! marked finished so stale references fail instead of silently resolving.
//!
//! Rust threads do not inherit thread-local state, so the current test is
//! handed across thread boundaries explicitly:
//!
//! - [`TestScope::spawn`] starts a thread that sees the spawning thread's test.
//! - [`TestScope::capture_state`] / [`TestScope::install_state`] move the
//!   current test onto threads that already exist, such as pool workers.
//! - [`ScopeState::bind_future`] carries the test across the polls of a future
//!   executed on an async runtime's worker threads.
//!
//! ```
//! use testbed_core::{BindingKey, TestDescription, TestScope};
//!
//! let scope = TestScope::new();
//! let test = TestDescription::named("checkout");
//! scope.enter(&test).unwrap();
//!
//! let key = BindingKey::named::<String>("session");
//! let first = scope.resolve(&key, || Ok(String::from("s-1"))).unwrap();
//! let again = scope.resolve(&key, || Ok(String::from("s-2"))).unwrap();
//! assert_eq!(*again, "s-1");
//! assert!(std::sync::Arc::ptr_eq(&first, &again));
//!
//! let from_worker = scope
//!     .spawn({
//!         let scope = scope.clone();
//!         let key = key.clone();
//!         move || scope.resolve(&key, || Ok(String::from("never"))).unwrap()
//!     })
//!     .join()
//!     .unwrap();
//! assert_eq!(*from_worker, "s-1");
//!
//! scope.clear_current();
//! scope.finish_scope(&test);
//! ```

use crate::container::Instance;
use crate::description::TestDescription;
use crate::error::{Error, Result, ScopeStateError};
use crate::key::BindingKey;
use crate::teardown::TearDownStack;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use testbed_log::{debug, trace};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Current test per scope on this thread, keyed by scope id so separate
    /// contexts never observe each other's tests.
    static CURRENT_TESTS: RefCell<HashMap<u64, Arc<TestSlot>>> = RefCell::new(HashMap::new());
}

/// Cached values of one running test.
struct TestSlot {
    description: TestDescription,
    finished: RwLock<bool>,
    values: DashMap<BindingKey, Arc<OnceCell<Instance>>>,
}

impl TestSlot {
    fn new(description: TestDescription) -> Self {
        Self {
            description,
            finished: RwLock::new(false),
            values: DashMap::new(),
        }
    }

    fn is_finished(&self) -> bool {
        *self.finished.read()
    }

    /// The once-cell for `key`, or an error once the test has finished.
    fn cell(&self, key: &BindingKey) -> Result<Arc<OnceCell<Instance>>> {
        let finished = self.finished.read();
        if *finished {
            return Err(ScopeStateError::TestFinished {
                test: self.description.name().to_string(),
            }
            .into());
        }
        Ok(self.values.entry(key.clone()).or_default().clone())
    }

    fn finish(&self) -> usize {
        let mut finished = self.finished.write();
        *finished = true;
        let discarded = self.values.len();
        self.values.clear();
        discarded
    }
}

fn current_slot(scope_id: u64) -> Option<Arc<TestSlot>> {
    CURRENT_TESTS.with(|current| current.borrow().get(&scope_id).cloned())
}

fn replace_slot(scope_id: u64, slot: Option<Arc<TestSlot>>) -> Option<Arc<TestSlot>> {
    let log_name = slot.as_ref().map(|s| s.description.name().to_string());
    let previous = CURRENT_TESTS.with(|current| {
        let mut current = current.borrow_mut();
        match slot {
            Some(slot) => current.insert(scope_id, slot),
            None => current.remove(&scope_id),
        }
    });
    testbed_log::set_test_context(log_name);
    previous
}

struct ScopeInner {
    id: u64,
    tests: DashMap<TestDescription, Arc<TestSlot>>,
}

/// Cache of per-test values, shared by cloning.
#[derive(Clone)]
pub struct TestScope {
    inner: Arc<ScopeInner>,
}

impl TestScope {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
                tests: DashMap::new(),
            }),
        }
    }

    /// Make `test` current on the calling thread.
    ///
    /// Fails with a sequencing error if another unfinished test is already
    /// current on this thread.
    pub fn enter(&self, test: &TestDescription) -> Result<()> {
        if let Some(active) = self.current_active() {
            return Err(Error::sequencing(format!(
                "cannot start {} while {} is still running on this thread; \
                 the previous test never ended",
                test, active
            )));
        }

        let slot = self
            .inner
            .tests
            .entry(test.clone())
            .or_insert_with(|| Arc::new(TestSlot::new(test.clone())))
            .clone();
        replace_slot(self.inner.id, Some(slot));
        trace!(target: "testbed::scope", "{} is now current", test);
        Ok(())
    }

    /// Forget the current test on the calling thread.
    pub fn clear_current(&self) {
        replace_slot(self.inner.id, None);
    }

    /// The test current on this thread, finished or not.
    pub fn current(&self) -> Option<TestDescription> {
        current_slot(self.inner.id).map(|slot| slot.description.clone())
    }

    /// The test current on this thread, unless it has already finished.
    pub fn current_active(&self) -> Option<TestDescription> {
        current_slot(self.inner.id)
            .filter(|slot| !slot.is_finished())
            .map(|slot| slot.description.clone())
    }

    /// Resolve the value for `key` in the current test, creating it with
    /// `creator` on first use.
    ///
    /// `creator` runs at most once per test and key, even when several
    /// threads of the same test resolve concurrently. A failing creator is
    /// not cached.
    pub fn resolve<T, F>(&self, key: &BindingKey, creator: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T>,
    {
        let instance = self.resolve_instance(key, || creator().map(|v| Arc::new(v) as Instance))?;
        instance.downcast::<T>().map_err(|_| Error::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
        })
    }

    /// Type-erased form of [`TestScope::resolve`].
    pub fn resolve_instance<F>(&self, key: &BindingKey, creator: F) -> Result<Instance>
    where
        F: FnOnce() -> Result<Instance>,
    {
        let slot = current_slot(self.inner.id).ok_or(ScopeStateError::NoCurrentTest)?;
        let cell = slot.cell(key)?;
        let value = cell.get_or_try_init(|| {
            debug!(
                target: "testbed::scope",
                "Creating {} for {}",
                key,
                slot.description.name()
            );
            creator()
        })?;
        Ok(value.clone())
    }

    /// The value for `key` in the current test, if it was already created.
    pub fn peek(&self, key: &BindingKey) -> Result<Option<Instance>> {
        let slot = current_slot(self.inner.id).ok_or(ScopeStateError::NoCurrentTest)?;
        Ok(slot.cell(key)?.get().cloned())
    }

    /// The current test's teardown stack, for registering cleanups that run
    /// when the test ends.
    pub fn tear_down_accepter(&self) -> Result<Arc<TearDownStack>> {
        self.resolve(&BindingKey::of::<TearDownStack>(), || Ok(TearDownStack::new()))
    }

    /// Discard every value of `test` and mark it finished.
    pub fn finish_scope(&self, test: &TestDescription) {
        if let Some((_, slot)) = self.inner.tests.remove(test) {
            let discarded = slot.finish();
            debug!(
                target: "testbed::scope",
                "Finished scope of {} ({} value(s) discarded)",
                test,
                discarded
            );
        }
    }

    /// Number of tests with an open scope.
    pub fn active_tests(&self) -> usize {
        self.inner.tests.len()
    }

    /// Finish every open scope.
    pub fn reset(&self) {
        let open: Vec<TestDescription> = self.inner.tests.iter().map(|e| e.key().clone()).collect();
        for test in open {
            self.finish_scope(&test);
        }
        self.clear_current();
    }

    /// Snapshot which test is current on this thread.
    pub fn capture_state(&self) -> ScopeState {
        ScopeState {
            scope_id: self.inner.id,
            slot: current_slot(self.inner.id),
        }
    }

    /// Make a snapshot taken on another thread current on this one until the
    /// returned guard is dropped.
    pub fn install_state(&self, state: ScopeState) -> StateGuard {
        state.install()
    }

    /// Spawn a thread that runs with the calling thread's current test.
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let state = self.capture_state();
        thread::spawn(move || state.run(f))
    }
}

impl Default for TestScope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TestScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestScope")
            .field("id", &self.inner.id)
            .field("active_tests", &self.inner.tests.len())
            .finish()
    }
}

/// Snapshot of the current test of one scope, movable across threads.
#[derive(Clone)]
pub struct ScopeState {
    scope_id: u64,
    slot: Option<Arc<TestSlot>>,
}

impl ScopeState {
    /// The test captured in this snapshot.
    pub fn test(&self) -> Option<&TestDescription> {
        self.slot.as_ref().map(|slot| &slot.description)
    }

    /// Install on the calling thread until the guard is dropped.
    pub fn install(self) -> StateGuard {
        let previous = replace_slot(self.scope_id, self.slot);
        StateGuard {
            scope_id: self.scope_id,
            previous,
            _not_send: PhantomData,
        }
    }

    /// Run `f` with this state installed.
    pub fn run<T>(self, f: impl FnOnce() -> T) -> T {
        let _guard = self.install();
        f()
    }

    /// Wrap a future so every poll runs with this state installed,
    /// whichever worker thread polls it.
    pub fn bind_future<F: Future>(self, future: F) -> ScopedFuture<F> {
        ScopedFuture {
            state: self,
            future: Box::pin(future),
        }
    }
}

impl fmt::Debug for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeState")
            .field("scope_id", &self.scope_id)
            .field("test", &self.test())
            .finish()
    }
}

/// Restores the thread's previous state on drop.
pub struct StateGuard {
    scope_id: u64,
    previous: Option<Arc<TestSlot>>,
    // Thread-local state must be restored on the thread that installed it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        replace_slot(self.scope_id, self.previous.take());
    }
}

/// Future returned by [`ScopeState::bind_future`].
pub struct ScopedFuture<F: Future> {
    state: ScopeState,
    future: Pin<Box<F>>,
}

impl<F: Future> Future for ScopedFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _guard = this.state.clone().install();
        this.future.as_mut().poll(cx)
    }
}
