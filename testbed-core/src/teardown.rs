//! Ordered teardown.
//!
//! A [`TearDownStack`] collects cleanup actions and runs them in reverse
//! registration order. Every action is attempted even when earlier ones
//! fail or panic; failures are reported together once the stack is empty.
//!
//! ```
//! use testbed_core::TearDownStack;
//! use std::sync::{Arc, Mutex};
//!
//! let order = Arc::new(Mutex::new(Vec::new()));
//! let stack = TearDownStack::new();
//! for name in ["A", "B", "C"] {
//!     let order = order.clone();
//!     stack.push_named(name, move || {
//!         order.lock().unwrap().push(name);
//!         Ok(())
//!     });
//! }
//!
//! stack.run_all().unwrap();
//! assert_eq!(*order.lock().unwrap(), vec!["C", "B", "A"]);
//! ```

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use testbed_log::{debug, warn};

/// A single cleanup step.
pub type TearDownAction = Box<dyn FnOnce() -> Result<()> + Send>;

/// Accepts cleanups to run when the owning test ends.
pub trait TearDownAccepter {
    fn add_tear_down(&self, name: &str, action: TearDownAction);
}

/// LIFO list of cleanup actions.
///
/// Cloning shares the underlying stack. The test-scoped instance a test
/// resolves through [`TestScope::tear_down_accepter`](crate::TestScope::tear_down_accepter)
/// is drained by the scaffolding when the test ends.
#[derive(Clone, Default)]
pub struct TearDownStack {
    actions: Arc<Mutex<Vec<(String, TearDownAction)>>>,
}

impl TearDownStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an unnamed action.
    pub fn push<F>(&self, action: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.push_named("teardown", action);
    }

    /// Register an action with a name used in log messages.
    pub fn push_named<F>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.actions.lock().push((name.into(), Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.lock().is_empty()
    }

    /// Run every registered action, most recent first.
    ///
    /// Actions registered while the stack is running are run as well. If
    /// any action failed, a single failure is returned as-is; several are
    /// folded into [`Error::TearDown`] with the first failure as primary.
    pub fn run_all(&self) -> Result<()> {
        let mut errors = Vec::new();
        let mut executed = 0usize;

        // The lock is released before each action runs so actions may
        // register further cleanups.
        loop {
            let next = self.actions.lock().pop();
            let Some((name, action)) = next else {
                break;
            };
            executed += 1;

            match catch_unwind(AssertUnwindSafe(action)) {
                Ok(Ok(())) => debug!(target: "testbed::teardown", "{} completed", name),
                Ok(Err(e)) => {
                    warn!(target: "testbed::teardown", "{} failed: {}", name, e);
                    errors.push(e);
                }
                Err(payload) => {
                    let e = Error::from_panic(payload);
                    warn!(target: "testbed::teardown", "{} panicked: {}", name, e);
                    errors.push(e);
                }
            }
        }

        debug!(
            target: "testbed::teardown",
            "Ran {} teardown action(s), {} failed",
            executed,
            errors.len()
        );

        match Error::aggregate(errors) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl TearDownAccepter for TearDownStack {
    fn add_tear_down(&self, name: &str, action: TearDownAction) {
        self.actions.lock().push((name.to_string(), action));
    }
}

impl fmt::Debug for TearDownStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.actions.lock().iter().map(|(n, _)| n.clone()).collect();
        f.debug_struct("TearDownStack").field("actions", &names).finish()
    }
}
