//! Client-side handles tests use to override bindings.

use crate::strategy::{ControlStrategy, ControllableId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use testbed_core::{BindingKey, Error, Instance, Result, ScopeStateError, TestScope};
use testbed_log::debug;

/// Overrides one controlled binding for the running test.
///
/// Resolved from a test environment's container. Overrides belong to the
/// test active on the calling thread and are cleared when it ends.
pub struct Control<T> {
    key: BindingKey,
    scope: TestScope,
    strategy: Arc<dyn ControlStrategy>,
    _value: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Control<T> {
    pub(crate) fn new(key: BindingKey, scope: TestScope, strategy: Arc<dyn ControlStrategy>) -> Self {
        Self {
            key,
            scope,
            strategy,
            _value: PhantomData,
        }
    }

    /// The controlled binding.
    pub fn key(&self) -> &BindingKey {
        &self.key
    }

    fn id(&self) -> Result<ControllableId> {
        let test = self
            .scope
            .current_active()
            .ok_or(ScopeStateError::NoCurrentTest)?;
        Ok(ControllableId::new(test.identity(), self.key.clone()))
    }

    /// Make resolutions of the binding on behalf of the current test return
    /// `value` until the test ends or the override is reset.
    pub fn set_override(&self, value: T) -> Result<()> {
        let cleanups = self.scope.tear_down_accepter()?;
        let id = self.id()?;

        // The clearing teardown is registered before the override exists.
        let strategy = self.strategy.clone();
        let label = format!("clear override of {}", self.key);
        let registered = id.clone();
        cleanups.push_named(label, move || {
            strategy.overrides().clear(&registered);
            Ok(())
        });

        let value: Instance = Arc::new(value);
        self.strategy.overrides().set(id, value);
        debug!(target: "testbed::control", "Overriding {} for the current test", self.key);
        Ok(())
    }

    /// Drop the current test's override now.
    pub fn reset_override(&self) -> Result<()> {
        let id = self.id()?;
        self.strategy.overrides().clear(&id);
        Ok(())
    }

    /// The current test's override, if one is set.
    pub fn current_override(&self) -> Result<Option<Arc<T>>> {
        let id = self.id()?;
        match self.strategy.overrides().get(&id) {
            None => Ok(None),
            Some(value) => value.downcast::<T>().map(Some).map_err(|_| Error::TypeMismatch {
                key: self.key.to_string(),
                expected: std::any::type_name::<T>(),
            }),
        }
    }
}

impl<T> fmt::Debug for Control<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Control").field("key", &self.key).finish()
    }
}
