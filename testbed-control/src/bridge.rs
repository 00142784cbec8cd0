//! Wiring of controllable bindings into test and server containers.

use crate::handle::Control;
use crate::strategy::{ControlStrategy, ControllableId};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use testbed_core::{
    BindingKey, BindingScope, ContainerConfig, Error, Instance, ResolutionInterceptor, Result,
};
use testbed_log::{debug, trace};

type Binder = Arc<dyn Fn(&mut ContainerConfig, Arc<dyn ControlStrategy>) + Send + Sync>;

struct Controlled {
    key: BindingKey,
    bind_handle: Binder,
}

/// Declares which bindings tests may override and builds both sides of
/// the bridge from the same declaration.
///
/// The server side is the configuration of the code under test: every
/// controlled binding gets an interceptor that serves the current test's
/// override. The client side goes into the test environment and provides a
/// [`Control`] handle per binding.
pub struct ControllableInjection {
    strategy: Arc<dyn ControlStrategy>,
    controlled: Vec<Controlled>,
    seen: HashSet<BindingKey>,
}

impl ControllableInjection {
    pub fn new<S: ControlStrategy>(strategy: S) -> Self {
        Self::with_strategy(Arc::new(strategy))
    }

    pub fn with_strategy(strategy: Arc<dyn ControlStrategy>) -> Self {
        Self {
            strategy,
            controlled: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn strategy(&self) -> &Arc<dyn ControlStrategy> {
        &self.strategy
    }

    /// Make the unqualified binding of `T` controllable.
    pub fn control<T: Send + Sync + 'static>(&mut self) -> Result<&mut Self> {
        self.add::<T>(BindingKey::of::<T>(), BindingKey::of::<Control<T>>())
    }

    /// Make the binding of `T` qualified by `name` controllable.
    pub fn control_named<T: Send + Sync + 'static>(&mut self, name: &'static str) -> Result<&mut Self> {
        self.add::<T>(BindingKey::named::<T>(name), BindingKey::named::<Control<T>>(name))
    }

    fn add<T: Send + Sync + 'static>(
        &mut self,
        key: BindingKey,
        handle_key: BindingKey,
    ) -> Result<&mut Self> {
        if !self.seen.insert(key.clone()) {
            return Err(Error::configuration(format!("{} is already controllable", key)));
        }

        let target = key.clone();
        let bind_handle: Binder = Arc::new(
            move |config: &mut ContainerConfig, strategy: Arc<dyn ControlStrategy>| {
                let scope = config.scope().clone();
                let target = target.clone();
                config.bind_key(handle_key.clone(), BindingScope::Singleton, move |_| {
                    Ok(Control::<T>::new(target.clone(), scope.clone(), strategy.clone()))
                });
            },
        );
        self.controlled.push(Controlled { key, bind_handle });
        Ok(self)
    }

    pub fn keys(&self) -> impl Iterator<Item = &BindingKey> {
        self.controlled.iter().map(|c| &c.key)
    }

    pub fn build_client_side(&self) -> ClientBindings {
        ClientBindings {
            strategy: self.strategy.clone(),
            binders: self.controlled.iter().map(|c| c.bind_handle.clone()).collect(),
        }
    }

    /// Add an override interceptor for every controlled binding of `base`.
    pub fn build_server_side(&self, mut base: ContainerConfig) -> Result<ContainerConfig> {
        for controlled in &self.controlled {
            if !base.has_binding(&controlled.key) {
                return Err(Error::configuration(format!(
                    "{} is controllable but the server configuration does not bind it",
                    controlled.key
                )));
            }
            base.intercept(
                controlled.key.clone(),
                Arc::new(OverrideInterceptor {
                    strategy: self.strategy.clone(),
                }),
            );
        }
        debug!(
            target: "testbed::control",
            "Server side intercepts {} binding(s)",
            self.controlled.len()
        );
        Ok(base)
    }
}

impl fmt::Debug for ControllableInjection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllableInjection")
            .field("keys", &self.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// `Control<T>` bindings for a test environment.
#[derive(Clone)]
pub struct ClientBindings {
    strategy: Arc<dyn ControlStrategy>,
    binders: Vec<Binder>,
}

impl ClientBindings {
    /// Bind a `Control<T>` handle for every controlled binding.
    pub fn bind_into(&self, config: &mut ContainerConfig) {
        for bind in &self.binders {
            bind(config, self.strategy.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.binders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.binders.is_empty()
    }
}

impl fmt::Debug for ClientBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBindings")
            .field("handles", &self.binders.len())
            .finish()
    }
}

/// Serves the current test's override in place of the original binding.
struct OverrideInterceptor {
    strategy: Arc<dyn ControlStrategy>,
}

impl ResolutionInterceptor for OverrideInterceptor {
    fn intercept(
        &self,
        key: &BindingKey,
        proceed: &dyn Fn() -> Result<Instance>,
    ) -> Result<Instance> {
        if let Some(test) = self.strategy.current_test() {
            let id = ControllableId::new(test, key.clone());
            if let Some(value) = self.strategy.overrides().get(&id) {
                trace!(target: "testbed::control", "Serving override {}", id);
                return Ok(value);
            }
        }
        proceed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{CorrelationStrategy, SharedMapStrategy};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use testbed_core::{Container, TestDescription, TestScope};

    #[derive(Debug, PartialEq)]
    struct Clock(&'static str);

    #[test]
    fn test_duplicate_control_is_rejected() {
        let mut bridge = ControllableInjection::new(CorrelationStrategy::default());
        bridge.control::<Clock>().unwrap();
        bridge.control_named::<Clock>("backup").unwrap();

        let error = bridge.control::<Clock>().unwrap_err();
        assert!(error.is_configuration());
        assert_eq!(bridge.keys().count(), 2);
    }

    #[test]
    fn test_server_side_requires_base_binding() {
        let mut bridge = ControllableInjection::new(CorrelationStrategy::default());
        bridge.control::<Clock>().unwrap();

        let base = ContainerConfig::new(TestScope::new());
        let error = bridge.build_server_side(base).unwrap_err();
        assert!(error.is_configuration());
    }

    #[test]
    fn test_override_visible_only_to_its_test() {
        let scope = TestScope::new();
        let mut bridge = ControllableInjection::new(SharedMapStrategy::new(scope.clone()));
        bridge.control::<Clock>().unwrap();

        let built = Arc::new(AtomicUsize::new(0));
        let mut base = ContainerConfig::new(scope.clone());
        let counter = built.clone();
        base.bind(BindingScope::Singleton, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Clock("real"))
        });
        let server = Container::create_from(bridge.build_server_side(base).unwrap()).unwrap();

        let mut client = ContainerConfig::new(scope.clone());
        bridge.build_client_side().bind_into(&mut client);
        let client = Container::create_from(client).unwrap();

        let t1 = TestDescription::named("t1");
        scope.enter(&t1).unwrap();
        let control = client.resolve::<Control<Clock>>().unwrap();
        control.set_override(Clock("fake")).unwrap();
        assert_eq!(*server.resolve::<Clock>().unwrap(), Clock("fake"));
        assert_eq!(*control.current_override().unwrap().unwrap(), Clock("fake"));

        // Ending t1 drains the cleanups it registered.
        let stack = scope.tear_down_accepter().unwrap();
        stack.run_all().unwrap();
        scope.clear_current();
        scope.finish_scope(&t1);

        let t2 = TestDescription::named("t2");
        scope.enter(&t2).unwrap();
        assert_eq!(*server.resolve::<Clock>().unwrap(), Clock("real"));
        assert_eq!(*server.resolve::<Clock>().unwrap(), Clock("real"));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        scope.clear_current();
    }

    #[test]
    fn test_reset_override_applies_immediately() {
        let scope = TestScope::new();
        let mut bridge = ControllableInjection::new(SharedMapStrategy::new(scope.clone()));
        bridge.control_named::<Clock>("wall").unwrap();

        let mut base = ContainerConfig::new(scope.clone());
        base.bind_instance_key(BindingKey::named::<Clock>("wall"), Clock("real"));
        let server = Container::create_from(bridge.build_server_side(base).unwrap()).unwrap();

        let mut client = ContainerConfig::new(scope.clone());
        bridge.build_client_side().bind_into(&mut client);
        let client = Container::create_from(client).unwrap();

        scope.enter(&TestDescription::named("reset")).unwrap();
        let control = client.resolve_named::<Control<Clock>>("wall").unwrap();
        control.set_override(Clock("fake")).unwrap();
        assert_eq!(*server.resolve_named::<Clock>("wall").unwrap(), Clock("fake"));

        control.reset_override().unwrap();
        assert_eq!(*server.resolve_named::<Clock>("wall").unwrap(), Clock("real"));
        assert!(control.current_override().unwrap().is_none());
        scope.clear_current();
    }

    #[test]
    fn test_override_always_comes_with_its_cleanup() {
        let scope = TestScope::new();
        let mut bridge = ControllableInjection::new(SharedMapStrategy::new(scope.clone()));
        bridge.control::<Clock>().unwrap();
        let mut client = ContainerConfig::new(scope.clone());
        bridge.build_client_side().bind_into(&mut client);
        let client = Container::create_from(client).unwrap();
        let control = client.resolve::<Control<Clock>>().unwrap();

        let test = TestDescription::named("finishing");
        scope.enter(&test).unwrap();
        let stack = scope.tear_down_accepter().unwrap();
        control.set_override(Clock("fake")).unwrap();
        assert_eq!(stack.len(), 1);
        assert_eq!(bridge.strategy().overrides().len(), 1);

        stack.run_all().unwrap();
        assert!(bridge.strategy().overrides().is_empty());

        // Finished while this thread still sees it as current.
        scope.finish_scope(&test);
        let error = control.set_override(Clock("late")).unwrap_err();
        assert!(error.scope_state().is_some());
        assert!(bridge.strategy().overrides().is_empty());
        scope.clear_current();
    }

    #[test]
    fn test_set_override_outside_test_fails() {
        let scope = TestScope::new();
        let mut bridge = ControllableInjection::new(SharedMapStrategy::new(scope.clone()));
        bridge.control::<Clock>().unwrap();
        let mut client = ContainerConfig::new(scope);
        bridge.build_client_side().bind_into(&mut client);
        let client = Container::create_from(client).unwrap();

        let control = client.resolve::<Control<Clock>>().unwrap();
        let error = control.set_override(Clock("fake")).unwrap_err();
        assert!(error.scope_state().is_some());
    }
}
