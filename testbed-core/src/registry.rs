//! Process-wide cache of constructed environments.
//!
//! Building a container is expensive, so each environment is constructed
//! once and its [`ContainerHandle`] shared by every test that selects it.
//! A construction that fails is remembered: the descriptor is parked on a
//! sentinel and every later lookup fails fast with
//! [`Error::PermanentEnvironmentFailure`] until [`EnvironmentRegistry::clear`].

use crate::container::{Container, ContainerConfig};
use crate::environment::{
    ContainerHandle, Environment, EnvironmentDescriptor, LegacyListenerAdapter,
    LegacyTestListener, NoopListener, TestLifecycleListener,
};
use crate::error::{Error, Result};
use crate::key::BindingKey;
use crate::scope::TestScope;
use dashmap::DashMap;
use parking_lot::{ReentrantMutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use testbed_log::{debug, info, trace, warn};

type EnvironmentFactory = Arc<dyn Fn() -> Result<Box<dyn Environment>> + Send + Sync>;

#[derive(Clone)]
enum Slot {
    Ready(ContainerHandle),
    Sentinel,
}

/// Stores the sentinel for a descriptor unless disarmed, so a construction
/// that errors or unwinds is never retried.
struct SentinelGuard<'a> {
    handles: &'a DashMap<EnvironmentDescriptor, Slot>,
    descriptor: Option<EnvironmentDescriptor>,
}

impl SentinelGuard<'_> {
    fn disarm(mut self) {
        self.descriptor = None;
    }
}

impl Drop for SentinelGuard<'_> {
    fn drop(&mut self) {
        if let Some(descriptor) = self.descriptor.take() {
            warn!(
                target: "testbed::registry",
                "Environment {} failed to construct; caching failure",
                descriptor
            );
            self.handles.insert(descriptor, Slot::Sentinel);
        }
    }
}

/// Maps environment descriptors to their constructed containers.
pub struct EnvironmentRegistry {
    scope: TestScope,
    strict_listener: bool,
    factories: RwLock<HashMap<EnvironmentDescriptor, EnvironmentFactory>>,
    handles: DashMap<EnvironmentDescriptor, Slot>,
    construction: ReentrantMutex<()>,
}

impl EnvironmentRegistry {
    /// Registry whose containers keep test-scoped values in `scope`.
    pub fn new(scope: TestScope) -> Self {
        Self {
            scope,
            strict_listener: false,
            factories: RwLock::new(HashMap::new()),
            handles: DashMap::new(),
            construction: ReentrantMutex::new(()),
        }
    }

    /// Require every environment to bind a lifecycle listener.
    pub fn with_strict_listener(mut self, strict: bool) -> Self {
        self.strict_listener = strict;
        self
    }

    pub fn scope(&self) -> &TestScope {
        &self.scope
    }

    /// Register `E` under [`EnvironmentDescriptor::of`].
    pub fn register<E: Environment + Default>(&self) -> EnvironmentDescriptor {
        let descriptor = EnvironmentDescriptor::of::<E>();
        self.register_factory(descriptor.clone(), || Ok(E::default()));
        descriptor
    }

    /// Register a factory producing the environment for `descriptor`.
    ///
    /// Replaces an earlier registration. An environment that was already
    /// constructed keeps its handle until [`EnvironmentRegistry::clear`].
    pub fn register_factory<E, F>(&self, descriptor: EnvironmentDescriptor, factory: F)
    where
        E: Environment,
        F: Fn() -> Result<E> + Send + Sync + 'static,
    {
        let factory: EnvironmentFactory =
            Arc::new(move || factory().map(|env| Box::new(env) as Box<dyn Environment>));
        if self.factories.write().insert(descriptor.clone(), factory).is_some() {
            debug!(target: "testbed::registry", "Replaced registration of {}", descriptor);
        } else {
            trace!(target: "testbed::registry", "Registered {}", descriptor);
        }
    }

    pub fn is_registered(&self, descriptor: &EnvironmentDescriptor) -> bool {
        self.factories.read().contains_key(descriptor)
    }

    /// The handle for `descriptor`, constructing the environment on first
    /// use.
    pub fn get_or_create(&self, descriptor: &EnvironmentDescriptor) -> Result<ContainerHandle> {
        if let Some(found) = self.lookup(descriptor) {
            return found;
        }

        let _construction = self.construction.lock();
        // Another thread may have finished while this one waited.
        if let Some(found) = self.lookup(descriptor) {
            return found;
        }

        let guard = SentinelGuard {
            handles: &self.handles,
            descriptor: Some(descriptor.clone()),
        };
        let handle = match catch_unwind(AssertUnwindSafe(|| self.construct(descriptor))) {
            Ok(result) => result?,
            Err(payload) => {
                let cause = Error::from_panic(payload);
                return Err(Error::configuration(format!(
                    "environment {} panicked during construction: {}",
                    descriptor, cause
                )));
            }
        };
        guard.disarm();

        self.handles
            .insert(descriptor.clone(), Slot::Ready(handle.clone()));
        info!(target: "testbed::registry", "Environment {} is ready", descriptor);
        Ok(handle)
    }

    fn lookup(&self, descriptor: &EnvironmentDescriptor) -> Option<Result<ContainerHandle>> {
        let slot = self.handles.get(descriptor)?.value().clone();
        Some(match slot {
            Slot::Ready(handle) => Ok(handle),
            Slot::Sentinel => Err(Error::PermanentEnvironmentFailure {
                environment: descriptor.to_string(),
            }),
        })
    }

    fn construct(&self, descriptor: &EnvironmentDescriptor) -> Result<ContainerHandle> {
        let factory = self.factories.read().get(descriptor).cloned().ok_or_else(|| {
            Error::configuration(format!("environment {} is not registered", descriptor))
        })?;

        debug!(target: "testbed::registry", "Constructing environment {}", descriptor);
        let environment = factory().map_err(|e| {
            Error::configuration(format!("environment {} could not be created: {}", descriptor, e))
        })?;

        let mut config = ContainerConfig::new(self.scope.clone());
        environment.configure(&mut config)?;
        let container = Container::create_from(config)?;
        environment.on_ready(&container)?;

        let listener = self.listener_for(descriptor, &container)?;
        Ok(ContainerHandle::new(descriptor.clone(), container, listener))
    }

    fn listener_for(
        &self,
        descriptor: &EnvironmentDescriptor,
        container: &Container,
    ) -> Result<Arc<dyn TestLifecycleListener>> {
        let current = BindingKey::of::<Arc<dyn TestLifecycleListener>>();
        let legacy = BindingKey::of::<Arc<dyn LegacyTestListener>>();

        match (container.has_binding(&current), container.has_binding(&legacy)) {
            (true, true) => Err(Error::configuration(format!(
                "environment {} binds both a lifecycle listener and a legacy listener; \
                 bind only one",
                descriptor
            ))),
            (true, false) => {
                let listener = container.resolve_key::<Arc<dyn TestLifecycleListener>>(&current)?;
                Ok(Arc::clone(&*listener))
            }
            (false, true) => {
                let listener = container.resolve_key::<Arc<dyn LegacyTestListener>>(&legacy)?;
                Ok(Arc::new(LegacyListenerAdapter(Arc::clone(&*listener))))
            }
            (false, false) if self.strict_listener => Err(Error::configuration(format!(
                "environment {} binds no lifecycle listener",
                descriptor
            ))),
            (false, false) => Ok(Arc::new(NoopListener)),
        }
    }

    /// Whether construction of `descriptor` failed and is cached as such.
    pub fn is_failed(&self, descriptor: &EnvironmentDescriptor) -> bool {
        matches!(
            self.handles.get(descriptor).as_deref(),
            Some(Slot::Sentinel)
        )
    }

    /// Number of cached entries, failures included.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Forget every constructed environment and cached failure.
    /// Registrations are kept.
    pub fn clear(&self) {
        let _construction = self.construction.lock();
        let dropped = self.handles.len();
        self.handles.clear();
        debug!(target: "testbed::registry", "Cleared {} cached environment(s)", dropped);
    }

    /// [`EnvironmentRegistry::clear`] plus dropping every registration.
    pub fn reset(&self) {
        self.clear();
        self.factories.write().clear();
    }
}

impl fmt::Debug for EnvironmentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentRegistry")
            .field("registered", &self.factories.read().len())
            .field("cached", &self.handles.len())
            .field("strict_listener", &self.strict_listener)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::TestDescription;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, Weak};
    use std::thread;

    struct Recording;

    impl TestLifecycleListener for Recording {
        fn entering_scope(&self, _test: &TestDescription) -> Result<()> {
            Ok(())
        }

        fn exiting_scope(&self, _test: &TestDescription) -> Result<()> {
            Ok(())
        }
    }

    struct Legacy;

    impl LegacyTestListener for Legacy {
        fn before_test(&self, _name: &str) {}

        fn after_test(&self, _name: &str) {}
    }

    #[derive(Default)]
    struct Plain;

    impl Environment for Plain {
        fn configure(&self, config: &mut ContainerConfig) -> Result<()> {
            config.bind_instance(String::from("plain"));
            Ok(())
        }
    }

    struct Configured<F>(F);

    impl<F> Environment for Configured<F>
    where
        F: Fn(&mut ContainerConfig) -> Result<()> + Send + Sync + 'static,
    {
        fn configure(&self, config: &mut ContainerConfig) -> Result<()> {
            (self.0)(config)
        }
    }

    fn configured<F>(f: F) -> Configured<F>
    where
        F: Fn(&mut ContainerConfig) -> Result<()> + Send + Sync + 'static,
    {
        Configured(f)
    }

    fn registry() -> EnvironmentRegistry {
        EnvironmentRegistry::new(TestScope::new())
    }

    #[test]
    fn test_concurrent_get_or_create_constructs_once() {
        let registry = Arc::new(registry());
        let built = Arc::new(AtomicUsize::new(0));
        let descriptor = EnvironmentDescriptor::new("slow");
        let counter = built.clone();
        registry.register_factory(descriptor.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(std::time::Duration::from_millis(20));
            Ok(Plain)
        });

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                let descriptor = descriptor.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.get_or_create(&descriptor).unwrap()
                })
            })
            .collect();

        let results: Vec<ContainerHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| w[0].same_container(&w[1])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_by_type() {
        let registry = registry();
        let descriptor = registry.register::<Plain>();
        assert!(descriptor.name().ends_with("Plain"));

        let handle = registry.get_or_create(&descriptor).unwrap();
        let value = handle.container().resolve::<String>().unwrap();
        assert_eq!(*value, "plain");
    }

    #[test]
    fn test_failed_construction_is_permanent_until_clear() {
        let registry = registry();
        let descriptor = EnvironmentDescriptor::new("flaky");
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        registry.register_factory(descriptor.clone(), move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::action("database unreachable"))
            } else {
                Ok(Plain)
            }
        });

        let first = registry.get_or_create(&descriptor).unwrap_err();
        assert!(first.is_configuration());
        assert!(first.to_string().contains("database unreachable"));

        let second = registry.get_or_create(&descriptor).unwrap_err();
        assert!(second.is_permanent_failure());
        assert!(registry.is_failed(&descriptor));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        registry.clear();
        assert!(registry.get_or_create(&descriptor).is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_environment_stores_sentinel() {
        let registry = registry();
        let descriptor = EnvironmentDescriptor::new("panics");
        registry.register_factory(descriptor.clone(), || {
            Ok(configured(|_| panic!("configure blew up")))
        });

        let error = registry.get_or_create(&descriptor).unwrap_err();
        assert!(error.is_configuration());
        assert!(error.to_string().contains("configure blew up"));
        assert!(registry.get_or_create(&descriptor).unwrap_err().is_permanent_failure());
    }

    #[test]
    fn test_unregistered_descriptor_is_configuration_error() {
        let registry = registry();
        let error = registry
            .get_or_create(&EnvironmentDescriptor::new("missing"))
            .unwrap_err();
        assert!(error.is_configuration());
        assert!(error.to_string().contains("not registered"));
    }

    #[test]
    fn test_conflicting_listeners_are_rejected() {
        let registry = registry();
        let descriptor = EnvironmentDescriptor::new("both");
        registry.register_factory(descriptor.clone(), || {
            Ok(configured(|config| {
                config.bind_listener(Recording);
                config.bind_legacy_listener(Legacy);
                Ok(())
            }))
        });

        let error = registry.get_or_create(&descriptor).unwrap_err();
        assert!(error.is_configuration());
        assert!(error.to_string().contains("both"));
    }

    #[test]
    fn test_missing_listener_depends_on_strict_mode() {
        let lenient = registry();
        let descriptor = lenient.register::<Plain>();
        assert!(lenient.get_or_create(&descriptor).is_ok());

        let strict = registry().with_strict_listener(true);
        let descriptor = strict.register::<Plain>();
        let error = strict.get_or_create(&descriptor).unwrap_err();
        assert!(error.to_string().contains("no lifecycle listener"));
    }

    #[test]
    fn test_legacy_listener_is_adapted() {
        let registry = registry().with_strict_listener(true);
        let descriptor = EnvironmentDescriptor::new("legacy");
        registry.register_factory(descriptor.clone(), || {
            Ok(configured(|config| {
                config.bind_legacy_listener(Legacy);
                Ok(())
            }))
        });

        let handle = registry.get_or_create(&descriptor).unwrap();
        let test = TestDescription::named("legacy-test");
        assert!(handle.listener().entering_scope(&test).is_ok());
    }

    struct DependsOn {
        registry: Weak<EnvironmentRegistry>,
        other: EnvironmentDescriptor,
    }

    impl Environment for DependsOn {
        fn configure(&self, _config: &mut ContainerConfig) -> Result<()> {
            Ok(())
        }

        fn on_ready(&self, _container: &Container) -> Result<()> {
            let registry = self
                .registry
                .upgrade()
                .ok_or_else(|| Error::configuration("registry dropped"))?;
            registry.get_or_create(&self.other).map(|_| ())
        }
    }

    #[test]
    fn test_nested_construction_on_same_thread() {
        let registry = Arc::new(registry());
        let base = registry.register::<Plain>();
        let weak = Arc::downgrade(&registry);
        let outer = EnvironmentDescriptor::new("outer");
        let other = base.clone();
        registry.register_factory(outer.clone(), move || {
            Ok(DependsOn {
                registry: weak.clone(),
                other: other.clone(),
            })
        });

        registry.get_or_create(&outer).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_failed(&base));
    }

    #[test]
    fn test_reset_drops_registrations() {
        let registry = registry();
        let descriptor = registry.register::<Plain>();
        registry.get_or_create(&descriptor).unwrap();

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.is_registered(&descriptor));

        registry.reset();
        assert!(!registry.is_registered(&descriptor));
    }
}
