// Dependency injection container used by test environments

use crate::error::{Error, Result};
use crate::key::BindingKey;
use crate::scope::TestScope;
use crate::teardown::TearDownStack;
use once_cell::sync::OnceCell;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use testbed_log::{debug, trace};

/// A resolved value, type-erased.
pub type Instance = Arc<dyn Any + Send + Sync>;

type ProviderFn = Arc<dyn Fn(&Container) -> Result<Instance> + Send + Sync>;

/// How often a binding's provider runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingScope {
    /// On every resolution
    Unscoped,
    /// Once per container, on first resolution
    Singleton,
    /// Once per container, when the container is created
    EagerSingleton,
    /// Once per running test
    Test,
}

/// Wraps resolution of one binding.
///
/// Interceptors run on every resolution regardless of the binding's scope;
/// `proceed` invokes the original provider with its scope intact, so a
/// singleton behind an interceptor is still built only once.
pub trait ResolutionInterceptor: Send + Sync {
    fn intercept(
        &self,
        key: &BindingKey,
        proceed: &dyn Fn() -> Result<Instance>,
    ) -> Result<Instance>;
}

struct BindingDefinition {
    scope: BindingScope,
    provider: ProviderFn,
}

/// The bindings an environment declares, plus resolution interceptors.
pub struct ContainerConfig {
    scope: TestScope,
    bindings: HashMap<BindingKey, BindingDefinition>,
    interceptors: Vec<(BindingKey, Arc<dyn ResolutionInterceptor>)>,
}

impl ContainerConfig {
    /// Configuration whose test-scoped bindings live in `scope`.
    ///
    /// Every configuration binds the test's [`TearDownStack`] so tests can
    /// register cleanups through the container.
    pub fn new(scope: TestScope) -> Self {
        let mut config = Self {
            scope,
            bindings: HashMap::new(),
            interceptors: Vec::new(),
        };
        config.bind(BindingScope::Test, |_| Ok(TearDownStack::new()));
        config
    }

    pub fn scope(&self) -> &TestScope {
        &self.scope
    }

    /// Bind `T` to a provider. Rebinding a key replaces the previous binding.
    pub fn bind<T, F>(&mut self, scope: BindingScope, provider: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Container) -> Result<T> + Send + Sync + 'static,
    {
        self.bind_key(BindingKey::of::<T>(), scope, provider)
    }

    pub fn bind_key<T, F>(&mut self, key: BindingKey, scope: BindingScope, provider: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Container) -> Result<T> + Send + Sync + 'static,
    {
        let provider: ProviderFn = Arc::new(move |container: &Container| {
            provider(container).map(|v| Arc::new(v) as Instance)
        });
        if self.bindings.insert(key.clone(), BindingDefinition { scope, provider }).is_some() {
            trace!(target: "testbed::container", "Rebinding {}", key);
        }
        self
    }

    /// Bind a ready-made value shared by every resolution.
    pub fn bind_instance<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.bind_instance_key(BindingKey::of::<T>(), value)
    }

    pub fn bind_instance_key<T: Send + Sync + 'static>(
        &mut self,
        key: BindingKey,
        value: T,
    ) -> &mut Self {
        let instance: Instance = Arc::new(value);
        let provider: ProviderFn = Arc::new(move |_: &Container| Ok(instance.clone()));
        self.bindings.insert(
            key,
            BindingDefinition {
                scope: BindingScope::Unscoped,
                provider,
            },
        );
        self
    }

    /// Bind `T` once per running test.
    pub fn bind_test_scoped<T, F>(&mut self, provider: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Container) -> Result<T> + Send + Sync + 'static,
    {
        self.bind(BindingScope::Test, provider)
    }

    /// Wrap resolution of `key`. Interceptors on the same key nest in
    /// registration order, the first registered outermost.
    pub fn intercept(
        &mut self,
        key: BindingKey,
        interceptor: Arc<dyn ResolutionInterceptor>,
    ) -> &mut Self {
        self.interceptors.push((key, interceptor));
        self
    }

    pub fn has_binding(&self, key: &BindingKey) -> bool {
        self.bindings.contains_key(key)
    }
}

impl fmt::Debug for ContainerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerConfig")
            .field("bindings", &self.bindings.len())
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

struct Binding {
    key: BindingKey,
    scope: BindingScope,
    provider: ProviderFn,
    singleton: OnceCell<Instance>,
    interceptors: Vec<Arc<dyn ResolutionInterceptor>>,
}

struct ContainerInner {
    bindings: HashMap<BindingKey, Binding>,
    scope: TestScope,
}

/// The resolved object graph of one environment.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    /// Build a container, attaching interceptors and creating eager
    /// singletons.
    pub fn create_from(config: ContainerConfig) -> Result<Self> {
        let ContainerConfig {
            scope,
            bindings,
            interceptors,
        } = config;

        let mut bindings: HashMap<BindingKey, Binding> = bindings
            .into_iter()
            .map(|(key, definition)| {
                let binding = Binding {
                    key: key.clone(),
                    scope: definition.scope,
                    provider: definition.provider,
                    singleton: OnceCell::new(),
                    interceptors: Vec::new(),
                };
                (key, binding)
            })
            .collect();

        for (key, interceptor) in interceptors {
            let binding = bindings.get_mut(&key).ok_or_else(|| {
                Error::configuration(format!("interceptor registered for unbound key {}", key))
            })?;
            binding.interceptors.push(interceptor);
        }

        let container = Self {
            inner: Arc::new(ContainerInner { bindings, scope }),
        };

        let eager: Vec<&Binding> = container
            .inner
            .bindings
            .values()
            .filter(|b| b.scope == BindingScope::EagerSingleton)
            .collect();
        for binding in eager {
            container.provide(binding)?;
        }

        debug!(
            target: "testbed::container",
            "Created container with {} binding(s)",
            container.inner.bindings.len()
        );
        Ok(container)
    }

    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.resolve_key(&BindingKey::of::<T>())
    }

    pub fn resolve_named<T: Send + Sync + 'static>(&self, qualifier: &'static str) -> Result<Arc<T>> {
        self.resolve_key(&BindingKey::named::<T>(qualifier))
    }

    pub fn resolve_key<T: Send + Sync + 'static>(&self, key: &BindingKey) -> Result<Arc<T>> {
        self.resolve_instance(key)?
            .downcast::<T>()
            .map_err(|_| Error::TypeMismatch {
                key: key.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Resolve `key` through its interceptors.
    pub fn resolve_instance(&self, key: &BindingKey) -> Result<Instance> {
        let binding = self
            .inner
            .bindings
            .get(key)
            .ok_or_else(|| Error::BindingNotFound(key.to_string()))?;

        trace!(target: "testbed::container", "Resolving {}", key);
        let underlying = || self.provide(binding);
        self.run_chain(key, &binding.interceptors, &underlying)
    }

    fn run_chain(
        &self,
        key: &BindingKey,
        chain: &[Arc<dyn ResolutionInterceptor>],
        underlying: &dyn Fn() -> Result<Instance>,
    ) -> Result<Instance> {
        match chain.split_first() {
            None => underlying(),
            Some((outer, rest)) => outer.intercept(key, &|| self.run_chain(key, rest, underlying)),
        }
    }

    /// Run the provider honouring the binding's scope.
    fn provide(&self, binding: &Binding) -> Result<Instance> {
        match binding.scope {
            BindingScope::Unscoped => (binding.provider)(self),
            BindingScope::Singleton | BindingScope::EagerSingleton => binding
                .singleton
                .get_or_try_init(|| (binding.provider)(self))
                .cloned(),
            BindingScope::Test => self
                .inner
                .scope
                .resolve_instance(&binding.key, || (binding.provider)(self)),
        }
    }

    pub fn has_binding(&self, key: &BindingKey) -> bool {
        self.inner.bindings.contains_key(key)
    }

    pub fn scope(&self) -> &TestScope {
        &self.inner.scope
    }

    pub fn ptr_eq(&self, other: &Container) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("bindings", &self.inner.bindings.len())
            .finish()
    }
}
