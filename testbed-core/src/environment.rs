//! Environments, selectors and test lifecycle listeners.

use crate::container::{Container, ContainerConfig};
use crate::description::TestDescription;
use crate::error::Result;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Names an environment. Usually derived from the environment's type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvironmentDescriptor(Cow<'static, str>);

impl EnvironmentDescriptor {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn of<E: Environment>() -> Self {
        Self(Cow::Borrowed(std::any::type_name::<E>()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A self-contained configuration a test container is built from.
pub trait Environment: Send + Sync + 'static {
    /// Declare the environment's bindings.
    fn configure(&self, config: &mut ContainerConfig) -> Result<()>;

    /// Called once after the container has been built.
    fn on_ready(&self, _container: &Container) -> Result<()> {
        Ok(())
    }
}

/// Chooses the environment a test runs in.
pub trait EnvironmentSelector: Send + Sync {
    fn select_environment(&self, test: &TestDescription) -> Result<EnvironmentDescriptor>;
}

impl<F> EnvironmentSelector for F
where
    F: Fn(&TestDescription) -> Result<EnvironmentDescriptor> + Send + Sync,
{
    fn select_environment(&self, test: &TestDescription) -> Result<EnvironmentDescriptor> {
        self(test)
    }
}

impl EnvironmentSelector for EnvironmentDescriptor {
    fn select_environment(&self, _test: &TestDescription) -> Result<EnvironmentDescriptor> {
        Ok(self.clone())
    }
}

/// Notified when a test enters and leaves its scope.
pub trait TestLifecycleListener: Send + Sync {
    fn entering_scope(&self, test: &TestDescription) -> Result<()>;

    fn exiting_scope(&self, test: &TestDescription) -> Result<()>;
}

/// Older listener style that only sees the test name and cannot fail.
pub trait LegacyTestListener: Send + Sync {
    fn before_test(&self, name: &str);

    fn after_test(&self, name: &str);
}

pub(crate) struct LegacyListenerAdapter(pub(crate) Arc<dyn LegacyTestListener>);

impl TestLifecycleListener for LegacyListenerAdapter {
    fn entering_scope(&self, test: &TestDescription) -> Result<()> {
        self.0.before_test(test.name());
        Ok(())
    }

    fn exiting_scope(&self, test: &TestDescription) -> Result<()> {
        self.0.after_test(test.name());
        Ok(())
    }
}

/// Listener used when an environment binds none and strict mode is off.
#[derive(Debug, Default)]
pub struct NoopListener;

impl TestLifecycleListener for NoopListener {
    fn entering_scope(&self, _test: &TestDescription) -> Result<()> {
        Ok(())
    }

    fn exiting_scope(&self, _test: &TestDescription) -> Result<()> {
        Ok(())
    }
}

impl ContainerConfig {
    /// Bind the environment's lifecycle listener.
    pub fn bind_listener<L: TestLifecycleListener + 'static>(&mut self, listener: L) -> &mut Self {
        let listener: Arc<dyn TestLifecycleListener> = Arc::new(listener);
        self.bind_instance(listener)
    }

    /// Bind a legacy-style lifecycle listener.
    pub fn bind_legacy_listener<L: LegacyTestListener + 'static>(&mut self, listener: L) -> &mut Self {
        let listener: Arc<dyn LegacyTestListener> = Arc::new(listener);
        self.bind_instance(listener)
    }
}

/// A constructed environment: its container and lifecycle listener.
#[derive(Clone)]
pub struct ContainerHandle {
    descriptor: EnvironmentDescriptor,
    container: Container,
    listener: Arc<dyn TestLifecycleListener>,
}

impl ContainerHandle {
    pub(crate) fn new(
        descriptor: EnvironmentDescriptor,
        container: Container,
        listener: Arc<dyn TestLifecycleListener>,
    ) -> Self {
        Self {
            descriptor,
            container,
            listener,
        }
    }

    pub fn descriptor(&self) -> &EnvironmentDescriptor {
        &self.descriptor
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn listener(&self) -> &Arc<dyn TestLifecycleListener> {
        &self.listener
    }

    /// Whether two handles share one constructed container.
    pub fn same_container(&self, other: &ContainerHandle) -> bool {
        self.container.ptr_eq(&other.container)
    }
}

impl fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("descriptor", &self.descriptor)
            .field("container", &self.container)
            .finish()
    }
}
