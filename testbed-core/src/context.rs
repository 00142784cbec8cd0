// Process-wide test context

use crate::description::TestDescription;
use crate::environment::{ContainerHandle, EnvironmentSelector};
use crate::error::{Error, Result};
use crate::registry::EnvironmentRegistry;
use crate::scaffolding::{Phase, TestCaseScaffolding};
use crate::scope::TestScope;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use testbed_log::debug;

static GLOBAL: OnceCell<TestContext> = OnceCell::new();

/// Options a [`TestContext`] is created with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    /// Fail environments that bind no lifecycle listener instead of
    /// falling back to a no-op listener.
    pub strict_listener: bool,
}

/// Everything a test suite shares: the scope, the environment registry and
/// the begin/end scaffolding built on both.
#[derive(Debug)]
pub struct TestContext {
    options: ContextOptions,
    scope: TestScope,
    registry: Arc<EnvironmentRegistry>,
    scaffolding: TestCaseScaffolding,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_options(ContextOptions::default())
    }

    pub fn with_options(options: ContextOptions) -> Self {
        let scope = TestScope::new();
        let registry = Arc::new(
            EnvironmentRegistry::new(scope.clone()).with_strict_listener(options.strict_listener),
        );
        let scaffolding = TestCaseScaffolding::new(registry.clone());
        Self {
            options,
            scope,
            registry,
            scaffolding,
        }
    }

    /// The shared context used by test-runner adapters, created with default
    /// options unless [`TestContext::init_global`] ran first.
    pub fn global() -> &'static TestContext {
        GLOBAL.get_or_init(TestContext::new)
    }

    /// Create the shared context with `options`. Fails if it already exists.
    pub fn init_global(options: ContextOptions) -> Result<&'static TestContext> {
        let mut created = false;
        let context = GLOBAL.get_or_init(|| {
            created = true;
            TestContext::with_options(options)
        });
        if created {
            Ok(context)
        } else {
            Err(Error::configuration(
                "the global test context was already initialized",
            ))
        }
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub fn scope(&self) -> &TestScope {
        &self.scope
    }

    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.registry
    }

    pub fn scaffolding(&self) -> &TestCaseScaffolding {
        &self.scaffolding
    }

    pub fn begin<S>(&self, test: &TestDescription, selector: &S) -> Result<ContainerHandle>
    where
        S: EnvironmentSelector + ?Sized,
    {
        self.scaffolding.begin(test, selector)
    }

    pub fn end(&self, test: &TestDescription) -> Result<()> {
        self.scaffolding.end(test)
    }

    pub fn phase(&self, test: &TestDescription) -> Phase {
        self.scaffolding.phase(test)
    }

    /// Drop every cached environment, registration, open scope and run
    /// record.
    pub fn reset(&self) {
        self.scaffolding.reset();
        self.scope.reset();
        self.registry.reset();
        debug!(target: "testbed::context", "Test context reset");
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
