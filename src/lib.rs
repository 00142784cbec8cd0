// Testbed - lifecycle management for dependency-injection containers in
// test suites
//
// Environments are constructed once and shared, test-scoped values live
// exactly as long as their test, teardown runs in reverse order, and tests
// may override bindings of the code under test for their own duration.

// Re-export core functionality
pub use testbed_core::*;

// Re-export logging
pub use testbed_log as log;

// Re-export optional crates
#[cfg(feature = "config")]
pub use testbed_config;

#[cfg(feature = "control")]
pub use testbed_control;

/// Commonly used types for writing environments and tests.
pub mod prelude {
    pub use testbed_core::{
        BindingKey, BindingScope, Container, ContainerConfig, Environment, EnvironmentDescriptor,
        Error, Result, TearDownStack, TestContext, TestDescription, TestInstance,
        TestLifecycleListener, TestScope, run_test,
    };

    #[cfg(feature = "config")]
    pub use testbed_config::Settings;

    #[cfg(feature = "control")]
    pub use testbed_control::{Control, ControllableInjection, CorrelationStrategy, SharedMapStrategy};
}
