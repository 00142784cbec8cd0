// Core library for Testbed
// Container caching, per-test scopes, ordered teardown and begin/end
// sequencing of tests.

pub mod container;
pub mod context;
pub mod description;
pub mod environment;
pub mod error;
pub mod key;
pub mod registry;
pub mod runner;
pub mod scaffolding;
pub mod scope;
pub mod teardown;

// Re-export commonly used types
pub use container::{BindingScope, Container, ContainerConfig, Instance, ResolutionInterceptor};
pub use context::{ContextOptions, TestContext};
pub use description::{NoDependencies, TestDescription, TestIdentity, TestInstance};
pub use environment::{
    ContainerHandle, Environment, EnvironmentDescriptor, EnvironmentSelector, LegacyTestListener,
    NoopListener, TestLifecycleListener,
};
pub use error::{BoxError, Error, Result, ScopeStateError};
pub use key::BindingKey;
pub use registry::EnvironmentRegistry;
pub use runner::run_test;
pub use scaffolding::{Phase, TestCaseScaffolding};
pub use scope::{ScopeState, ScopedFuture, StateGuard, TestScope};
pub use teardown::{TearDownAccepter, TearDownAction, TearDownStack};
