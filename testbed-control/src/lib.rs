//! Per-test overrides of container bindings.
//!
//! A test declares which bindings of the code under test it may replace.
//! The same declaration produces two halves:
//!
//! - the **server side**, an interceptor on each controlled binding of the
//!   production configuration that serves the current test's override and
//!   otherwise falls through to the original provider;
//! - the **client side**, a [`Control<T>`] handle per binding that tests
//!   resolve from their own environment to set or reset overrides.
//!
//! Which test a resolution belongs to is decided by a [`ControlStrategy`]:
//! [`SharedMapStrategy`] when the code under test runs on the test's own
//! threads, [`CorrelationStrategy`] when it serves requests and learns the
//! test from a correlation cookie.
//!
//! ```
//! use testbed_control::{Control, ControllableInjection, SharedMapStrategy};
//! use testbed_core::{BindingScope, Container, ContainerConfig, TestDescription, TestScope};
//!
//! let scope = TestScope::new();
//! let mut bridge = ControllableInjection::new(SharedMapStrategy::new(scope.clone()));
//! bridge.control::<String>().unwrap();
//!
//! let mut production = ContainerConfig::new(scope.clone());
//! production.bind(BindingScope::Singleton, |_| Ok(String::from("live")));
//! let server = Container::create_from(bridge.build_server_side(production).unwrap()).unwrap();
//!
//! let mut environment = ContainerConfig::new(scope.clone());
//! bridge.build_client_side().bind_into(&mut environment);
//! let client = Container::create_from(environment).unwrap();
//!
//! scope.enter(&TestDescription::named("overrides")).unwrap();
//! client
//!     .resolve::<Control<String>>()
//!     .unwrap()
//!     .set_override(String::from("stubbed"))
//!     .unwrap();
//! assert_eq!(*server.resolve::<String>().unwrap(), "stubbed");
//! # scope.clear_current();
//! ```

pub mod bridge;
pub mod cookie;
pub mod handle;
pub mod strategy;

pub use bridge::{ClientBindings, ControllableInjection};
pub use cookie::{correlation_cookie, identity_from_cookie_header, set_correlation_cookie};
pub use handle::Control;
pub use strategy::{
    ControlStrategy, ControllableId, CorrelationStrategy, OverrideStore, RequestGuard,
    SharedMapStrategy,
};
