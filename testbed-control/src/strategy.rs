//! Where overrides live and how a resolution finds its test.

use crate::cookie;
use dashmap::DashMap;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use testbed_config::{DEFAULT_CORRELATION_COOKIE, Settings};
use testbed_core::{BindingKey, Instance, TestDescription, TestIdentity, TestScope};
use testbed_log::trace;

/// A controllable binding of one test.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControllableId {
    pub test: TestIdentity,
    pub key: BindingKey,
}

impl ControllableId {
    pub fn new(test: TestIdentity, key: BindingKey) -> Self {
        Self { test, key }
    }
}

impl fmt::Display for ControllableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for {}", self.key, self.test)
    }
}

/// Override values keyed by test and binding.
#[derive(Default)]
pub struct OverrideStore {
    values: DashMap<ControllableId, Instance>,
}

impl OverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: ControllableId, value: Instance) {
        trace!(target: "testbed::control", "Override set: {}", id);
        self.values.insert(id, value);
    }

    pub fn get(&self, id: &ControllableId) -> Option<Instance> {
        self.values.get(id).map(|v| v.value().clone())
    }

    pub fn clear(&self, id: &ControllableId) -> bool {
        let removed = self.values.remove(id).is_some();
        if removed {
            trace!(target: "testbed::control", "Override cleared: {}", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for OverrideStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverrideStore")
            .field("overrides", &self.values.len())
            .finish()
    }
}

/// Decides which test's overrides apply to a resolution.
pub trait ControlStrategy: Send + Sync + 'static {
    /// The test the code resolving on the calling thread is working for.
    fn current_test(&self) -> Option<TestIdentity>;

    fn overrides(&self) -> &OverrideStore;
}

/// In-process strategy: the resolving thread runs inside the test, so the
/// test scope already knows which test it is.
#[derive(Debug)]
pub struct SharedMapStrategy {
    scope: TestScope,
    overrides: OverrideStore,
}

impl SharedMapStrategy {
    pub fn new(scope: TestScope) -> Self {
        Self {
            scope,
            overrides: OverrideStore::new(),
        }
    }
}

impl ControlStrategy for SharedMapStrategy {
    fn current_test(&self) -> Option<TestIdentity> {
        self.scope.current_active().map(|test| test.identity())
    }

    fn overrides(&self) -> &OverrideStore {
        &self.overrides
    }
}

thread_local! {
    static CURRENT_REQUEST: Cell<Option<TestIdentity>> = const { Cell::new(None) };
}

/// Strategy for code serving requests on threads that know nothing about
/// tests. The request handling code binds the correlation token carried by
/// the request to the serving thread with [`CorrelationStrategy::enter_request`].
#[derive(Debug)]
pub struct CorrelationStrategy {
    cookie_name: String,
    overrides: OverrideStore,
}

impl CorrelationStrategy {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            overrides: OverrideStore::new(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.correlation_cookie.clone())
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Serve the current request on behalf of `test` until the guard drops.
    pub fn enter_request(&self, test: TestIdentity) -> RequestGuard {
        let previous = CURRENT_REQUEST.with(|current| current.replace(Some(test)));
        RequestGuard {
            previous,
            _not_send: PhantomData,
        }
    }

    /// Enter the request whose `Cookie` header carries a correlation token.
    /// Returns `None` if the header has no valid token.
    pub fn enter_from_cookie_header(&self, header: &str) -> Option<RequestGuard> {
        cookie::identity_from_cookie_header(&self.cookie_name, header)
            .map(|test| self.enter_request(test))
    }

    /// The `Cookie` header value a test sends so its requests are
    /// correlated.
    pub fn cookie_for(&self, test: &TestDescription) -> String {
        cookie::correlation_cookie(&self.cookie_name, test.identity())
    }
}

impl Default for CorrelationStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_CORRELATION_COOKIE)
    }
}

impl ControlStrategy for CorrelationStrategy {
    fn current_test(&self) -> Option<TestIdentity> {
        CURRENT_REQUEST.with(Cell::get)
    }

    fn overrides(&self) -> &OverrideStore {
        &self.overrides
    }
}

/// Returned by [`CorrelationStrategy::enter_request`]; restores the
/// previous request on drop.
pub struct RequestGuard {
    previous: Option<TestIdentity>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        CURRENT_REQUEST.with(|current| current.set(self.previous.take()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_store_is_keyed_by_test_and_binding() {
        let store = OverrideStore::new();
        let a = TestIdentity::new();
        let b = TestIdentity::new();
        let key = BindingKey::of::<String>();

        store.set(ControllableId::new(a, key.clone()), Arc::new(String::from("a")));
        assert!(store.get(&ControllableId::new(b, key.clone())).is_none());
        assert!(store.get(&ControllableId::new(a, key.clone())).is_some());

        store.set(ControllableId::new(b, key.clone()), Arc::new(String::from("b")));
        assert_eq!(store.len(), 2);
        assert!(store.clear(&ControllableId::new(a, key.clone())));
        assert_eq!(store.len(), 1);
        assert!(store.clear(&ControllableId::new(b, key.clone())));
        assert!(!store.clear(&ControllableId::new(b, key)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_shared_map_follows_scope() {
        let scope = TestScope::new();
        let strategy = SharedMapStrategy::new(scope.clone());
        assert!(strategy.current_test().is_none());

        let test = TestDescription::named("shared");
        scope.enter(&test).unwrap();
        assert_eq!(strategy.current_test(), Some(test.identity()));
        scope.clear_current();
    }

    #[test]
    fn test_request_guards_nest() {
        let strategy = CorrelationStrategy::default();
        let outer = TestIdentity::new();
        let inner = TestIdentity::new();

        let _outer = strategy.enter_request(outer);
        {
            let _inner = strategy.enter_request(inner);
            assert_eq!(strategy.current_test(), Some(inner));
        }
        assert_eq!(strategy.current_test(), Some(outer));
    }

    #[test]
    fn test_cookie_round_trip_through_strategy() {
        let strategy = CorrelationStrategy::new("suite-test");
        let test = TestDescription::named("cookie");
        let header = format!("theme=dark; {}", strategy.cookie_for(&test));

        let guard = strategy.enter_from_cookie_header(&header);
        assert!(guard.is_some());
        assert_eq!(strategy.current_test(), Some(test.identity()));
        drop(guard);
        assert!(strategy.current_test().is_none());
        assert!(strategy.enter_from_cookie_header("theme=dark").is_none());
    }

    #[test]
    fn test_from_settings_uses_cookie_name() {
        let settings = Settings {
            correlation_cookie: "custom".to_string(),
            ..Settings::default()
        };
        assert_eq!(CorrelationStrategy::from_settings(&settings).cookie_name(), "custom");
    }
}
