//! Test identities and descriptions.
//!
//! A [`TestDescription`] names one executing test: the test instance, its
//! display name and a [`TestIdentity`] correlation token. Two descriptions
//! are equal when they point at the same instance under the same name; the
//! identity only travels along for correlation (cookies, logs).

use crate::container::Container;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque token unique per test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestIdentity(Uuid);

impl TestIdentity {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TestIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TestIdentity {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// The object a test body runs against.
///
/// `inject` is called once the test's container is ready; implementations
/// resolve what they need and keep it, typically in `OnceLock` fields.
pub trait TestInstance: Send + Sync + 'static {
    fn inject(&self, _container: &Container) -> Result<()> {
        Ok(())
    }
}

/// Test instance for tests that declare no dependencies.
#[derive(Debug, Default)]
pub struct NoDependencies;

impl TestInstance for NoDependencies {}

/// Identifies one executing test.
#[derive(Clone)]
pub struct TestDescription {
    instance: Arc<dyn TestInstance>,
    name: Arc<str>,
    identity: TestIdentity,
}

impl TestDescription {
    pub fn new(instance: Arc<dyn TestInstance>, name: impl Into<String>) -> Self {
        Self {
            instance,
            name: Arc::from(name.into()),
            identity: TestIdentity::new(),
        }
    }

    /// Description for a test without declared dependencies.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(Arc::new(NoDependencies), name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> TestIdentity {
        self.identity
    }

    pub fn instance(&self) -> &Arc<dyn TestInstance> {
        &self.instance
    }

    fn instance_addr(&self) -> *const () {
        Arc::as_ptr(&self.instance) as *const ()
    }
}

impl PartialEq for TestDescription {
    fn eq(&self, other: &Self) -> bool {
        self.instance_addr() == other.instance_addr() && self.name == other.name
    }
}

impl Eq for TestDescription {}

impl Hash for TestDescription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instance_addr().hash(state);
        self.name.hash(state);
    }
}

impl fmt::Debug for TestDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDescription")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .finish()
    }
}

impl fmt::Display for TestDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.identity)
    }
}
