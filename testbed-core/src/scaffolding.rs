//! Begin/end sequencing of a single test.

use crate::description::{TestDescription, TestIdentity};
use crate::environment::{ContainerHandle, EnvironmentDescriptor, EnvironmentSelector};
use crate::error::{Error, Result};
use crate::key::BindingKey;
use crate::registry::EnvironmentRegistry;
use crate::scope::TestScope;
use crate::teardown::TearDownStack;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::sync::Arc;
use testbed_log::{debug, info, warn};

/// Where a test is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    SettingUp,
    Active,
    TearingDown,
    /// Ended cleanly. The run is forgotten right after, so `phase` never reports it.
    Finished,
    /// Setup or teardown failed.
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::NotStarted => "not started",
            Phase::SettingUp => "setting up",
            Phase::Active => "active",
            Phase::TearingDown => "tearing down",
            Phase::Finished => "finished",
            Phase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
enum Stage {
    /// Setup succeeded; `end` will tear down.
    Open {
        handle: ContainerHandle,
        stack: TearDownStack,
    },
    /// The environment could not be obtained; `end` only cleans up.
    Sentinel,
    /// Nothing is left for `end` to do.
    Closed,
}

struct Run {
    phase: Phase,
    stage: Stage,
}

/// Sequences `begin`/`end` of tests against an environment registry.
///
/// Runs are tracked by identity so a record never keeps a test instance
/// alive. A run that ends cleanly is forgotten; only aborted runs are kept,
/// to reject a second `begin` of the same test.
pub struct TestCaseScaffolding {
    scope: TestScope,
    registry: Arc<EnvironmentRegistry>,
    runs: DashMap<TestIdentity, Run>,
}

impl TestCaseScaffolding {
    pub fn new(registry: Arc<EnvironmentRegistry>) -> Self {
        Self {
            scope: registry.scope().clone(),
            registry,
            runs: DashMap::new(),
        }
    }

    /// Set up `test` on the calling thread.
    ///
    /// On success the test is current on this thread, its listener has been
    /// told it is entering scope and its dependencies are injected. Every
    /// failure after the test became current leaves it either closed (the
    /// teardown stack already ran) or, when the environment itself is
    /// unavailable, waiting for [`TestCaseScaffolding::end`] to clean up.
    pub fn begin<S>(&self, test: &TestDescription, selector: &S) -> Result<ContainerHandle>
    where
        S: EnvironmentSelector + ?Sized,
    {
        if let Some(active) = self.scope.current_active() {
            return Err(Error::sequencing(format!(
                "cannot begin {} while {} is still running on this thread",
                test, active
            )));
        }
        match self.runs.entry(test.identity()) {
            Entry::Occupied(existing) => {
                return Err(Error::sequencing(format!(
                    "{} was already begun (currently {})",
                    test,
                    existing.get().phase
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Run {
                    phase: Phase::SettingUp,
                    stage: Stage::Closed,
                });
            }
        }

        let descriptor = match selector.select_environment(test) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.transition(test, Phase::Aborted, Stage::Closed);
                return Err(e);
            }
        };

        if let Err(e) = self.scope.enter(test) {
            self.transition(test, Phase::Aborted, Stage::Closed);
            return Err(e);
        }
        debug!(target: "testbed::scaffolding", "Setting up {} in {}", test, descriptor);

        let handle = match self.registry.get_or_create(&descriptor) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    target: "testbed::scaffolding",
                    "{} cannot run: environment {} is unavailable",
                    test,
                    descriptor
                );
                self.transition(test, Phase::Aborted, Stage::Sentinel);
                return Err(e);
            }
        };

        let stack = self.scaffold_tear_down(test);

        if let Err(e) = handle.listener().entering_scope(test) {
            let e = Self::with_suppressed(e, stack.run_all());
            self.transition(test, Phase::Aborted, Stage::Closed);
            return Err(e);
        }

        if let Err(e) = test.instance().inject(handle.container()) {
            let mut e = Error::Injection {
                environment: descriptor.to_string(),
                source: Box::new(e),
            };
            if let Err(exit) = handle.listener().exiting_scope(test) {
                e = Self::with_suppressed(e, Err(exit));
            }
            let e = Self::with_suppressed(e, stack.run_all());
            self.transition(test, Phase::Aborted, Stage::Closed);
            return Err(e);
        }

        self.transition(
            test,
            Phase::Active,
            Stage::Open {
                handle: handle.clone(),
                stack,
            },
        );
        info!(target: "testbed::scaffolding", "Began {} in {}", test, descriptor);
        Ok(handle)
    }

    /// Tear down `test` on the calling thread.
    ///
    /// The listener is told the test is exiting scope before the teardown
    /// stack runs; failures from both are reported together.
    pub fn end(&self, test: &TestDescription) -> Result<()> {
        let (handle, stack) = {
            let Some(mut run) = self.runs.get_mut(&test.identity()) else {
                return Err(Error::sequencing(format!("{} was ended without being begun", test)));
            };

            let sentinel = match run.stage {
                Stage::Closed => {
                    return Err(Error::sequencing(format!(
                        "{} cannot be ended again (currently {})",
                        test, run.phase
                    )));
                }
                Stage::Sentinel => true,
                Stage::Open { .. } => false,
            };
            if sentinel {
                // Stays aborted so the same test cannot begin again.
                run.stage = Stage::Closed;
                drop(run);
                if self.scope.current().as_ref() == Some(test) {
                    self.scope.clear_current();
                }
                self.scope.finish_scope(test);
                debug!(target: "testbed::scaffolding", "Released {} after failed setup", test);
                return Ok(());
            }

            match self.scope.current() {
                Some(current) if current == *test => {}
                Some(current) => {
                    return Err(Error::sequencing(format!(
                        "cannot end {} on a thread where {} is current",
                        test, current
                    )));
                }
                None => {
                    return Err(Error::sequencing(format!(
                        "cannot end {} on a thread where no test is current",
                        test
                    )));
                }
            }

            run.phase = Phase::TearingDown;
            match std::mem::replace(&mut run.stage, Stage::Closed) {
                Stage::Open { handle, stack } => (handle, stack),
                Stage::Sentinel | Stage::Closed => {
                    return Err(Error::sequencing(format!("{} has no open teardown", test)));
                }
            }
        };

        let mut errors = Vec::new();
        if let Err(e) = handle.listener().exiting_scope(test) {
            warn!(target: "testbed::scaffolding", "Listener failed while {} exited: {}", test, e);
            errors.push(e);
        }
        if let Err(e) = stack.run_all() {
            errors.push(e);
        }

        match Error::aggregate(errors) {
            None => {
                self.finish(test);
                info!(target: "testbed::scaffolding", "Ended {}", test);
                Ok(())
            }
            Some(e) => {
                self.set_phase(test, Phase::Aborted);
                warn!(target: "testbed::scaffolding", "Teardown of {} failed: {}", test, e);
                Err(e)
            }
        }
    }

    /// The phase `test` is in. A test that ended cleanly is forgotten and
    /// reports [`Phase::NotStarted`] again.
    pub fn phase(&self, test: &TestDescription) -> Phase {
        self.runs
            .get(&test.identity())
            .map(|run| run.phase)
            .unwrap_or(Phase::NotStarted)
    }

    /// Whether `end` still has work to do for `test`.
    pub fn awaits_end(&self, test: &TestDescription) -> bool {
        self.runs
            .get(&test.identity())
            .is_some_and(|run| !matches!(run.stage, Stage::Closed))
    }

    /// The environment `test` was set up in, while it is active.
    pub fn handle(&self, test: &TestDescription) -> Option<ContainerHandle> {
        self.runs.get(&test.identity()).and_then(|run| match &run.stage {
            Stage::Open { handle, .. } => Some(handle.clone()),
            Stage::Sentinel | Stage::Closed => None,
        })
    }

    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.registry
    }

    /// Forget every recorded run.
    pub fn reset(&self) {
        self.runs.clear();
    }

    /// The teardown stack every test gets: releasing the scope runs last,
    /// after the test's own cleanups have drained.
    fn scaffold_tear_down(&self, test: &TestDescription) -> TearDownStack {
        let stack = TearDownStack::new();

        let scope = self.scope.clone();
        let owner = test.clone();
        stack.push_named(format!("release scope of {}", test.name()), move || {
            if scope.current().as_ref() == Some(&owner) {
                scope.clear_current();
            }
            scope.finish_scope(&owner);
            Ok(())
        });

        let scope = self.scope.clone();
        stack.push_named(format!("cleanups of {}", test.name()), move || {
            match scope.peek(&BindingKey::of::<TearDownStack>())? {
                Some(instance) => match instance.downcast::<TearDownStack>() {
                    Ok(registered) => registered.run_all(),
                    Err(_) => Err(Error::TypeMismatch {
                        key: BindingKey::of::<TearDownStack>().to_string(),
                        expected: std::any::type_name::<TearDownStack>(),
                    }),
                },
                None => Ok(()),
            }
        });

        stack
    }

    fn transition(&self, test: &TestDescription, phase: Phase, stage: Stage) {
        if let Some(mut run) = self.runs.get_mut(&test.identity()) {
            debug!(
                target: "testbed::scaffolding",
                "{}: {} -> {}",
                test,
                run.phase,
                phase
            );
            run.phase = phase;
            run.stage = stage;
        }
    }

    /// Drop the record of a run that ended cleanly.
    fn finish(&self, test: &TestDescription) {
        if let Some((_, run)) = self.runs.remove(&test.identity()) {
            debug!(target: "testbed::scaffolding", "{}: {} -> {}", test, run.phase, Phase::Finished);
        }
    }

    fn set_phase(&self, test: &TestDescription, phase: Phase) {
        if let Some(mut run) = self.runs.get_mut(&test.identity()) {
            run.phase = phase;
        }
    }

    fn with_suppressed(primary: Error, secondary: Result<()>) -> Error {
        match secondary {
            Ok(()) => primary,
            Err(other) => {
                warn!(target: "testbed::scaffolding", "Suppressed during failed setup: {}", other);
                Error::TearDown {
                    first: Box::new(primary),
                    suppressed: vec![other],
                }
            }
        }
    }
}

impl fmt::Debug for TestCaseScaffolding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCaseScaffolding")
            .field("runs", &self.runs.len())
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Container, ContainerConfig};
    use crate::description::TestInstance;
    use crate::environment::{Environment, TestLifecycleListener};
    use parking_lot::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Journaling(Journal);

    impl TestLifecycleListener for Journaling {
        fn entering_scope(&self, test: &TestDescription) -> Result<()> {
            self.0.lock().push(format!("enter {}", test.name()));
            Ok(())
        }

        fn exiting_scope(&self, test: &TestDescription) -> Result<()> {
            self.0.lock().push(format!("exit {}", test.name()));
            Ok(())
        }
    }

    struct JournalEnvironment(Journal);

    impl Environment for JournalEnvironment {
        fn configure(&self, config: &mut ContainerConfig) -> Result<()> {
            config.bind_listener(Journaling(self.0.clone()));
            config.bind_test_scoped(|_| Ok(String::from("per-test")));
            Ok(())
        }
    }

    fn scaffolding() -> (TestCaseScaffolding, EnvironmentDescriptor, Journal) {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(EnvironmentRegistry::new(TestScope::new()));
        let descriptor = EnvironmentDescriptor::new("journal");
        let for_factory = journal.clone();
        registry.register_factory(descriptor.clone(), move || {
            Ok(JournalEnvironment(for_factory.clone()))
        });
        (TestCaseScaffolding::new(registry), descriptor, journal)
    }

    #[test]
    fn test_begin_and_end_walk_through_phases() {
        let (scaffolding, descriptor, journal) = scaffolding();
        let test = TestDescription::named("happy");
        assert_eq!(scaffolding.phase(&test), Phase::NotStarted);

        let handle = scaffolding.begin(&test, &descriptor).unwrap();
        assert_eq!(scaffolding.phase(&test), Phase::Active);
        assert_eq!(*handle.container().resolve::<String>().unwrap(), "per-test");

        scaffolding.end(&test).unwrap();
        assert_eq!(scaffolding.phase(&test), Phase::NotStarted);
        assert_eq!(*journal.lock(), vec!["enter happy", "exit happy"]);
        assert!(handle.container().scope().current().is_none());
        assert_eq!(handle.container().scope().active_tests(), 0);
    }

    #[test]
    fn test_begin_twice_is_sequencing_error() {
        let (scaffolding, descriptor, _) = scaffolding();
        let test = TestDescription::named("twice");
        scaffolding.begin(&test, &descriptor).unwrap();

        let error = scaffolding.begin(&test, &descriptor).unwrap_err();
        assert!(error.is_sequencing());
        scaffolding.end(&test).unwrap();
    }

    #[test]
    fn test_cleanly_ended_test_may_begin_again() {
        let (scaffolding, descriptor, _) = scaffolding();
        let test = TestDescription::named("again");
        scaffolding.begin(&test, &descriptor).unwrap();
        scaffolding.end(&test).unwrap();

        scaffolding.begin(&test, &descriptor).unwrap();
        assert_eq!(scaffolding.phase(&test), Phase::Active);
        scaffolding.end(&test).unwrap();
    }

    #[test]
    fn test_begin_while_other_test_open_names_both() {
        let (scaffolding, descriptor, _) = scaffolding();
        let first = TestDescription::named("first");
        scaffolding.begin(&first, &descriptor).unwrap();

        let error = scaffolding
            .begin(&TestDescription::named("second"), &descriptor)
            .unwrap_err();
        assert!(error.is_sequencing());
        assert!(error.to_string().contains("first"));
        assert!(error.to_string().contains("second"));
        scaffolding.end(&first).unwrap();
    }

    #[test]
    fn test_end_without_begin_and_double_end() {
        let (scaffolding, descriptor, _) = scaffolding();
        let test = TestDescription::named("ends");
        assert!(scaffolding.end(&test).unwrap_err().is_sequencing());

        scaffolding.begin(&test, &descriptor).unwrap();
        scaffolding.end(&test).unwrap();
        assert!(scaffolding.end(&test).unwrap_err().is_sequencing());
    }

    #[test]
    fn test_end_on_wrong_thread_leaves_test_active() {
        let (scaffolding, descriptor, _) = scaffolding();
        let scaffolding = Arc::new(scaffolding);
        let test = TestDescription::named("elsewhere");
        scaffolding.begin(&test, &descriptor).unwrap();

        let other = scaffolding.clone();
        let remote = test.clone();
        let error = std::thread::spawn(move || other.end(&remote))
            .join()
            .unwrap()
            .unwrap_err();
        assert!(error.is_sequencing());
        assert_eq!(scaffolding.phase(&test), Phase::Active);
        scaffolding.end(&test).unwrap();
    }

    #[test]
    fn test_registered_cleanups_run_before_scope_release() {
        let (scaffolding, descriptor, journal) = scaffolding();
        let test = TestDescription::named("cleanups");
        let handle = scaffolding.begin(&test, &descriptor).unwrap();

        let scope = handle.container().scope().clone();
        let stack = scope.tear_down_accepter().unwrap();
        for name in ["A", "B", "C"] {
            let journal = journal.clone();
            let scope = scope.clone();
            stack.push(move || {
                // Still current while cleanups run.
                assert!(scope.current_active().is_some());
                journal.lock().push(name.to_string());
                Ok(())
            });
        }

        scaffolding.end(&test).unwrap();
        assert_eq!(
            *journal.lock(),
            vec!["enter cleanups", "exit cleanups", "C", "B", "A"]
        );
    }

    #[test]
    fn test_failed_environment_needs_end_to_release() {
        let registry = Arc::new(EnvironmentRegistry::new(TestScope::new()));
        let descriptor = EnvironmentDescriptor::new("broken");
        registry.register_factory(descriptor.clone(), || -> Result<JournalEnvironment> {
            Err(Error::action("no database"))
        });
        let scaffolding = TestCaseScaffolding::new(registry.clone());

        let test = TestDescription::named("doomed");
        assert!(scaffolding.begin(&test, &descriptor).unwrap_err().is_configuration());
        assert_eq!(scaffolding.phase(&test), Phase::Aborted);
        assert!(scaffolding.awaits_end(&test));
        assert!(registry.scope().current().is_some());

        scaffolding.end(&test).unwrap();
        assert_eq!(scaffolding.phase(&test), Phase::Aborted);
        assert!(!scaffolding.awaits_end(&test));
        assert!(registry.scope().current().is_none());
        assert!(scaffolding.begin(&test, &descriptor).unwrap_err().is_sequencing());

        let next = TestDescription::named("also-doomed");
        let error = scaffolding.begin(&next, &descriptor).unwrap_err();
        assert!(error.is_permanent_failure());
        scaffolding.end(&next).unwrap();
    }

    struct Needs;

    impl TestInstance for Needs {
        fn inject(&self, container: &Container) -> Result<()> {
            container.resolve::<u64>().map(|_| ())
        }
    }

    #[derive(Default)]
    struct Holder(Mutex<Option<Arc<String>>>);

    impl TestInstance for Holder {
        fn inject(&self, container: &Container) -> Result<()> {
            *self.0.lock() = Some(container.resolve::<String>()?);
            Ok(())
        }
    }

    #[test]
    fn test_ended_tests_release_injected_values() {
        let (scaffolding, descriptor, _) = scaffolding();
        let mut injected = Vec::new();

        for round in 0..100 {
            let holder = Arc::new(Holder::default());
            let test = TestDescription::new(holder.clone(), format!("holder-{round}"));
            scaffolding.begin(&test, &descriptor).unwrap();
            if let Some(value) = holder.0.lock().as_ref() {
                injected.push(Arc::downgrade(value));
            }
            scaffolding.end(&test).unwrap();
        }

        assert_eq!(injected.len(), 100);
        assert!(injected.iter().all(|value| value.upgrade().is_none()));
        assert_eq!(scaffolding.runs.len(), 0);
    }

    #[test]
    fn test_injection_failure_aborts_and_notifies_exit() {
        let (scaffolding, descriptor, journal) = scaffolding();
        let test = TestDescription::new(Arc::new(Needs), "needs-u64");

        let error = scaffolding.begin(&test, &descriptor).unwrap_err();
        match error {
            Error::Injection { environment, source } => {
                assert_eq!(environment, "journal");
                assert!(matches!(*source, Error::BindingNotFound(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(scaffolding.phase(&test), Phase::Aborted);
        assert_eq!(*journal.lock(), vec!["enter needs-u64", "exit needs-u64"]);
        assert!(scaffolding.registry().scope().current().is_none());
        assert!(scaffolding.end(&test).unwrap_err().is_sequencing());
    }

    #[test]
    fn test_failing_cleanup_aborts_but_releases_scope() {
        let (scaffolding, descriptor, _) = scaffolding();
        let test = TestDescription::named("dirty");
        let handle = scaffolding.begin(&test, &descriptor).unwrap();
        handle
            .container()
            .scope()
            .tear_down_accepter()
            .unwrap()
            .push(|| Err(Error::action("left a file behind")));

        let error = scaffolding.end(&test).unwrap_err();
        assert_eq!(error.to_string(), "left a file behind");
        assert_eq!(scaffolding.phase(&test), Phase::Aborted);
        assert!(handle.container().scope().current().is_none());
        assert_eq!(handle.container().scope().active_tests(), 0);
    }

    #[test]
    fn test_selector_closure_picks_environment() {
        let (scaffolding, descriptor, _) = scaffolding();
        let selector = move |_: &TestDescription| -> Result<EnvironmentDescriptor> { Ok(descriptor.clone()) };
        let test = TestDescription::named("selected");
        scaffolding.begin(&test, &selector).unwrap();
        assert!(scaffolding.handle(&test).is_some());
        scaffolding.end(&test).unwrap();
        assert!(scaffolding.handle(&test).is_none());
    }
}
