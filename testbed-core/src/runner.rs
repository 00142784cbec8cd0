//! Helper for test-runner adapters.

use crate::container::Container;
use crate::context::TestContext;
use crate::description::TestDescription;
use crate::environment::EnvironmentSelector;
use crate::error::{Error, Result};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use testbed_log::warn;

/// Run `body` as `test`: begin, run, and always end.
///
/// A failing body is reported ahead of teardown failures. A panicking body
/// is re-raised after the test has ended, so runners that rely on unwinding
/// still see it.
///
/// ```
/// use testbed_core::{run_test, ContainerConfig, Environment, Result, TestContext, TestDescription};
///
/// #[derive(Default)]
/// struct Greetings;
///
/// impl Environment for Greetings {
///     fn configure(&self, config: &mut ContainerConfig) -> Result<()> {
///         config.bind_instance(String::from("hello"));
///         Ok(())
///     }
/// }
///
/// let context = TestContext::new();
/// let environment = context.registry().register::<Greetings>();
/// let test = TestDescription::named("greets");
///
/// let greeting = run_test(&context, &test, &environment, |container| {
///     container.resolve::<String>()
/// })
/// .unwrap();
/// assert_eq!(*greeting, "hello");
/// ```
pub fn run_test<S, F, T>(
    context: &TestContext,
    test: &TestDescription,
    selector: &S,
    body: F,
) -> Result<T>
where
    S: EnvironmentSelector + ?Sized,
    F: FnOnce(&Container) -> Result<T>,
{
    let handle = match context.begin(test, selector) {
        Ok(handle) => handle,
        Err(e) => {
            if context.scaffolding().awaits_end(test) {
                if let Err(cleanup) = context.end(test) {
                    warn!(target: "testbed::runner", "Cleanup after failed setup of {}: {}", test, cleanup);
                }
            }
            return Err(e);
        }
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| body(handle.container())));
    let ended = context.end(test);

    match outcome {
        Err(payload) => {
            if let Err(e) = ended {
                warn!(target: "testbed::runner", "Teardown of panicked {} failed: {}", test, e);
            }
            resume_unwind(payload)
        }
        Ok(Ok(value)) => ended.map(|()| value),
        Ok(Err(e)) => match ended {
            Ok(()) => Err(e),
            Err(teardown) => Err(Error::TearDown {
                first: Box::new(e),
                suppressed: vec![teardown],
            }),
        },
    }
}
