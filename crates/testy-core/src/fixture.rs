//! Test fixture lifecycle.
//!
//! A fixture sets up a resource for a test (or a group of tests) and hands
//! back a typed handle; the same fixture tears that handle down afterwards.
//! Handles carry their own accessors, so tests ask for exactly what they use.

use crate::error::Result;

/// A resource that can be set up before tests and torn down after.
pub trait Fixture {
    /// Typed handle returned by setup.
    type Handle;

    /// Create the resource.
    fn setup(&self) -> Result<Self::Handle>;

    /// Release the resource.
    fn teardown(&self, handle: Self::Handle) -> Result<()>;
}

/// Run `body` against a freshly set up fixture, tearing it down afterwards.
///
/// Teardown runs even when `body` fails; the body's error wins over a
/// teardown error.
pub fn with_fixture<F, T>(fixture: &F, body: impl FnOnce(&F::Handle) -> Result<T>) -> Result<T>
where
    F: Fixture,
{
    let handle = fixture.setup()?;
    let outcome = body(&handle);
    let teardown = fixture.teardown(handle);

    match (outcome, teardown) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), teardown) => {
            if let Err(te) = teardown {
                tracing::warn!("Fixture teardown failed after test error: {}", te);
            }
            Err(e)
        }
        (Ok(_), Err(te)) => Err(te),
    }
}
