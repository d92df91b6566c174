//! # Process-wide default Environment.
//!
//! Top-level entry points that do not juggle multiple lifecycles can use the
//! default [`Environment`] through the free functions in this module instead
//! of threading a handle everywhere. Libraries and anything below `main`
//! should take an explicit [`Environment`].
//!
//! The default instance is created on first use and lives for the rest of
//! the process; the first call to any function here must happen inside the
//! tokio runtime.

use std::future::Future;
use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;

use crate::env::Environment;
use crate::error::TaskError;

static DEFAULT: OnceLock<Environment> = OnceLock::new();

/// Returns the process-wide default Environment, creating it on first call.
pub fn global() -> &'static Environment {
    DEFAULT.get_or_init(Environment::new)
}

/// Returns the base cancellation token of the default Environment.
pub fn context() -> CancellationToken {
    global().context()
}

/// Spawns a task on the default Environment. See [`Environment::spawn`].
pub fn spawn<F, Fut>(f: F)
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    global().spawn(f);
}

/// Cancels the default Environment. See [`Environment::cancel`].
pub fn cancel(err: Option<TaskError>) -> bool {
    global().cancel(err)
}

/// Stops the default Environment without cancelling its context.
/// See [`Environment::stop`].
pub fn stop() -> bool {
    global().stop()
}

/// Waits for the default Environment to drain. See [`Environment::wait`].
pub async fn wait() -> Result<(), TaskError> {
    global().wait().await
}
