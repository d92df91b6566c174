//! # Environment: cancellation-propagating task supervision.
//!
//! [`Environment`] is the foundation every other component runs on. It owns a
//! base [`CancellationToken`], counts outstanding tasks, latches the first
//! error, and provides a completion barrier.
//!
//! ## Lifecycle
//! ```text
//! Running ──cancel(err)──► Stopping ──all tasks done──► Stopped(err)
//! ```
//!
//! - [`Environment::spawn`] registers and launches a task with a child token
//!   of the base token; the token is cancelled when the task returns.
//!   Spawning after the Environment stopped is a no-op, so no new work starts
//!   during shutdown.
//! - [`Environment::cancel`] is idempotent: the first call latches the error
//!   (which may be `None`) and cancels the base token, waking every task that
//!   watches it and any `wait` caller. It reports whether *this* call
//!   performed the transition.
//! - [`Environment::wait`] blocks until `cancel` (or [`Environment::stop`])
//!   has been called, then until every spawned task has returned, and finally
//!   yields the latched error.
//!
//! A task returning `Err` triggers an implicit `cancel` with that error: one
//! failure cancels all siblings. Concurrent failures keep only the first.
//!
//! Environments are not reusable; independent barriers get independent
//! Environments. A process-wide default instance lives in [`crate::global`].
//!
//! ## Example
//! ```no_run
//! use graceserve::{Environment, TaskError};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), TaskError> {
//!     let env = Environment::new();
//!
//!     env.spawn(|ctx| async move {
//!         ctx.cancelled().await;
//!         Ok(())
//!     });
//!
//!     env.cancel(None);
//!     env.wait().await
//! }
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::TaskError;
use crate::signals;

/// Cancellable task registry with a first-error latch and completion barrier.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<Inner>,
}

struct Inner {
    /// Base cancellation token; child tokens derive from it.
    token: CancellationToken,
    /// One-shot done signal, fired by the first `cancel`/`stop`.
    done: CancellationToken,
    /// Outstanding-task counter and completion barrier.
    tracker: TaskTracker,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Monotonic: flips false -> true exactly once.
    stopped: bool,
    /// Latched terminal error; set at most once, together with `stopped`.
    err: Option<TaskError>,
}

impl Environment {
    /// Creates a new root Environment and installs its signal watcher
    /// (see [`crate::signals`]).
    ///
    /// Must be called within a tokio runtime.
    pub fn new() -> Self {
        let env = Self::bare(CancellationToken::new());
        signals::install(env.clone());
        env
    }

    /// Creates an Environment whose base token is derived from `parent`.
    ///
    /// Cancelling `parent` cancels this Environment's context, but does not
    /// latch an error: call [`Environment::cancel`] for a full stop.
    pub fn with_parent(parent: &CancellationToken) -> Self {
        let env = Self::bare(parent.child_token());
        signals::install(env.clone());
        env
    }

    fn bare(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                token,
                done: CancellationToken::new(),
                tracker: TaskTracker::new(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Returns the base cancellation token of this Environment.
    pub fn context(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Registers and launches a task.
    ///
    /// `f` receives a child token of the base token. The child is cancelled
    /// when `f` returns, not before, so the task learns of shutdown strictly
    /// through the Environment's own cancellation.
    ///
    /// If `f` returns `Err`, [`Environment::cancel`] is called immediately
    /// with that error. No-op if the Environment already stopped.
    pub fn spawn<F, Fut>(&self, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        // The stopped check and tracker registration happen under the same
        // lock so a concurrent `cancel` cannot slip between them.
        let state = self.lock_state();
        if state.stopped {
            return;
        }
        let env = self.clone();
        let ctx = self.inner.token.child_token();
        self.inner.tracker.spawn(async move {
            let guard = ctx.clone().drop_guard();
            let result = f(ctx).await;
            drop(guard);
            if let Err(err) = result {
                env.cancel(Some(err));
            }
        });
        drop(state);
    }

    /// Cancels the base token and latches `err`.
    ///
    /// Idempotent: returns true only for the call that performed the
    /// transition. Later errors are discarded (logged at debug level).
    pub fn cancel(&self, err: Option<TaskError>) -> bool {
        self.inner.token.cancel();
        self.latch(err)
    }

    /// Declares that no further tasks will be spawned, without cancelling
    /// the base token.
    ///
    /// Running tasks keep going until they return on their own; `wait`
    /// cancels the token once they have. Returns true if this was the first
    /// `stop`/`cancel` call.
    pub fn stop(&self) -> bool {
        self.latch(None)
    }

    fn latch(&self, err: Option<TaskError>) -> bool {
        let mut state = self.lock_state();
        if state.stopped {
            if let Some(err) = err {
                tracing::debug!(error = %err, "discarding error latched after stop");
            }
            return false;
        }
        state.stopped = true;
        state.err = err;
        drop(state);
        self.inner.done.cancel();
        true
    }

    /// Waits for `cancel`/`stop`, then for every spawned task to return,
    /// and yields the latched error.
    pub async fn wait(&self) -> Result<(), TaskError> {
        self.inner.done.cancelled().await;
        tracing::debug!("waiting for all tasks to complete");
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        // Covers `stop()`, which latches without cancelling.
        self.inner.token.cancel();

        match self.lock_state().err.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}
