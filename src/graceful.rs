//! # Zero-downtime restart orchestration.
//!
//! [`Graceful`] wires listener acquisition, serving, and the restart signal
//! into one lifecycle:
//!
//! ```text
//!        cold start                      restart child
//!   ┌────────────────┐             ┌──────────────────────┐
//!   │ listen() binds │             │ inherit fds 3..3+N   │
//!   └───────┬────────┘             └──────────┬───────────┘
//!           ▼                                 ▼
//!       serve(listeners, env)          serve(listeners, env)
//!           │                                 │
//!        SIGHUP ──► re-exec self with fds ──► write ready byte
//!           │        (old generation keeps    │
//!           ▼         serving on failure)     ▼
//!       env.cancel(None), drain          env.wait()
//! ```
//!
//! On SIGHUP the current process re-executes its own binary with the same
//! arguments, handing every listener descriptor to the child renumbered from
//! 3. The parent shuts down only after the child writes one byte on an
//! inherited pipe to declare its serve stage up; if the child exits first,
//! the parent logs the failure and keeps serving. Listening sockets are
//! never closed across the handoff, so no connection attempt is refused.
//!
//! Re-exec is a capability behind the [`Restarter`] trait; the default
//! [`OsRestarter`] does the real fork/exec dance on unix, and tests plug in
//! fakes.

use std::future::Future;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::env::Environment;
use crate::error::{SetupError, TaskError};
use crate::global;
use crate::listener::{Listener, FD_COUNT_ENV, READY_FD_ENV, RESTART_ENV};

#[cfg(unix)]
use crate::listener::{activated_listeners, inherited_listeners, listener_fds, INHERIT_FDS_START};

/// Raw OS descriptor number handed across a restart.
pub type Descriptor = i32;

/// Capability to replace the current process with a successor.
#[async_trait]
pub trait Restarter: Send + Sync + 'static {
    /// Whether re-exec is possible at all on this platform/build.
    fn can_reexec(&self) -> bool;

    /// Launches the successor with the given listener descriptors and
    /// resolves once it has signaled readiness. An error means the
    /// successor never became ready; the caller keeps serving.
    async fn reexec(&self, fds: &[Descriptor]) -> Result<(), SetupError>;
}

/// Restart generation of this process: 0 for a cold start, incremented by
/// each successful handoff.
pub fn generation() -> u64 {
    parse_generation(std::env::var(RESTART_ENV).ok().as_deref())
}

fn parse_generation(raw: Option<&str>) -> u64 {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

/// Runs a serve stage under restart management.
///
/// `listen` produces fresh listeners and is only invoked on a cold start
/// without socket activation; restart children inherit their listeners
/// instead. `serve` receives the listeners exactly once and wires them into
/// servers running on the Environment.
pub struct Graceful<L, S> {
    listen: L,
    serve: S,
    env: Option<Environment>,
    restarter: Arc<dyn Restarter>,
}

impl<L, Fut, S> Graceful<L, S>
where
    L: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<Listener>, SetupError>> + Send,
    S: FnOnce(Vec<Listener>, &Environment) -> Result<(), SetupError>,
{
    pub fn new(listen: L, serve: S) -> Self {
        Self {
            listen,
            serve,
            env: None,
            restarter: default_restarter(),
        }
    }

    /// Runs under `env` instead of the process-wide default.
    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    /// Replaces the re-exec capability. Mostly for tests.
    pub fn with_restarter(mut self, restarter: Arc<dyn Restarter>) -> Self {
        self.restarter = restarter;
        self
    }

    /// Acquires listeners, starts the serve stage, arms the restart signal,
    /// signals readiness to a waiting predecessor, and blocks until the
    /// Environment drains.
    pub async fn run(self) -> Result<(), TaskError> {
        let env = match self.env {
            Some(env) => env,
            None => global::global().clone(),
        };

        // Setup failures latch through the Environment so sibling tasks
        // (and the signal watcher) wind down before run() reports them.
        let abort = |env: &Environment, err: TaskError| {
            env.cancel(Some(err));
        };

        let listeners = match acquire_listeners(self.listen).await {
            Ok(listeners) => listeners,
            Err(err) => {
                abort(&env, err.into());
                return env.wait().await;
            }
        };

        #[cfg(unix)]
        let fds = match listener_fds(&listeners) {
            Ok(fds) => fds,
            Err(err) => {
                abort(&env, err.into());
                return env.wait().await;
            }
        };
        #[cfg(not(unix))]
        let fds: Vec<Descriptor> = Vec::new();

        if let Err(err) = (self.serve)(listeners, &env) {
            abort(&env, err.into());
            return env.wait().await;
        }

        install_restart_watcher(&env, self.restarter, fds);

        if let Err(err) = notify_ready() {
            abort(&env, err);
        }

        env.wait().await
    }
}

async fn acquire_listeners<L, Fut>(listen: L) -> Result<Vec<Listener>, SetupError>
where
    L: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<Listener>, SetupError>>,
{
    #[cfg(unix)]
    {
        if let Some(listeners) = activated_listeners()? {
            tracing::info!(count = listeners.len(), "using socket-activated listeners");
            return Ok(listeners);
        }
        if let Some(listeners) = inherited_listeners()? {
            tracing::info!(
                count = listeners.len(),
                generation = generation(),
                "inherited listeners from predecessor"
            );
            return Ok(listeners);
        }
    }
    listen().await
}

/// Arms the restart trigger: SIGHUP events flow into a channel consumed by
/// [`watch_restarts`]. On platforms without SIGHUP the watcher simply never
/// fires.
fn install_restart_watcher(env: &Environment, restarter: Arc<dyn Restarter>, fds: Vec<Descriptor>) {
    let watch_env = env.clone();
    env.spawn(move |ctx| async move {
        let (tx, rx) = mpsc::channel::<()>(1);
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sighup = signal(SignalKind::hangup()).map_err(TaskError::from)?;
            let forward_ctx = ctx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = forward_ctx.cancelled() => break,
                        received = sighup.recv() => {
                            if received.is_none() || tx.send(()).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
        #[cfg(not(unix))]
        drop(tx);

        watch_restarts(ctx, watch_env, restarter, fds, rx).await;
        Ok(())
    });
}

/// Consumes restart triggers until the context is cancelled.
///
/// A failed restart attempt never takes the current generation down: the
/// error is logged and the loop keeps listening for the next trigger.
async fn watch_restarts(
    ctx: CancellationToken,
    env: Environment,
    restarter: Arc<dyn Restarter>,
    fds: Vec<Descriptor>,
    mut trigger: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return,
            received = trigger.recv() => {
                if received.is_none() {
                    return;
                }
                if !restarter.can_reexec() {
                    tracing::warn!("restart requested but re-exec is unavailable, ignoring");
                    continue;
                }
                tracing::info!(generation = generation(), "restart requested, launching successor");
                match restarter.reexec(&fds).await {
                    Ok(()) => {
                        tracing::info!("successor ready, shutting down this generation");
                        env.cancel(None);
                        return;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "restart failed, continuing to serve");
                    }
                }
            }
        }
    }
}

/// If this process is a restart child, writes the ready byte on the
/// inherited pipe so the predecessor can shut down. No-op on cold starts.
fn notify_ready() -> Result<(), TaskError> {
    #[cfg(unix)]
    {
        let fd = match std::env::var(READY_FD_ENV) {
            Ok(raw) => match raw.trim().parse::<i32>() {
                Ok(fd) => fd,
                Err(_) => {
                    return Err(TaskError::fail(format!("malformed {READY_FD_ENV}: {raw}")));
                }
            },
            Err(_) => return Ok(()),
        };
        std::env::remove_var(READY_FD_ENV);

        use std::io::Write;
        use std::os::unix::io::FromRawFd;
        // Closing the File closes the write end, which is what lets the
        // predecessor detect an early child exit via EOF.
        let mut pipe = unsafe { std::fs::File::from_raw_fd(fd) };
        pipe.write_all(&[1]).map_err(TaskError::from)?;
        tracing::info!(generation = generation(), "signaled readiness to predecessor");
    }
    Ok(())
}

fn default_restarter() -> Arc<dyn Restarter> {
    #[cfg(unix)]
    {
        Arc::new(OsRestarter)
    }
    #[cfg(not(unix))]
    {
        Arc::new(UnsupportedRestarter)
    }
}

/// Re-executes the current binary with identical arguments, handing listener
/// descriptors renumbered from 3 and a readiness pipe.
#[cfg(unix)]
pub struct OsRestarter;

#[cfg(unix)]
#[async_trait]
impl Restarter for OsRestarter {
    fn can_reexec(&self) -> bool {
        std::env::current_exe().is_ok()
    }

    async fn reexec(&self, fds: &[Descriptor]) -> Result<(), SetupError> {
        use std::os::unix::io::AsRawFd;

        use nix::fcntl::{fcntl, FcntlArg, OFlag};
        use nix::unistd::{close, dup2, pipe2};

        let reexec = |source: io::Error| SetupError::Reexec { source };

        let exe = std::env::current_exe().map_err(reexec)?;
        let (ready_read, ready_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| reexec(e.into()))?;

        // Duplicate everything we hand off to descriptor numbers above the
        // target range 3..=3+N, so the child-side renumbering cannot clobber
        // a source before it is copied.
        let min_fd = fds.len() as i32 + 4;
        let mut dups: Vec<Descriptor> = Vec::with_capacity(fds.len() + 1);
        let mut dup_all = || -> nix::Result<Descriptor> {
            for fd in fds {
                dups.push(fcntl(*fd, FcntlArg::F_DUPFD_CLOEXEC(min_fd))?);
            }
            fcntl(ready_write.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(min_fd))
        };
        let ready_dup = match dup_all() {
            Ok(fd) => fd,
            Err(err) => {
                for fd in &dups {
                    let _ = close(*fd);
                }
                return Err(reexec(err.into()));
            }
        };

        let count = fds.len();
        let ready_target = INHERIT_FDS_START + count as i32;
        let mut command = tokio::process::Command::new(exe);
        command
            .args(std::env::args_os().skip(1))
            .env(RESTART_ENV, (generation() + 1).to_string())
            .env(FD_COUNT_ENV, count.to_string())
            .env(READY_FD_ENV, ready_target.to_string());

        let child_dups = dups.clone();
        unsafe {
            command.pre_exec(move || {
                // Runs in the child after fork. dup2 clears close-on-exec on
                // the target, so exactly these copies survive the exec.
                for (i, fd) in child_dups.iter().enumerate() {
                    dup2(*fd, INHERIT_FDS_START + i as i32).map_err(io::Error::from)?;
                }
                dup2(ready_dup, ready_target).map_err(io::Error::from)?;
                Ok(())
            });
        }

        let spawned = command.spawn();
        for fd in dups.iter().chain(std::iter::once(&ready_dup)) {
            let _ = close(*fd);
        }
        drop(ready_write);
        let mut child = spawned.map_err(reexec)?;

        // One byte on the pipe means the successor's serve stage is up.
        // EOF means it exited (or closed the pipe) without getting there.
        let read_ready = tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut pipe = std::fs::File::from(ready_read);
            let mut byte = [0u8; 1];
            pipe.read_exact(&mut byte)
        });

        match read_ready.await {
            Ok(Ok(())) => Ok(()),
            _ => {
                let status = child.wait().await.map_err(reexec)?;
                tracing::error!(%status, "successor exited before readiness");
                Err(SetupError::NotReady)
            }
        }
    }
}

#[cfg(not(unix))]
struct UnsupportedRestarter;

#[cfg(not(unix))]
#[async_trait]
impl Restarter for UnsupportedRestarter {
    fn can_reexec(&self) -> bool {
        false
    }

    async fn reexec(&self, _fds: &[Descriptor]) -> Result<(), SetupError> {
        Err(SetupError::Reexec {
            source: io::Error::new(io::ErrorKind::Unsupported, "re-exec not supported here"),
        })
    }
}
