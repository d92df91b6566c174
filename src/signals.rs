//! # Termination-signal handling.
//!
//! Every [`Environment`](crate::Environment) installs one watcher that turns
//! the first interrupt/terminate signal into a cancellation with the
//! [`TaskError::Signaled`] sentinel, optionally after a configurable delay.
//!
//! ## Signals
//! **Unix:** SIGINT and SIGTERM. **Other platforms:** Ctrl-C via
//! [`tokio::signal::ctrl_c`].
//!
//! The restart signal (SIGHUP) is handled separately by
//! [`Graceful`](crate::Graceful); it never reaches this watcher.
//!
//! ## Stop delay
//! `GRACESERVE_STOP_DELAY` holds an integer number of seconds to sleep
//! between receiving the signal and cancelling the Environment, giving load
//! balancers time to deregister the instance. Unset or malformed values fall
//! back to the default of 5 seconds; negative values clamp to zero.

use std::io;
use std::time::Duration;

use crate::env::Environment;
use crate::error::TaskError;

/// Environment variable holding the stop delay in seconds.
pub const STOP_DELAY_ENV: &str = "GRACESERVE_STOP_DELAY";

const DEFAULT_STOP_DELAY: Duration = Duration::from_secs(5);

/// Spawns the watcher for `env`. Called once from `Environment::new`.
///
/// The watcher exits as soon as the Environment's context is cancelled.
pub(crate) fn install(env: Environment) {
    let ctx = env.context();
    tokio::spawn(async move {
        tokio::select! {
            _ = ctx.cancelled() => {}
            received = wait_for_termination() => match received {
                Ok(name) => {
                    let delay = stop_delay();
                    tracing::warn!(signal = name, delay_secs = delay.as_secs(), "got signal");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    env.cancel(Some(TaskError::Signaled));
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to register signal handlers");
                }
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_termination() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Reads the stop delay from [`STOP_DELAY_ENV`].
pub fn stop_delay() -> Duration {
    parse_stop_delay(std::env::var(STOP_DELAY_ENV).ok().as_deref())
}

fn parse_stop_delay(raw: Option<&str>) -> Duration {
    match raw {
        None => DEFAULT_STOP_DELAY,
        Some(raw) => match raw.trim().parse::<i64>() {
            Ok(secs) if secs < 0 => Duration::ZERO,
            Ok(secs) => Duration::from_secs(secs as u64),
            Err(_) => DEFAULT_STOP_DELAY,
        },
    }
}
