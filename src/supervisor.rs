//! Task supervision.
//!
//! Every long-running task is wrapped here: a fault (error return or
//! panic) restarts it with exponential backoff, but three faults within
//! sixty seconds mean something is structurally wrong and the process
//! should die loudly rather than flap forever.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::net::Backoff;

const FAULT_WINDOW: Duration = Duration::from_secs(60);
const MAX_FAULTS_IN_WINDOW: usize = 3;

/// Run `task` until it completes cleanly or the token fires; restart on
/// fault. Escalates (returns `Err`) after repeated faults.
pub async fn supervise<F, Fut>(
    name: &'static str,
    cancel: CancellationToken,
    mut task: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let mut faults: VecDeque<Instant> = VecDeque::new();
    let mut backoff = Backoff::default();

    loop {
        let mut handle = tokio::spawn(task());
        let fault = tokio::select! {
            _ = cancel.cancelled() => {
                // Let the task observe the token and finish on its own.
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("{name} ended with error during shutdown: {e:#}"),
                    Err(e) => warn!("{name} join error during shutdown: {e}"),
                }
                return Ok(());
            }
            joined = &mut handle => match joined {
                Ok(Ok(())) => {
                    info!("{name} finished");
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(e) if e.is_panic() => anyhow::anyhow!("{name} panicked"),
                Err(_) => return Ok(()),
            }
        };

        let now = Instant::now();
        faults.push_back(now);
        while let Some(front) = faults.front() {
            if now.duration_since(*front) > FAULT_WINDOW {
                faults.pop_front();
            } else {
                break;
            }
        }
        if faults.len() >= MAX_FAULTS_IN_WINDOW {
            error!("{name} faulted {} times within {FAULT_WINDOW:?}, escalating", faults.len());
            anyhow::bail!("{name} keeps faulting; giving up");
        }

        let delay = backoff.next_delay();
        warn!("{name} faulted: {fault:#}; restarting in {delay:?}");
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
