use std::time::Duration;

use super::session::{ProcessSession, Signal};

/// Terminate a worker: graceful signal first, then a forced kill after the
/// grace window if it is still alive. Must leave no orphaned process.
pub async fn terminate_session(session: &mut Box<dyn ProcessSession>, grace_ms: u64) {
    if let Err(e) = session.signal(Signal::Term).await {
        tracing::debug!(error = %e, "graceful termination signal failed");
    }
    tokio::time::sleep(Duration::from_millis(grace_ms)).await;

    match session.try_wait() {
        Ok(Some(outcome)) => {
            tracing::debug!(exit_code = outcome.exit_code, "worker exited within grace window");
        }
        _ => {
            if let Err(e) = session.signal(Signal::Kill).await {
                tracing::warn!(error = %e, "failed to kill worker process");
            }
        }
    }
}
