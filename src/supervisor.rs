//! Runs the long-lived loops side by side and tears them all down as soon as
//! one of them stops.

use anyhow::anyhow;
use std::future::Future;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type TaskResult = (&'static str, anyhow::Result<()>);

pub(crate) struct Supervisor {
    cancel: CancellationToken,
    tasks: JoinSet<TaskResult>,
}

impl Supervisor {
    pub(crate) fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Token every supervised task must stop on.
    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        info!(task = name, "Starting task");
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Waits until `shutdown` resolves or any task ends, then cancels the rest
    /// and waits for them. Returns the first failure, if any.
    pub(crate) async fn wait<S>(mut self, shutdown: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()>,
    {
        let mut failure = None;

        tokio::select! {
            _ = shutdown => info!("Shutdown requested, stopping tasks"),
            Some(joined) = self.tasks.join_next() => {
                failure = task_failure(joined);
                info!("A task stopped, stopping the others");
            }
        }

        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Some(err) = task_failure(joined) {
                failure.get_or_insert(err);
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn task_failure(joined: Result<TaskResult, JoinError>) -> Option<anyhow::Error> {
    match joined {
        Ok((name, Ok(()))) => {
            info!(task = name, "Task finished");
            None
        }
        Ok((name, Err(e))) => {
            error!(task = name, error = %e, "Task failed");
            Some(e.context(format!("{name} failed")))
        }
        Err(e) if e.is_panic() => {
            error!(error = %e, "Task panicked");
            Some(anyhow!("task panicked: {e}"))
        }
        Err(e) => {
            warn!(error = %e, "Task was cancelled");
            None
        }
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
