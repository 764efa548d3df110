use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Graceful shutdown coordinator for background monitors
///
/// Owns the root cancellation token. Monitors receive child tokens and the
/// coordinator keeps their join handles so shutdown can wait for them.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: Vec<String>,
    pub aborted: Vec<String>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a tracked background task
    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        info!(task = %name, "Starting background task");
        let handle = tokio::spawn(task);
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push((name, handle));
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// Wait until every tracked task has finished on its own
    pub async fn wait(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(task = %name, error = %e, "Background task panicked");
            }
        }
    }

    /// Cancel all monitors and wait up to `grace` for them; stragglers are aborted
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        info!("Initiating graceful shutdown of background monitors...");
        self.token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        let deadline = tokio::time::Instant::now() + grace;
        let mut report = ShutdownReport::default();

        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => report.completed.push(name),
                Err(_) => {
                    warn!(task = %name, "Task did not stop within grace period; aborting");
                    handle.abort();
                    report.aborted.push(name);
                }
            }
        }

        info!(completed = report.completed.len(), aborted = report.aborted.len(), "Shutdown complete");
        report
    }

    /// Cancel everything on Ctrl-C
    pub fn cancel_on_ctrl_c(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; cancelling monitors");
                token.cancel();
            }
        });
    }
}
