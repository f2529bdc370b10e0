use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiServer;
use crate::api::ApiState;
use crate::app::services::ApplicationServices;
use crate::config::DaemonArgs;
use crate::domain::reaper::PlaceholderReaper;
use crate::domain::reconcile::OrphanSweeper;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Starts and stops the background tasks.
///
/// The reaper has its own token and is stopped last, so placeholders released
/// by requests that finish during shutdown are still deleted.
pub struct Tasks {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    reaper_task: Option<JoinHandle<()>>,
    cancellation_token: CancellationToken,
    reaper_token: CancellationToken,
    api_shutdown: Option<oneshot::Sender<()>>,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            reaper_task: None,
            cancellation_token: CancellationToken::new(),
            reaper_token: CancellationToken::new(),
            api_shutdown: None,
        }
    }

    pub fn spawn_all_tasks(&mut self, services: ApplicationServices, args: &DaemonArgs) {
        self.reaper_task = Some(self.spawn_reaper_task(services.reaper));

        let sweeper_task = self.spawn_sweeper_task(services.sweeper, args.orphan_sweep_interval());
        self.tasks.push(("orphan sweeper", sweeper_task));

        let state = Arc::new(ApiState {
            mounter: services.mounter,
            reaper: services.reaper_handle,
            request_timeout: args.request_timeout(),
            node_name: args.node_name.clone(),
            pool_namespace: args.pool_namespace.clone(),
        });
        let api_task = self.spawn_api_server_task(state, args.api_listen_addr.clone());
        self.tasks.push(("API server", api_task));
    }

    /// Waits for SIGTERM/SIGINT or for a task to stop on its own, then shuts
    /// everything down. A task stopping on its own is an error.
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let stopped = tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                None
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                None
            }
            (result, index, _) = futures::future::select_all(self.tasks.iter_mut().map(|(_, task)| task)) => {
                Some((index, result.err()))
            }
        };
        let stopped = stopped.map(|(index, error)| {
            let (name, _) = self.tasks.remove(index);
            if let Some(e) = error {
                tracing::error!("{name} task failed: {e}");
            }
            name
        });

        self.shutdown().await;

        match stopped {
            Some(name) => Err(anyhow::anyhow!("{name} task stopped unexpectedly")),
            None => Ok(()),
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("Shutdown signal received, cancelling all tasks");
        if let Some(tx) = self.api_shutdown.take() {
            // the server may already be gone
            let _ = tx.send(());
        }
        self.cancellation_token.cancel();
        Self::join_with_timeout(std::mem::take(&mut self.tasks)).await;

        self.reaper_token.cancel();
        if let Some(reaper) = self.reaper_task.take() {
            Self::join_with_timeout(vec![("placeholder reaper", reaper)]).await;
        }
    }

    async fn join_with_timeout(tasks: Vec<(&'static str, JoinHandle<()>)>) {
        tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            for (name, task) in tasks {
                if let Err(e) = task.await {
                    tracing::error!("{name} task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
        });
    }

    fn spawn_reaper_task(&self, reaper: PlaceholderReaper) -> JoinHandle<()> {
        let token = self.reaper_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting placeholder reaper task");
            reaper.run(token).await;
            tracing::info!("Placeholder reaper task completed");
        })
    }

    fn spawn_sweeper_task(&self, sweeper: OrphanSweeper, interval: Duration) -> JoinHandle<()> {
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting orphan sweeper task");
            sweeper.run(interval, token).await;
            tracing::info!("Orphan sweeper task completed");
        })
    }

    fn spawn_api_server_task(&mut self, state: Arc<ApiState>, listen_addr: String) -> JoinHandle<()> {
        let (tx, rx) = oneshot::channel();
        self.api_shutdown = Some(tx);
        let api_server = ApiServer::new(state, listen_addr);
        tokio::spawn(async move {
            if let Err(e) = api_server.run(rx).await {
                tracing::error!("API server failed: {e:?}");
            } else {
                tracing::info!("API server completed");
            }
        })
    }
}
