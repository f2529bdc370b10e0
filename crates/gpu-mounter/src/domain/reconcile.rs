//! Periodic release of placeholders whose owner pod is gone
//!
//! A placeholder outlives its owner when the owner is deleted while GPUs are
//! mounted, or when the agent restarts in the middle of a request. The sweeper
//! finds those on this node and hands them to the reaper, together with
//! released placeholders whose deletion failed.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::errors::LookupError;
use super::errors::PlaceholderError;
use super::reaper::ReaperHandle;
use super::traits::Placeholder;
use super::traits::PlaceholderApi;
use super::traits::PodLookup;

pub struct OrphanSweeper {
    placeholders: Arc<dyn PlaceholderApi>,
    pods: Arc<dyn PodLookup>,
    reaper: ReaperHandle,
    node_name: String,
}

impl OrphanSweeper {
    pub fn new(
        placeholders: Arc<dyn PlaceholderApi>,
        pods: Arc<dyn PodLookup>,
        reaper: ReaperHandle,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            placeholders,
            pods,
            reaper,
            node_name: node_name.into(),
        }
    }

    /// Whether the placeholder's owner no longer exists. A pod recreated under
    /// the same name counts as gone.
    async fn is_orphan(&self, placeholder: &Placeholder) -> bool {
        if placeholder.owner.name.is_empty() {
            warn!(placeholder = %placeholder.name, "Placeholder pod has no owner, skipping");
            return false;
        }
        match self.pods.get_pod(&placeholder.owner).await {
            Ok(owner) => owner.uid != placeholder.owner_uid,
            Err(e) if matches!(e.current_context(), LookupError::NotFound { .. }) => true,
            Err(e) => {
                warn!(
                    placeholder = %placeholder.name,
                    owner = %placeholder.owner,
                    error = ?e,
                    "Failed to look up placeholder owner, skipping"
                );
                false
            }
        }
    }

    /// Releases every orphaned placeholder on this node, retries failed
    /// releases, and returns how many were handed to the reaper.
    pub async fn sweep_once(&self) -> Result<usize, Report<PlaceholderError>> {
        let placeholders = self.placeholders.list_on_node(&self.node_name).await?;
        let failed = self.reaper.failed_releases();
        self.reaper
            .forget_failed(|name| placeholders.iter().any(|p| p.name == name));

        let mut orphans = Vec::new();
        for placeholder in placeholders {
            if failed.contains(&placeholder.name) {
                info!(placeholder = %placeholder.name, "Retrying release of placeholder pod");
                orphans.push(placeholder.name);
            } else if self.reaper.is_released(&placeholder.name) {
                debug!(placeholder = %placeholder.name, "Placeholder pod already queued for release");
            } else if self.is_orphan(&placeholder).await {
                info!(
                    placeholder = %placeholder.name,
                    owner = %placeholder.owner,
                    "Releasing orphaned placeholder pod"
                );
                orphans.push(placeholder.name);
            }
        }
        let count = orphans.len();
        self.reaper.release(orphans);
        Ok(count)
    }

    pub async fn run(self, interval: Duration, cancellation_token: CancellationToken) {
        info!(node = %self.node_name, ?interval, "Orphan sweeper started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => match self.sweep_once().await {
                    Ok(0) => debug!("No orphaned placeholder pods"),
                    Ok(count) => info!(count, "Released orphaned placeholder pods"),
                    Err(e) => warn!(error = ?e, "Orphan sweep failed"),
                },
                _ = cancellation_token.cancelled() => break,
            }
        }
        info!("Orphan sweeper stopped");
    }
}
