//! Fire-and-forget placeholder cleanup
//!
//! Requests hand placeholder names to a [`ReaperHandle`] and move on; the
//! [`PlaceholderReaper`] task deletes them in the background. A failed deletion
//! leaves a dangling reservation behind, which is reported through the
//! counters, an error log and a line on the `metrics` target, never to the
//! request that released it.
//!
//! A released name stays in the handle's ledger until its deletion succeeds,
//! so requests stop treating it as owned the moment it is released.

use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use api_types::ReaperStats;
use dashmap::DashMap;
use influxdb_line_protocol::LineProtocolBuilder;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use utils::logging::METRICS_TARGET;

use super::traits::PlaceholderApi;

#[derive(Debug, Default)]
struct Counters {
    released: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ReaperStats {
        ReaperStats {
            released: self.released.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Queued,
    Failed,
}

type Ledger = Arc<DashMap<String, Release>>;

/// Sending side of the reaper. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ReaperHandle {
    tx: mpsc::UnboundedSender<String>,
    counters: Arc<Counters>,
    ledger: Ledger,
}

impl ReaperHandle {
    /// Queues placeholders for deletion, skipping duplicate names.
    pub fn release<I>(&self, names: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name.clone()) {
                continue;
            }
            self.ledger.insert(name.clone(), Release::Queued);
            if self.tx.send(name.clone()).is_err() {
                // reaper already stopped
                self.ledger.insert(name.clone(), Release::Failed);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(placeholder = %name, "Placeholder reaper is gone, placeholder left behind");
            }
        }
    }

    /// Whether `name` was released and its pod may still exist.
    pub fn is_released(&self, name: &str) -> bool {
        self.ledger.contains_key(name)
    }

    /// Released placeholders whose deletion failed.
    pub fn failed_releases(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .ledger
            .iter()
            .filter(|entry| *entry.value() == Release::Failed)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Drops failed releases for which `still_exists` is false.
    pub fn forget_failed(&self, still_exists: impl Fn(&str) -> bool) {
        self.ledger
            .retain(|name, release| *release == Release::Queued || still_exists(name.as_str()));
    }

    pub fn stats(&self) -> ReaperStats {
        self.counters.snapshot()
    }
}

/// Background task deleting released placeholders once each.
pub struct PlaceholderReaper {
    api: Arc<dyn PlaceholderApi>,
    namespace: String,
    rx: mpsc::UnboundedReceiver<String>,
    counters: Arc<Counters>,
    ledger: Ledger,
}

impl PlaceholderReaper {
    pub fn new(api: Arc<dyn PlaceholderApi>, namespace: impl Into<String>) -> (Self, ReaperHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let ledger: Ledger = Arc::new(DashMap::new());
        let handle = ReaperHandle {
            tx,
            counters: Arc::clone(&counters),
            ledger: Arc::clone(&ledger),
        };
        (
            Self {
                api,
                namespace: namespace.into(),
                rx,
                counters,
                ledger,
            },
            handle,
        )
    }

    /// Runs until every handle is dropped, or until cancelled. Names already
    /// queued at cancellation are still processed.
    pub async fn run(mut self, cancellation_token: CancellationToken) {
        info!(namespace = %self.namespace, "Placeholder reaper started");
        loop {
            tokio::select! {
                name = self.rx.recv() => match name {
                    Some(name) => self.reap(&name).await,
                    None => break,
                },
                _ = cancellation_token.cancelled() => {
                    self.rx.close();
                    self.drain_queued().await;
                    break;
                }
            }
        }
        info!("Placeholder reaper stopped");
    }

    /// Deletes every name queued so far without waiting for more.
    pub(crate) async fn drain_queued(&mut self) {
        while let Ok(name) = self.rx.try_recv() {
            self.reap(&name).await;
        }
    }

    async fn reap(&self, name: &str) {
        let success = match self.api.delete(name).await {
            Ok(()) => {
                self.ledger.remove(name);
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                info!(placeholder = %name, namespace = %self.namespace, "Released placeholder pod");
                true
            }
            Err(e) => {
                self.ledger.insert(name.to_string(), Release::Failed);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    placeholder = %name,
                    namespace = %self.namespace,
                    error = ?e,
                    "Failed to release placeholder pod, GPU reservation is dangling"
                );
                false
            }
        };
        let line = release_metric(&self.namespace, name, success);
        tracing::info!(target: METRICS_TARGET, msg = %line);
    }
}

fn release_metric(namespace: &str, name: &str, success: bool) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default();
    let line = LineProtocolBuilder::new()
        .measurement("gpu_mounter_placeholder_release")
        .tag("namespace", namespace)
        .tag("placeholder", name)
        .field("success", success)
        .timestamp(timestamp)
        .close_line()
        .build();
    String::from_utf8_lossy(&line).trim_end().to_string()
}
