//! GPU pool allocator
//!
//! GPUs are reserved by creating placeholder pods pinned to the target pod's
//! node, each requesting device-plugin GPUs. Once the kubelet admits a
//! placeholder, the devices it was bound to belong to the target pod until the
//! placeholder is deleted.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::errors::AllocatorError;
use super::errors::PlaceholderError;
use super::reaper::ReaperHandle;
use super::resource::GpuResource;
use super::resource::MountMode;
use super::resource::TargetPod;
use super::traits::DeviceAssignments;
use super::traits::DeviceCatalog;
use super::traits::Placeholder;
use super::traits::PlaceholderApi;
use super::traits::PlaceholderSpec;

const NAME_SUFFIX_LEN: usize = 5;

/// `<target>-slave-pod-<5 lowercase alphanumerics>`
pub fn placeholder_name(target_name: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_SUFFIX_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{target_name}-slave-pod-{suffix}")
}

/// Owns the shared GPU pool and its placeholder pods.
pub struct GpuAllocator {
    placeholders: Arc<dyn PlaceholderApi>,
    assignments: Arc<dyn DeviceAssignments>,
    catalog: Arc<dyn DeviceCatalog>,
    reaper: ReaperHandle,
    pool_namespace: String,
    bind_timeout: Duration,
    /// Held across placeholder creation and binding so concurrent requests
    /// cannot oversubscribe the node's devices.
    reservation: Mutex<()>,
}

impl GpuAllocator {
    pub fn new(
        placeholders: Arc<dyn PlaceholderApi>,
        assignments: Arc<dyn DeviceAssignments>,
        catalog: Arc<dyn DeviceCatalog>,
        reaper: ReaperHandle,
        pool_namespace: impl Into<String>,
        bind_timeout: Duration,
    ) -> Self {
        Self {
            placeholders,
            assignments,
            catalog,
            reaper,
            pool_namespace: pool_namespace.into(),
            bind_timeout,
            reservation: Mutex::new(()),
        }
    }

    /// Placeholders currently held on behalf of `target`. Released ones are
    /// skipped even while their pods still exist.
    async fn owned_placeholders(
        &self,
        target: &TargetPod,
    ) -> Result<Vec<Placeholder>, Report<AllocatorError>> {
        let placeholders = self
            .placeholders
            .list_for_owner(&target.uid)
            .await
            .change_context(AllocatorError::ListFailed {
                pod: target.pod_ref().to_string(),
            })?;
        Ok(placeholders
            .into_iter()
            .filter(|p| p.owner_uid == target.uid && !self.reaper.is_released(&p.name))
            .collect())
    }

    /// Derives the pod's mount mode from the placeholders it holds.
    pub async fn mount_mode(&self, target: &TargetPod) -> Result<MountMode, Report<AllocatorError>> {
        let placeholders = self.owned_placeholders(target).await?;
        let mode = if placeholders.is_empty() {
            MountMode::Unmounted
        } else if placeholders
            .iter()
            .any(|p| p.mode == MountMode::ExclusiveWhole)
        {
            MountMode::ExclusiveWhole
        } else {
            MountMode::Shared
        };
        debug!(pod = %target.pod_ref(), %mode, "Resolved mount mode");
        Ok(mode)
    }

    /// Reserves exactly `total` GPUs on the target's node through
    /// `ceil(total / per_placeholder)` placeholders labelled with `mode`.
    ///
    /// Every placeholder created by a failed call is released before returning.
    ///
    /// # Errors
    ///
    /// - [`AllocatorError::InsufficientGpu`] if the node cannot admit enough placeholders
    /// - [`AllocatorError::FailedCreated`] if a placeholder cannot be created
    /// - [`AllocatorError::Cancelled`] if `cancellation_token` fires first
    #[tracing::instrument(skip(self, target, cancellation_token), fields(pod = %target.pod_ref()))]
    pub async fn get_available_gpu(
        &self,
        target: &TargetPod,
        total: u32,
        per_placeholder: u32,
        mode: MountMode,
        cancellation_token: &CancellationToken,
    ) -> Result<Vec<GpuResource>, Report<AllocatorError>> {
        if total == 0 || per_placeholder == 0 {
            return Err(Report::new(AllocatorError::FailedCreated {
                message: format!("invalid GPU count {total} per {per_placeholder}"),
            }));
        }
        let Some(node_name) = target.node_name.clone() else {
            return Err(Report::new(AllocatorError::FailedCreated {
                message: format!("pod {} is not scheduled", target.pod_ref()),
            }));
        };
        let _reservation = tokio::select! {
            guard = self.reservation.lock() => guard,
            _ = cancellation_token.cancelled() => {
                return Err(Report::new(AllocatorError::Cancelled));
            }
        };

        let mut created = Vec::new();
        let result = self
            .reserve(
                target,
                &node_name,
                total,
                per_placeholder,
                mode,
                cancellation_token,
                &mut created,
            )
            .await;

        match result {
            Ok(resources) => {
                info!(
                    count = resources.len(),
                    placeholders = created.len(),
                    "Reserved GPUs"
                );
                Ok(resources)
            }
            Err(e) => {
                warn!(
                    placeholders = ?created,
                    "Reservation failed, releasing placeholders"
                );
                self.delete_slave_pods(created);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn reserve(
        &self,
        target: &TargetPod,
        node_name: &str,
        total: u32,
        per_placeholder: u32,
        mode: MountMode,
        cancellation_token: &CancellationToken,
        created: &mut Vec<String>,
    ) -> Result<Vec<GpuResource>, Report<AllocatorError>> {
        let placeholder_count = total.div_ceil(per_placeholder);
        let mut specs = Vec::with_capacity(placeholder_count as usize);
        let mut remaining = total;
        for _ in 0..placeholder_count {
            let gpu_count = remaining.min(per_placeholder);
            remaining -= gpu_count;
            specs.push(PlaceholderSpec {
                name: placeholder_name(&target.name),
                owner: target.pod_ref(),
                owner_uid: target.uid.clone(),
                node_name: node_name.to_string(),
                gpu_count,
                mode,
            });
        }

        for spec in &specs {
            if cancellation_token.is_cancelled() {
                return Err(Report::new(AllocatorError::Cancelled));
            }
            self.placeholders
                .create(spec)
                .await
                .change_context(AllocatorError::FailedCreated {
                    message: format!("placeholder {}", spec.name),
                })?;
            created.push(spec.name.clone());
            debug!(placeholder = %spec.name, gpus = spec.gpu_count, "Created placeholder pod");
        }

        let mut resources = Vec::with_capacity(total as usize);
        for spec in &specs {
            let placeholder = self.await_bound(spec, cancellation_token).await?;
            let device_ids = self
                .assignments
                .devices_of(&placeholder.uid)
                .await
                .change_context(AllocatorError::DeviceResolution {
                    name: spec.name.clone(),
                })?;
            if device_ids.len() != spec.gpu_count as usize {
                return Err(Report::new(AllocatorError::BindingMismatch {
                    name: spec.name.clone(),
                    bound: device_ids.len(),
                    expected: spec.gpu_count,
                }));
            }
            for uuid in device_ids {
                resources.push(self.resource(uuid, &spec.name)?);
            }
        }

        resources.truncate(total as usize);
        Ok(resources)
    }

    async fn await_bound(
        &self,
        spec: &PlaceholderSpec,
        cancellation_token: &CancellationToken,
    ) -> Result<Placeholder, Report<AllocatorError>> {
        let insufficient = || AllocatorError::InsufficientGpu {
            requested: spec.gpu_count,
        };
        tokio::select! {
            outcome = tokio::time::timeout(self.bind_timeout, self.placeholders.wait_bound(&spec.name)) => {
                match outcome {
                    Ok(Ok(placeholder)) => Ok(placeholder),
                    Ok(Err(e)) => {
                        if matches!(e.current_context(), PlaceholderError::Rejected { .. }) {
                            Err(e.change_context(insufficient()))
                        } else {
                            Err(e.change_context(AllocatorError::FailedCreated {
                                message: format!("placeholder {} never became ready", spec.name),
                            }))
                        }
                    }
                    Err(_) => Err(Report::new(insufficient()).attach_printable(format!(
                        "placeholder {} not bound within {:?}",
                        spec.name, self.bind_timeout
                    ))),
                }
            }
            _ = cancellation_token.cancelled() => Err(Report::new(AllocatorError::Cancelled)),
        }
    }

    fn resource(
        &self,
        uuid: String,
        placeholder_name: &str,
    ) -> Result<GpuResource, Report<AllocatorError>> {
        let device = self
            .catalog
            .device_node(&uuid)
            .change_context(AllocatorError::DeviceResolution {
                name: placeholder_name.to_string(),
            })?;
        Ok(GpuResource {
            uuid,
            device,
            placeholder_name: placeholder_name.to_string(),
            namespace: self.pool_namespace.clone(),
        })
    }

    /// Resolves `uuids` against the GPUs reserved for `target`.
    ///
    /// Unknown UUIDs are skipped, so the result may be empty. Naming any GPU of
    /// a multi-GPU placeholder selects all of its GPUs, since releasing the
    /// placeholder releases them together.
    #[tracing::instrument(skip(self, target), fields(pod = %target.pod_ref()))]
    pub async fn get_remove_gpu(
        &self,
        target: &TargetPod,
        uuids: &[String],
    ) -> Result<Vec<GpuResource>, Report<AllocatorError>> {
        let mut resources = Vec::new();
        for placeholder in self.owned_placeholders(target).await? {
            let device_ids = self
                .assignments
                .devices_of(&placeholder.uid)
                .await
                .change_context(AllocatorError::DeviceResolution {
                    name: placeholder.name.clone(),
                })?;
            let selected = device_ids
                .iter()
                .any(|id| uuids.iter().any(|uuid| uuid.eq_ignore_ascii_case(id)));
            if !selected {
                continue;
            }
            for uuid in device_ids {
                resources.push(self.resource(uuid, &placeholder.name)?);
            }
        }
        Ok(resources)
    }

    /// Hands placeholders to the reaper. Never fails.
    pub fn delete_slave_pods<I>(&self, names: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.reaper.release(names);
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::testing::target_pod;
    use crate::testing::TestBed;

    #[test]
    fn placeholder_name_format() {
        let name = placeholder_name("p1");
        let suffix = name
            .strip_prefix("p1-slave-pod-")
            .expect("should carry the target name");
        assert_eq!(suffix.len(), NAME_SUFFIX_LEN);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test(tokio::test)]
    async fn shared_allocation_uses_one_placeholder_per_gpu() {
        let bed = TestBed::new(&["GPU-a", "GPU-b", "GPU-c"]);
        let target = target_pod("ns1", "p1");

        let resources = bed
            .allocator
            .get_available_gpu(&target, 3, 1, MountMode::Shared, &CancellationToken::new())
            .await
            .expect("should allocate");

        assert_eq!(resources.len(), 3);
        assert_eq!(bed.cluster.created().len(), 3);
        assert!(bed.cluster.created_specs().iter().all(|s| s.gpu_count == 1));
        assert_eq!(
            resources.iter().map(|r| r.uuid.as_str()).collect::<Vec<_>>(),
            vec!["GPU-a", "GPU-b", "GPU-c"]
        );
        assert!(resources.iter().all(|r| r.namespace == "gpu-pool"));
    }

    #[test(tokio::test)]
    async fn entire_allocation_uses_a_single_placeholder() {
        let bed = TestBed::new(&["GPU-a", "GPU-b"]);
        let target = target_pod("ns1", "p1");

        let resources = bed
            .allocator
            .get_available_gpu(&target, 2, 2, MountMode::ExclusiveWhole, &CancellationToken::new())
            .await
            .expect("should allocate");

        assert_eq!(resources.len(), 2);
        let specs = bed.cluster.created_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].gpu_count, 2);
        assert_eq!(specs[0].mode, MountMode::ExclusiveWhole);
        assert_eq!(specs[0].node_name, "node-1");
        assert_eq!(resources[0].placeholder_name, resources[1].placeholder_name);
    }

    #[test(tokio::test)]
    async fn uneven_split_never_over_reserves() {
        let bed = TestBed::new(&["GPU-a", "GPU-b", "GPU-c", "GPU-d"]);
        let target = target_pod("ns1", "p1");

        let resources = bed
            .allocator
            .get_available_gpu(&target, 3, 2, MountMode::ExclusiveWhole, &CancellationToken::new())
            .await
            .expect("should allocate");

        assert_eq!(resources.len(), 3);
        let counts: Vec<u32> = bed
            .cluster
            .created_specs()
            .iter()
            .map(|s| s.gpu_count)
            .collect();
        assert_eq!(counts, vec![2, 1]);
        assert_eq!(bed.cluster.free_devices(), vec!["GPU-d".to_string()]);
    }

    #[test(tokio::test)]
    async fn insufficient_capacity_releases_created_placeholders() {
        let bed = TestBed::new(&["GPU-a"]);
        let target = target_pod("ns1", "p1");

        let err = bed
            .allocator
            .get_available_gpu(&target, 2, 1, MountMode::Shared, &CancellationToken::new())
            .await
            .expect_err("should not fit");

        assert!(matches!(
            err.current_context(),
            AllocatorError::InsufficientGpu { .. }
        ));
        bed.drain_reaper().await;
        assert_eq!(bed.cluster.live_placeholders(), Vec::<String>::new());
    }

    #[test(tokio::test)]
    async fn creation_failure_is_failed_created() {
        let bed = TestBed::new(&["GPU-a", "GPU-b"]);
        bed.cluster.fail_creates_after(1);
        let target = target_pod("ns1", "p1");

        let err = bed
            .allocator
            .get_available_gpu(&target, 2, 1, MountMode::Shared, &CancellationToken::new())
            .await
            .expect_err("second create should fail");

        assert!(matches!(
            err.current_context(),
            AllocatorError::FailedCreated { .. }
        ));
        bed.drain_reaper().await;
        assert_eq!(bed.cluster.live_placeholders(), Vec::<String>::new());
    }

    #[test(tokio::test)]
    async fn cancelled_reservation_creates_nothing() {
        let bed = TestBed::new(&["GPU-a"]);
        let target = target_pod("ns1", "p1");
        let token = CancellationToken::new();
        token.cancel();

        let err = bed
            .allocator
            .get_available_gpu(&target, 1, 1, MountMode::Shared, &token)
            .await
            .expect_err("should be cancelled");

        assert!(matches!(err.current_context(), AllocatorError::Cancelled));
        assert!(bed.cluster.created().is_empty());
    }

    #[test(tokio::test)]
    async fn mount_mode_follows_placeholders() {
        let bed = TestBed::new(&["GPU-a", "GPU-b", "GPU-c"]);
        let target = target_pod("ns1", "p1");
        let other = target_pod("ns1", "p2");
        let token = CancellationToken::new();

        assert_eq!(
            bed.allocator.mount_mode(&target).await.unwrap(),
            MountMode::Unmounted
        );

        bed.allocator
            .get_available_gpu(&target, 2, 1, MountMode::Shared, &token)
            .await
            .expect("should allocate");
        bed.allocator
            .get_available_gpu(&other, 1, 1, MountMode::ExclusiveWhole, &token)
            .await
            .expect("should allocate");

        assert_eq!(
            bed.allocator.mount_mode(&target).await.unwrap(),
            MountMode::Shared
        );
        assert_eq!(
            bed.allocator.mount_mode(&other).await.unwrap(),
            MountMode::ExclusiveWhole
        );
    }

    #[test(tokio::test)]
    async fn released_placeholders_are_no_longer_owned() {
        let bed = TestBed::new(&["GPU-a", "GPU-b"]);
        let target = target_pod("ns1", "p1");
        let resources = bed
            .allocator
            .get_available_gpu(&target, 1, 1, MountMode::Shared, &CancellationToken::new())
            .await
            .expect("should allocate");

        bed.allocator
            .delete_slave_pods(resources.iter().map(|r| r.placeholder_name.clone()));

        // the pod is still listed until the reaper gets to it
        assert_eq!(bed.cluster.live_placeholders().len(), 1);
        assert_eq!(
            bed.allocator.mount_mode(&target).await.unwrap(),
            MountMode::Unmounted
        );
        let resolved = bed
            .allocator
            .get_remove_gpu(&target, &["GPU-a".to_string()])
            .await
            .expect("should resolve");
        assert!(resolved.is_empty());
    }

    #[test(tokio::test)]
    async fn remove_resolution_skips_unknown_uuids() {
        let bed = TestBed::new(&["GPU-a", "GPU-b"]);
        let target = target_pod("ns1", "p1");
        bed.allocator
            .get_available_gpu(&target, 2, 1, MountMode::Shared, &CancellationToken::new())
            .await
            .expect("should allocate");

        let resolved = bed
            .allocator
            .get_remove_gpu(&target, &["gpu-a".to_string(), "does-not-exist".to_string()])
            .await
            .expect("should resolve");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].uuid, "GPU-a");

        let none = bed
            .allocator
            .get_remove_gpu(&target, &["does-not-exist".to_string()])
            .await
            .expect("unknown UUIDs are not an error");
        assert!(none.is_empty());
    }

    #[test(tokio::test)]
    async fn remove_resolution_expands_entire_placeholder() {
        let bed = TestBed::new(&["GPU-a", "GPU-b"]);
        let target = target_pod("ns1", "p1");
        bed.allocator
            .get_available_gpu(&target, 2, 2, MountMode::ExclusiveWhole, &CancellationToken::new())
            .await
            .expect("should allocate");

        let resolved = bed
            .allocator
            .get_remove_gpu(&target, &["GPU-b".to_string()])
            .await
            .expect("should resolve");
        assert_eq!(
            resolved.iter().map(|r| r.uuid.as_str()).collect::<Vec<_>>(),
            vec!["GPU-a", "GPU-b"]
        );
    }

    #[test(tokio::test)]
    async fn remove_resolution_ignores_other_owners() {
        let bed = TestBed::new(&["GPU-a", "GPU-b"]);
        let target = target_pod("ns1", "p1");
        let other = target_pod("ns1", "p2");
        bed.allocator
            .get_available_gpu(&other, 1, 1, MountMode::Shared, &CancellationToken::new())
            .await
            .expect("should allocate");

        let resolved = bed
            .allocator
            .get_remove_gpu(&target, &["GPU-a".to_string()])
            .await
            .expect("should resolve");
        assert!(resolved.is_empty());
    }
}
