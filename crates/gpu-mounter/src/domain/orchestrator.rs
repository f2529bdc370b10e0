//! AddGPU / RemoveGPU request handling
//!
//! A request resolves the target pod, reserves or resolves GPUs through the
//! [`GpuAllocator`] and drives the [`ContainerDevices`] executors one device at
//! a time. A failed AddGPU is rolled back completely; a RemoveGPU batch is
//! refused as a whole when any device is busy.

use std::sync::Arc;

use api_types::AddGpuResult;
use api_types::RemoveGpuResult;
use error_stack::Report;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::allocator::GpuAllocator;
use super::compat::can_mount;
use super::errors::AllocatorError;
use super::errors::DeviceError;
use super::errors::LookupError;
use super::errors::ServiceError;
use super::resource::GpuResource;
use super::resource::MountRequest;
use super::resource::PodRef;
use super::resource::TargetPod;
use super::resource::UnmountRequest;
use super::traits::ContainerDevices;
use super::traits::PodLookup;
use crate::util::keyed_lock::KeyedAsyncLock;

/// Request handlers of the service.
pub struct GpuMounter {
    pods: Arc<dyn PodLookup>,
    allocator: Arc<GpuAllocator>,
    devices: Arc<dyn ContainerDevices>,
    node_name: String,
    /// Serializes requests against the same pod.
    pod_locks: KeyedAsyncLock<PodRef>,
}

impl GpuMounter {
    pub fn new(
        pods: Arc<dyn PodLookup>,
        allocator: Arc<GpuAllocator>,
        devices: Arc<dyn ContainerDevices>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            pods,
            allocator,
            devices,
            node_name: node_name.into(),
            pod_locks: KeyedAsyncLock::new(),
        }
    }

    /// Looks up the target pod. `Ok(None)` means it does not exist.
    async fn resolve_target(
        &self,
        pod: &PodRef,
    ) -> Result<Option<TargetPod>, Report<ServiceError>> {
        match self.pods.get_pod(pod).await {
            Ok(target) => {
                if target.node_name.as_deref() != Some(self.node_name.as_str()) {
                    return Err(Report::new(ServiceError::PodOnOtherNode {
                        pod: pod.to_string(),
                        node: target.node_name.clone(),
                        local: self.node_name.clone(),
                    }));
                }
                Ok(Some(target))
            }
            Err(e) if matches!(e.current_context(), LookupError::NotFound { .. }) => {
                error!(pod = %pod, "No such pod");
                Ok(None)
            }
            Err(e) => Err(e.change_context(ServiceError::PodLookup)),
        }
    }

    /// Attaches `request.gpu_num` GPUs to the target pod.
    ///
    /// Either every GPU is mounted or, on failure or cancellation, the pod is
    /// left with the devices it had before the call and every placeholder
    /// created for the request is released.
    #[tracing::instrument(skip(self, cancellation_token), fields(pod = %request.pod))]
    pub async fn add_gpu(
        &self,
        request: &MountRequest,
        cancellation_token: &CancellationToken,
    ) -> Result<AddGpuResult, Report<ServiceError>> {
        info!(
            gpu_num = request.gpu_num,
            entire = request.is_entire_mount,
            "AddGPU called"
        );
        if request.gpu_num == 0 {
            return Err(Report::new(ServiceError::InvalidRequest {
                message: "gpu_num must be positive".to_string(),
            }));
        }

        let _pod_guard = tokio::select! {
            guard = self.pod_locks.lock(&request.pod) => guard,
            _ = cancellation_token.cancelled() => return Err(Report::new(ServiceError::Cancelled)),
        };

        let Some(target) = self.resolve_target(&request.pod).await? else {
            return Ok(AddGpuResult::PodNotFound);
        };

        let current = self
            .allocator
            .mount_mode(&target)
            .await
            .change_context(ServiceError::Allocation)?;
        if !can_mount(current, request) {
            return Err(Report::new(ServiceError::IncompatibleMount {
                current,
                requested: request.mode(),
            }));
        }

        let per_placeholder = if request.is_entire_mount {
            request.gpu_num
        } else {
            1
        };
        let resources = match self
            .allocator
            .get_available_gpu(
                &target,
                request.gpu_num,
                per_placeholder,
                request.mode(),
                cancellation_token,
            )
            .await
        {
            Ok(resources) => resources,
            Err(e) if matches!(e.current_context(), AllocatorError::InsufficientGpu { .. }) => {
                error!(error = ?e, "Insufficient GPU");
                return Ok(AddGpuResult::InsufficientGpu);
            }
            Err(e) if matches!(e.current_context(), AllocatorError::Cancelled) => {
                return Err(e.change_context(ServiceError::Cancelled));
            }
            Err(e) => return Err(e.change_context(ServiceError::Allocation)),
        };

        for (idx, resource) in resources.iter().enumerate() {
            info!(
                total = resources.len(),
                current = idx + 1,
                gpu = %resource,
                "Mounting GPU"
            );
            let outcome = tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => None,
                result = self.devices.mount_gpu(&target, resource) => Some(result),
            };
            match outcome {
                Some(Ok(())) => info!(gpu = %resource, "Mounted GPU"),
                Some(Err(e)) => {
                    error!(gpu = %resource, error = ?e, "Failed to mount GPU, rolling back");
                    self.rollback(&target, &resources, idx + 1).await;
                    return Err(e.change_context(ServiceError::Mount {
                        uuid: resource.uuid.clone(),
                    }));
                }
                None => {
                    warn!(gpu = %resource, "Request cancelled while mounting, rolling back");
                    self.rollback(&target, &resources, idx + 1).await;
                    return Err(Report::new(ServiceError::Cancelled));
                }
            }
        }

        info!(count = resources.len(), "Mounted all GPUs");
        Ok(AddGpuResult::Success)
    }

    /// Unmounts the first `attempted` resources in reverse order and releases
    /// the placeholders of the whole batch, including never attempted ones.
    async fn rollback(&self, target: &TargetPod, resources: &[GpuResource], attempted: usize) {
        for resource in resources[..attempted].iter().rev() {
            if let Err(e) = self.devices.unmount_gpu(target, resource, true).await {
                error!(gpu = %resource, error = ?e, "Failed to unmount GPU during rollback");
            }
        }
        self.allocator
            .delete_slave_pods(resources.iter().map(|r| r.placeholder_name.clone()));
    }

    /// Detaches the GPUs named in `request.uuids` from the target pod.
    ///
    /// Without `force`, nothing is unmounted when any GPU of the batch is in use.
    #[tracing::instrument(skip(self, cancellation_token), fields(pod = %request.pod))]
    pub async fn remove_gpu(
        &self,
        request: &UnmountRequest,
        cancellation_token: &CancellationToken,
    ) -> Result<RemoveGpuResult, Report<ServiceError>> {
        info!(uuids = ?request.uuids, force = request.force, "RemoveGPU called");

        let _pod_guard = tokio::select! {
            guard = self.pod_locks.lock(&request.pod) => guard,
            _ = cancellation_token.cancelled() => return Err(Report::new(ServiceError::Cancelled)),
        };

        let Some(target) = self.resolve_target(&request.pod).await? else {
            return Ok(RemoveGpuResult::PodNotFound);
        };

        let resources = tokio::select! {
            resources = self.allocator.get_remove_gpu(&target, &request.uuids) => {
                resources.change_context(ServiceError::Resolve)?
            }
            _ = cancellation_token.cancelled() => return Err(Report::new(ServiceError::Cancelled)),
        };
        if resources.is_empty() {
            error!(uuids = ?request.uuids, "Invalid UUIDs");
            return Ok(RemoveGpuResult::GpuNotFound);
        }

        for resource in &resources {
            let processes = tokio::select! {
                processes = self.devices.gpu_processes(&target, resource) => {
                    processes.change_context(ServiceError::Occupancy {
                        uuid: resource.uuid.clone(),
                    })?
                }
                _ = cancellation_token.cancelled() => return Err(Report::new(ServiceError::Cancelled)),
            };
            if let Some(processes) = processes {
                if !request.force {
                    info!(gpu = %resource, pids = ?processes.pids, "GPU is busy");
                    return Ok(RemoveGpuResult::GpuBusy);
                }
                warn!(gpu = %resource, pids = ?processes.pids, "GPU is busy, forcing removal");
            }
        }

        if cancellation_token.is_cancelled() {
            return Err(Report::new(ServiceError::Cancelled));
        }

        for resource in &resources {
            match self
                .devices
                .unmount_gpu(&target, resource, request.force)
                .await
            {
                Ok(()) => info!(gpu = %resource, "Unmounted GPU"),
                Err(e) if matches!(e.current_context(), DeviceError::Busy { .. }) => {
                    warn!(gpu = %resource, error = ?e, "GPU became busy before unmount");
                    return Ok(RemoveGpuResult::GpuBusy);
                }
                Err(e) => {
                    return Err(e.change_context(ServiceError::Unmount {
                        uuid: resource.uuid.clone(),
                    }));
                }
            }
        }

        self.allocator
            .delete_slave_pods(resources.iter().map(|r| r.placeholder_name.clone()));
        Ok(RemoveGpuResult::Success)
    }
}
