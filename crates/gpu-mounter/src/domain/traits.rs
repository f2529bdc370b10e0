//! Collaborator seams of the orchestrator and allocator

use async_trait::async_trait;
use error_stack::Report;

use super::errors::AssignmentError;
use super::errors::CatalogError;
use super::errors::DeviceError;
use super::errors::LookupError;
use super::errors::PlaceholderError;
use super::resource::DeviceNode;
use super::resource::GpuResource;
use super::resource::MountMode;
use super::resource::PodRef;
use super::resource::ProcessInfo;
use super::resource::TargetPod;

/// What the allocator asks the cluster to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderSpec {
    pub name: String,
    pub owner: PodRef,
    pub owner_uid: String,
    pub node_name: String,
    pub gpu_count: u32,
    pub mode: MountMode,
}

/// A placeholder pod as it exists in the pool namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub name: String,
    pub uid: String,
    pub owner: PodRef,
    pub owner_uid: String,
    pub node_name: Option<String>,
    pub mode: MountMode,
}

/// Fetches the current state of a pod. Never cached.
#[async_trait]
pub trait PodLookup: Send + Sync {
    async fn get_pod(&self, pod: &PodRef) -> Result<TargetPod, Report<LookupError>>;
}

/// Placeholder pod CRUD in the pool namespace.
#[async_trait]
pub trait PlaceholderApi: Send + Sync {
    async fn create(&self, spec: &PlaceholderSpec) -> Result<Placeholder, Report<PlaceholderError>>;

    /// Resolves once the placeholder is running with its devices bound.
    ///
    /// Returns [`PlaceholderError::Rejected`] when the node refuses it.
    /// Does not time out on its own.
    async fn wait_bound(&self, name: &str) -> Result<Placeholder, Report<PlaceholderError>>;

    /// Deleting a placeholder that no longer exists succeeds.
    async fn delete(&self, name: &str) -> Result<(), Report<PlaceholderError>>;

    async fn list_for_owner(
        &self,
        owner_uid: &str,
    ) -> Result<Vec<Placeholder>, Report<PlaceholderError>>;

    async fn list_on_node(&self, node_name: &str)
        -> Result<Vec<Placeholder>, Report<PlaceholderError>>;
}

/// Device IDs the device plugin bound to a pod, in allocation order.
#[async_trait]
pub trait DeviceAssignments: Send + Sync {
    async fn devices_of(&self, pod_uid: &str) -> Result<Vec<String>, Report<AssignmentError>>;
}

/// Maps GPU UUIDs to device files.
pub trait DeviceCatalog: Send + Sync {
    fn device_node(&self, uuid: &str) -> Result<DeviceNode, Report<CatalogError>>;
}

/// Mount executor, occupancy checker and unmount executor for one node.
#[async_trait]
pub trait ContainerDevices: Send + Sync {
    /// Exposes the device inside the target container and whitelists it in
    /// the container's device cgroup. Mounting an already mounted device succeeds.
    async fn mount_gpu(
        &self,
        target: &TargetPod,
        resource: &GpuResource,
    ) -> Result<(), Report<DeviceError>>;

    /// Returns `None` when no process in the target container holds the device.
    async fn gpu_processes(
        &self,
        target: &TargetPod,
        resource: &GpuResource,
    ) -> Result<Option<ProcessInfo>, Report<DeviceError>>;

    /// Reverses [`ContainerDevices::mount_gpu`].
    ///
    /// Fails with [`DeviceError::Busy`] when the device is held open and
    /// `force` is false; with `force` the holders are killed first.
    async fn unmount_gpu(
        &self,
        target: &TargetPod,
        resource: &GpuResource,
        force: bool,
    ) -> Result<(), Report<DeviceError>>;
}
