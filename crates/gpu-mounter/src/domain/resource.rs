//! Resource pool model and request types

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use api_types::AddGpuRequest;
use api_types::RemoveGpuRequest;
use k8s_openapi::api::core::v1::Pod;

/// Character device major number of NVIDIA GPU device files.
pub const NVIDIA_MAJOR: u32 = 195;

/// Namespace/name pair identifying a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A character device file as seen from inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceNode {
    pub path: PathBuf,
    pub major: u32,
    pub minor: u32,
}

impl DeviceNode {
    pub fn new(path: impl Into<PathBuf>, major: u32, minor: u32) -> Self {
        Self {
            path: path.into(),
            major,
            minor,
        }
    }

    /// `/dev/nvidia<minor>`
    pub fn nvidia(minor: u32) -> Self {
        Self::new(format!("/dev/nvidia{minor}"), NVIDIA_MAJOR, minor)
    }

    /// Entry for the v1 `devices.allow` / `devices.deny` files.
    pub fn cgroup_rule(&self) -> String {
        format!("c {}:{} rwm", self.major, self.minor)
    }
}

/// One GPU reserved from the pool by a placeholder pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuResource {
    pub uuid: String,
    pub device: DeviceNode,
    /// Placeholder pod holding the device-plugin reservation
    pub placeholder_name: String,
    /// Namespace of the placeholder pod
    pub namespace: String,
}

impl GpuResource {
    pub fn device_file_path(&self) -> &Path {
        &self.device.path
    }
}

impl fmt::Display for GpuResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, held by {}/{})",
            self.uuid,
            self.device.path.display(),
            self.namespace,
            self.placeholder_name
        )
    }
}

/// How GPUs are currently attached to a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum MountMode {
    #[display("unmounted")]
    Unmounted,
    /// All GPUs came from one placeholder requesting the whole count
    #[display("entire")]
    ExclusiveWhole,
    /// Every GPU came from its own single-device placeholder
    #[display("shared")]
    Shared,
}

impl MountMode {
    /// Label value recorded on placeholder pods.
    pub fn label_value(self) -> Option<&'static str> {
        match self {
            Self::Unmounted => None,
            Self::ExclusiveWhole => Some("entire"),
            Self::Shared => Some("shared"),
        }
    }

    pub fn from_label_value(value: &str) -> Option<Self> {
        match value {
            "entire" => Some(Self::ExclusiveWhole),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }
}

/// Kubernetes QoS class, which decides the pod's cgroup parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QosClass {
    Guaranteed,
    #[default]
    Burstable,
    BestEffort,
}

impl QosClass {
    fn parse(value: &str) -> Self {
        match value {
            "Guaranteed" => Self::Guaranteed,
            "BestEffort" => Self::BestEffort,
            _ => Self::Burstable,
        }
    }
}

/// A running container of the target pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub name: String,
    /// Runtime scheme from the status container ID, e.g. `containerd`
    pub runtime: String,
    /// Runtime container ID without the scheme
    pub id: String,
}

impl ContainerRef {
    /// Parses `<runtime>://<id>`.
    pub fn parse(name: &str, container_id: &str) -> Option<Self> {
        let (runtime, id) = container_id.split_once("://")?;
        if runtime.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            runtime: runtime.to_string(),
            id: id.to_string(),
        })
    }
}

/// Snapshot of the target pod taken at the start of a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargetPod {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub node_name: Option<String>,
    pub qos_class: QosClass,
    /// Containers that already have a runtime ID, in status order
    pub containers: Vec<ContainerRef>,
}

impl TargetPod {
    pub fn pod_ref(&self) -> PodRef {
        PodRef::new(&self.namespace, &self.name)
    }

    /// Picks the named container, or the first one when no name is given.
    pub fn container(&self, name: Option<&str>) -> Option<&ContainerRef> {
        match name {
            Some(name) => self.containers.iter().find(|c| c.name == name),
            None => self.containers.first(),
        }
    }
}

impl From<&Pod> for TargetPod {
    fn from(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let containers = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| {
                statuses
                    .iter()
                    .filter_map(|cs| {
                        cs.container_id
                            .as_deref()
                            .and_then(|id| ContainerRef::parse(&cs.name, id))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            uid: pod.metadata.uid.clone().unwrap_or_default(),
            node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
            qos_class: status
                .and_then(|s| s.qos_class.as_deref())
                .map(QosClass::parse)
                .unwrap_or_default(),
            containers,
        }
    }
}

/// Processes inside the target container that hold a device open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pids: Vec<u32>,
}

/// Transient AddGPU request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub pod: PodRef,
    pub gpu_num: u32,
    pub is_entire_mount: bool,
}

impl MountRequest {
    pub fn mode(&self) -> MountMode {
        if self.is_entire_mount {
            MountMode::ExclusiveWhole
        } else {
            MountMode::Shared
        }
    }
}

impl From<AddGpuRequest> for MountRequest {
    fn from(request: AddGpuRequest) -> Self {
        Self {
            pod: PodRef::new(request.namespace, request.pod_name),
            gpu_num: request.gpu_num,
            is_entire_mount: request.is_entire_mount,
        }
    }
}

/// Transient RemoveGPU request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmountRequest {
    pub pod: PodRef,
    pub uuids: Vec<String>,
    pub force: bool,
}

impl From<RemoveGpuRequest> for UnmountRequest {
    fn from(request: RemoveGpuRequest) -> Self {
        Self {
            pod: PodRef::new(request.namespace, request.pod_name),
            uuids: request.uuids,
            force: request.force,
        }
    }
}
