use core::error::Error;

use derive_more::Display;

use super::resource::MountMode;

/// Errors from the pod lookup collaborator.
#[derive(Debug, Display)]
pub enum LookupError {
    #[display("Pod {pod} not found")]
    NotFound { pod: String },
    #[display("Failed to get pod {pod}")]
    QueryFailed { pod: String },
}

impl Error for LookupError {}

/// Errors from placeholder pod CRUD.
#[derive(Debug, Display)]
pub enum PlaceholderError {
    #[display("Failed to create placeholder pod {name}")]
    CreateFailed { name: String },
    /// The node refused to run the placeholder, usually for lack of free GPUs
    #[display("Placeholder pod {name} was rejected: {reason}")]
    Rejected { name: String, reason: String },
    #[display("Failed while waiting for placeholder pod {name}")]
    WaitFailed { name: String },
    #[display("Failed to delete placeholder pod {name}")]
    DeleteFailed { name: String },
    #[display("Failed to list placeholder pods")]
    ListFailed,
}

impl Error for PlaceholderError {}

/// Errors reading which devices the device plugin bound to a pod.
#[derive(Debug, Display)]
pub enum AssignmentError {
    #[display("Failed to read device assignments: {message}")]
    ReadFailed { message: String },
}

impl Error for AssignmentError {}

/// Errors mapping a GPU UUID to its device file.
#[derive(Debug, Display)]
pub enum CatalogError {
    #[display("Unknown GPU {uuid}")]
    UnknownDevice { uuid: String },
}

impl Error for CatalogError {}

/// Errors from mounting, unmounting and occupancy checks inside a container.
#[derive(Debug, Display)]
pub enum DeviceError {
    #[display("No running container {container} in pod {pod}")]
    ContainerNotFound { pod: String, container: String },
    #[display("Container cgroup {path} has no processes")]
    ContainerNotRunning { path: String },
    #[display("Failed to update device cgroup {path}")]
    CgroupFailed { path: String },
    #[display("Failed to update device node {path}")]
    DeviceNodeFailed { path: String },
    #[display("Failed to inspect processes under {path}")]
    ProcFailed { path: String },
    /// The device is held open and removal was not forced
    #[display("Device {path} is in use by {pids:?}")]
    Busy { path: String, pids: Vec<u32> },
    #[display("Failed to kill process {pid}")]
    KillFailed { pid: u32 },
}

impl Error for DeviceError {}

/// Allocator failures.
#[derive(Debug, Display)]
pub enum AllocatorError {
    /// The node cannot host enough placeholders to cover the request
    #[display("Insufficient GPU: requested {requested}")]
    InsufficientGpu { requested: u32 },
    #[display("Failed to create placeholder pods: {message}")]
    FailedCreated { message: String },
    #[display("Placeholder pod {name} was bound to {bound} device(s), expected {expected}")]
    BindingMismatch {
        name: String,
        bound: usize,
        expected: u32,
    },
    #[display("Failed to resolve devices of placeholder pod {name}")]
    DeviceResolution { name: String },
    #[display("Failed to list placeholder pods of {pod}")]
    ListFailed { pod: String },
    #[display("Reservation cancelled")]
    Cancelled,
}

impl Error for AllocatorError {}

/// Internal failures of an AddGPU/RemoveGPU call.
///
/// Domain outcomes (pod not found, insufficient GPU, busy) are never reported
/// through this type.
#[derive(Debug, Display)]
pub enum ServiceError {
    #[display("Invalid request: {message}")]
    InvalidRequest { message: String },
    #[display("Failed to look up target pod")]
    PodLookup,
    #[display("Pod {pod} runs on node {node:?}, this agent serves {local}")]
    PodOnOtherNode {
        pod: String,
        node: Option<String>,
        local: String,
    },
    #[display("Cannot mount {requested} GPUs on a pod in {current} mode")]
    IncompatibleMount {
        current: MountMode,
        requested: MountMode,
    },
    #[display("Failed to allocate GPUs")]
    Allocation,
    #[display("Failed to mount GPU {uuid}")]
    Mount { uuid: String },
    #[display("Failed to resolve GPUs to remove")]
    Resolve,
    #[display("Failed to check processes on GPU {uuid}")]
    Occupancy { uuid: String },
    #[display("Failed to unmount GPU {uuid}")]
    Unmount { uuid: String },
    #[display("Request cancelled")]
    Cancelled,
    #[display("Request task failed")]
    TaskFailed,
}

impl Error for ServiceError {}
