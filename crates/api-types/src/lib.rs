//! Shared API type definitions
//!
//! Request and response bodies of the gpu-mounter HTTP API. Result enums carry
//! the domain outcome of a call; transport level failures are reported with
//! [`ErrorResponse`] and a non-2xx status instead.

use serde::Deserialize;
use serde::Serialize;

/// Request to attach GPUs to a running pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddGpuRequest {
    /// Namespace of the target pod
    pub namespace: String,
    /// Name of the target pod
    pub pod_name: String,
    /// Number of GPUs to attach
    pub gpu_num: u32,
    /// Reserve all GPUs through a single placeholder instead of one per GPU
    #[serde(default)]
    pub is_entire_mount: bool,
}

/// Domain outcome of an AddGPU call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddGpuResult {
    Success,
    PodNotFound,
    #[serde(rename = "InsufficientGPU")]
    InsufficientGpu,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddGpuResponse {
    pub add_gpu_result: AddGpuResult,
}

/// Request to detach GPUs from a running pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveGpuRequest {
    /// Namespace of the target pod
    pub namespace: String,
    /// Name of the target pod
    pub pod_name: String,
    /// UUIDs of the GPUs to detach
    pub uuids: Vec<String>,
    /// Kill processes still holding a device instead of refusing the removal
    #[serde(default)]
    pub force: bool,
}

/// Domain outcome of a RemoveGPU call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoveGpuResult {
    Success,
    PodNotFound,
    #[serde(rename = "GPUNotFound")]
    GpuNotFound,
    #[serde(rename = "GPUBusy")]
    GpuBusy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveGpuResponse {
    pub remove_gpu_result: RemoveGpuResult,
}

/// Body returned together with a 5xx status when a call fails internally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

/// Placeholder cleanup counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaperStats {
    /// Placeholders deleted successfully
    pub released: u64,
    /// Placeholder deletions that failed and were left behind
    pub failed: u64,
}

/// Response of the status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub node_name: String,
    pub pool_namespace: String,
    pub reaper: ReaperStats,
}
