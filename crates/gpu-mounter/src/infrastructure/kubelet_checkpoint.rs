//! Device assignments from the kubelet device-manager checkpoint
//!
//! The kubelet records every device-plugin allocation in
//! `kubelet_internal_checkpoint` before it starts the pod's containers, so a
//! running placeholder always has its entry in the file.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::fs;
use tracing::debug;

use crate::domain::errors::AssignmentError;
use crate::domain::traits::DeviceAssignments;

pub const DEFAULT_CHECKPOINT_PATH: &str =
    "/var/lib/kubelet/device-plugins/kubelet_internal_checkpoint";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
struct KubeletDeviceState {
    data: DeviceStateData,
    checksum: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceStateData {
    pod_device_entries: Option<Vec<PodDeviceEntry>>,
    #[serde(default)]
    registered_devices: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PodDeviceEntry {
    #[serde(rename = "PodUID")]
    pod_uid: String,
    container_name: String,
    resource_name: String,
    #[serde(rename = "DeviceIDs")]
    device_ids: DeviceIds,
    #[serde(rename = "AllocResp", default)]
    alloc_resp: String,
}

/// Kubelets before 1.20 stored a flat list, later ones group by NUMA node
/// (`"-1"` when the plugin reports no topology).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum DeviceIds {
    PerNuma(BTreeMap<String, Vec<String>>),
    Flat(Vec<String>),
}

impl DeviceIds {
    fn iter(&self) -> Box<dyn Iterator<Item = &String> + '_> {
        match self {
            Self::PerNuma(by_node) => Box::new(by_node.values().flatten()),
            Self::Flat(ids) => Box::new(ids.iter()),
        }
    }
}

impl KubeletDeviceState {
    /// Devices of `resource_name` allocated to the pod, in file order.
    fn devices_of(&self, pod_uid: &str, resource_name: &str) -> Vec<String> {
        let mut devices: Vec<String> = Vec::new();
        for entry in self.data.pod_device_entries.iter().flatten() {
            if entry.pod_uid != pod_uid || entry.resource_name != resource_name {
                continue;
            }
            for id in entry.device_ids.iter() {
                if !devices.contains(id) {
                    devices.push(id.clone());
                }
            }
        }
        devices
    }
}

/// Reads assignments from the checkpoint on every call.
pub struct KubeletCheckpoint {
    path: PathBuf,
    resource_name: String,
}

impl KubeletCheckpoint {
    pub fn new(path: impl Into<PathBuf>, resource_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            resource_name: resource_name.into(),
        }
    }

    async fn read(&self) -> Result<KubeletDeviceState, Report<AssignmentError>> {
        let content = fs::read_to_string(&self.path)
            .await
            .change_context(AssignmentError::ReadFailed {
                message: format!("Failed to read checkpoint {}", self.path.display()),
            })?;
        serde_json::from_str(&content).change_context(AssignmentError::ReadFailed {
            message: format!("Failed to parse checkpoint {}", self.path.display()),
        })
    }
}

#[async_trait]
impl DeviceAssignments for KubeletCheckpoint {
    async fn devices_of(&self, pod_uid: &str) -> Result<Vec<String>, Report<AssignmentError>> {
        let state = self.read().await?;
        let devices = state.devices_of(pod_uid, &self.resource_name);
        debug!(pod_uid, ?devices, "Read device assignments");
        Ok(devices)
    }
}
