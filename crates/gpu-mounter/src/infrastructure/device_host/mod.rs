//! Mounting GPUs into running containers on this node
//!
//! A mount whitelists the device in the container's v1 device cgroup and then
//! creates the device file inside the container's mount namespace. Unmounting
//! reverses both steps. Requires host PID namespace and privileges.

pub mod cgroup;
pub mod node;
pub mod occupancy;

use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use cgroup::CgroupDriver;
pub use cgroup::CgroupLocator;

use crate::domain::errors::DeviceError;
use crate::domain::resource::ContainerRef;
use crate::domain::resource::DeviceNode;
use crate::domain::resource::GpuResource;
use crate::domain::resource::ProcessInfo;
use crate::domain::resource::TargetPod;
use crate::domain::traits::ContainerDevices;

pub const DEFAULT_CONTROL_DEVICES: [&str; 3] =
    ["/dev/nvidiactl", "/dev/nvidia-uvm", "/dev/nvidia-uvm-tools"];

/// Looks up control devices on the host, skipping the ones that do not exist.
pub fn resolve_control_devices(paths: &[PathBuf]) -> Vec<DeviceNode> {
    paths
        .iter()
        .filter_map(|path| match node::stat_device(path) {
            Ok(device) => {
                info!(path = %path.display(), major = device.major, minor = device.minor, "Found control device");
                Some(device)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Control device unavailable, skipping");
                None
            }
        })
        .collect()
}

/// [`ContainerDevices`] over cgroupfs and procfs.
pub struct ContainerDeviceHost {
    cgroups: CgroupLocator,
    proc_root: PathBuf,
    control_devices: Vec<DeviceNode>,
    target_container: Option<String>,
}

impl ContainerDeviceHost {
    pub fn new(
        cgroups: CgroupLocator,
        proc_root: impl Into<PathBuf>,
        control_devices: Vec<DeviceNode>,
        target_container: Option<String>,
    ) -> Self {
        Self {
            cgroups,
            proc_root: proc_root.into(),
            control_devices,
            target_container,
        }
    }

    fn container<'a>(&self, target: &'a TargetPod) -> Result<&'a ContainerRef, Report<DeviceError>> {
        target
            .container(self.target_container.as_deref())
            .ok_or_else(|| {
                Report::new(DeviceError::ContainerNotFound {
                    pod: target.pod_ref().to_string(),
                    container: self
                        .target_container
                        .clone()
                        .unwrap_or_else(|| "<first>".to_string()),
                })
            })
    }

    /// Cgroup directory and current PIDs of the target container.
    async fn container_procs(
        &self,
        target: &TargetPod,
    ) -> Result<(PathBuf, Vec<u32>), Report<DeviceError>> {
        let container = self.container(target)?;
        let dir = self.cgroups.container_dir(target, container);
        let pids = cgroup::procs(&dir)
            .await
            .change_context(DeviceError::CgroupFailed {
                path: dir.display().to_string(),
            })?;
        Ok((dir, pids))
    }

    async fn expose(&self, dir: &Path, anchor: u32, device: &DeviceNode) -> Result<(), Report<DeviceError>> {
        cgroup::allow(dir, device)
            .await
            .change_context(DeviceError::CgroupFailed {
                path: dir.display().to_string(),
            })?;
        node::create(&self.proc_root, anchor, device).change_context(
            DeviceError::DeviceNodeFailed {
                path: device.path.display().to_string(),
            },
        )?;
        debug!(device = %device.path.display(), anchor, "Exposed device");
        Ok(())
    }

    async fn holders(
        &self,
        pids: &[u32],
        resource: &GpuResource,
    ) -> Result<Vec<u32>, Report<DeviceError>> {
        occupancy::holders(&self.proc_root, pids, resource.device_file_path())
            .await
            .change_context(DeviceError::ProcFailed {
                path: self.proc_root.display().to_string(),
            })
    }
}

#[async_trait]
impl ContainerDevices for ContainerDeviceHost {
    async fn mount_gpu(
        &self,
        target: &TargetPod,
        resource: &GpuResource,
    ) -> Result<(), Report<DeviceError>> {
        let (dir, pids) = self.container_procs(target).await?;
        let Some(&anchor) = pids.first() else {
            return Err(Report::new(DeviceError::ContainerNotRunning {
                path: dir.display().to_string(),
            }));
        };
        for control in &self.control_devices {
            self.expose(&dir, anchor, control).await?;
        }
        self.expose(&dir, anchor, &resource.device).await
    }

    async fn gpu_processes(
        &self,
        target: &TargetPod,
        resource: &GpuResource,
    ) -> Result<Option<ProcessInfo>, Report<DeviceError>> {
        let (_, pids) = self.container_procs(target).await?;
        let holding = self.holders(&pids, resource).await?;
        Ok((!holding.is_empty()).then_some(ProcessInfo { pids: holding }))
    }

    async fn unmount_gpu(
        &self,
        target: &TargetPod,
        resource: &GpuResource,
        force: bool,
    ) -> Result<(), Report<DeviceError>> {
        let (dir, mut pids) = self.container_procs(target).await?;
        let holding = self.holders(&pids, resource).await?;
        if !holding.is_empty() {
            if !force {
                return Err(Report::new(DeviceError::Busy {
                    path: resource.device_file_path().display().to_string(),
                    pids: holding,
                }));
            }
            for pid in &holding {
                warn!(pid, gpu = %resource, "Killing process holding GPU");
                occupancy::kill(*pid).change_context(DeviceError::KillFailed { pid: *pid })?;
            }
            // the anchor may have been among them
            pids = cgroup::procs(&dir).await.unwrap_or_default();
        }

        if let Some(&anchor) = pids.first() {
            node::remove(&self.proc_root, anchor, &resource.device).change_context(
                DeviceError::DeviceNodeFailed {
                    path: resource.device_file_path().display().to_string(),
                },
            )?;
        }
        match cgroup::deny(&dir, &resource.device).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound || dir.exists() => {
                Err(Report::new(e).change_context(DeviceError::CgroupFailed {
                    path: dir.display().to_string(),
                }))
            }
            _ => Ok(()),
        }
    }
}
