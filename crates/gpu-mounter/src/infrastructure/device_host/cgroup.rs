//! cgroup v1 `devices` controller access for pod containers

use std::io;
use std::path::Path;
use std::path::PathBuf;

use tokio::fs;

use crate::domain::resource::ContainerRef;
use crate::domain::resource::DeviceNode;
use crate::domain::resource::QosClass;
use crate::domain::resource::TargetPod;

pub const DEFAULT_DEVICES_ROOT: &str = "/sys/fs/cgroup/devices";

/// How the kubelet names pod and container cgroups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CgroupDriver {
    Cgroupfs,
    Systemd,
}

/// Computes container cgroup directories under the devices hierarchy.
#[derive(Debug, Clone)]
pub struct CgroupLocator {
    root: PathBuf,
    driver: CgroupDriver,
}

impl CgroupLocator {
    pub fn new(root: impl Into<PathBuf>, driver: CgroupDriver) -> Self {
        Self {
            root: root.into(),
            driver,
        }
    }

    pub fn container_dir(&self, target: &TargetPod, container: &ContainerRef) -> PathBuf {
        match self.driver {
            CgroupDriver::Cgroupfs => self.cgroupfs_dir(target, container),
            CgroupDriver::Systemd => self.systemd_dir(target, container),
        }
    }

    /// `kubepods/<qos>/pod<uid>/<container id>`
    fn cgroupfs_dir(&self, target: &TargetPod, container: &ContainerRef) -> PathBuf {
        let mut dir = self.root.join("kubepods");
        match target.qos_class {
            QosClass::Guaranteed => {}
            QosClass::Burstable => dir.push("burstable"),
            QosClass::BestEffort => dir.push("besteffort"),
        }
        dir.join(format!("pod{}", target.uid)).join(&container.id)
    }

    /// `kubepods.slice/kubepods-<qos>.slice/kubepods-<qos>-pod<uid>.slice/<runtime>-<id>.scope`
    fn systemd_dir(&self, target: &TargetPod, container: &ContainerRef) -> PathBuf {
        let uid = target.uid.replace('-', "_");
        let mut dir = self.root.join("kubepods.slice");
        let pod_slice = match target.qos_class {
            QosClass::Guaranteed => format!("kubepods-pod{uid}.slice"),
            QosClass::Burstable => {
                dir.push("kubepods-burstable.slice");
                format!("kubepods-burstable-pod{uid}.slice")
            }
            QosClass::BestEffort => {
                dir.push("kubepods-besteffort.slice");
                format!("kubepods-besteffort-pod{uid}.slice")
            }
        };
        let scope_prefix = match container.runtime.as_str() {
            "containerd" => "cri-containerd",
            "cri-o" => "crio",
            other => other,
        };
        dir.join(pod_slice)
            .join(format!("{scope_prefix}-{}.scope", container.id))
    }
}

pub async fn allow(dir: &Path, node: &DeviceNode) -> io::Result<()> {
    fs::write(dir.join("devices.allow"), node.cgroup_rule()).await
}

pub async fn deny(dir: &Path, node: &DeviceNode) -> io::Result<()> {
    fs::write(dir.join("devices.deny"), node.cgroup_rule()).await
}

/// PIDs in the cgroup, in the order the kernel lists them.
pub async fn procs(dir: &Path) -> io::Result<Vec<u32>> {
    let content = fs::read_to_string(dir.join("cgroup.procs")).await?;
    Ok(content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testing::target_pod;

    fn pod(qos_class: QosClass) -> TargetPod {
        let mut pod = target_pod("ns1", "p1");
        pod.uid = "1a2b-3c4d".to_string();
        pod.qos_class = qos_class;
        pod
    }

    fn container(runtime: &str) -> ContainerRef {
        ContainerRef {
            name: "main".to_string(),
            runtime: runtime.to_string(),
            id: "abc".to_string(),
        }
    }

    #[test]
    fn cgroupfs_layout() {
        let locator = CgroupLocator::new("/cg", CgroupDriver::Cgroupfs);
        assert_eq!(
            locator.container_dir(&pod(QosClass::Burstable), &container("docker")),
            PathBuf::from("/cg/kubepods/burstable/pod1a2b-3c4d/abc")
        );
        assert_eq!(
            locator.container_dir(&pod(QosClass::Guaranteed), &container("docker")),
            PathBuf::from("/cg/kubepods/pod1a2b-3c4d/abc")
        );
    }

    #[test]
    fn systemd_layout() {
        let locator = CgroupLocator::new("/cg", CgroupDriver::Systemd);
        assert_eq!(
            locator.container_dir(&pod(QosClass::BestEffort), &container("containerd")),
            PathBuf::from(
                "/cg/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod1a2b_3c4d.slice/cri-containerd-abc.scope"
            )
        );
        assert_eq!(
            locator.container_dir(&pod(QosClass::Guaranteed), &container("cri-o")),
            PathBuf::from("/cg/kubepods.slice/kubepods-pod1a2b_3c4d.slice/crio-abc.scope")
        );
    }

    #[tokio::test]
    async fn writes_rules_and_reads_procs() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        std::fs::write(dir.path().join("cgroup.procs"), "42\n7\n\n").expect("should write procs");

        allow(dir.path(), &DeviceNode::nvidia(2))
            .await
            .expect("should allow");
        deny(dir.path(), &DeviceNode::nvidia(3))
            .await
            .expect("should deny");

        assert_eq!(
            std::fs::read_to_string(dir.path().join("devices.allow")).unwrap(),
            "c 195:2 rwm"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("devices.deny")).unwrap(),
            "c 195:3 rwm"
        );
        assert_eq!(procs(dir.path()).await.unwrap(), vec![42, 7]);
    }
}
