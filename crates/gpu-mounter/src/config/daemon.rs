use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::infrastructure::device_host::CgroupDriver;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "GPU_NODE_NAME",
        help = "Name of the node this agent serves; requests for pods elsewhere are refused"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "GPU_POOL_NAMESPACE",
        default_value = "gpu-pool",
        help = "Namespace holding the placeholder pods"
    )]
    pub pool_namespace: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "0.0.0.0:1200",
        help = "HTTP API server listen address"
    )]
    pub api_listen_addr: String,

    #[arg(
        long,
        env = "GPU_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/logs/metrics.log",
        help = "Path for influx line metrics, e.g. /logs/metrics.log"
    )]
    pub metrics_file: PathBuf,

    #[arg(
        long,
        env = "GPU_RESOURCE_NAME",
        default_value = "nvidia.com/gpu",
        help = "Extended resource requested by placeholder pods"
    )]
    pub gpu_resource_name: String,

    #[arg(
        long,
        env = "PLACEHOLDER_IMAGE",
        default_value = "busybox:stable",
        help = "Image of the placeholder pods"
    )]
    pub placeholder_image: String,

    #[arg(
        long,
        default_value_t = 30,
        value_name = "SECONDS",
        help = "How long a placeholder pod may take to be admitted before the request counts as insufficient"
    )]
    pub placeholder_timeout: u64,

    #[arg(
        long,
        default_value_t = 120,
        value_name = "SECONDS",
        help = "Deadline of a single AddGPU/RemoveGPU request; an expired AddGPU is rolled back"
    )]
    pub request_timeout: u64,

    #[arg(
        long,
        default_value_t = 60,
        value_name = "SECONDS",
        help = "Interval between sweeps for placeholder pods whose owner is gone"
    )]
    pub orphan_sweep_interval: u64,

    #[arg(
        long,
        help = "Kubelet device manager checkpoint holding device plugin allocations",
        default_value = crate::infrastructure::kubelet_checkpoint::DEFAULT_CHECKPOINT_PATH,
        value_hint = clap::ValueHint::FilePath,
    )]
    pub kubelet_device_state_path: PathBuf,

    #[arg(
        long,
        env = "CGROUP_DRIVER",
        value_enum,
        default_value_t = CgroupDriver::Cgroupfs,
        help = "Cgroup driver of the kubelet"
    )]
    pub cgroup_driver: CgroupDriver,

    #[arg(
        long,
        default_value = crate::infrastructure::device_host::cgroup::DEFAULT_DEVICES_ROOT,
        value_hint = clap::ValueHint::DirPath,
        help = "Mount point of the cgroup v1 devices controller"
    )]
    pub cgroup_root: PathBuf,

    #[arg(
        long,
        default_value = "/proc",
        value_hint = clap::ValueHint::DirPath,
        help = "Host procfs; the agent must share the host PID namespace"
    )]
    pub proc_root: PathBuf,

    #[arg(
        long = "control-device",
        default_values = crate::infrastructure::device_host::DEFAULT_CONTROL_DEVICES,
        help = "Device files exposed alongside every GPU"
    )]
    pub control_devices: Vec<PathBuf>,

    #[arg(
        long,
        env = "TARGET_CONTAINER",
        help = "Container receiving the GPUs (defaults to the pod's first container)"
    )]
    pub target_container: Option<String>,
}

impl DaemonArgs {
    pub fn placeholder_timeout(&self) -> Duration {
        Duration::from_secs(self.placeholder_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn orphan_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_sweep_interval.max(1))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::Cli;
    use crate::config::Commands;

    fn parse(args: &[&str]) -> DaemonArgs {
        let cli = Cli::try_parse_from(args).expect("should parse");
        match cli.command {
            Commands::Daemon(args) => *args,
        }
    }

    #[test]
    fn defaults() {
        let args = parse(&["gpu-mounter", "daemon", "--node-name", "node-1"]);

        assert_eq!(args.node_name, "node-1");
        assert_eq!(args.gpu_resource_name, "nvidia.com/gpu");
        assert_eq!(args.placeholder_image, "busybox:stable");
        assert_eq!(args.placeholder_timeout(), Duration::from_secs(30));
        assert_eq!(args.request_timeout(), Duration::from_secs(120));
        assert_eq!(args.cgroup_driver, CgroupDriver::Cgroupfs);
        assert_eq!(args.control_devices.len(), 3);
        assert!(args.target_container.is_none());
    }

    #[test]
    fn overrides() {
        let args = parse(&[
            "gpu-mounter",
            "daemon",
            "--node-name",
            "node-1",
            "--pool-namespace",
            "pool",
            "--cgroup-driver",
            "systemd",
            "--control-device",
            "/dev/nvidiactl",
            "--placeholder-timeout",
            "5",
        ]);

        assert_eq!(args.pool_namespace, "pool");
        assert_eq!(args.cgroup_driver, CgroupDriver::Systemd);
        assert_eq!(args.control_devices, vec![PathBuf::from("/dev/nvidiactl")]);
        assert_eq!(args.placeholder_timeout(), Duration::from_secs(5));
    }
}
