use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;

use crate::app::Application;
use crate::app::ApplicationServices;
use crate::config::DaemonArgs;
use crate::domain::allocator::GpuAllocator;
use crate::domain::orchestrator::GpuMounter;
use crate::domain::reaper::PlaceholderReaper;
use crate::domain::reconcile::OrphanSweeper;
use crate::domain::traits::ContainerDevices;
use crate::domain::traits::DeviceAssignments;
use crate::domain::traits::DeviceCatalog;
use crate::domain::traits::PlaceholderApi;
use crate::domain::traits::PodLookup;
use crate::infrastructure::device_host::resolve_control_devices;
use crate::infrastructure::device_host::CgroupLocator;
use crate::infrastructure::device_host::ContainerDeviceHost;
use crate::infrastructure::k8s::KubePlaceholderApi;
use crate::infrastructure::k8s::KubePodLookup;
use crate::infrastructure::k8s::PlaceholderConfig;
use crate::infrastructure::kube_client::init_kube_client;
use crate::infrastructure::kubelet_checkpoint::KubeletCheckpoint;
use crate::infrastructure::nvml::init_nvml;
use crate::infrastructure::nvml::NvmlCatalog;

pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");
        let args = &self.daemon_args;

        let catalog = Self::create_device_catalog()?;

        let client = init_kube_client(args.kubeconfig.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize Kubernetes client: {e:?}"))?;
        let placeholders: Arc<dyn PlaceholderApi> = Arc::new(KubePlaceholderApi::new(
            client.clone(),
            PlaceholderConfig {
                namespace: args.pool_namespace.clone(),
                image: args.placeholder_image.clone(),
                resource_name: args.gpu_resource_name.clone(),
            },
        ));
        let pods: Arc<dyn PodLookup> = Arc::new(KubePodLookup::new(client));

        let assignments: Arc<dyn DeviceAssignments> = Arc::new(KubeletCheckpoint::new(
            &args.kubelet_device_state_path,
            args.gpu_resource_name.clone(),
        ));
        let devices = self.create_device_host();

        let (reaper, reaper_handle) =
            PlaceholderReaper::new(Arc::clone(&placeholders), args.pool_namespace.clone());
        let allocator = Arc::new(GpuAllocator::new(
            Arc::clone(&placeholders),
            assignments,
            catalog,
            reaper_handle.clone(),
            args.pool_namespace.clone(),
            args.placeholder_timeout(),
        ));
        let mounter = Arc::new(GpuMounter::new(
            Arc::clone(&pods),
            allocator,
            devices,
            args.node_name.clone(),
        ));
        let sweeper = OrphanSweeper::new(
            placeholders,
            pods,
            reaper_handle.clone(),
            args.node_name.clone(),
        );

        let services = ApplicationServices {
            mounter,
            reaper_handle,
            reaper,
            sweeper,
        };
        Ok(Application::new(services, self.daemon_args))
    }

    fn create_device_catalog() -> Result<Arc<dyn DeviceCatalog>> {
        let nvml = init_nvml().context("Failed to initialize NVML")?;
        let catalog = NvmlCatalog::discover(&nvml).context("Failed to enumerate GPU devices")?;
        if catalog.device_count() == 0 {
            tracing::warn!("No GPU visible on this node, every AddGPU will be insufficient");
        }
        Ok(Arc::new(catalog))
    }

    fn create_device_host(&self) -> Arc<dyn ContainerDevices> {
        let args = &self.daemon_args;
        let control_devices = resolve_control_devices(&args.control_devices);
        Arc::new(ContainerDeviceHost::new(
            CgroupLocator::new(&args.cgroup_root, args.cgroup_driver),
            &args.proc_root,
            control_devices,
            args.target_container.clone(),
        ))
    }
}
