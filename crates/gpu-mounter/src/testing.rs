//! In-memory collaborators for domain tests

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use tokio_util::sync::CancellationToken;

use crate::domain::allocator::GpuAllocator;
use crate::domain::errors::AssignmentError;
use crate::domain::errors::CatalogError;
use crate::domain::errors::DeviceError;
use crate::domain::errors::LookupError;
use crate::domain::errors::PlaceholderError;
use crate::domain::orchestrator::GpuMounter;
use crate::domain::reaper::PlaceholderReaper;
use crate::domain::reaper::ReaperHandle;
use crate::domain::resource::ContainerRef;
use crate::domain::resource::DeviceNode;
use crate::domain::resource::GpuResource;
use crate::domain::resource::MountMode;
use crate::domain::resource::PodRef;
use crate::domain::resource::ProcessInfo;
use crate::domain::resource::QosClass;
use crate::domain::resource::TargetPod;
use crate::domain::traits::ContainerDevices;
use crate::domain::traits::DeviceAssignments;
use crate::domain::traits::DeviceCatalog;
use crate::domain::traits::Placeholder;
use crate::domain::traits::PlaceholderApi;
use crate::domain::traits::PlaceholderSpec;
use crate::domain::traits::PodLookup;

pub const NODE: &str = "node-1";
pub const POOL: &str = "gpu-pool";

/// A running pod on [`NODE`] with a single `main` container.
pub fn target_pod(namespace: &str, name: &str) -> TargetPod {
    TargetPod {
        namespace: namespace.to_string(),
        name: name.to_string(),
        uid: format!("uid-{namespace}-{name}"),
        node_name: Some(NODE.to_string()),
        qos_class: QosClass::Burstable,
        containers: vec![ContainerRef {
            name: "main".to_string(),
            runtime: "containerd".to_string(),
            id: format!("{name}-ctr"),
        }],
    }
}

struct FakePlaceholder {
    placeholder: Placeholder,
    gpu_count: u32,
    bound: Vec<String>,
}

#[derive(Default)]
struct ClusterState {
    devices: Vec<String>,
    live: Vec<FakePlaceholder>,
    created: Vec<PlaceholderSpec>,
    deleted: Vec<String>,
    fail_creates_after: Option<usize>,
    fail_deletes: bool,
}

impl ClusterState {
    fn free_devices(&self) -> Vec<String> {
        self.devices
            .iter()
            .filter(|d| !self.live.iter().any(|p| p.bound.contains(d)))
            .cloned()
            .collect()
    }
}

/// Placeholder pods and device-plugin bindings of one node.
///
/// Binding hands out free devices in order and rejects placeholders that
/// cannot be covered, like the kubelet does.
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new(devices: &[&str]) -> Self {
        Self {
            state: Mutex::new(ClusterState {
                devices: devices.iter().map(|d| d.to_string()).collect(),
                ..Default::default()
            }),
        }
    }

    pub fn insert_placeholder(&self, name: &str) {
        self.insert_placeholder_for(name, &target_pod("ns1", "someone"));
    }

    pub fn insert_placeholder_for(&self, name: &str, owner: &TargetPod) {
        self.state.lock().unwrap().live.push(FakePlaceholder {
            placeholder: Placeholder {
                name: name.to_string(),
                uid: format!("ph-uid-{name}"),
                owner: owner.pod_ref(),
                owner_uid: owner.uid.clone(),
                node_name: owner.node_name.clone(),
                mode: MountMode::Shared,
            },
            gpu_count: 0,
            bound: Vec::new(),
        });
    }

    pub fn fail_creates_after(&self, count: usize) {
        self.state.lock().unwrap().fail_creates_after = Some(count);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().unwrap().fail_deletes = fail;
    }

    pub fn created(&self) -> Vec<String> {
        self.created_specs().into_iter().map(|s| s.name).collect()
    }

    pub fn created_specs(&self) -> Vec<PlaceholderSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn live_placeholders(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .live
            .iter()
            .map(|p| p.placeholder.name.clone())
            .collect()
    }

    pub fn free_devices(&self) -> Vec<String> {
        self.state.lock().unwrap().free_devices()
    }
}

#[async_trait]
impl PlaceholderApi for FakeCluster {
    async fn create(&self, spec: &PlaceholderSpec) -> Result<Placeholder, Report<PlaceholderError>> {
        let mut state = self.state.lock().unwrap();
        if state
            .fail_creates_after
            .is_some_and(|limit| state.created.len() >= limit)
        {
            return Err(Report::new(PlaceholderError::CreateFailed {
                name: spec.name.clone(),
            }));
        }
        let placeholder = Placeholder {
            name: spec.name.clone(),
            uid: format!("ph-uid-{}", spec.name),
            owner: spec.owner.clone(),
            owner_uid: spec.owner_uid.clone(),
            node_name: Some(spec.node_name.clone()),
            mode: spec.mode,
        };
        state.created.push(spec.clone());
        state.live.push(FakePlaceholder {
            placeholder: placeholder.clone(),
            gpu_count: spec.gpu_count,
            bound: Vec::new(),
        });
        Ok(placeholder)
    }

    async fn wait_bound(&self, name: &str) -> Result<Placeholder, Report<PlaceholderError>> {
        let mut state = self.state.lock().unwrap();
        let free = state.free_devices();
        let Some(entry) = state.live.iter_mut().find(|p| p.placeholder.name == name) else {
            return Err(Report::new(PlaceholderError::WaitFailed {
                name: name.to_string(),
            }));
        };
        if entry.bound.is_empty() {
            let needed = entry.gpu_count as usize;
            if free.len() < needed {
                return Err(Report::new(PlaceholderError::Rejected {
                    name: name.to_string(),
                    reason: "UnexpectedAdmissionError".to_string(),
                }));
            }
            entry.bound = free.into_iter().take(needed).collect();
        }
        Ok(entry.placeholder.clone())
    }

    async fn delete(&self, name: &str) -> Result<(), Report<PlaceholderError>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes {
            return Err(Report::new(PlaceholderError::DeleteFailed {
                name: name.to_string(),
            }));
        }
        state.live.retain(|p| p.placeholder.name != name);
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn list_for_owner(
        &self,
        owner_uid: &str,
    ) -> Result<Vec<Placeholder>, Report<PlaceholderError>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .live
            .iter()
            .filter(|p| p.placeholder.owner_uid == owner_uid)
            .map(|p| p.placeholder.clone())
            .collect())
    }

    async fn list_on_node(
        &self,
        node_name: &str,
    ) -> Result<Vec<Placeholder>, Report<PlaceholderError>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .live
            .iter()
            .filter(|p| p.placeholder.node_name.as_deref() == Some(node_name))
            .map(|p| p.placeholder.clone())
            .collect())
    }
}

#[async_trait]
impl DeviceAssignments for FakeCluster {
    async fn devices_of(&self, pod_uid: &str) -> Result<Vec<String>, Report<AssignmentError>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .live
            .iter()
            .find(|p| p.placeholder.uid == pod_uid)
            .map(|p| p.bound.clone())
            .unwrap_or_default())
    }
}

/// Device files numbered by position in the device list.
pub struct FakeCatalog {
    devices: Vec<String>,
}

impl FakeCatalog {
    pub fn new(devices: &[&str]) -> Self {
        Self {
            devices: devices.iter().map(|d| d.to_string()).collect(),
        }
    }
}

impl DeviceCatalog for FakeCatalog {
    fn device_node(&self, uuid: &str) -> Result<DeviceNode, Report<CatalogError>> {
        self.devices
            .iter()
            .position(|d| d == uuid)
            .map(|idx| DeviceNode::nvidia(idx as u32))
            .ok_or_else(|| {
                Report::new(CatalogError::UnknownDevice {
                    uuid: uuid.to_string(),
                })
            })
    }
}

#[derive(Default)]
struct PodsState {
    pods: HashMap<PodRef, TargetPod>,
    fail: bool,
}

#[derive(Default)]
pub struct FakePods {
    state: Mutex<PodsState>,
}

impl FakePods {
    pub fn insert(&self, pod: TargetPod) {
        self.state.lock().unwrap().pods.insert(pod.pod_ref(), pod);
    }

    pub fn insert_on_node(&self, namespace: &str, name: &str, node: &str) {
        let mut pod = target_pod(namespace, name);
        pod.node_name = Some(node.to_string());
        self.insert(pod);
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }
}

#[async_trait]
impl PodLookup for FakePods {
    async fn get_pod(&self, pod: &PodRef) -> Result<TargetPod, Report<LookupError>> {
        let state = self.state.lock().unwrap();
        if state.fail {
            return Err(Report::new(LookupError::QueryFailed {
                pod: pod.to_string(),
            }));
        }
        state.pods.get(pod).cloned().ok_or_else(|| {
            Report::new(LookupError::NotFound {
                pod: pod.to_string(),
            })
        })
    }
}

#[derive(Default)]
struct DevicesState {
    mounted: HashMap<PodRef, Vec<String>>,
    busy: HashMap<String, Vec<u32>>,
    busy_on_unmount: HashSet<String>,
    fail_mount: HashSet<String>,
    fail_unmount: HashSet<String>,
    fail_occupancy: HashSet<String>,
    stall_occupancy: bool,
    cancel_after: Option<(usize, CancellationToken)>,
    mounts: usize,
}

/// Records which GPUs are exposed to which pod.
#[derive(Default)]
pub struct FakeDevices {
    state: Mutex<DevicesState>,
}

impl FakeDevices {
    pub fn mounted(&self, namespace: &str, name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .mounted
            .get(&PodRef::new(namespace, name))
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_mount(&self, uuid: &str) {
        self.state.lock().unwrap().fail_mount.insert(uuid.to_string());
    }

    /// Unmounting `uuid` fails without the device being busy.
    pub fn fail_unmount(&self, uuid: &str) {
        self.state.lock().unwrap().fail_unmount.insert(uuid.to_string());
    }

    /// The occupancy check of `uuid` cannot read the container's processes.
    pub fn fail_occupancy(&self, uuid: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_occupancy
            .insert(uuid.to_string());
    }

    /// Occupancy checks never complete.
    pub fn stall_occupancy(&self) {
        self.state.lock().unwrap().stall_occupancy = true;
    }

    pub fn set_busy(&self, uuid: &str, pids: Vec<u32>) {
        self.state.lock().unwrap().busy.insert(uuid.to_string(), pids);
    }

    /// Occupancy checks pass but the unmount itself reports the device busy.
    pub fn busy_on_unmount(&self, uuid: &str) {
        self.state
            .lock()
            .unwrap()
            .busy_on_unmount
            .insert(uuid.to_string());
    }

    /// Cancels `token` once `count` mounts have succeeded.
    pub fn cancel_after_mounts(&self, count: usize, token: CancellationToken) {
        self.state.lock().unwrap().cancel_after = Some((count, token));
    }
}

#[async_trait]
impl ContainerDevices for FakeDevices {
    async fn mount_gpu(
        &self,
        target: &TargetPod,
        resource: &GpuResource,
    ) -> Result<(), Report<DeviceError>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_mount.contains(&resource.uuid) {
            return Err(Report::new(DeviceError::DeviceNodeFailed {
                path: resource.device_file_path().display().to_string(),
            }));
        }
        let mounted = state.mounted.entry(target.pod_ref()).or_default();
        if !mounted.contains(&resource.uuid) {
            mounted.push(resource.uuid.clone());
        }
        state.mounts += 1;
        if let Some((count, token)) = &state.cancel_after {
            if state.mounts >= *count {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn gpu_processes(
        &self,
        _target: &TargetPod,
        resource: &GpuResource,
    ) -> Result<Option<ProcessInfo>, Report<DeviceError>> {
        {
            let state = self.state.lock().unwrap();
            if state.fail_occupancy.contains(&resource.uuid) {
                return Err(Report::new(DeviceError::ProcFailed {
                    path: "/proc/1/fd".to_string(),
                }));
            }
            if !state.stall_occupancy {
                return Ok(state
                    .busy
                    .get(&resource.uuid)
                    .map(|pids| ProcessInfo { pids: pids.clone() }));
            }
        }
        std::future::pending::<()>().await;
        Ok(None)
    }

    async fn unmount_gpu(
        &self,
        target: &TargetPod,
        resource: &GpuResource,
        force: bool,
    ) -> Result<(), Report<DeviceError>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_unmount.contains(&resource.uuid) {
            return Err(Report::new(DeviceError::CgroupFailed {
                path: "/sys/fs/cgroup/devices/kubepods".to_string(),
            }));
        }
        if force {
            state.busy.remove(&resource.uuid);
            state.busy_on_unmount.remove(&resource.uuid);
        } else if state.busy.contains_key(&resource.uuid)
            || state.busy_on_unmount.contains(&resource.uuid)
        {
            return Err(Report::new(DeviceError::Busy {
                path: resource.device_file_path().display().to_string(),
                pids: state.busy.get(&resource.uuid).cloned().unwrap_or_default(),
            }));
        }
        if let Some(mounted) = state.mounted.get_mut(&target.pod_ref()) {
            mounted.retain(|uuid| uuid != &resource.uuid);
        }
        Ok(())
    }
}

/// Allocator and request handlers wired to the fakes above.
pub struct TestBed {
    pub cluster: Arc<FakeCluster>,
    pub pods: Arc<FakePods>,
    pub devices: Arc<FakeDevices>,
    pub allocator: Arc<GpuAllocator>,
    pub mounter: Arc<GpuMounter>,
    pub reaper_handle: ReaperHandle,
    reaper: tokio::sync::Mutex<PlaceholderReaper>,
}

impl TestBed {
    pub fn new(devices: &[&str]) -> Self {
        let cluster = Arc::new(FakeCluster::new(devices));
        let pods = Arc::new(FakePods::default());
        let fake_devices = Arc::new(FakeDevices::default());
        let (reaper, reaper_handle) = PlaceholderReaper::new(cluster.clone(), POOL);
        let allocator = Arc::new(GpuAllocator::new(
            cluster.clone(),
            cluster.clone(),
            Arc::new(FakeCatalog::new(devices)),
            reaper_handle.clone(),
            POOL,
            Duration::from_secs(5),
        ));
        let mounter = Arc::new(GpuMounter::new(
            pods.clone(),
            allocator.clone(),
            fake_devices.clone(),
            NODE,
        ));
        Self {
            cluster,
            pods,
            devices: fake_devices,
            allocator,
            mounter,
            reaper_handle,
            reaper: tokio::sync::Mutex::new(reaper),
        }
    }

    pub fn with_pod(devices: &[&str], namespace: &str, name: &str) -> Self {
        let bed = Self::new(devices);
        bed.pods.insert(target_pod(namespace, name));
        bed
    }

    /// Deletes everything released so far.
    pub async fn drain_reaper(&self) {
        self.reaper.lock().await.drain_queued().await;
    }
}
