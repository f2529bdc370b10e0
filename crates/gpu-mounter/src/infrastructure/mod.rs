pub mod device_host;
pub mod k8s;
pub mod kube_client;
pub mod kubelet_checkpoint;
pub mod nvml;
