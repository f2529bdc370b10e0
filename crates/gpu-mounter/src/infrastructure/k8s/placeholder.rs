//! Placeholder pods in the GPU pool namespace
//!
//! A placeholder is pinned to the target's node with `spec.nodeName`, so it
//! skips the scheduler and the kubelet admits or rejects it directly against
//! the node's free device-plugin GPUs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::ObjectMeta;
use kube::api::PostParams;
use kube::runtime::wait::await_condition;
use kube::Api;
use kube::Client;
use tracing::debug;

use super::types::is_not_found;
use crate::domain::errors::PlaceholderError;
use crate::domain::resource::MountMode;
use crate::domain::resource::PodRef;
use crate::domain::traits::Placeholder;
use crate::domain::traits::PlaceholderApi;
use crate::domain::traits::PlaceholderSpec;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER: &str = "gpu-mounter";
pub const OWNER_UID_LABEL: &str = "gpu-mounter.io/owner-uid";
pub const MOUNT_MODE_LABEL: &str = "gpu-mounter.io/mount-mode";
// pod names can exceed the 63 character label limit
pub const OWNER_NAMESPACE_ANNOTATION: &str = "gpu-mounter.io/owner-namespace";
pub const OWNER_NAME_ANNOTATION: &str = "gpu-mounter.io/owner-name";

const HOLDER_CONTAINER: &str = "gpu-holder";

/// How placeholder pods are built.
#[derive(Debug, Clone)]
pub struct PlaceholderConfig {
    pub namespace: String,
    pub image: String,
    pub resource_name: String,
}

/// Where a placeholder stands with the kubelet.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    Pending,
    Bound,
    Rejected(String),
}

fn binding_state(pod: &Pod) -> Binding {
    let Some(status) = pod.status.as_ref() else {
        return Binding::Pending;
    };
    match status.phase.as_deref() {
        Some("Running") => return Binding::Bound,
        Some("Failed") | Some("Succeeded") => {
            let reason = status
                .reason
                .clone()
                .or_else(|| status.phase.clone())
                .unwrap_or_default();
            return Binding::Rejected(reason);
        }
        _ => {}
    }
    let unschedulable = status.conditions.iter().flatten().find(|c| {
        c.type_ == "PodScheduled" && c.status == "False" && c.reason.as_deref() == Some("Unschedulable")
    });
    match unschedulable {
        Some(condition) => Binding::Rejected(
            condition
                .message
                .clone()
                .unwrap_or_else(|| "Unschedulable".to_string()),
        ),
        None => Binding::Pending,
    }
}

/// Placeholders of the listed pods, skipping pods already being deleted.
fn live_placeholders(pods: &[Pod]) -> Vec<Placeholder> {
    pods.iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .map(placeholder_from_pod)
        .collect()
}

fn placeholder_from_pod(pod: &Pod) -> Placeholder {
    let meta = &pod.metadata;
    let label = |key: &str| meta.labels.as_ref().and_then(|l| l.get(key)).cloned();
    let annotation = |key: &str| {
        meta.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .cloned()
            .unwrap_or_default()
    };
    Placeholder {
        name: meta.name.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        owner: PodRef::new(
            annotation(OWNER_NAMESPACE_ANNOTATION),
            annotation(OWNER_NAME_ANNOTATION),
        ),
        owner_uid: label(OWNER_UID_LABEL).unwrap_or_default(),
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        mode: label(MOUNT_MODE_LABEL)
            .as_deref()
            .and_then(MountMode::from_label_value)
            .unwrap_or(MountMode::Shared),
    }
}

fn build_pod(config: &PlaceholderConfig, spec: &PlaceholderSpec) -> Pod {
    let mut labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGER.to_string()),
        (OWNER_UID_LABEL.to_string(), spec.owner_uid.clone()),
    ]);
    if let Some(mode) = spec.mode.label_value() {
        labels.insert(MOUNT_MODE_LABEL.to_string(), mode.to_string());
    }
    let annotations = BTreeMap::from([
        (
            OWNER_NAMESPACE_ANNOTATION.to_string(),
            spec.owner.namespace.clone(),
        ),
        (OWNER_NAME_ANNOTATION.to_string(), spec.owner.name.clone()),
    ]);
    let limits = BTreeMap::from([(
        config.resource_name.clone(),
        Quantity(spec.gpu_count.to_string()),
    )]);

    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(spec.node_name.clone()),
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(0),
            // GPU nodes are commonly tainted
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: HOLDER_CONTAINER.to_string(),
                image: Some(config.image.clone()),
                command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                resources: Some(ResourceRequirements {
                    limits: Some(limits),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGER}")
}

/// Placeholder CRUD against the API server.
#[derive(Clone)]
pub struct KubePlaceholderApi {
    api: Api<Pod>,
    config: PlaceholderConfig,
}

impl KubePlaceholderApi {
    pub fn new(client: Client, config: PlaceholderConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            config,
        }
    }

    async fn list(&self, params: &ListParams) -> Result<Vec<Placeholder>, Report<PlaceholderError>> {
        let pods = self
            .api
            .list(params)
            .await
            .change_context(PlaceholderError::ListFailed)?;
        Ok(live_placeholders(&pods.items))
    }
}

#[async_trait]
impl PlaceholderApi for KubePlaceholderApi {
    async fn create(&self, spec: &PlaceholderSpec) -> Result<Placeholder, Report<PlaceholderError>> {
        let pod = self
            .api
            .create(&PostParams::default(), &build_pod(&self.config, spec))
            .await
            .change_context(PlaceholderError::CreateFailed {
                name: spec.name.clone(),
            })?;
        Ok(placeholder_from_pod(&pod))
    }

    async fn wait_bound(&self, name: &str) -> Result<Placeholder, Report<PlaceholderError>> {
        let settled = |pod: Option<&Pod>| pod.map_or(true, |p| binding_state(p) != Binding::Pending);
        let pod = await_condition(self.api.clone(), name, settled)
            .await
            .change_context(PlaceholderError::WaitFailed {
                name: name.to_string(),
            })?;
        let Some(pod) = pod else {
            return Err(Report::new(PlaceholderError::WaitFailed {
                name: name.to_string(),
            })
            .attach_printable("placeholder pod was deleted"));
        };
        match binding_state(&pod) {
            Binding::Bound => {
                debug!(placeholder = %name, "Placeholder pod is running");
                Ok(placeholder_from_pod(&pod))
            }
            Binding::Rejected(reason) => Err(Report::new(PlaceholderError::Rejected {
                name: name.to_string(),
                reason,
            })),
            Binding::Pending => Err(Report::new(PlaceholderError::WaitFailed {
                name: name.to_string(),
            })),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), Report<PlaceholderError>> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match self.api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Report::new(PlaceholderError::DeleteFailed {
                name: name.to_string(),
            })
            .attach_printable(format!("Kubernetes API error: {e}"))),
        }
    }

    async fn list_for_owner(
        &self,
        owner_uid: &str,
    ) -> Result<Vec<Placeholder>, Report<PlaceholderError>> {
        let selector = format!("{},{OWNER_UID_LABEL}={owner_uid}", managed_selector());
        self.list(&ListParams::default().labels(&selector)).await
    }

    async fn list_on_node(
        &self,
        node_name: &str,
    ) -> Result<Vec<Placeholder>, Report<PlaceholderError>> {
        let params = ListParams::default()
            .labels(&managed_selector())
            .fields(&format!("spec.nodeName={node_name}"));
        self.list(&params).await
    }
}
