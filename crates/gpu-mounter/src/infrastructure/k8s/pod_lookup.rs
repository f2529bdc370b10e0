use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::Client;

use super::types::is_not_found;
use crate::domain::errors::LookupError;
use crate::domain::resource::PodRef;
use crate::domain::resource::TargetPod;
use crate::domain::traits::PodLookup;

/// Reads pods straight from the API server.
#[derive(Clone)]
pub struct KubePodLookup {
    client: Client,
}

impl KubePodLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodLookup for KubePodLookup {
    async fn get_pod(&self, pod: &PodRef) -> Result<TargetPod, Report<LookupError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        match api.get(&pod.name).await {
            Ok(found) => Ok(TargetPod::from(&found)),
            Err(e) if is_not_found(&e) => Err(Report::new(LookupError::NotFound {
                pod: pod.to_string(),
            })),
            Err(e) => Err(Report::new(LookupError::QueryFailed {
                pod: pod.to_string(),
            })
            .attach_printable(format!("Kubernetes API error: {e}"))),
        }
    }
}
