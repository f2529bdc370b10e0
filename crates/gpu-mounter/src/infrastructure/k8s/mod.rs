//! Kubernetes side of the service.
//!
//! - [`KubePodLookup`]: reads target pods
//! - [`KubePlaceholderApi`]: creates, watches and deletes placeholder pods

pub mod placeholder;
pub mod pod_lookup;
pub mod types;

pub use placeholder::KubePlaceholderApi;
pub use placeholder::PlaceholderConfig;
pub use pod_lookup::KubePodLookup;
pub use types::KubernetesError;
