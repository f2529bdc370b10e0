use std::collections::HashMap;

use error_stack::Report;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use tracing::info;
use tracing::warn;

use crate::domain::errors::CatalogError;
use crate::domain::resource::DeviceNode;
use crate::domain::traits::DeviceCatalog;

pub fn init_nvml() -> Result<Nvml, NvmlError> {
    match Nvml::init() {
        Ok(nvml) => {
            info!("NVML initialized successfully");
            Ok(nvml)
        }
        Err(_) => {
            warn!("Standard NVML init failed, trying with explicit library path");
            let nvml = Nvml::builder()
                .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                .init()?;
            info!("NVML initialized with explicit library path");
            Ok(nvml)
        }
    }
}

/// Resolves GPU UUIDs to `/dev/nvidia<minor>`.
///
/// The node's GPUs are enumerated once at startup, so lookups never block on
/// NVML while a request holds the reservation lock.
#[derive(Debug, Default)]
pub struct NvmlCatalog {
    minors: HashMap<String, u32>,
}

impl NvmlCatalog {
    /// Enumerates and logs every GPU visible on this node.
    pub fn discover(nvml: &Nvml) -> Result<Self, NvmlError> {
        let count = nvml.device_count()?;
        info!("Discovered {count} GPU device(s)");
        let mut minors = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = nvml.device_by_index(index)?;
            let uuid = device.uuid()?;
            let minor = device.minor_number()?;
            info!(index, uuid = %uuid, minor, name = %device.name()?, "Found GPU");
            minors.push((uuid, minor));
        }
        Ok(Self::from_minors(minors))
    }

    pub fn from_minors(minors: impl IntoIterator<Item = (String, u32)>) -> Self {
        Self {
            minors: minors
                .into_iter()
                .map(|(uuid, minor)| (uuid.to_ascii_lowercase(), minor))
                .collect(),
        }
    }

    pub fn device_count(&self) -> usize {
        self.minors.len()
    }
}

impl DeviceCatalog for NvmlCatalog {
    fn device_node(&self, uuid: &str) -> Result<DeviceNode, Report<CatalogError>> {
        self.minors
            .get(&uuid.to_ascii_lowercase())
            .map(|&minor| DeviceNode::nvidia(minor))
            .ok_or_else(|| {
                Report::new(CatalogError::UnknownDevice {
                    uuid: uuid.to_string(),
                })
            })
    }
}
