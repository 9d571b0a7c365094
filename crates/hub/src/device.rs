//! Hub device object

use interface::DeviceObject;
use std::sync::Arc;

/// The hub's own device object; owns every work item the hub allocates
#[derive(Debug)]
pub struct HubDevice {
    name: String,
    ports: u8,
}

impl HubDevice {
    pub fn new(name: impl Into<String>, ports: u8) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ports,
        })
    }

    /// Number of downstream ports
    pub fn ports(&self) -> u8 {
        self.ports
    }
}

impl DeviceObject for HubDevice {
    fn name(&self) -> &str {
        &self.name
    }
}
