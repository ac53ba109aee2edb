// ── Device domain type ──

use serde::{Deserialize, Serialize};

use hmgate_api::DeviceDescription;

/// A physical device on one interface, as seen by the host.
///
/// Built from the device root description; reachability and pending
/// configuration follow the `UNREACH` / `CONFIG_PENDING` values pushed
/// on channel 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub interface_id: String,
    pub address: String,
    pub device_type: String,
    pub firmware: Option<String>,
    pub version: u32,
    /// Channel addresses in description order.
    pub channels: Vec<String>,
    pub reachable: bool,
    pub config_pending: bool,
}

impl Device {
    pub fn from_description(interface_id: &str, description: &DeviceDescription) -> Self {
        Self {
            interface_id: interface_id.to_owned(),
            address: description.address.clone(),
            device_type: description.device_type.clone(),
            firmware: description.firmware.clone(),
            version: description.version,
            channels: description.children.clone(),
            reachable: true,
            config_pending: false,
        }
    }
}
