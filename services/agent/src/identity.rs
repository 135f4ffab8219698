//! Who this display node is.
//!
//! The hardware id is derived once at startup from the configured network
//! interface's MAC address and is never recomputed.

use std::path::Path;

/// Used when the interface has no readable MAC (containers, dev machines).
pub const FALLBACK_MAC: &str = "AA:BB:CC:DD:EE:FF";

/// Device kind presented to the controller at connect time.
pub const DEVICE_TYPE: &str = "raspberry_pi";

pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Colon-separated, upper-case MAC address.
    pub mac_address: String,
    /// MAC without separators; the controller's key for this device.
    pub device_id: String,
    pub display_name: Option<String>,
    pub software_version: String,
}

impl DeviceIdentity {
    pub fn from_mac(mac: &str, display_name: Option<String>) -> Self {
        let mac_address = mac.trim().to_ascii_uppercase();
        let device_id = mac_address.replace([':', '-'], "");
        Self {
            mac_address,
            device_id,
            display_name,
            software_version: SOFTWARE_VERSION.to_owned(),
        }
    }

    /// Read the MAC of `interface` from sysfs, falling back to
    /// [`FALLBACK_MAC`].
    pub fn detect(interface: &str, display_name: Option<String>) -> Self {
        let path = Path::new("/sys/class/net").join(interface).join("address");
        let mac = read_mac(&path).unwrap_or_else(|| {
            tracing::warn!(interface, "no MAC address found, using fallback id");
            FALLBACK_MAC.to_owned()
        });
        Self::from_mac(&mac, display_name)
    }

    /// Header pairs presented on the WebSocket upgrade request.
    pub fn connect_headers(&self) -> [(&'static str, &str); 4] {
        [
            ("mac_address", self.mac_address.as_str()),
            ("device_type", DEVICE_TYPE),
            ("software_version", self.software_version.as_str()),
            ("device_id", self.device_id.as_str()),
        ]
    }
}

fn read_mac(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let mac = raw.trim();
    if mac.is_empty() || mac == "00:00:00:00:00:00" {
        return None;
    }
    Some(mac.to_owned())
}

/// Local address the kernel would route outbound traffic from. A UDP
/// `connect` picks the route without sending anything.
pub fn detect_local_ip() -> String {
    let probe = || -> Option<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        Some(socket.local_addr().ok()?.ip().to_string())
    };
    probe().unwrap_or_else(|| "127.0.0.1".to_owned())
}
