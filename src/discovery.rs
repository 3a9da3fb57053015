//! Decoding of discovery broadcasts into negotiation targets.
//! Devices announce themselves with a JSON document, either in clear or
//! inside a frame encrypted under the discovery key.

use crate::device::{DeviceInfo, LocalKey};
use crate::error::{Result, TuyaError};
use crate::gcm::GcmFrameParser;
use crate::protocol;
use log::debug;
use serde_json::Value;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Instant;

/// DiscoveryResult contains information about a discovered Tuya device.
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    /// Device ID
    pub id: String,
    pub ip: IpAddr,
    pub port: Option<u16>,
    /// Protocol version as announced (e.g. "3.3", "3.5")
    pub version: Option<String>,
    pub product_key: Option<String>,
    pub mac: Option<String>,
    /// Time when the device was discovered
    pub discovered_at: Instant,
}

impl DiscoveryResult {
    /// Extract device info from an announcement document.
    pub fn from_json(val: &Value) -> Option<Self> {
        let id = val
            .get("gwId")
            .or_else(|| val.get("devId"))
            .or_else(|| val.get("id"))
            .and_then(|v| v.as_str())?;
        let ip = val
            .get("ip")
            .and_then(|v| v.as_str())
            .and_then(|s| IpAddr::from_str(s).ok())?;

        let text = |key: &str| val.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let port = val
            .get("port")
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok());

        Some(Self {
            id: id.to_string(),
            ip,
            port,
            version: text("version"),
            product_key: text("productKey"),
            mac: text("mac"),
            discovered_at: Instant::now(),
        })
    }

    /// Negotiation target for this device.
    pub fn into_device(self, local_key: LocalKey) -> Result<DeviceInfo> {
        let version = match self.version.as_deref() {
            Some(s) => Some(
                protocol::Version::from_str(s)
                    .map_err(|_| TuyaError::UnsupportedVersion(s.to_string()))?,
            ),
            None => None,
        };

        let mut device = DeviceInfo::new(self.id, local_key)
            .with_ip(self.ip)
            .with_version(version);
        if let Some(port) = self.port {
            device = device.with_port(port);
        }
        device.product_key = self.product_key;
        device.mac = self.mac;
        Ok(device)
    }
}

/// Decodes one discovery datagram.
pub fn parse_broadcast(data: &[u8]) -> Option<DiscoveryResult> {
    debug!("Parsing UDP packet of {} bytes...", data.len());

    // 1. Frame encrypted under the discovery key (v3.4+)
    if let Some(frame) = GcmFrameParser::discovery().parse(data, None)
        && let Some(val) = json_in(&frame.plaintext)
    {
        debug!("Successfully decrypted discovery frame");
        return DiscoveryResult::from_json(&val);
    }

    // 2. Raw JSON
    if let Ok(val) = serde_json::from_slice::<Value>(data) {
        debug!("Successfully parsed raw JSON packet");
        return DiscoveryResult::from_json(&val);
    }

    // 3. Clear JSON inside a frame, possibly behind a return code
    if let Ok(frame) = protocol::parse(data)
        && frame.crc_valid
        && let Some(val) = json_in(&frame.payload)
    {
        debug!("Successfully parsed JSON from frame payload");
        return DiscoveryResult::from_json(&val);
    }

    debug!("Failed to parse UDP packet");
    None
}

fn json_in(data: &[u8]) -> Option<Value> {
    let start = data.iter().position(|&b| b == b'{')?;
    let end = data.iter().rposition(|&b| b == b'}')?;
    if end < start {
        return None;
    }
    serde_json::from_slice(&data[start..=end]).ok()
}
