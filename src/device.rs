//! Device identity used by the negotiation engine.

use crate::error::{Result, TuyaError};
use crate::protocol::{NEGOTIATION_PORT, Version};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Device-specific 16-byte provisioning secret.
///
/// Accepts either 32 hex digits or the 16-character form Tuya apps export.
#[derive(Clone, PartialEq, Eq)]
pub struct LocalKey([u8; 16]);

impl LocalKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; 16] = bytes
            .try_into()
            .map_err(|_| TuyaError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        Self::from_bytes(&hex::decode(s)?)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl FromStr for LocalKey {
    type Err = TuyaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.len() {
            32 => Self::from_hex(s),
            16 => Self::from_bytes(s.as_bytes()),
            n => Err(TuyaError::InvalidKeyLength(n)),
        }
    }
}

impl fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LocalKey(***)")
    }
}

/// A device the manager can negotiate with.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device ID (gwId)
    pub id: String,
    /// Known IP address; `None` means the request is broadcast
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub local_key: LocalKey,
    pub version: Option<Version>,
    pub product_key: Option<String>,
    pub mac: Option<String>,
}

impl DeviceInfo {
    pub fn new<I: Into<String>>(id: I, local_key: LocalKey) -> Self {
        Self {
            id: id.into(),
            ip: None,
            port: NEGOTIATION_PORT,
            local_key,
            version: Some(Version::V3_5),
            product_key: None,
            mac: None,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_version(mut self, version: Option<Version>) -> Self {
        self.version = version;
        self
    }

    /// Whether this device speaks the v3.5 session negotiation.
    /// An unknown version is assumed to.
    pub fn supports_negotiation(&self) -> bool {
        self.version.is_none_or(|v| v == Version::V3_5)
    }

    /// Unicast address when the IP is known, `broadcast:port` otherwise.
    pub fn target(&self, broadcast: IpAddr) -> SocketAddr {
        SocketAddr::new(self.ip.unwrap_or(broadcast), self.port)
    }
}
