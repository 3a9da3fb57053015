//! # tuyalan
//!
//! Tuya LAN protocol engine: frame codec, AES-128-GCM layer and concurrent
//! v3.5 session negotiation for Tuya-compatible devices, without cloud
//! dependencies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuyalan::{DeviceInfo, LocalKey, Manager, ManagerConfig};
//!
//! # async fn run() -> tuyalan::error::Result<()> {
//! let manager = Manager::bind(ManagerConfig::default()).await?;
//! let key: LocalKey = "0123456789abcdef".parse()?;
//! let device = DeviceInfo::new("DEVICE_ID", key).with_ip("192.168.1.20".parse().unwrap());
//! let session = manager.negotiate(device, None).await?;
//! println!("session key: {}", hex::encode(session.session_key));
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod batch;
pub mod cache;
pub mod crypto;
pub mod device;
pub mod discovery;
pub mod error;
pub mod gcm;
pub mod manager;
pub mod negotiation;
pub mod negotiator;
pub mod protocol;
pub mod transport;

pub use cache::{SessionCache, SessionMaterial};
pub use device::{DeviceInfo, LocalKey};
pub use error::TuyaError;
pub use manager::{BatchReport, Manager, ManagerConfig, NegotiationEvent};
pub use negotiator::{Negotiator, NegotiatorState};
pub use protocol::{CommandType, Version};
pub use transport::{Transport, UdpTransport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
