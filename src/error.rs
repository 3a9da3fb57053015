//! Error types and result definitions for the tuyalan crate.
//! Includes Tuya-specific error codes and conversion from standard IO/JSON errors.

use thiserror::Error;

/// Represents all possible errors raised by the LAN protocol engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TuyaError {
    /// Socket-level send/bind/receive failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Bad prefix, impossible length or truncated buffer
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// CRC check failed for the received frame
    #[error("CRC mismatch")]
    CrcMismatch,

    /// AES-GCM tag did not verify (wrong key, nonce, AAD or tampered data)
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Failed to encrypt a message
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Key material of the wrong size
    #[error("Invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    /// The frame carried a command other than the one awaited
    #[error("Unexpected command 0x{actual:02X} (expected 0x{expected:02X})")]
    UnexpectedCommand { expected: u32, actual: u32 },

    /// The peer answered with a different uuid or gwId than the one requested
    #[error("Identity mismatch on {field}: expected '{expected}', got '{actual}'")]
    IdentityMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    /// No answer before the negotiation deadline
    #[error("Timeout waiting for device")]
    Timeout,

    /// Failed to decode hex or otherwise structured data
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Operation not allowed in the current negotiator state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Negotiation cancelled by an explicit removal
    #[error("Negotiation cancelled")]
    Cancelled,

    /// Protocol version not handled by this engine
    #[error("Unsupported protocol version '{0}'")]
    UnsupportedVersion(String),

    /// Device ID not found in the manager
    #[error("Device ID '{0}' not found")]
    DeviceNotFound(String),
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        TuyaError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl From<hex::FromHexError> for TuyaError {
    fn from(err: hex::FromHexError) -> Self {
        TuyaError::DecodeError(err.to_string())
    }
}

impl TuyaError {
    pub fn code(&self) -> u32 {
        match self {
            TuyaError::Transport(_) => ERR_CONNECT,
            TuyaError::Json(_) => ERR_JSON,
            TuyaError::MalformedFrame(_) => ERR_PAYLOAD,
            TuyaError::CrcMismatch => ERR_KEY_OR_VER,
            TuyaError::AuthenticationFailed => ERR_KEY_OR_VER,
            TuyaError::EncryptionFailed => ERR_KEY_OR_VER,
            TuyaError::InvalidKeyLength(_) => ERR_KEY_OR_VER,
            TuyaError::UnexpectedCommand { .. } => ERR_PAYLOAD,
            TuyaError::IdentityMismatch { .. } => ERR_IDENTITY,
            TuyaError::Timeout => ERR_TIMEOUT,
            TuyaError::DecodeError(_) => ERR_PAYLOAD,
            TuyaError::InvalidState(_) => ERR_STATE,
            TuyaError::Cancelled => ERR_STATE,
            TuyaError::UnsupportedVersion(_) => ERR_KEY_OR_VER,
            TuyaError::DeviceNotFound(_) => ERR_PARAMS,
        }
    }

    /// Whether this failure concerns authenticity of the peer rather than
    /// plain transport noise.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            TuyaError::IdentityMismatch { .. } | TuyaError::AuthenticationFailed
        )
    }
}

// TinyTuya Error Response Codes
define_error_codes! {
    ERR_SUCCESS = 0 => "Connection Successful",
    ERR_JSON = 900 => "Invalid JSON Response from Device",
    ERR_CONNECT = 901 => "Network Error: Unable to Connect",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_PAYLOAD = 904 => "Unexpected Payload from Device",
    ERR_OFFLINE = 905 => "Network Error: Device Unreachable",
    ERR_STATE = 906 => "Device in Unknown State",
    ERR_PARAMS = 912 => "Missing Function Parameters",
    ERR_KEY_OR_VER = 914 => "Check device key or version",
    ERR_IDENTITY = 916 => "Device identity mismatch",
}
