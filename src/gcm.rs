//! Decryption of AES-GCM frames exchanged before a per-device session exists.
//!
//! Frames carry `nonce(12) | ciphertext | tag(16)` as payload and are
//! authenticated with the 16-byte frame AAD (sequence, command and
//! ciphertext length). By default the well-known discovery key is used.

use crate::crypto::{self, NONCE_LEN, TuyaCipher};
use crate::error::{Result, TuyaError};
use crate::protocol::{self, ParsedFrame};
use log::debug;

/// `MD5("yGAdlopoPVldABfn")`, shared by every v3.4+ device for discovery traffic.
pub const DISCOVERY_KEY: [u8; 16] = [
    0x6c, 0x1e, 0xc8, 0xe2, 0xbb, 0x9b, 0xb5, 0x9a, 0xb5, 0x0b, 0x0d, 0xaf, 0x64, 0x9b, 0x41, 0x0a,
];

/// A decrypted frame.
#[derive(Debug, Clone)]
pub struct GcmFrame {
    /// Header fields; `payload` still holds the encrypted bytes
    pub frame: ParsedFrame,
    pub plaintext: Vec<u8>,
    pub nonce_hex: String,
}

pub struct GcmFrameParser {
    cipher: TuyaCipher,
}

impl GcmFrameParser {
    /// Parser keyed with [`DISCOVERY_KEY`].
    pub fn discovery() -> Self {
        Self {
            cipher: TuyaCipher::from_key(&DISCOVERY_KEY),
        }
    }

    pub fn with_key(key: &[u8]) -> Result<Self> {
        Ok(Self {
            cipher: TuyaCipher::new(key)?,
        })
    }

    /// Decrypts `data`, returning `None` on CRC failure, command mismatch or
    /// authentication failure.
    pub fn parse(&self, data: &[u8], expected_command: Option<u32>) -> Option<GcmFrame> {
        match self.open(data, expected_command) {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!("Discarding GCM frame: {}", e);
                None
            }
        }
    }

    /// Same as [`parse`](Self::parse) but reports why a frame was rejected.
    pub fn open(&self, data: &[u8], expected_command: Option<u32>) -> Result<GcmFrame> {
        let frame = protocol::parse(data)?.verified()?;

        if let Some(expected) = expected_command
            && frame.command != expected
        {
            return Err(TuyaError::UnexpectedCommand {
                expected,
                actual: frame.command,
            });
        }

        let parts = crypto::split_payload(&frame.payload)?;
        let aad = crypto::frame_aad(
            frame.sequence,
            frame.command,
            parts.ciphertext.len() as u32,
        );
        let plaintext = self
            .cipher
            .open(parts.ciphertext, parts.nonce, parts.tag, &aad)?;
        let nonce_hex = hex::encode(parts.nonce);

        Ok(GcmFrame {
            frame,
            plaintext,
            nonce_hex,
        })
    }

    /// Encrypts `plaintext` into a complete frame readable by [`open`](Self::open).
    pub fn seal(
        &self,
        prefix: u32,
        suffix: u32,
        sequence: u32,
        command: u32,
        plaintext: &[u8],
        nonce: &[u8; NONCE_LEN],
    ) -> Result<Vec<u8>> {
        let aad = crypto::frame_aad(sequence, command, plaintext.len() as u32);
        let sealed = self.cipher.seal(plaintext, nonce, &aad)?;
        protocol::build(prefix, sequence, command, &sealed.to_payload(nonce), suffix)
    }
}

impl Default for GcmFrameParser {
    fn default() -> Self {
        Self::discovery()
    }
}
