//! v3.5 session negotiation messages.
//!
//! The request carries `{gwId, random, t, uuid}` encrypted under the device's
//! local key with the 12-byte negotiation AAD, inside a `6699` frame with
//! sequence 1. The CRC of that frame identifies the request on the network:
//! the device echoes it back and the manager routes the answer with it.

use crate::crypto::{self, NONCE_LEN, TuyaCipher};
use crate::device::LocalKey;
use crate::error::{Result, TuyaError};
use crate::protocol::{self, CommandType, Frame, FrameFamily};
use serde::{Deserialize, Serialize};

/// Sequence number of the opening request.
pub const REQUEST_SEQUENCE: u32 = 1;
/// Sequence number of the finish acknowledgement.
pub const FINISH_SEQUENCE: u32 = 2;

/// JSON body of a negotiation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBody {
    #[serde(rename = "gwId")]
    pub gw_id: String,
    /// Client random, hex encoded
    pub random: String,
    pub t: u64,
    pub uuid: String,
}

/// JSON body of the device's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBody {
    #[serde(rename = "gwId")]
    pub gw_id: String,
    /// Device random, hex encoded
    pub random: String,
    pub uuid: String,
}

/// Inputs of a negotiation request.
#[derive(Debug, Clone)]
pub struct NegotiationRequest<'a> {
    pub device_id: &'a str,
    pub local_key: &'a LocalKey,
    pub uuid: &'a str,
    pub client_random: [u8; 16],
    pub timestamp: u64,
}

/// `MD5(device_id)` as hex, split into four dash-separated groups of 8 digits.
pub fn device_uuid(device_id: &str) -> String {
    let digest = hex::encode(crypto::md5(device_id.as_bytes()));
    [&digest[0..8], &digest[8..16], &digest[16..24], &digest[24..32]].join("-")
}

/// Build the opening request frame.
pub fn build_request(req: &NegotiationRequest<'_>) -> Result<Vec<u8>> {
    let body = RequestBody {
        gw_id: req.device_id.to_string(),
        random: hex::encode(req.client_random),
        t: req.timestamp,
        uuid: req.uuid.to_string(),
    };
    let plaintext = serde_json::to_vec(&body)?;
    let cipher = TuyaCipher::from_key(req.local_key.as_bytes());
    seal_frame(
        &cipher,
        REQUEST_SEQUENCE,
        CommandType::SessKeyNegStart,
        &plaintext,
    )
}

/// Build the acknowledgement sent once a session is established:
/// `HMAC-SHA256(local_key, device_random)` encrypted under the new session key.
pub fn build_finish(local_key: &LocalKey, session_key: &[u8; 16], device_random: &[u8]) -> Result<Vec<u8>> {
    let proof = crypto::hmac_sha256(local_key.as_bytes(), device_random)?;
    let cipher = TuyaCipher::from_key(session_key);
    seal_frame(
        &cipher,
        FINISH_SEQUENCE,
        CommandType::SessKeyNegFinish,
        &proof,
    )
}

/// Decode a request frame the way a device does. Used by device emulators.
pub fn decode_request(data: &[u8], local_key: &LocalKey) -> Result<RequestBody> {
    let cipher = TuyaCipher::from_key(local_key.as_bytes());
    let plaintext = open_frame(&cipher, data, CommandType::SessKeyNegStart)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Decode and verify a finish frame; returns the HMAC proof.
pub fn decode_finish(
    data: &[u8],
    local_key: &LocalKey,
    session_key: &[u8; 16],
    device_random: &[u8],
) -> Result<Vec<u8>> {
    let cipher = TuyaCipher::from_key(session_key);
    let proof = open_frame(&cipher, data, CommandType::SessKeyNegFinish)?;
    crypto::verify_hmac_sha256(local_key.as_bytes(), device_random, &proof)?;
    Ok(proof)
}

fn seal_frame(cipher: &TuyaCipher, sequence: u32, command: CommandType, plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce: [u8; NONCE_LEN] = crypto::random_bytes();
    let aad = crypto::negotiation_aad(sequence, command as u8, plaintext.len())?;
    let sealed = cipher.seal(plaintext, &nonce, &aad)?;
    Frame::new(
        FrameFamily::Negotiation,
        sequence,
        command.as_u32(),
        sealed.to_payload(&nonce),
    )
    .build()
}

fn open_frame(cipher: &TuyaCipher, data: &[u8], command: CommandType) -> Result<Vec<u8>> {
    let frame = protocol::parse(data)?.verified()?;
    if frame.command != command.as_u32() {
        return Err(TuyaError::UnexpectedCommand {
            expected: command.as_u32(),
            actual: frame.command,
        });
    }
    let parts = crypto::split_payload(&frame.payload)?;
    let aad = crypto::negotiation_aad(frame.sequence, command as u8, parts.ciphertext.len())?;
    cipher.open(parts.ciphertext, parts.nonce, parts.tag, &aad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PREFIX_6699, SUFFIX_6699};

    fn key() -> LocalKey {
        LocalKey::from_bytes(b"0123456789abcdef").unwrap()
    }

    #[test]
    fn test_device_uuid_grouping() {
        let uuid = device_uuid("ebed83c21d73b95055nsc5");
        let groups: Vec<&str> = uuid.split('-').collect();
        assert_eq!(groups.len(), 4);
        assert!(groups.iter().all(|g| g.len() == 8));
        assert_eq!(uuid.replace('-', ""), hex::encode(crypto::md5(b"ebed83c21d73b95055nsc5")));
        assert_eq!(uuid, device_uuid("ebed83c21d73b95055nsc5"));
    }

    #[test]
    fn test_request_frame_layout() {
        let key = key();
        let uuid = device_uuid("dev1");
        let req = NegotiationRequest {
            device_id: "dev1",
            local_key: &key,
            uuid: &uuid,
            client_random: [0xAB; 16],
            timestamp: 1_700_000_000,
        };
        let bytes = build_request(&req).unwrap();
        let parsed = protocol::parse(&bytes).unwrap();
        assert_eq!(parsed.prefix, PREFIX_6699);
        assert_eq!(parsed.suffix, SUFFIX_6699);
        assert_eq!(parsed.sequence, REQUEST_SEQUENCE);
        assert_eq!(parsed.command, CommandType::SessKeyNegStart as u32);
        assert!(parsed.crc_valid);

        let body = decode_request(&bytes, &key).unwrap();
        assert_eq!(body.gw_id, "dev1");
        assert_eq!(body.random, hex::encode([0xAB; 16]));
        assert_eq!(body.t, 1_700_000_000);
        assert_eq!(body.uuid, uuid);
    }

    #[test]
    fn test_request_needs_the_local_key() {
        let key = key();
        let req = NegotiationRequest {
            device_id: "dev1",
            local_key: &key,
            uuid: "u",
            client_random: [1; 16],
            timestamp: 0,
        };
        let bytes = build_request(&req).unwrap();
        let other = LocalKey::from_bytes(b"fedcba9876543210").unwrap();
        assert_eq!(
            decode_request(&bytes, &other),
            Err(TuyaError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_finish_roundtrip() {
        let key = key();
        let session_key = [5u8; 16];
        let device_random = [6u8; 16];
        let bytes = build_finish(&key, &session_key, &device_random).unwrap();
        assert_eq!(protocol::parse(&bytes).unwrap().sequence, FINISH_SEQUENCE);
        assert!(decode_finish(&bytes, &key, &session_key, &device_random).is_ok());
        assert!(decode_finish(&bytes, &key, &session_key, &[7u8; 16]).is_err());
    }
}
