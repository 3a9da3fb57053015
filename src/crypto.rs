//! Tuya protocol cryptography.
//! AES-128-GCM with detached tags, message-family AAD layouts, session key
//! derivation and the MD5/HMAC helpers the handshake relies on.

use crate::error::{Result, TuyaError};
use aes_gcm::{
    Aes128Gcm, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use byteorder::{BigEndian, WriteBytesExt};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::RngCore;
use sha2::Sha256;

pub const KEY_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Reserved and protocol version bytes leading the frame and negotiation AADs.
const AAD_HEADER: [u8; 4] = [0x00, 0x00, 0x03, 0x05];

/// Largest plaintext whose length fits the 3-byte negotiation AAD field.
pub const MAX_NEGOTIATION_LEN: usize = 0x00FF_FFFF;

/// Ciphertext and detached authentication tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl Sealed {
    /// Wire layout used in frame payloads: `nonce | ciphertext | tag`.
    pub fn to_payload(&self, nonce: &[u8; NONCE_LEN]) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len() + TAG_LEN);
        out.extend_from_slice(nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }
}

/// A payload split into its AEAD parts.
#[derive(Debug, Clone, Copy)]
pub struct PayloadParts<'a> {
    pub nonce: &'a [u8],
    pub ciphertext: &'a [u8],
    pub tag: &'a [u8],
}

/// Splits `nonce(12) | ciphertext | tag(16)`.
pub fn split_payload(payload: &[u8]) -> Result<PayloadParts<'_>> {
    if payload.len() < NONCE_LEN + TAG_LEN {
        return Err(TuyaError::MalformedFrame(format!(
            "AEAD payload of {} bytes is shorter than nonce and tag",
            payload.len()
        )));
    }
    let tag_start = payload.len() - TAG_LEN;
    Ok(PayloadParts {
        nonce: &payload[..NONCE_LEN],
        ciphertext: &payload[NONCE_LEN..tag_start],
        tag: &payload[tag_start..],
    })
}

/// TuyaCipher holds a keyed AES-128-GCM instance.
pub struct TuyaCipher {
    gcm: Aes128Gcm,
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(TuyaError::InvalidKeyLength(key.len()));
        }
        let gcm = Aes128Gcm::new_from_slice(key).map_err(|_| TuyaError::InvalidKeyLength(key.len()))?;
        Ok(Self { gcm })
    }

    /// Infallible constructor for keys whose size is known statically.
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        Self {
            gcm: Aes128Gcm::new(&(*key).into()),
        }
    }

    /// Encrypt `plaintext`, returning the ciphertext and the detached tag.
    pub fn seal(&self, plaintext: &[u8], nonce: &[u8], aad: &[u8]) -> Result<Sealed> {
        check_nonce(nonce)?;
        let mut buffer = plaintext.to_vec();
        let tag = self
            .gcm
            .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut buffer)
            .map_err(|_| TuyaError::EncryptionFailed)?;

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(tag.as_slice());
        Ok(Sealed {
            ciphertext: buffer,
            tag: tag_bytes,
        })
    }

    /// Decrypt and authenticate. Plaintext is only released when the tag verifies.
    pub fn open(&self, ciphertext: &[u8], nonce: &[u8], tag: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        check_nonce(nonce)?;
        if tag.len() != TAG_LEN {
            return Err(TuyaError::AuthenticationFailed);
        }
        let mut buffer = ciphertext.to_vec();
        self.gcm
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                aad,
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| TuyaError::AuthenticationFailed)?;
        Ok(buffer)
    }
}

fn check_nonce(nonce: &[u8]) -> Result<()> {
    if nonce.len() != NONCE_LEN {
        return Err(TuyaError::MalformedFrame(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LEN,
            nonce.len()
        )));
    }
    Ok(())
}

/// One-shot AES-128-GCM encryption.
pub fn encrypt(plaintext: &[u8], key: &[u8], nonce: &[u8], aad: &[u8]) -> Result<Sealed> {
    TuyaCipher::new(key)?.seal(plaintext, nonce, aad)
}

/// One-shot AES-128-GCM decryption. Any authentication problem is reported
/// as [`TuyaError::AuthenticationFailed`].
pub fn decrypt(ciphertext: &[u8], key: &[u8], nonce: &[u8], tag: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    TuyaCipher::new(key)?.open(ciphertext, nonce, tag, aad)
}

/// AAD for frames read by the GCM frame parser (16 bytes):
/// `00 00 03 05 | sequence(4) | command(4) | length(4)`.
pub fn frame_aad(sequence: u32, command: u32, length: u32) -> [u8; 16] {
    let mut aad = [0u8; 16];
    aad[..4].copy_from_slice(&AAD_HEADER);
    aad[4..8].copy_from_slice(&sequence.to_be_bytes());
    aad[8..12].copy_from_slice(&command.to_be_bytes());
    aad[12..].copy_from_slice(&length.to_be_bytes());
    aad
}

/// AAD for negotiation frames (12 bytes):
/// `00 00 03 05 | sequence(4) | type(1) | length(3)`.
pub fn negotiation_aad(sequence: u32, message_type: u8, length: usize) -> Result<[u8; 12]> {
    if length > MAX_NEGOTIATION_LEN {
        return Err(TuyaError::EncryptionFailed);
    }
    let mut aad = [0u8; 12];
    aad[..4].copy_from_slice(&AAD_HEADER);
    aad[4..8].copy_from_slice(&sequence.to_be_bytes());
    aad[8] = message_type;
    let len = (length as u32).to_be_bytes();
    aad[9..].copy_from_slice(&len[1..]);
    Ok(aad)
}

/// AAD for batch frames (16 bytes):
/// `sequence(4) | type(4) | batch_crc(4) | device_count(4)`.
pub fn batch_aad(sequence: u32, message_type: u32, batch_crc: u32, device_count: u32) -> Result<Vec<u8>> {
    let mut aad = Vec::with_capacity(16);
    aad.write_u32::<BigEndian>(sequence)?;
    aad.write_u32::<BigEndian>(message_type)?;
    aad.write_u32::<BigEndian>(batch_crc)?;
    aad.write_u32::<BigEndian>(device_count)?;
    Ok(aad)
}

pub fn md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// `MD5(local_key ∥ client_random ∥ device_random)` over raw bytes.
pub fn derive_session_key(local_key: &[u8], client_random: &[u8], device_random: &[u8]) -> [u8; KEY_LEN] {
    let mut hasher = Md5::new();
    hasher.update(local_key);
    hasher.update(client_random);
    hasher.update(device_random);
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Constant-time HMAC check.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], expected: &[u8]) -> Result<()> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
    mac.update(data);
    mac.verify_slice(expected)
        .map_err(|_| TuyaError::AuthenticationFailed)
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::rng().fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = *b"0123456789abcdef";
    const NONCE: [u8; 12] = [7u8; 12];

    #[test]
    fn test_encrypt_decrypt() {
        let aad = frame_aad(1, 4, 11);
        let sealed = encrypt(b"hello world", &KEY, &NONCE, &aad).unwrap();
        assert_eq!(sealed.ciphertext.len(), 11);

        let plain = decrypt(&sealed.ciphertext, &KEY, &NONCE, &sealed.tag, &aad).unwrap();
        assert_eq!(plain, b"hello world");
    }

    #[test]
    fn test_decrypt_rejects_wrong_inputs() {
        let aad = frame_aad(1, 4, 5);
        let sealed = encrypt(b"lamp!", &KEY, &NONCE, &aad).unwrap();

        let wrong_key = *b"fedcba9876543210";
        assert_eq!(
            decrypt(&sealed.ciphertext, &wrong_key, &NONCE, &sealed.tag, &aad),
            Err(TuyaError::AuthenticationFailed)
        );

        let wrong_nonce = [8u8; 12];
        assert!(decrypt(&sealed.ciphertext, &KEY, &wrong_nonce, &sealed.tag, &aad).is_err());

        let mut wrong_tag = sealed.tag;
        wrong_tag[0] ^= 0x01;
        assert!(decrypt(&sealed.ciphertext, &KEY, &NONCE, &wrong_tag, &aad).is_err());

        let other_aad = frame_aad(2, 4, 5);
        assert!(decrypt(&sealed.ciphertext, &KEY, &NONCE, &sealed.tag, &other_aad).is_err());

        let mut tampered = sealed.ciphertext.clone();
        tampered[0] ^= 0xff;
        assert!(decrypt(&tampered, &KEY, &NONCE, &sealed.tag, &aad).is_err());
    }

    #[test]
    fn test_bad_sizes_are_errors() {
        assert_eq!(
            encrypt(b"x", &KEY[..15], &NONCE, &[]).err(),
            Some(TuyaError::InvalidKeyLength(15))
        );
        assert!(matches!(
            encrypt(b"x", &KEY, &NONCE[..8], &[]),
            Err(TuyaError::MalformedFrame(_))
        ));
        assert_eq!(
            decrypt(b"x", &KEY, &NONCE, &[0u8; 4], &[]),
            Err(TuyaError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_session_key_is_deterministic_and_input_sensitive() {
        let local = [1u8; 16];
        let client = [2u8; 16];
        let device = [3u8; 16];
        let key = derive_session_key(&local, &client, &device);
        assert_eq!(key, derive_session_key(&local, &client, &device));

        let mut concat = Vec::new();
        concat.extend_from_slice(&local);
        concat.extend_from_slice(&client);
        concat.extend_from_slice(&device);
        assert_eq!(key, md5(&concat));

        assert_ne!(key, derive_session_key(&[9u8; 16], &client, &device));
        assert_ne!(key, derive_session_key(&local, &[9u8; 16], &device));
        assert_ne!(key, derive_session_key(&local, &client, &[9u8; 16]));
    }

    #[test]
    fn test_aad_layouts() {
        let aad = negotiation_aad(1, 0x03, 0x010203).unwrap();
        assert_eq!(
            aad,
            [0x00, 0x00, 0x03, 0x05, 0, 0, 0, 1, 0x03, 0x01, 0x02, 0x03]
        );
        assert!(negotiation_aad(1, 0x03, MAX_NEGOTIATION_LEN + 1).is_err());

        let aad = frame_aad(0x0A0B0C0D, 4, 32);
        assert_eq!(&aad[..4], &[0x00, 0x00, 0x03, 0x05]);
        assert_eq!(&aad[4..8], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&aad[8..12], &[0, 0, 0, 4]);
        assert_eq!(&aad[12..], &[0, 0, 0, 32]);

        let aad = batch_aad(1, 3, 0xDEADBEEF, 2).unwrap();
        assert_eq!(aad, vec![0, 0, 0, 1, 0, 0, 0, 3, 0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 2]);
    }

    #[test]
    fn test_md5_known_vector() {
        assert_eq!(hex::encode(md5(b"")), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_hmac_verify() {
        let mac = hmac_sha256(&KEY, b"device-random").unwrap();
        assert!(verify_hmac_sha256(&KEY, b"device-random", &mac).is_ok());
        assert_eq!(
            verify_hmac_sha256(&KEY, b"other", &mac),
            Err(TuyaError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_split_payload() {
        let sealed = encrypt(b"abc", &KEY, &NONCE, &[]).unwrap();
        let payload = sealed.to_payload(&NONCE);
        let parts = split_payload(&payload).unwrap();
        assert_eq!(parts.nonce, &NONCE);
        assert_eq!(parts.ciphertext, sealed.ciphertext.as_slice());
        assert_eq!(parts.tag, &sealed.tag);
        assert!(split_payload(&payload[..20]).is_err());
    }
}
