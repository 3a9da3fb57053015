//! Batch packets: one broadcast frame addressing several devices at once.
//!
//! Each device is addressed by a 4-byte token, `CRC32(device_id)`. The frame
//! body is `base_nonce(12)` followed by one entry per device:
//! `token(4) | ct_len(2, BE) | ciphertext | tag(16)`, where the plaintext is
//! `token | random(16)` and the entry nonce is the base nonce with its last
//! four bytes XORed with the entry index. Every entry is authenticated with
//! the batch AAD, so a device can verify it was addressed by the whole batch.

use crate::crypto::{self, NONCE_LEN, TAG_LEN, TuyaCipher};
use crate::error::{Result, TuyaError};
use crate::gcm::DISCOVERY_KEY;
use crate::protocol::{self, CommandType, Frame, FrameFamily};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

const TOKEN_LEN: usize = 4;
const ENTRY_HEADER_LEN: usize = TOKEN_LEN + 2;
const RANDOM_LEN: usize = 16;

/// One addressed device and the random it is handed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub device_id: String,
    pub random: [u8; RANDOM_LEN],
}

impl BatchEntry {
    pub fn new<I: Into<String>>(device_id: I) -> Self {
        Self {
            device_id: device_id.into(),
            random: crypto::random_bytes(),
        }
    }
}

/// A decoded, authenticated entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedEntry {
    pub token: u32,
    pub random: [u8; RANDOM_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPacket {
    pub sequence: u32,
    pub batch_crc: u32,
    pub entries: Vec<OpenedEntry>,
}

impl BatchPacket {
    /// Finds the entry addressed to `device_id`.
    pub fn entry_for(&self, device_id: &str) -> Option<&OpenedEntry> {
        let token = device_token(device_id);
        self.entries.iter().find(|e| e.token == token)
    }
}

pub fn device_token(device_id: &str) -> u32 {
    protocol::crc32(device_id.as_bytes())
}

/// CRC32 over the concatenated big-endian tokens.
pub fn batch_crc(tokens: &[u32]) -> u32 {
    let mut buf = Vec::with_capacity(tokens.len() * TOKEN_LEN);
    for token in tokens {
        buf.extend_from_slice(&token.to_be_bytes());
    }
    protocol::crc32(&buf)
}

fn entry_nonce(base: &[u8; NONCE_LEN], index: usize) -> [u8; NONCE_LEN] {
    let mut nonce = *base;
    let tail = BigEndian::read_u32(&nonce[NONCE_LEN - 4..]) ^ index as u32;
    BigEndian::write_u32(&mut nonce[NONCE_LEN - 4..], tail);
    nonce
}

pub struct BatchPacketBuilder {
    cipher: TuyaCipher,
}

impl BatchPacketBuilder {
    pub fn new(key: &[u8]) -> Result<Self> {
        Ok(Self {
            cipher: TuyaCipher::new(key)?,
        })
    }

    /// Builder keyed with the protocol broadcast key.
    pub fn broadcast() -> Self {
        Self {
            cipher: TuyaCipher::from_key(&DISCOVERY_KEY),
        }
    }

    pub fn build(&self, sequence: u32, entries: &[BatchEntry]) -> Result<Vec<u8>> {
        self.build_with_nonce(sequence, entries, &crypto::random_bytes())
    }

    pub fn build_with_nonce(
        &self,
        sequence: u32,
        entries: &[BatchEntry],
        base_nonce: &[u8; NONCE_LEN],
    ) -> Result<Vec<u8>> {
        if entries.is_empty() {
            return Err(TuyaError::InvalidState("batch without devices".into()));
        }
        let tokens: Vec<u32> = entries.iter().map(|e| device_token(&e.device_id)).collect();
        let aad = crypto::batch_aad(
            sequence,
            CommandType::SessKeyNegStart.as_u32(),
            batch_crc(&tokens),
            tokens.len() as u32,
        )?;

        let mut body = Vec::with_capacity(
            NONCE_LEN + entries.len() * (ENTRY_HEADER_LEN + TOKEN_LEN + RANDOM_LEN + TAG_LEN),
        );
        body.extend_from_slice(base_nonce);

        for (index, (entry, token)) in entries.iter().zip(&tokens).enumerate() {
            let mut plaintext = Vec::with_capacity(TOKEN_LEN + RANDOM_LEN);
            plaintext.extend_from_slice(&token.to_be_bytes());
            plaintext.extend_from_slice(&entry.random);

            let sealed = self
                .cipher
                .seal(&plaintext, &entry_nonce(base_nonce, index), &aad)?;
            body.write_u32::<BigEndian>(*token)?;
            body.write_u16::<BigEndian>(sealed.ciphertext.len() as u16)?;
            body.extend_from_slice(&sealed.ciphertext);
            body.extend_from_slice(&sealed.tag);
        }

        Frame::new(
            FrameFamily::Negotiation,
            sequence,
            CommandType::SessKeyNegStart.as_u32(),
            body,
        )
        .build()
    }

    /// Decodes a batch frame and authenticates every entry.
    pub fn open(&self, data: &[u8]) -> Result<BatchPacket> {
        let frame = protocol::parse(data)?.verified()?;
        let expected = CommandType::SessKeyNegStart.as_u32();
        if frame.command != expected {
            return Err(TuyaError::UnexpectedCommand {
                expected,
                actual: frame.command,
            });
        }

        let body = frame.payload.as_slice();
        if body.len() < NONCE_LEN {
            return Err(TuyaError::MalformedFrame("batch body shorter than nonce".into()));
        }
        let mut base_nonce = [0u8; NONCE_LEN];
        base_nonce.copy_from_slice(&body[..NONCE_LEN]);

        // first pass: slice out entries, since the AAD covers all tokens
        let mut raw = Vec::new();
        let mut rest = &body[NONCE_LEN..];
        while !rest.is_empty() {
            if rest.len() < ENTRY_HEADER_LEN {
                return Err(TuyaError::MalformedFrame("truncated batch entry header".into()));
            }
            let token = BigEndian::read_u32(&rest[..TOKEN_LEN]);
            let ct_len = BigEndian::read_u16(&rest[TOKEN_LEN..ENTRY_HEADER_LEN]) as usize;
            let end = ENTRY_HEADER_LEN + ct_len + TAG_LEN;
            if rest.len() < end {
                return Err(TuyaError::MalformedFrame("truncated batch entry".into()));
            }
            let ciphertext = &rest[ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + ct_len];
            let tag = &rest[ENTRY_HEADER_LEN + ct_len..end];
            raw.push((token, ciphertext, tag));
            rest = &rest[end..];
        }
        if raw.is_empty() {
            return Err(TuyaError::MalformedFrame("batch without entries".into()));
        }

        let tokens: Vec<u32> = raw.iter().map(|(token, _, _)| *token).collect();
        let crc = batch_crc(&tokens);
        let aad = crypto::batch_aad(frame.sequence, expected, crc, tokens.len() as u32)?;

        let mut entries = Vec::with_capacity(raw.len());
        for (index, (token, ciphertext, tag)) in raw.into_iter().enumerate() {
            let plaintext = self
                .cipher
                .open(ciphertext, &entry_nonce(&base_nonce, index), tag, &aad)?;
            if plaintext.len() != TOKEN_LEN + RANDOM_LEN
                || BigEndian::read_u32(&plaintext[..TOKEN_LEN]) != token
            {
                return Err(TuyaError::DecodeError(format!(
                    "batch entry {} does not match its token",
                    index
                )));
            }
            let mut random = [0u8; RANDOM_LEN];
            random.copy_from_slice(&plaintext[TOKEN_LEN..]);
            entries.push(OpenedEntry { token, random });
        }

        Ok(BatchPacket {
            sequence: frame.sequence,
            batch_crc: crc,
            entries,
        })
    }
}

impl Default for BatchPacketBuilder {
    fn default() -> Self {
        Self::broadcast()
    }
}
