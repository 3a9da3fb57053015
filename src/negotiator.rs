//! Per-device session negotiation state machine.
//!
//! `Idle -> RequestSent -> {Established | Failed}`; `cleanup()` returns to
//! `Idle`. The negotiator performs no I/O: it produces request frames and
//! consumes response frames, and reports its transitions as [`Outcome`]s.

use crate::cache::SessionMaterial;
use crate::crypto;
use crate::device::DeviceInfo;
use crate::error::{Result, TuyaError};
use crate::gcm::GcmFrameParser;
use crate::negotiation::{self, NegotiationRequest, ResponseBody};
use crate::protocol::{self, CommandType};
use log::{debug, warn};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    Idle,
    RequestSent,
    Established,
    Failed,
}

/// Result of a state transition.
#[derive(Debug, Clone)]
pub enum Outcome {
    Established(SessionMaterial),
    Failed(TuyaError),
}

/// Material of the attempt in flight.
struct PendingSession {
    uuid: String,
    client_random: [u8; 16],
    timestamp: u64,
    request_crc: u32,
}

pub struct Negotiator {
    device: DeviceInfo,
    state: NegotiatorState,
    pending: Option<PendingSession>,
    established: Option<SessionMaterial>,
    last_error: Option<TuyaError>,
    parser: GcmFrameParser,
}

impl Negotiator {
    pub fn new(device: DeviceInfo) -> Self {
        Self {
            device,
            state: NegotiatorState::Idle,
            pending: None,
            established: None,
            last_error: None,
            parser: GcmFrameParser::discovery(),
        }
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == NegotiatorState::Established
    }

    /// CRC of the request currently awaiting an answer.
    pub fn request_crc(&self) -> Option<u32> {
        self.pending.as_ref().map(|p| p.request_crc)
    }

    pub fn uuid(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.uuid.as_str())
    }

    pub fn session(&self) -> Option<&SessionMaterial> {
        self.established.as_ref()
    }

    pub fn last_error(&self) -> Option<&TuyaError> {
        self.last_error.as_ref()
    }

    /// Updates the address used for the next request (e.g. after rediscovery).
    pub fn update_device(&mut self, device: DeviceInfo) {
        self.device = device;
    }

    /// `Idle -> RequestSent`. Returns the frame and its CRC (the routing key).
    pub fn build_request(&mut self) -> Result<(Vec<u8>, u32)> {
        if self.state != NegotiatorState::Idle {
            return Err(TuyaError::InvalidState(format!(
                "cannot start negotiation for {} from {:?}",
                self.device.id, self.state
            )));
        }

        let client_random: [u8; 16] = crypto::random_bytes();
        let uuid = negotiation::device_uuid(&self.device.id);
        let timestamp = unix_timestamp();
        let frame = negotiation::build_request(&NegotiationRequest {
            device_id: &self.device.id,
            local_key: &self.device.local_key,
            uuid: &uuid,
            client_random,
            timestamp,
        })?;
        let request_crc = protocol::frame_crc(&frame)
            .ok_or_else(|| TuyaError::MalformedFrame("request frame without CRC".into()))?;

        debug!(
            "Built negotiation request for {} (crc=0x{:08X})",
            self.device.id, request_crc
        );
        self.pending = Some(PendingSession {
            uuid,
            client_random,
            timestamp,
            request_crc,
        });
        self.last_error = None;
        self.state = NegotiatorState::RequestSent;
        Ok((frame, request_crc))
    }

    /// Handle an answer. Returns `None` when the negotiator is not waiting
    /// (already established, failed or idle) or the frame fails its CRC, so
    /// duplicates, late frames and line noise have no effect. Otherwise every
    /// check failure ends in `Failed`.
    pub fn process_response(&mut self, data: &[u8], source: SocketAddr) -> Option<Outcome> {
        if self.state != NegotiatorState::RequestSent {
            debug!(
                "Ignoring response from {} for {} in state {:?}",
                source, self.device.id, self.state
            );
            return None;
        }

        if let Ok(frame) = protocol::parse(data)
            && !frame.crc_valid
        {
            debug!(
                "Discarding response from {} for {}: CRC mismatch",
                source, self.device.id
            );
            return None;
        }

        let outcome = match self.validate_response(data, source) {
            Ok(material) => {
                self.state = NegotiatorState::Established;
                self.pending = None;
                self.established = Some(material.clone());
                Outcome::Established(material)
            }
            Err(e) => {
                if e.is_security_relevant() {
                    warn!("Negotiation with {} rejected: {}", self.device.id, e);
                }
                self.mark_failed(e.clone());
                Outcome::Failed(e)
            }
        };
        Some(outcome)
    }

    /// Manager-driven failure (timeout, transport error). Only affects a
    /// negotiator that is waiting for an answer.
    pub fn fail(&mut self, reason: TuyaError) -> Option<Outcome> {
        if self.state != NegotiatorState::RequestSent {
            return None;
        }
        self.mark_failed(reason.clone());
        Some(Outcome::Failed(reason))
    }

    /// Back to `Idle`, dropping randoms, UUID and any established session.
    pub fn cleanup(&mut self) {
        self.pending = None;
        self.established = None;
        self.state = NegotiatorState::Idle;
    }

    fn mark_failed(&mut self, reason: TuyaError) {
        self.pending = None;
        self.last_error = Some(reason);
        self.state = NegotiatorState::Failed;
    }

    fn validate_response(&self, data: &[u8], source: SocketAddr) -> Result<SessionMaterial> {
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| TuyaError::InvalidState("no request in flight".into()))?;

        let frame = protocol::parse(data)?;
        let expected = CommandType::SessKeyNegResp.as_u32();
        if frame.command != expected {
            return Err(TuyaError::UnexpectedCommand {
                expected,
                actual: frame.command,
            });
        }

        let decrypted = self.parser.open(data, Some(expected))?;
        let body: ResponseBody = serde_json::from_slice(&decrypted.plaintext)?;

        if body.uuid != pending.uuid {
            return Err(TuyaError::IdentityMismatch {
                field: "uuid",
                expected: pending.uuid.clone(),
                actual: body.uuid,
            });
        }
        if body.gw_id != self.device.id {
            return Err(TuyaError::IdentityMismatch {
                field: "gwId",
                expected: self.device.id.clone(),
                actual: body.gw_id,
            });
        }

        let device_random: [u8; 16] = hex::decode(&body.random)?
            .try_into()
            .map_err(|v: Vec<u8>| {
                TuyaError::DecodeError(format!("device random of {} bytes", v.len()))
            })?;

        let session_key = crypto::derive_session_key(
            self.device.local_key.as_bytes(),
            &pending.client_random,
            &device_random,
        );
        debug!(
            "Session established with {} at {} (request t={})",
            self.device.id, source, pending.timestamp
        );

        Ok(SessionMaterial::new(
            &self.device.id,
            session_key,
            pending.client_random,
            device_random,
            source,
        ))
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
