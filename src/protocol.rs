//! Tuya wire protocol implementation.
//! Handles frame building, header parsing and CRC verification for the
//! legacy `55AA` family and the v3.5 `6699` negotiation family.

use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use std::io::Cursor;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const PREFIX_6699: u32 = 0x00006699;
pub const SUFFIX_55AA: u32 = 0x0000AA55;
pub const SUFFIX_6699: u32 = 0x00009966;

/// Prefix, sequence, command and length.
pub const HEADER_LEN: usize = 16;
/// CRC and suffix.
pub const TRAILER_LEN: usize = 8;
/// Shortest buffer `parse` will look at.
pub const MIN_FRAME_LEN: usize = 20;

/// UDP port used by v3.5 devices for negotiation traffic.
pub const NEGOTIATION_PORT: u16 = 6669;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

define_command_type! {
    ApConfig = 0x01,
    Active = 0x02,
    SessKeyNegStart = 0x03,
    SessKeyNegResp = 0x04,
    SessKeyNegFinish = 0x05,
    Unbind = 0x06,
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    ControlNew = 0x0d,
    DpQueryNew = 0x10,
    UpdateDps = 0x12,
    UdpNew = 0x13,
    ReqDevInfo = 0x25,
    LanExtStream = 0x40,
}

define_version! {
    V3_3 = ("3.3", 3.3),
    V3_4 = ("3.4", 3.4),
    V3_5 = ("3.5", 3.5),
}

/// The two frame families and their length conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFamily {
    /// `55AA`: the length field also counts CRC and suffix.
    Legacy,
    /// `6699`: the length field is the raw payload length.
    Negotiation,
}

impl FrameFamily {
    pub fn from_prefix(prefix: u32) -> Option<Self> {
        match prefix {
            PREFIX_55AA => Some(FrameFamily::Legacy),
            PREFIX_6699 => Some(FrameFamily::Negotiation),
            _ => None,
        }
    }

    pub fn prefix(self) -> u32 {
        match self {
            FrameFamily::Legacy => PREFIX_55AA,
            FrameFamily::Negotiation => PREFIX_6699,
        }
    }

    pub fn suffix(self) -> u32 {
        match self {
            FrameFamily::Legacy => SUFFIX_55AA,
            FrameFamily::Negotiation => SUFFIX_6699,
        }
    }

    /// Value written to the header length field for a payload of `payload_len` bytes.
    fn encode_len(self, payload_len: usize) -> usize {
        match self {
            FrameFamily::Legacy => payload_len + TRAILER_LEN,
            FrameFamily::Negotiation => payload_len,
        }
    }

    /// Payload length implied by the header length field.
    fn decode_len(self, declared: u32) -> Option<usize> {
        match self {
            FrameFamily::Legacy => (declared as usize).checked_sub(TRAILER_LEN),
            FrameFamily::Negotiation => Some(declared as usize),
        }
    }
}

/// Tuya protocol frame contents (input to [`Frame::build`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub prefix: u32,
    pub sequence: u32,
    pub command: u32,
    pub payload: Vec<u8>,
    pub suffix: u32,
}

impl Frame {
    /// A frame of `family` with its matching prefix and suffix.
    pub fn new(family: FrameFamily, sequence: u32, command: u32, payload: Vec<u8>) -> Self {
        Self {
            prefix: family.prefix(),
            sequence,
            command,
            payload,
            suffix: family.suffix(),
        }
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        build(self.prefix, self.sequence, self.command, &self.payload, self.suffix)
    }
}

/// A decoded frame. CRC problems are reported, not raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub prefix: u32,
    pub sequence: u32,
    pub command: u32,
    /// Length field exactly as found in the header
    pub payload_len: u32,
    pub payload: Vec<u8>,
    pub crc: u32,
    pub computed_crc: u32,
    pub crc_valid: bool,
    pub suffix: u32,
}

impl ParsedFrame {
    pub fn family(&self) -> FrameFamily {
        // parse() only accepts known prefixes
        FrameFamily::from_prefix(self.prefix).unwrap_or(FrameFamily::Negotiation)
    }

    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::from_u32(self.command)
    }

    /// Returns the frame if its CRC verified, [`TuyaError::CrcMismatch`] otherwise.
    pub fn verified(self) -> Result<Self> {
        if self.crc_valid {
            Ok(self)
        } else {
            Err(TuyaError::CrcMismatch)
        }
    }
}

/// CRC-32/ISO-HDLC: reflected 0xEDB88320, init 0xFFFFFFFF, complemented output.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Assemble a frame. The CRC is always computed over the fresh header and payload.
pub fn build(prefix: u32, sequence: u32, command: u32, payload: &[u8], suffix: u32) -> Result<Vec<u8>> {
    let family = FrameFamily::from_prefix(prefix)
        .ok_or_else(|| TuyaError::MalformedFrame(format!("unknown prefix 0x{:08X}", prefix)))?;
    let declared = u32::try_from(family.encode_len(payload.len()))
        .map_err(|_| TuyaError::MalformedFrame("payload too large".into()))?;

    let mut data = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    data.write_u32::<BigEndian>(prefix)?;
    data.write_u32::<BigEndian>(sequence)?;
    data.write_u32::<BigEndian>(command)?;
    data.write_u32::<BigEndian>(declared)?;
    data.extend_from_slice(payload);

    let crc = crc32(&data);
    data.write_u32::<BigEndian>(crc)?;
    data.write_u32::<BigEndian>(suffix)?;
    Ok(data)
}

/// Parse a frame. Fails on short buffers, unknown prefixes and truncation;
/// trailing bytes past the declared frame are ignored.
pub fn parse(data: &[u8]) -> Result<ParsedFrame> {
    if data.len() < MIN_FRAME_LEN {
        return Err(TuyaError::MalformedFrame(format!(
            "frame of {} bytes is shorter than {}",
            data.len(),
            MIN_FRAME_LEN
        )));
    }

    let mut cursor = Cursor::new(data);
    let prefix = cursor.read_u32::<BigEndian>()?;
    let family = FrameFamily::from_prefix(prefix)
        .ok_or_else(|| TuyaError::MalformedFrame(format!("unknown prefix 0x{:08X}", prefix)))?;
    let sequence = cursor.read_u32::<BigEndian>()?;
    let command = cursor.read_u32::<BigEndian>()?;
    let payload_len = cursor.read_u32::<BigEndian>()?;

    let body_len = family.decode_len(payload_len).ok_or_else(|| {
        TuyaError::MalformedFrame(format!("length field {} below trailer size", payload_len))
    })?;
    let payload_end = HEADER_LEN
        .checked_add(body_len)
        .ok_or_else(|| TuyaError::MalformedFrame("length overflow".into()))?;
    let total = payload_end + TRAILER_LEN;
    if data.len() < total {
        return Err(TuyaError::MalformedFrame(format!(
            "declared {} bytes but only {} available",
            total,
            data.len()
        )));
    }

    let crc = BigEndian::read_u32(&data[payload_end..payload_end + 4]);
    let suffix = BigEndian::read_u32(&data[payload_end + 4..total]);
    let computed_crc = crc32(&data[..payload_end]);

    Ok(ParsedFrame {
        prefix,
        sequence,
        command,
        payload_len,
        payload: data[HEADER_LEN..payload_end].to_vec(),
        crc,
        computed_crc,
        crc_valid: crc == computed_crc,
        suffix,
    })
}

/// Reads the CRC field of a frame without copying its payload.
pub fn frame_crc(data: &[u8]) -> Option<u32> {
    if data.len() < MIN_FRAME_LEN {
        return None;
    }
    let family = FrameFamily::from_prefix(BigEndian::read_u32(&data[..4]))?;
    let body_len = family.decode_len(BigEndian::read_u32(&data[12..16]))?;
    let crc_at = HEADER_LEN.checked_add(body_len)?;
    if data.len() < crc_at + TRAILER_LEN {
        return None;
    }
    Some(BigEndian::read_u32(&data[crc_at..crc_at + 4]))
}

/// Routing key of an inbound negotiation response: devices echo the CRC of
/// the request they answer in the response's sequence field.
pub fn routing_crc(data: &[u8]) -> Option<u32> {
    if data.len() < MIN_FRAME_LEN {
        return None;
    }
    FrameFamily::from_prefix(BigEndian::read_u32(&data[..4]))?;
    Some(BigEndian::read_u32(&data[4..8]))
}
