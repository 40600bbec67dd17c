// ABOUTME: SMPP v3.3/3.4 wire codec: PDU header, encode/decode traits and framing
// ABOUTME: Separates the byte-level format from the PDU domain models in pdu/

use crate::pdu::{self, CommandId, CommandStatus};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use thiserror::Error;

/// Maximum allowed PDU size to prevent memory exhaustion from a
/// misbehaving peer.
pub const MAX_PDU_SIZE: u32 = 65536;

/// SMPP PDU header (16 bytes, common to all PDUs). Fields are kept raw
/// so that vendor-specific command ids and statuses survive decoding;
/// typed views are available via [`PduHeader::command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub command_length: u32,
    pub command_id: u32,
    pub command_status: u32,
    pub sequence_number: u32,
}

impl PduHeader {
    pub const SIZE: usize = 16;

    pub fn new(command_id: CommandId, status: CommandStatus, sequence_number: u32) -> Self {
        PduHeader {
            command_length: 0,
            command_id: command_id as u32,
            command_status: status.0,
            sequence_number,
        }
    }

    /// Typed command id, `None` for ids this gateway does not speak.
    pub fn command(&self) -> Option<CommandId> {
        CommandId::try_from(self.command_id).ok()
    }

    pub fn status(&self) -> CommandStatus {
        CommandStatus(self.command_status)
    }

    pub fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        if buf.remaining() < Self::SIZE {
            return Err(CodecError::Incomplete);
        }
        let command_length = buf.get_u32();
        let command_id = buf.get_u32();
        let command_status = buf.get_u32();
        let sequence_number = buf.get_u32();

        if command_length < Self::SIZE as u32 || command_length > MAX_PDU_SIZE {
            return Err(CodecError::InvalidPduLength {
                length: command_length,
                min: Self::SIZE as u32,
                max: MAX_PDU_SIZE,
            });
        }

        Ok(PduHeader {
            command_length,
            command_id,
            command_status,
            sequence_number,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.command_length);
        buf.put_u32(self.command_id);
        buf.put_u32(self.command_status);
        buf.put_u32(self.sequence_number);
    }
}

/// Types that can be encoded to SMPP wire bytes.
pub trait Encodable {
    /// Encode this PDU, header included, into the buffer. The
    /// command_length field may be written as zero; [`Encodable::to_bytes`]
    /// fixes it up afterwards. Fails when a field does not fit its
    /// wire slot; nothing is ever silently truncated.
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError>;

    /// Encode into a fresh buffer with a correct command_length.
    fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        let length = buf.len() as u32;
        buf[0..4].copy_from_slice(&length.to_be_bytes());
        Ok(buf.freeze())
    }
}

/// Types that can be decoded from SMPP wire bytes, given an already
/// decoded header.
pub trait Decodable: Sized {
    fn command_id() -> CommandId;

    fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError>;

    fn validate_header(header: &PduHeader) -> Result<(), CodecError> {
        if header.command() != Some(Self::command_id()) {
            return Err(CodecError::UnexpectedCommandId {
                expected: Self::command_id(),
                actual: header.command_id,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("incomplete PDU: need more data")]
    Incomplete,

    #[error("invalid PDU length {length}, must be within {min}..{max}")]
    InvalidPduLength { length: u32, min: u32, max: u32 },

    #[error("unexpected command_id: expected {expected:?}, got {actual:#x}")]
    UnexpectedCommandId { expected: CommandId, actual: u32 },

    #[error("field '{field}' validation failed: {reason}")]
    FieldValidation { field: &'static str, reason: String },

    #[error("trailing TLV parsing error: {0}")]
    Tlv(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Map a decode failure onto the SMPP status to answer with.
    pub fn to_command_status(&self) -> CommandStatus {
        match self {
            CodecError::Incomplete | CodecError::InvalidPduLength { .. } => {
                pdu::status::ESME_RINVCMDLEN
            }
            CodecError::UnexpectedCommandId { .. } => pdu::status::ESME_RINVCMDID,
            CodecError::FieldValidation { field, .. } => match *field {
                "source_addr" => pdu::status::ESME_RINVSRCADR,
                "destination_addr" => pdu::status::ESME_RINVDSTADR,
                _ => pdu::status::ESME_RSYSERR,
            },
            _ => pdu::status::ESME_RSYSERR,
        }
    }
}

/// Decode a C-octet string: bytes up to a NUL terminator, at most
/// `max_len` including the terminator.
pub fn decode_cstring(
    buf: &mut Cursor<&[u8]>,
    max_len: usize,
    field: &'static str,
) -> Result<String, CodecError> {
    let start = buf.position() as usize;
    let data = *buf.get_ref();
    let mut end = start;
    loop {
        if end >= data.len() {
            return Err(CodecError::Incomplete);
        }
        if data[end] == 0 {
            break;
        }
        end += 1;
        if end - start >= max_len {
            return Err(CodecError::FieldValidation {
                field,
                reason: format!("C string exceeds {max_len} octets"),
            });
        }
    }
    let s = String::from_utf8_lossy(&data[start..end]).into_owned();
    buf.set_position((end + 1) as u64);
    Ok(s)
}

/// Encode a C-octet string: the bytes followed by a NUL. A value that
/// does not fit within `max_len` (terminator included) is an error;
/// callers validate or reject, the codec never clips.
pub fn encode_cstring(
    buf: &mut BytesMut,
    value: &str,
    max_len: usize,
    field: &'static str,
) -> Result<(), CodecError> {
    let bytes = value.as_bytes();
    if bytes.len() > max_len - 1 {
        return Err(CodecError::FieldValidation {
            field,
            reason: format!("value of {} octets exceeds {} octet field", bytes.len(), max_len - 1),
        });
    }
    buf.put_slice(bytes);
    buf.put_u8(0);
    Ok(())
}

pub fn decode_u8(buf: &mut Cursor<&[u8]>) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Incomplete);
    }
    Ok(buf.get_u8())
}

pub fn decode_octets(
    buf: &mut Cursor<&[u8]>,
    len: usize,
    field: &'static str,
) -> Result<Bytes, CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::FieldValidation {
            field,
            reason: format!("need {len} octets, have {}", buf.remaining()),
        });
    }
    Ok(buf.copy_to_bytes(len))
}

/// Generic frame over the PDU set this gateway speaks, plus an opaque
/// variant for everything else so unknown traffic can be nacked rather
/// than killing the link.
#[derive(Debug)]
pub enum Frame {
    BindTransmitter(pdu::BindTransmitter),
    BindTransmitterResp(pdu::BindTransmitterResp),
    BindReceiver(pdu::BindReceiver),
    BindReceiverResp(pdu::BindReceiverResp),
    BindTransceiver(pdu::BindTransceiver),
    BindTransceiverResp(pdu::BindTransceiverResp),
    SubmitSm(Box<pdu::SubmitSm>),
    SubmitSmResp(pdu::SubmitSmResp),
    DeliverSm(Box<pdu::DeliverSm>),
    DeliverSmResp(pdu::DeliverSmResp),
    EnquireLink(pdu::EnquireLink),
    EnquireLinkResp(pdu::EnquireLinkResp),
    Unbind(pdu::Unbind),
    UnbindResp(pdu::UnbindResp),
    GenericNack(pdu::GenericNack),
    Unknown { header: PduHeader, body: Bytes },
}

impl Frame {
    pub fn command_id(&self) -> u32 {
        match self {
            Frame::BindTransmitter(_) => CommandId::BindTransmitter as u32,
            Frame::BindTransmitterResp(_) => CommandId::BindTransmitterResp as u32,
            Frame::BindReceiver(_) => CommandId::BindReceiver as u32,
            Frame::BindReceiverResp(_) => CommandId::BindReceiverResp as u32,
            Frame::BindTransceiver(_) => CommandId::BindTransceiver as u32,
            Frame::BindTransceiverResp(_) => CommandId::BindTransceiverResp as u32,
            Frame::SubmitSm(_) => CommandId::SubmitSm as u32,
            Frame::SubmitSmResp(_) => CommandId::SubmitSmResp as u32,
            Frame::DeliverSm(_) => CommandId::DeliverSm as u32,
            Frame::DeliverSmResp(_) => CommandId::DeliverSmResp as u32,
            Frame::EnquireLink(_) => CommandId::EnquireLink as u32,
            Frame::EnquireLinkResp(_) => CommandId::EnquireLinkResp as u32,
            Frame::Unbind(_) => CommandId::Unbind as u32,
            Frame::UnbindResp(_) => CommandId::UnbindResp as u32,
            Frame::GenericNack(_) => CommandId::GenericNack as u32,
            Frame::Unknown { header, .. } => header.command_id,
        }
    }

    pub fn sequence_number(&self) -> u32 {
        match self {
            Frame::BindTransmitter(p) => p.sequence_number,
            Frame::BindTransmitterResp(p) => p.sequence_number,
            Frame::BindReceiver(p) => p.sequence_number,
            Frame::BindReceiverResp(p) => p.sequence_number,
            Frame::BindTransceiver(p) => p.sequence_number,
            Frame::BindTransceiverResp(p) => p.sequence_number,
            Frame::SubmitSm(p) => p.sequence_number,
            Frame::SubmitSmResp(p) => p.sequence_number,
            Frame::DeliverSm(p) => p.sequence_number,
            Frame::DeliverSmResp(p) => p.sequence_number,
            Frame::EnquireLink(p) => p.sequence_number,
            Frame::EnquireLinkResp(p) => p.sequence_number,
            Frame::Unbind(p) => p.sequence_number,
            Frame::UnbindResp(p) => p.sequence_number,
            Frame::GenericNack(p) => p.sequence_number,
            Frame::Unknown { header, .. } => header.sequence_number,
        }
    }

    pub fn is_response(&self) -> bool {
        self.command_id() & 0x8000_0000 != 0
    }

    /// Check whether the buffer holds at least one complete PDU.
    pub fn check(buf: &mut Cursor<&[u8]>) -> Result<(), CodecError> {
        if buf.remaining() < PduHeader::SIZE {
            return Err(CodecError::Incomplete);
        }
        let pos = buf.position();
        let command_length = buf.get_u32();
        buf.set_position(pos);

        if command_length < PduHeader::SIZE as u32 || command_length > MAX_PDU_SIZE {
            return Err(CodecError::InvalidPduLength {
                length: command_length,
                min: PduHeader::SIZE as u32,
                max: MAX_PDU_SIZE,
            });
        }
        if buf.remaining() < command_length as usize {
            return Err(CodecError::Incomplete);
        }
        Ok(())
    }

    /// Parse one complete PDU from the buffer. The caller has verified
    /// completeness with [`Frame::check`].
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Frame, CodecError> {
        let start = buf.position() as usize;
        let header = PduHeader::decode(buf)?;
        let body_len = header.command_length as usize - PduHeader::SIZE;
        let body_end = start + header.command_length as usize;

        let frame = match header.command() {
            Some(CommandId::BindTransmitter) => {
                Frame::BindTransmitter(pdu::BindTransmitter::decode(header, buf)?)
            }
            Some(CommandId::BindTransmitterResp) => {
                Frame::BindTransmitterResp(pdu::BindTransmitterResp::decode(header, buf)?)
            }
            Some(CommandId::BindReceiver) => {
                Frame::BindReceiver(pdu::BindReceiver::decode(header, buf)?)
            }
            Some(CommandId::BindReceiverResp) => {
                Frame::BindReceiverResp(pdu::BindReceiverResp::decode(header, buf)?)
            }
            Some(CommandId::BindTransceiver) => {
                Frame::BindTransceiver(pdu::BindTransceiver::decode(header, buf)?)
            }
            Some(CommandId::BindTransceiverResp) => {
                Frame::BindTransceiverResp(pdu::BindTransceiverResp::decode(header, buf)?)
            }
            Some(CommandId::SubmitSm) => {
                Frame::SubmitSm(Box::new(pdu::SubmitSm::decode(header, buf)?))
            }
            Some(CommandId::SubmitSmResp) => {
                Frame::SubmitSmResp(pdu::SubmitSmResp::decode(header, buf)?)
            }
            Some(CommandId::DeliverSm) => {
                Frame::DeliverSm(Box::new(pdu::DeliverSm::decode(header, buf)?))
            }
            Some(CommandId::DeliverSmResp) => {
                Frame::DeliverSmResp(pdu::DeliverSmResp::decode(header, buf)?)
            }
            Some(CommandId::EnquireLink) => {
                Frame::EnquireLink(pdu::EnquireLink::decode(header, buf)?)
            }
            Some(CommandId::EnquireLinkResp) => {
                Frame::EnquireLinkResp(pdu::EnquireLinkResp::decode(header, buf)?)
            }
            Some(CommandId::Unbind) => Frame::Unbind(pdu::Unbind::decode(header, buf)?),
            Some(CommandId::UnbindResp) => Frame::UnbindResp(pdu::UnbindResp::decode(header, buf)?),
            Some(CommandId::GenericNack) => {
                Frame::GenericNack(pdu::GenericNack::decode(header, buf)?)
            }
            None => {
                let body = decode_octets(buf, body_len, "unknown_pdu_body")?;
                tracing::warn!(
                    "unknown PDU command_id {:#010x}, treating as opaque",
                    header.command_id
                );
                Frame::Unknown { header, body }
            }
        };

        // a decoder must consume exactly its declared body
        if buf.position() as usize != body_end {
            buf.set_position(body_end as u64);
        }
        Ok(frame)
    }

    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        match self {
            Frame::BindTransmitter(p) => p.to_bytes(),
            Frame::BindTransmitterResp(p) => p.to_bytes(),
            Frame::BindReceiver(p) => p.to_bytes(),
            Frame::BindReceiverResp(p) => p.to_bytes(),
            Frame::BindTransceiver(p) => p.to_bytes(),
            Frame::BindTransceiverResp(p) => p.to_bytes(),
            Frame::SubmitSm(p) => p.to_bytes(),
            Frame::SubmitSmResp(p) => p.to_bytes(),
            Frame::DeliverSm(p) => p.to_bytes(),
            Frame::DeliverSmResp(p) => p.to_bytes(),
            Frame::EnquireLink(p) => p.to_bytes(),
            Frame::EnquireLinkResp(p) => p.to_bytes(),
            Frame::Unbind(p) => p.to_bytes(),
            Frame::UnbindResp(p) => p.to_bytes(),
            Frame::GenericNack(p) => p.to_bytes(),
            Frame::Unknown { .. } => Err(CodecError::FieldValidation {
                field: "frame",
                reason: "cannot serialize an unknown frame".to_string(),
            }),
        }
    }
}
