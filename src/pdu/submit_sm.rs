// ABOUTME: submit_sm PDU (v3.4 section 4.4) and its response
// ABOUTME: The body codec is shared with deliver_sm, which has the same wire layout

use crate::codec::{
    CodecError, Decodable, Encodable, PduHeader, decode_cstring, decode_octets, decode_u8,
    encode_cstring,
};
use crate::pdu::{CommandId, CommandStatus, Tlv};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

pub const MAX_SERVICE_TYPE: usize = 6;
pub(crate) const MAX_ADDR: usize = 21;
pub(crate) const MAX_TIME: usize = 17;
pub(crate) const MAX_MESSAGE_ID: usize = 65;
/// Longest payload sm_length can describe; anything bigger must ride
/// the message_payload TLV.
pub const MAX_SHORT_MESSAGE: usize = 254;

/// Shared body of submit_sm and deliver_sm: the two PDUs are wire
/// identical, only their direction and the meaning of a few fields
/// differ.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SmBody {
    pub service_type: String,
    pub source_addr_ton: u8,
    pub source_addr_npi: u8,
    pub source_addr: String,
    pub dest_addr_ton: u8,
    pub dest_addr_npi: u8,
    pub destination_addr: String,
    pub esm_class: u8,
    pub protocol_id: u8,
    pub priority_flag: u8,
    pub schedule_delivery_time: String,
    pub validity_period: String,
    pub registered_delivery: u8,
    pub replace_if_present_flag: u8,
    pub data_coding: u8,
    pub sm_default_msg_id: u8,
    pub short_message: Bytes,
    pub tlvs: Vec<Tlv>,
}

impl SmBody {
    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        if self.short_message.len() > MAX_SHORT_MESSAGE {
            return Err(CodecError::FieldValidation {
                field: "short_message",
                reason: format!(
                    "{} octets exceed sm_length; use the message_payload TLV",
                    self.short_message.len()
                ),
            });
        }
        encode_cstring(buf, &self.service_type, MAX_SERVICE_TYPE + 1, "service_type")?;
        buf.put_u8(self.source_addr_ton);
        buf.put_u8(self.source_addr_npi);
        encode_cstring(buf, &self.source_addr, MAX_ADDR, "source_addr")?;
        buf.put_u8(self.dest_addr_ton);
        buf.put_u8(self.dest_addr_npi);
        encode_cstring(buf, &self.destination_addr, MAX_ADDR, "destination_addr")?;
        buf.put_u8(self.esm_class);
        buf.put_u8(self.protocol_id);
        buf.put_u8(self.priority_flag);
        encode_cstring(buf, &self.schedule_delivery_time, MAX_TIME, "schedule_delivery_time")?;
        encode_cstring(buf, &self.validity_period, MAX_TIME, "validity_period")?;
        buf.put_u8(self.registered_delivery);
        buf.put_u8(self.replace_if_present_flag);
        buf.put_u8(self.data_coding);
        buf.put_u8(self.sm_default_msg_id);
        buf.put_u8(self.short_message.len() as u8);
        buf.put_slice(&self.short_message);
        for tlv in &self.tlvs {
            tlv.encode(buf)?;
        }
        Ok(())
    }

    pub(crate) fn decode(buf: &mut Cursor<&[u8]>, body_end: usize) -> Result<Self, CodecError> {
        let service_type = decode_cstring(buf, MAX_SERVICE_TYPE + 1, "service_type")?;
        let source_addr_ton = decode_u8(buf)?;
        let source_addr_npi = decode_u8(buf)?;
        let source_addr = decode_cstring(buf, MAX_ADDR, "source_addr")?;
        let dest_addr_ton = decode_u8(buf)?;
        let dest_addr_npi = decode_u8(buf)?;
        let destination_addr = decode_cstring(buf, MAX_ADDR, "destination_addr")?;
        let esm_class = decode_u8(buf)?;
        let protocol_id = decode_u8(buf)?;
        let priority_flag = decode_u8(buf)?;
        let schedule_delivery_time = decode_cstring(buf, MAX_TIME, "schedule_delivery_time")?;
        let validity_period = decode_cstring(buf, MAX_TIME, "validity_period")?;
        let registered_delivery = decode_u8(buf)?;
        let replace_if_present_flag = decode_u8(buf)?;
        let data_coding = decode_u8(buf)?;
        let sm_default_msg_id = decode_u8(buf)?;
        let sm_length = decode_u8(buf)? as usize;
        let short_message = decode_octets(buf, sm_length, "short_message")?;
        let tlvs = Tlv::decode_all(buf, body_end)?;
        Ok(SmBody {
            service_type,
            source_addr_ton,
            source_addr_npi,
            source_addr,
            dest_addr_ton,
            dest_addr_npi,
            destination_addr,
            esm_class,
            protocol_id,
            priority_flag,
            schedule_delivery_time,
            validity_period,
            registered_delivery,
            replace_if_present_flag,
            data_coding,
            sm_default_msg_id,
            short_message,
            tlvs,
        })
    }
}

/// submit_sm: MT short message towards the SMSC.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubmitSm {
    pub command_status: CommandStatus,
    pub sequence_number: u32,
    pub body: SmBody,
}

impl Encodable for SubmitSm {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        PduHeader::new(CommandId::SubmitSm, self.command_status, self.sequence_number).encode(buf);
        self.body.encode(buf)
    }
}

impl Decodable for SubmitSm {
    fn command_id() -> CommandId {
        CommandId::SubmitSm
    }

    fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;
        let body_end = buf.position() as usize - PduHeader::SIZE + header.command_length as usize;
        Ok(SubmitSm {
            command_status: header.status(),
            sequence_number: header.sequence_number,
            body: SmBody::decode(buf, body_end)?,
        })
    }
}

/// submit_sm_resp: carries the SMSC-assigned message id on success.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubmitSmResp {
    pub command_status: CommandStatus,
    pub sequence_number: u32,
    pub message_id: String,
}

impl SubmitSmResp {
    pub fn ok(sequence_number: u32, message_id: &str) -> Self {
        SubmitSmResp {
            command_status: crate::pdu::status::ESME_ROK,
            sequence_number,
            message_id: message_id.to_string(),
        }
    }

    pub fn error(sequence_number: u32, status: CommandStatus) -> Self {
        SubmitSmResp {
            command_status: status,
            sequence_number,
            message_id: String::new(),
        }
    }
}

impl Encodable for SubmitSmResp {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        PduHeader::new(
            CommandId::SubmitSmResp,
            self.command_status,
            self.sequence_number,
        )
        .encode(buf);
        if self.command_status.is_ok() {
            encode_cstring(buf, &self.message_id, MAX_MESSAGE_ID, "message_id")?;
        }
        Ok(())
    }
}

impl Decodable for SubmitSmResp {
    fn command_id() -> CommandId {
        CommandId::SubmitSmResp
    }

    fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;
        let has_body = header.command_length as usize > PduHeader::SIZE;
        let message_id = if has_body {
            decode_cstring(buf, MAX_MESSAGE_ID, "message_id")?
        } else {
            String::new()
        };
        Ok(SubmitSmResp {
            command_status: header.status(),
            sequence_number: header.sequence_number,
            message_id,
        })
    }
}
