// ABOUTME: deliver_sm PDU (v3.4 section 4.6) and its response
// ABOUTME: Carries both mobile-originated messages and delivery receipts

use crate::codec::{CodecError, Decodable, Encodable, PduHeader, decode_cstring, encode_cstring};
use crate::pdu::submit_sm::SmBody;
use crate::pdu::{CommandId, CommandStatus};
use bytes::BytesMut;
use std::io::Cursor;

/// esm_class bits relevant to deliver_sm handling.
pub mod esm {
    /// Message type bits 2-5; 0x04 flags an SMSC delivery receipt.
    /// Some SMSCs set extra feature bits, so the type is isolated by
    /// masking with `!0xC3` before comparing.
    pub const TYPE_MASK: u8 = 0xC3;
    pub const DELIVERY_RECEIPT: u8 = 0x04;
    /// UDH indicator (bit 6).
    pub const UDH_INDICATOR: u8 = 0x40;
    /// Reply-path / RPI (bit 7).
    pub const REPLY_PATH: u8 = 0x80;
    /// Store-and-forward message mode for submits.
    pub const STORE_AND_FORWARD: u8 = 0x03;

    /// True when the class marks a delivery receipt rather than an MO
    /// message.
    pub fn is_delivery_receipt(esm_class: u8) -> bool {
        esm_class & !TYPE_MASK == DELIVERY_RECEIPT
    }
}

/// deliver_sm: MO short message or delivery receipt from the SMSC.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeliverSm {
    pub command_status: CommandStatus,
    pub sequence_number: u32,
    pub body: SmBody,
}

impl Encodable for DeliverSm {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        PduHeader::new(
            CommandId::DeliverSm,
            self.command_status,
            self.sequence_number,
        )
        .encode(buf);
        self.body.encode(buf)
    }
}

impl Decodable for DeliverSm {
    fn command_id() -> CommandId {
        CommandId::DeliverSm
    }

    fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;
        let body_end = buf.position() as usize - PduHeader::SIZE + header.command_length as usize;
        Ok(DeliverSm {
            command_status: header.status(),
            sequence_number: header.sequence_number,
            body: SmBody::decode(buf, body_end)?,
        })
    }
}

/// deliver_sm_resp; the message_id field is unused and always empty.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeliverSmResp {
    pub command_status: CommandStatus,
    pub sequence_number: u32,
}

impl DeliverSmResp {
    pub fn ok(sequence_number: u32) -> Self {
        DeliverSmResp {
            command_status: crate::pdu::status::ESME_ROK,
            sequence_number,
        }
    }

    pub fn error(sequence_number: u32, status: CommandStatus) -> Self {
        DeliverSmResp {
            command_status: status,
            sequence_number,
        }
    }
}

impl Encodable for DeliverSmResp {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        PduHeader::new(
            CommandId::DeliverSmResp,
            self.command_status,
            self.sequence_number,
        )
        .encode(buf);
        encode_cstring(buf, "", 1, "message_id")?;
        Ok(())
    }
}

impl Decodable for DeliverSmResp {
    fn command_id() -> CommandId {
        CommandId::DeliverSmResp
    }

    fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;
        if header.command_length as usize > PduHeader::SIZE {
            let _ = decode_cstring(buf, 65, "message_id")?;
        }
        Ok(DeliverSmResp {
            command_status: header.status(),
            sequence_number: header.sequence_number,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::status;
    use bytes::Bytes;

    #[test]
    fn deliver_sm_roundtrip() {
        let mut body = SmBody::default();
        body.source_addr = "358409876543".to_string();
        body.source_addr_ton = 1;
        body.destination_addr = "12345".to_string();
        body.short_message = Bytes::from_static(b"info weather");
        let original = DeliverSm {
            command_status: status::ESME_ROK,
            sequence_number: 11,
            body,
        };
        let bytes = original.to_bytes().unwrap();
        let mut cursor = Cursor::new(bytes.as_ref());
        let header = PduHeader::decode(&mut cursor).unwrap();
        assert_eq!(DeliverSm::decode(header, &mut cursor).unwrap(), original);
    }

    #[test]
    fn deliver_sm_resp_roundtrip() {
        let original = DeliverSmResp::ok(11);
        let bytes = original.to_bytes().unwrap();
        // header + empty message_id
        assert_eq!(bytes.len(), PduHeader::SIZE + 1);
        let mut cursor = Cursor::new(bytes.as_ref());
        let header = PduHeader::decode(&mut cursor).unwrap();
        assert_eq!(DeliverSmResp::decode(header, &mut cursor).unwrap(), original);
    }

    #[test]
    fn receipt_discrimination() {
        assert!(esm::is_delivery_receipt(0x04));
        // feature bits on top of the receipt type are still receipts
        assert!(esm::is_delivery_receipt(0x44));
        assert!(!esm::is_delivery_receipt(0x00));
        assert!(!esm::is_delivery_receipt(0x40)); // plain MO with UDH
        assert!(!esm::is_delivery_receipt(0x08));
    }
}
