// ABOUTME: bind_transmitter / bind_receiver / bind_transceiver PDUs and responses
// ABOUTME: The three request bodies are identical; a macro stamps out each pair

use crate::codec::{
    CodecError, Decodable, Encodable, PduHeader, decode_cstring, decode_u8, encode_cstring,
};
use crate::pdu::{CommandId, CommandStatus};
use bytes::{BufMut, BytesMut};
use std::io::Cursor;

const MAX_SYSTEM_ID: usize = 16;
const MAX_PASSWORD: usize = 9;
const MAX_SYSTEM_TYPE: usize = 13;
const MAX_ADDRESS_RANGE: usize = 41;

macro_rules! bind_pdu {
    ($req:ident, $req_id:expr, $resp:ident, $resp_id:expr) => {
        /// Bind request body (v3.4 section 4.1): credentials, interface
        /// version (BCD, e.g. 0x34) and the address range served.
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $req {
            pub command_status: CommandStatus,
            pub sequence_number: u32,
            pub system_id: String,
            pub password: String,
            pub system_type: String,
            pub interface_version: u8,
            pub addr_ton: u8,
            pub addr_npi: u8,
            pub address_range: String,
        }

        impl Encodable for $req {
            fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
                PduHeader::new($req_id, self.command_status, self.sequence_number).encode(buf);
                encode_cstring(buf, &self.system_id, MAX_SYSTEM_ID, "system_id")?;
                encode_cstring(buf, &self.password, MAX_PASSWORD, "password")?;
                encode_cstring(buf, &self.system_type, MAX_SYSTEM_TYPE, "system_type")?;
                buf.put_u8(self.interface_version);
                buf.put_u8(self.addr_ton);
                buf.put_u8(self.addr_npi);
                encode_cstring(buf, &self.address_range, MAX_ADDRESS_RANGE, "address_range")?;
                Ok(())
            }
        }

        impl Decodable for $req {
            fn command_id() -> CommandId {
                $req_id
            }

            fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
                Self::validate_header(&header)?;
                Ok($req {
                    command_status: header.status(),
                    sequence_number: header.sequence_number,
                    system_id: decode_cstring(buf, MAX_SYSTEM_ID, "system_id")?,
                    password: decode_cstring(buf, MAX_PASSWORD, "password")?,
                    system_type: decode_cstring(buf, MAX_SYSTEM_TYPE, "system_type")?,
                    interface_version: decode_u8(buf)?,
                    addr_ton: decode_u8(buf)?,
                    addr_npi: decode_u8(buf)?,
                    address_range: decode_cstring(buf, MAX_ADDRESS_RANGE, "address_range")?,
                })
            }
        }

        /// Matching bind response; carries the SMSC's system_id on
        /// success, and only the header on failure.
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $resp {
            pub command_status: CommandStatus,
            pub sequence_number: u32,
            pub system_id: String,
        }

        impl $resp {
            pub fn ok(sequence_number: u32, system_id: &str) -> Self {
                $resp {
                    command_status: crate::pdu::status::ESME_ROK,
                    sequence_number,
                    system_id: system_id.to_string(),
                }
            }

            pub fn error(sequence_number: u32, status: CommandStatus) -> Self {
                $resp {
                    command_status: status,
                    sequence_number,
                    system_id: String::new(),
                }
            }
        }

        impl Encodable for $resp {
            fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
                PduHeader::new($resp_id, self.command_status, self.sequence_number).encode(buf);
                if self.command_status.is_ok() {
                    encode_cstring(buf, &self.system_id, MAX_SYSTEM_ID, "system_id")?;
                }
                Ok(())
            }
        }

        impl Decodable for $resp {
            fn command_id() -> CommandId {
                $resp_id
            }

            fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
                Self::validate_header(&header)?;
                // error responses legitimately omit the body
                let has_body = header.command_length as usize > PduHeader::SIZE;
                let system_id = if has_body {
                    decode_cstring(buf, MAX_SYSTEM_ID, "system_id")?
                } else {
                    String::new()
                };
                Ok($resp {
                    command_status: header.status(),
                    sequence_number: header.sequence_number,
                    system_id,
                })
            }
        }
    };
}

bind_pdu!(
    BindTransmitter,
    CommandId::BindTransmitter,
    BindTransmitterResp,
    CommandId::BindTransmitterResp
);
bind_pdu!(
    BindReceiver,
    CommandId::BindReceiver,
    BindReceiverResp,
    CommandId::BindReceiverResp
);
bind_pdu!(
    BindTransceiver,
    CommandId::BindTransceiver,
    BindTransceiverResp,
    CommandId::BindTransceiverResp
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::status;

    fn sample_bind() -> BindTransceiver {
        BindTransceiver {
            command_status: status::ESME_ROK,
            sequence_number: 1,
            system_id: "gateway".to_string(),
            password: "secret".to_string(),
            system_type: "VMA".to_string(),
            interface_version: 0x34,
            addr_ton: 0,
            addr_npi: 0,
            address_range: String::new(),
        }
    }

    #[test]
    fn bind_request_roundtrip() {
        let original = sample_bind();
        let bytes = original.to_bytes().unwrap();
        let mut cursor = Cursor::new(bytes.as_ref());
        let header = PduHeader::decode(&mut cursor).unwrap();
        assert_eq!(header.command(), Some(CommandId::BindTransceiver));
        let decoded = BindTransceiver::decode(header, &mut cursor).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn bind_wire_layout_is_null_terminated() {
        let bytes = sample_bind().to_bytes().unwrap();
        let body = &bytes[PduHeader::SIZE..];
        assert!(body.starts_with(b"gateway\0secret\0VMA\0"));
        assert_eq!(body[19], 0x34); // interface_version after the strings
    }

    #[test]
    fn oversized_credentials_do_not_encode() {
        let mut bind = sample_bind();
        bind.password = "far-too-long-password".to_string();
        assert!(bind.to_bytes().is_err());
    }

    #[test]
    fn bind_resp_roundtrip() {
        let original = BindTransmitterResp::ok(9, "SMSC");
        let bytes = original.to_bytes().unwrap();
        let mut cursor = Cursor::new(bytes.as_ref());
        let header = PduHeader::decode(&mut cursor).unwrap();
        let decoded = BindTransmitterResp::decode(header, &mut cursor).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn error_bind_resp_has_no_body() {
        let resp = BindTransceiverResp::error(4, status::ESME_RINVPASWD);
        let bytes = resp.to_bytes().unwrap();
        assert_eq!(bytes.len(), PduHeader::SIZE);

        let mut cursor = Cursor::new(bytes.as_ref());
        let header = PduHeader::decode(&mut cursor).unwrap();
        let decoded = BindTransceiverResp::decode(header, &mut cursor).unwrap();
        assert_eq!(decoded.command_status, status::ESME_RINVPASWD);
        assert!(decoded.system_id.is_empty());
    }
}
