// ABOUTME: Macros cutting the boilerplate out of header-only PDU implementations

/// Implement Encodable/Decodable plus `new`/`error` constructors for a
/// PDU that consists of the 16-byte header and nothing else.
macro_rules! impl_header_only_pdu {
    ($pdu_type:ident, $command_id:expr) => {
        impl $crate::codec::Decodable for $pdu_type {
            fn command_id() -> $crate::pdu::CommandId {
                $command_id
            }

            fn decode(
                header: $crate::codec::PduHeader,
                _buf: &mut std::io::Cursor<&[u8]>,
            ) -> Result<Self, $crate::codec::CodecError> {
                Self::validate_header(&header)?;
                // some SMSCs pad header-only PDUs; anything after the
                // header is skipped by the frame layer
                Ok($pdu_type {
                    command_status: header.status(),
                    sequence_number: header.sequence_number,
                })
            }
        }

        impl $crate::codec::Encodable for $pdu_type {
            fn encode(
                &self,
                buf: &mut bytes::BytesMut,
            ) -> Result<(), $crate::codec::CodecError> {
                let header = $crate::codec::PduHeader::new(
                    $command_id,
                    self.command_status,
                    self.sequence_number,
                );
                header.encode(buf);
                Ok(())
            }
        }

        impl $pdu_type {
            pub fn new(sequence_number: u32) -> Self {
                Self {
                    command_status: $crate::pdu::status::ESME_ROK,
                    sequence_number,
                }
            }

            pub fn error(sequence_number: u32, status: $crate::pdu::CommandStatus) -> Self {
                Self {
                    command_status: status,
                    sequence_number,
                }
            }
        }
    };
}

pub(crate) use impl_header_only_pdu;
