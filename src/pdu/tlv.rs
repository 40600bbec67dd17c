use crate::codec::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

// TLV tags the gateway cares about, per SMPP v3.4 section 5.3.2
pub mod tags {
    pub const USER_MESSAGE_REFERENCE: u16 = 0x0204;
    pub const SOURCE_PORT: u16 = 0x020A;
    pub const DESTINATION_PORT: u16 = 0x020C;
    pub const SAR_MSG_REF_NUM: u16 = 0x020E;
    pub const SAR_TOTAL_SEGMENTS: u16 = 0x020F;
    pub const SAR_SEGMENT_SEQNUM: u16 = 0x0210;
    pub const MESSAGE_PAYLOAD: u16 = 0x0424;
    pub const RECEIPTED_MESSAGE_ID: u16 = 0x001E;
    pub const MESSAGE_STATE: u16 = 0x0427;
    pub const NETWORK_ERROR_CODE: u16 = 0x0423;
}

/// One optional parameter: tag, length, value.
#[derive(Clone, Debug, PartialEq)]
pub struct Tlv {
    pub tag: u16,
    pub value: Bytes,
}

impl Tlv {
    pub fn new(tag: u16, value: impl Into<Bytes>) -> Self {
        Tlv {
            tag,
            value: value.into(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        if self.value.len() > u16::MAX as usize {
            return Err(CodecError::Tlv(format!(
                "TLV {:#06x} value of {} octets exceeds the 16-bit length field",
                self.tag,
                self.value.len()
            )));
        }
        buf.put_u16(self.tag);
        buf.put_u16(self.value.len() as u16);
        buf.put_slice(&self.value);
        Ok(())
    }

    pub fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        if buf.remaining() < 4 {
            return Err(CodecError::Tlv("truncated TLV header".to_string()));
        }
        let tag = buf.get_u16();
        let length = buf.get_u16() as usize;
        if buf.remaining() < length {
            return Err(CodecError::Tlv(format!(
                "TLV {tag:#06x} declares {length} octets, {} available",
                buf.remaining()
            )));
        }
        let value = buf.copy_to_bytes(length);
        Ok(Tlv { tag, value })
    }

    /// Decode all remaining TLVs up to `end` (absolute cursor position).
    pub fn decode_all(buf: &mut Cursor<&[u8]>, end: usize) -> Result<Vec<Tlv>, CodecError> {
        let mut tlvs = Vec::new();
        while (buf.position() as usize) < end {
            tlvs.push(Tlv::decode(buf)?);
        }
        Ok(tlvs)
    }
}

/// First TLV with the given tag, if any.
pub fn find_tlv(tlvs: &[Tlv], tag: u16) -> Option<&Tlv> {
    tlvs.iter().find(|t| t.tag == tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlv_roundtrip() {
        let tlv = Tlv::new(tags::RECEIPTED_MESSAGE_ID, Bytes::from_static(b"abc\0"));
        let mut buf = BytesMut::new();
        tlv.encode(&mut buf).unwrap();
        assert_eq!(&buf[..4], &[0x00, 0x1E, 0x00, 0x04]);

        let frozen = buf.freeze();
        let mut cursor = Cursor::new(frozen.as_ref());
        assert_eq!(Tlv::decode(&mut cursor).unwrap(), tlv);
    }

    #[test]
    fn tlv_empty_value() {
        let tlv = Tlv::new(0x0204, Bytes::new());
        let mut buf = BytesMut::new();
        tlv.encode(&mut buf).unwrap();
        assert_eq!(buf.as_ref(), &[0x02, 0x04, 0x00, 0x00]);
    }

    #[test]
    fn oversized_tlv_value_is_an_error() {
        let tlv = Tlv::new(tags::MESSAGE_PAYLOAD, Bytes::from(vec![0x42; 65536]));
        let mut buf = BytesMut::new();
        assert!(tlv.encode(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_tlv_is_an_error() {
        let data = [0x02u8, 0x04, 0x00, 0x08, 0x01];
        let mut cursor = Cursor::new(&data[..]);
        assert!(Tlv::decode(&mut cursor).is_err());
    }

    #[test]
    fn decode_all_consumes_to_end() {
        let mut buf = BytesMut::new();
        Tlv::new(0x0204, Bytes::from_static(&[0x00, 0x01]))
            .encode(&mut buf)
            .unwrap();
        Tlv::new(0x020A, Bytes::from_static(&[0x23, 0xF0]))
            .encode(&mut buf)
            .unwrap();
        let frozen = buf.freeze();
        let mut cursor = Cursor::new(frozen.as_ref());
        let tlvs = Tlv::decode_all(&mut cursor, frozen.len()).unwrap();
        assert_eq!(tlvs.len(), 2);
        assert!(find_tlv(&tlvs, 0x020A).is_some());
        assert!(find_tlv(&tlvs, 0x0423).is_none());
    }
}
