// ABOUTME: SMPP command identifiers for the PDU set the gateway driver speaks
// ABOUTME: Bit 31 set marks a response PDU

use num_enum::TryFromPrimitive;

/// SMPP command identifiers (v3.4 Table 4-1 subset).
///
/// Bit 31 is the response indicator; bits 30-0 identify the operation.
/// Ids outside this set are carried opaquely by the frame layer and
/// answered with generic_nack.
#[derive(TryFromPrimitive)]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandId {
    GenericNack = 0x8000_0000,
    BindReceiver = 0x0000_0001,
    BindReceiverResp = 0x8000_0001,
    BindTransmitter = 0x0000_0002,
    BindTransmitterResp = 0x8000_0002,
    SubmitSm = 0x0000_0004,
    SubmitSmResp = 0x8000_0004,
    DeliverSm = 0x0000_0005,
    DeliverSmResp = 0x8000_0005,
    Unbind = 0x0000_0006,
    UnbindResp = 0x8000_0006,
    BindTransceiver = 0x0000_0009,
    BindTransceiverResp = 0x8000_0009,
    EnquireLink = 0x0000_0015,
    EnquireLinkResp = 0x8000_0015,
}

impl CommandId {
    pub fn is_response(self) -> bool {
        (self as u32) & 0x8000_0000 != 0
    }
}
