// ABOUTME: Header-only PDUs: enquire_link, unbind, generic_nack and their responses

use crate::pdu::CommandId;
use crate::pdu::CommandStatus;
use crate::pdu::macros::impl_header_only_pdu;

/// enquire_link keepalive request (v3.4 section 4.11.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnquireLink {
    pub command_status: CommandStatus,
    pub sequence_number: u32,
}
impl_header_only_pdu!(EnquireLink, CommandId::EnquireLink);

/// enquire_link_resp (section 4.11.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnquireLinkResp {
    pub command_status: CommandStatus,
    pub sequence_number: u32,
}
impl_header_only_pdu!(EnquireLinkResp, CommandId::EnquireLinkResp);

/// unbind request (section 4.2.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unbind {
    pub command_status: CommandStatus,
    pub sequence_number: u32,
}
impl_header_only_pdu!(Unbind, CommandId::Unbind);

/// unbind_resp (section 4.2.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnbindResp {
    pub command_status: CommandStatus,
    pub sequence_number: u32,
}
impl_header_only_pdu!(UnbindResp, CommandId::UnbindResp);

/// generic_nack (section 4.3.1), the answer to malformed or unknown
/// request PDUs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenericNack {
    pub command_status: CommandStatus,
    pub sequence_number: u32,
}
impl_header_only_pdu!(GenericNack, CommandId::GenericNack);
