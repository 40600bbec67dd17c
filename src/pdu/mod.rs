mod bind;
mod command_id;
pub mod command_status;
pub(crate) mod macros;
mod simple;
mod submit_sm;

pub mod deliver_sm;
mod tlv;

pub use bind::{
    BindReceiver, BindReceiverResp, BindTransceiver, BindTransceiverResp, BindTransmitter,
    BindTransmitterResp,
};
pub use command_id::CommandId;
pub use command_status::CommandStatus;
pub use command_status as status;
pub use deliver_sm::{DeliverSm, DeliverSmResp, esm};
pub use simple::{EnquireLink, EnquireLinkResp, GenericNack, Unbind, UnbindResp};
pub use submit_sm::{MAX_SERVICE_TYPE, MAX_SHORT_MESSAGE, SmBody, SubmitSm, SubmitSmResp};
pub use tlv::{Tlv, find_tlv, tags};

/// Type-of-number values (GSM 03.40 / SMPP 5.2.5).
pub mod ton {
    pub const UNKNOWN: u8 = 0;
    pub const INTERNATIONAL: u8 = 1;
    pub const NATIONAL: u8 = 2;
    pub const ALPHANUMERIC: u8 = 5;
}

/// Numbering-plan-indicator values (SMPP 5.2.6).
pub mod npi {
    pub const UNKNOWN: u8 = 0;
    pub const E164: u8 = 1;
}
