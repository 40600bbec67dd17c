//! Store-and-forward SMS gateway core.
//!
//! The crate routes short messages between SMS centers and application
//! boxes: a per-protocol driver framework with SMPP v3.3/3.4 as the
//! reference implementation, a connection framework with routing
//! filters and number normalization, framed box links, and a keyword
//! based service translation table.
//!
//! ```text
//! SMSC (wire) ── smsc::smpp ── smscconn ── router ─┬─ boxc ── smsbox worker
//! HTTP frontend ────────────── gateway ── router ──┘
//! ```
//!
//! [`gateway::Gateway::start`] wires everything from a parsed [`cfg::Cfg`].

pub mod boxc;
pub mod cfg;
pub mod charset;
pub mod codec;
pub mod connection;
pub mod dlr;
pub mod gateway;
pub mod msg;
pub mod pdu;
pub mod queue;
pub mod router;
pub mod smsbox;
pub mod smsc;
pub mod smscconn;
pub mod urltrans;

#[cfg(test)]
mod tests;

pub use codec::{CodecError, Decodable, Encodable, Frame, PduHeader};
pub use gateway::Gateway;
pub use msg::{Coding, DlrStatus, Msg, Sms, SmsType};
pub use smscconn::{FailReason, SmscConn, SmscConnStatus, SmscDriver, SmscEvent, StatusInfo};
pub use urltrans::{ServiceInvocation, TranslationTable};
