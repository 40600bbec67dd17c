// ABOUTME: Message envelope exchanged between the router core and the box processes
// ABOUTME: Implements the self-describing binary pack/unpack codec used on box links

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use thiserror::Error;

/// Sentinel for integer fields that carry no value on the wire.
pub const PARAM_UNDEFINED: i32 = -1;

/// Data coding of an SMS payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum Coding {
    #[default]
    Undef = 0,
    SevenBit = 1,
    EightBit = 2,
    Ucs2 = 3,
}

impl Coding {
    fn from_wire(v: i32) -> Result<Self, MsgError> {
        match v {
            0 => Ok(Coding::Undef),
            1 => Ok(Coding::SevenBit),
            2 => Ok(Coding::EightBit),
            3 => Ok(Coding::Ucs2),
            other => Err(MsgError::BadField("coding", other)),
        }
    }
}

/// Origin/purpose of an SMS message inside the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum SmsType {
    #[default]
    Mo = 0,
    MtReply = 1,
    MtPush = 2,
    Report = 3,
}

impl SmsType {
    fn from_wire(v: i32) -> Result<Self, MsgError> {
        match v {
            0 => Ok(SmsType::Mo),
            1 => Ok(SmsType::MtReply),
            2 => Ok(SmsType::MtPush),
            3 => Ok(SmsType::Report),
            other => Err(MsgError::BadField("sms_type", other)),
        }
    }
}

/// Delivery report outcome classes.
///
/// Also used as bit flags in `Sms::dlr_mask` to select which report
/// classes the sender is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DlrStatus {
    Success = 0x01,
    Fail = 0x02,
    Buffered = 0x04,
    SmscAck = 0x08,
    SmscReject = 0x10,
    Deleted = 0x20,
    Expired = 0x40,
}

impl DlrStatus {
    fn from_wire(v: i32) -> Result<Self, MsgError> {
        match v {
            0x01 => Ok(DlrStatus::Success),
            0x02 => Ok(DlrStatus::Fail),
            0x04 => Ok(DlrStatus::Buffered),
            0x08 => Ok(DlrStatus::SmscAck),
            0x10 => Ok(DlrStatus::SmscReject),
            0x20 => Ok(DlrStatus::Deleted),
            0x40 => Ok(DlrStatus::Expired),
            other => Err(MsgError::BadField("dlr status", other)),
        }
    }

    /// True for outcomes that terminate the report lifecycle of a message.
    pub fn is_final(self) -> bool {
        !matches!(self, DlrStatus::Buffered | DlrStatus::SmscAck)
    }
}

/// Returns true when `dlr_mask` requests device-level reports
/// (success, failure or buffered notifications from the handset side).
pub fn dlr_wants_device_ack(dlr_mask: i32) -> bool {
    dlr_mask > 0
        && dlr_mask
            & (DlrStatus::Success as i32 | DlrStatus::Fail as i32 | DlrStatus::Buffered as i32)
            != 0
}

/// Returns true when `dlr_mask` requests final success/fail reports,
/// which is what registered delivery on the SMSC link maps to.
pub fn dlr_wants_success_or_fail(dlr_mask: i32) -> bool {
    dlr_mask > 0 && dlr_mask & (DlrStatus::Success as i32 | DlrStatus::Fail as i32) != 0
}

/// Short message record.
///
/// Integer parameters use [`PARAM_UNDEFINED`] when unset; optional octet
/// strings are `None`. `msgdata` and `udhdata` are binary-safe, the
/// address and identifier fields are text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sms {
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub udhdata: Option<Bytes>,
    pub msgdata: Option<Bytes>,
    /// Unix time of reception, -1 when unknown.
    pub time: i32,
    pub smsc_id: Option<String>,
    pub service: Option<String>,
    pub binfo: Option<String>,
    pub id: i32,
    pub sms_type: SmsType,
    pub mclass: i32,
    pub mwi: i32,
    pub coding: Coding,
    pub compress: i32,
    /// Validity period in minutes, -1 for SMSC default.
    pub validity: i32,
    /// Deferred delivery in minutes, -1 for immediate.
    pub deferred: i32,
    pub dlr_mask: i32,
    pub dlr_url: Option<String>,
    pub pid: i32,
    pub alt_dcs: i32,
    pub rpi: i32,
    pub charset: Option<String>,
    pub boxc_id: Option<String>,
}

impl Sms {
    pub fn new() -> Self {
        Sms {
            time: PARAM_UNDEFINED,
            id: PARAM_UNDEFINED,
            mclass: PARAM_UNDEFINED,
            mwi: PARAM_UNDEFINED,
            compress: PARAM_UNDEFINED,
            validity: PARAM_UNDEFINED,
            deferred: PARAM_UNDEFINED,
            dlr_mask: PARAM_UNDEFINED,
            pid: PARAM_UNDEFINED,
            alt_dcs: PARAM_UNDEFINED,
            rpi: PARAM_UNDEFINED,
            ..Default::default()
        }
    }
}

/// Transfer acknowledgement between router and box.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ack {
    pub nack: i32,
    pub time: i32,
    pub id: i32,
}

/// Box load report; `load` is the queue depth of the producer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Heartbeat {
    pub load: i32,
}

/// Delivery report record as stored and correlated by the DLR store.
#[derive(Debug, Clone, PartialEq)]
pub struct DlrReport {
    pub smsc_id: Option<String>,
    pub smsc_message_id: Option<String>,
    pub destination: Option<String>,
    pub status: DlrStatus,
    pub timestamp: i32,
}

/// WAP datagram envelope; carried for box interop, the WAP stack itself
/// lives outside this crate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WdpDatagram {
    pub source_address: Option<String>,
    pub source_port: i32,
    pub destination_address: Option<String>,
    pub destination_port: i32,
    pub user_data: Option<Bytes>,
}

/// A message as it travels through the gateway.
///
/// The variant set is closed; pack, unpack and dump each match every
/// variant so the compiler flags any future addition.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Heartbeat(Heartbeat),
    Sms(Sms),
    Ack(Ack),
    WdpDatagram(WdpDatagram),
    DlrReport(DlrReport),
}

const TAG_HEARTBEAT: i32 = 0;
const TAG_SMS: i32 = 1;
const TAG_ACK: i32 = 2;
const TAG_WDP_DATAGRAM: i32 = 3;
const TAG_DLR_REPORT: i32 = 4;

#[derive(Debug, Error)]
pub enum MsgError {
    #[error("truncated message while reading {0}")]
    Truncated(&'static str),
    #[error("unknown message tag {0}")]
    UnknownTag(i32),
    #[error("invalid value {1} for field {0}")]
    BadField(&'static str, i32),
    #[error("negative octet string length {0}")]
    BadLength(i32),
    #[error("octet string field {0} is not valid UTF-8")]
    BadText(&'static str),
}

fn put_int(buf: &mut BytesMut, v: i32) {
    buf.put_i32(v);
}

fn put_octstr(buf: &mut BytesMut, v: Option<&[u8]>) {
    match v {
        Some(bytes) => {
            buf.put_i32(bytes.len() as i32);
            buf.put_slice(bytes);
        }
        None => buf.put_i32(-1),
    }
}

fn put_str(buf: &mut BytesMut, v: Option<&str>) {
    put_octstr(buf, v.map(str::as_bytes));
}

fn get_int(cur: &mut Cursor<&[u8]>, field: &'static str) -> Result<i32, MsgError> {
    if cur.remaining() < 4 {
        return Err(MsgError::Truncated(field));
    }
    Ok(cur.get_i32())
}

fn get_octstr(cur: &mut Cursor<&[u8]>, field: &'static str) -> Result<Option<Bytes>, MsgError> {
    let len = get_int(cur, field)?;
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(MsgError::BadLength(len));
    }
    let len = len as usize;
    if cur.remaining() < len {
        return Err(MsgError::Truncated(field));
    }
    Ok(Some(cur.copy_to_bytes(len)))
}

fn get_str(cur: &mut Cursor<&[u8]>, field: &'static str) -> Result<Option<String>, MsgError> {
    match get_octstr(cur, field)? {
        None => Ok(None),
        Some(bytes) => String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| MsgError::BadText(field)),
    }
}

impl Msg {
    /// Deep copy. The name mirrors the operation the connection contract
    /// requires from drivers that must keep a message beyond a call.
    pub fn duplicate(&self) -> Msg {
        self.clone()
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Msg::Heartbeat(_) => "heartbeat",
            Msg::Sms(_) => "sms",
            Msg::Ack(_) => "ack",
            Msg::WdpDatagram(_) => "wdp-datagram",
            Msg::DlrReport(_) => "dlr-report",
        }
    }

    /// Pack into the self-describing wire form: a variant tag followed by
    /// the variant's fields in declaration order. Integers are 32-bit
    /// big-endian signed; octet strings are a 32-bit length (-1 for
    /// absent) followed by the raw bytes.
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Msg::Heartbeat(h) => {
                put_int(&mut buf, TAG_HEARTBEAT);
                put_int(&mut buf, h.load);
            }
            Msg::Sms(s) => {
                put_int(&mut buf, TAG_SMS);
                put_str(&mut buf, s.sender.as_deref());
                put_str(&mut buf, s.receiver.as_deref());
                put_octstr(&mut buf, s.udhdata.as_deref());
                put_octstr(&mut buf, s.msgdata.as_deref());
                put_int(&mut buf, s.time);
                put_str(&mut buf, s.smsc_id.as_deref());
                put_str(&mut buf, s.service.as_deref());
                put_str(&mut buf, s.binfo.as_deref());
                put_int(&mut buf, s.id);
                put_int(&mut buf, s.sms_type as i32);
                put_int(&mut buf, s.mclass);
                put_int(&mut buf, s.mwi);
                put_int(&mut buf, s.coding as i32);
                put_int(&mut buf, s.compress);
                put_int(&mut buf, s.validity);
                put_int(&mut buf, s.deferred);
                put_int(&mut buf, s.dlr_mask);
                put_str(&mut buf, s.dlr_url.as_deref());
                put_int(&mut buf, s.pid);
                put_int(&mut buf, s.alt_dcs);
                put_int(&mut buf, s.rpi);
                put_str(&mut buf, s.charset.as_deref());
                put_str(&mut buf, s.boxc_id.as_deref());
            }
            Msg::Ack(a) => {
                put_int(&mut buf, TAG_ACK);
                put_int(&mut buf, a.nack);
                put_int(&mut buf, a.time);
                put_int(&mut buf, a.id);
            }
            Msg::WdpDatagram(d) => {
                put_int(&mut buf, TAG_WDP_DATAGRAM);
                put_str(&mut buf, d.source_address.as_deref());
                put_int(&mut buf, d.source_port);
                put_str(&mut buf, d.destination_address.as_deref());
                put_int(&mut buf, d.destination_port);
                put_octstr(&mut buf, d.user_data.as_deref());
            }
            Msg::DlrReport(r) => {
                put_int(&mut buf, TAG_DLR_REPORT);
                put_str(&mut buf, r.smsc_id.as_deref());
                put_str(&mut buf, r.smsc_message_id.as_deref());
                put_str(&mut buf, r.destination.as_deref());
                put_int(&mut buf, r.status as i32);
                put_int(&mut buf, r.timestamp);
            }
        }
        buf.freeze()
    }

    /// Unpack a message previously produced by [`Msg::pack`].
    ///
    /// Any length-check failure yields an error; the caller is expected
    /// to log and discard the message and keep the link running.
    pub fn unpack(data: &[u8]) -> Result<Msg, MsgError> {
        let mut cur = Cursor::new(data);
        let tag = get_int(&mut cur, "tag")?;
        let msg = match tag {
            TAG_HEARTBEAT => Msg::Heartbeat(Heartbeat {
                load: get_int(&mut cur, "load")?,
            }),
            TAG_SMS => {
                let mut s = Sms::new();
                s.sender = get_str(&mut cur, "sender")?;
                s.receiver = get_str(&mut cur, "receiver")?;
                s.udhdata = get_octstr(&mut cur, "udhdata")?;
                s.msgdata = get_octstr(&mut cur, "msgdata")?;
                s.time = get_int(&mut cur, "time")?;
                s.smsc_id = get_str(&mut cur, "smsc_id")?;
                s.service = get_str(&mut cur, "service")?;
                s.binfo = get_str(&mut cur, "binfo")?;
                s.id = get_int(&mut cur, "id")?;
                s.sms_type = SmsType::from_wire(get_int(&mut cur, "sms_type")?)?;
                s.mclass = get_int(&mut cur, "mclass")?;
                s.mwi = get_int(&mut cur, "mwi")?;
                s.coding = Coding::from_wire(get_int(&mut cur, "coding")?)?;
                s.compress = get_int(&mut cur, "compress")?;
                s.validity = get_int(&mut cur, "validity")?;
                s.deferred = get_int(&mut cur, "deferred")?;
                s.dlr_mask = get_int(&mut cur, "dlr_mask")?;
                s.dlr_url = get_str(&mut cur, "dlr_url")?;
                s.pid = get_int(&mut cur, "pid")?;
                s.alt_dcs = get_int(&mut cur, "alt_dcs")?;
                s.rpi = get_int(&mut cur, "rpi")?;
                s.charset = get_str(&mut cur, "charset")?;
                s.boxc_id = get_str(&mut cur, "boxc_id")?;
                Msg::Sms(s)
            }
            TAG_ACK => Msg::Ack(Ack {
                nack: get_int(&mut cur, "nack")?,
                time: get_int(&mut cur, "time")?,
                id: get_int(&mut cur, "id")?,
            }),
            TAG_WDP_DATAGRAM => Msg::WdpDatagram(WdpDatagram {
                source_address: get_str(&mut cur, "source_address")?,
                source_port: get_int(&mut cur, "source_port")?,
                destination_address: get_str(&mut cur, "destination_address")?,
                destination_port: get_int(&mut cur, "destination_port")?,
                user_data: get_octstr(&mut cur, "user_data")?,
            }),
            TAG_DLR_REPORT => Msg::DlrReport(DlrReport {
                smsc_id: get_str(&mut cur, "smsc_id")?,
                smsc_message_id: get_str(&mut cur, "smsc_message_id")?,
                destination: get_str(&mut cur, "destination")?,
                status: DlrStatus::from_wire(get_int(&mut cur, "status")?)?,
                timestamp: get_int(&mut cur, "timestamp")?,
            }),
            other => return Err(MsgError::UnknownTag(other)),
        };
        Ok(msg)
    }

    /// Log the message contents at debug level.
    pub fn dump(&self) {
        tracing::debug!("msg {}: {:?}", self.type_name(), self);
    }
}
