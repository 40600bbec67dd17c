// ABOUTME: SMPP 3.3/3.4 protocol driver: bind, windowed submit, DLR correlation, reconnect
// ABOUTME: One IO task per bound socket; a transceiver uses a single task for both directions

use crate::cfg::{CfgError, CfgGroup};
use crate::charset;
use crate::codec::Frame;
use crate::connection::Connection;
use crate::msg::{self, Coding, DlrStatus, Msg, PARAM_UNDEFINED, Sms, SmsType};
use crate::pdu::{self, CommandStatus, SmBody, Tlv, esm, find_tlv, npi, tags, ton};
use crate::queue::MsgQueue;
use crate::smscconn::{FailReason, KillReason, SmscConnStatus, SmscDriver};
use crate::smsc::ConnSetup;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep, timeout};
use tracing::{Instrument, debug, error, info, warn};

const DEFAULT_ENQUIRE_LINK_INTERVAL: u64 = 30;
const DEFAULT_MAX_PENDING_SUBMITS: usize = 10;
const DEFAULT_VERSION: u8 = 0x34;
const DEFAULT_PRIORITY: u8 = 0;
const DEFAULT_WAIT_ACK: u64 = 60;
const THROTTLING_SLEEP_TIME: Duration = Duration::from_secs(15);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
/// Wakeup granularity of the session loop for timer checks.
const TICK: Duration = Duration::from_millis(1000);

/// What to do with submits that never got their submit_sm_resp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitAckAction {
    Reconnect,
    Requeue,
    NeverExpire,
}

/// How the SMSC represents message ids in submit_sm_resp and
/// deliver_sm receipt texts. The default passes them through verbatim,
/// which is what the protocol specifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MsgIdType {
    #[default]
    AsIs,
    Numeric {
        submit_hex: bool,
        deliver_hex: bool,
    },
}

impl MsgIdType {
    fn normalize_submit(self, id: &str) -> String {
        match self {
            MsgIdType::AsIs => id.to_string(),
            MsgIdType::Numeric { submit_hex, .. } => parse_numeric_id(id, submit_hex),
        }
    }

    fn normalize_deliver(self, id: &str) -> String {
        match self {
            MsgIdType::AsIs => id.to_string(),
            MsgIdType::Numeric { deliver_hex, .. } => parse_numeric_id(id, deliver_hex),
        }
    }
}

fn parse_numeric_id(id: &str, hex: bool) -> String {
    let radix = if hex { 16 } else { 10 };
    i64::from_str_radix(id.trim(), radix)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| {
            warn!("unparseable numeric message id <{id}>, passing through");
            id.to_string()
        })
}

/// SMPP driver configuration, from an `smsc` group.
#[derive(Debug, Clone)]
pub struct SmppConfig {
    pub host: String,
    pub port: u16,
    pub receive_port: u16,
    pub transceiver_mode: bool,
    pub username: String,
    pub password: String,
    pub system_type: String,
    pub address_range: String,
    pub my_number: Option<String>,
    pub service_type: String,
    pub source_addr_ton: Option<u8>,
    pub source_addr_npi: Option<u8>,
    pub dest_addr_ton: Option<u8>,
    pub dest_addr_npi: Option<u8>,
    pub autodetect_addr: bool,
    pub interface_version: u8,
    pub priority: u8,
    pub enquire_link_interval: Duration,
    pub max_pending_submits: usize,
    pub msg_id_type: MsgIdType,
    pub alt_charset: Option<String>,
    pub connection_timeout: Duration,
    pub wait_ack: Duration,
    pub wait_ack_action: WaitAckAction,
}

const SMPP_GROUP_KEYS: &[&str] = &[
    // framework-level keys
    "smsc",
    "smsc-id",
    "allowed-smsc-id",
    "denied-smsc-id",
    "preferred-smsc-id",
    "allowed-smsc-id-regex",
    "denied-smsc-id-regex",
    "allowed-prefix",
    "denied-prefix",
    "preferred-prefix",
    "allowed-prefix-regex",
    "denied-prefix-regex",
    "preferred-prefix-regex",
    "unified-prefix",
    "our-host",
    "log-file",
    "log-level",
    "alt-dcs",
    "throughput",
    "reconnect-delay",
    "reroute",
    "reroute-smsc-id",
    "reroute-receiver",
    // smpp driver keys
    "host",
    "port",
    "receive-port",
    "transceiver-mode",
    "smsc-username",
    "smsc-password",
    "system-type",
    "address-range",
    "my-number",
    "service-type",
    "source-addr-ton",
    "source-addr-npi",
    "dest-addr-ton",
    "dest-addr-npi",
    "source-addr-autodetect",
    "interface-version",
    "priority",
    "msg-id-type",
    "alt-charset",
    "enquire-link-interval",
    "max-pending-submits",
    "connection-timeout",
    "wait-ack",
    "wait-ack-expire",
];

impl SmppConfig {
    pub fn from_group(grp: &CfgGroup) -> Result<Self, CfgError> {
        grp.check_allowed(SMPP_GROUP_KEYS);

        let bad = |key: &str, value: &str| CfgError::BadValue {
            group: grp.name().to_string(),
            key: key.to_string(),
            value: value.to_string(),
        };

        let host = grp.require("host")?;
        let port = grp.get_integer("port")?.unwrap_or(0) as u16;
        let receive_port = grp.get_integer("receive-port")?.unwrap_or(0) as u16;

        // credentials must fit their bind PDU slots, otherwise every
        // bind attempt would fail at the encoder
        let username = grp.require("smsc-username")?;
        if username.len() > 15 {
            return Err(bad("smsc-username", &username));
        }
        let password = grp.require("smsc-password")?;
        if password.len() > 8 {
            return Err(bad("smsc-password", &password));
        }
        let system_type = grp.get_string("system-type").unwrap_or_else(|| "VMA".into());
        if system_type.len() > 12 {
            return Err(bad("system-type", &system_type));
        }

        let service_type = grp.get_string("service-type").unwrap_or_default();
        if service_type.len() > pdu::MAX_SERVICE_TYPE {
            return Err(bad("service-type", &service_type));
        }

        let interface_version = match grp.get_integer("interface-version")? {
            None => DEFAULT_VERSION,
            // configured in decimal, carried as BCD on the wire
            Some(v) => (((v / 10) << 4) + (v % 10)) as u8,
        };

        let msg_id_type = match grp.get_integer("msg-id-type")? {
            None => MsgIdType::AsIs,
            Some(v @ 0..=3) => MsgIdType::Numeric {
                submit_hex: v & 0x01 != 0,
                deliver_hex: v & 0x02 != 0,
            },
            Some(v) => return Err(bad("msg-id-type", &v.to_string())),
        };

        let enquire_link_interval = Duration::from_secs(
            grp.get_integer("enquire-link-interval")?
                .unwrap_or(DEFAULT_ENQUIRE_LINK_INTERVAL as i64)
                .max(1) as u64,
        );
        let connection_timeout = Duration::from_secs(
            grp.get_integer("connection-timeout")?
                .unwrap_or(10 * enquire_link_interval.as_secs() as i64)
                .max(0) as u64,
        );
        let wait_ack = Duration::from_secs(
            grp.get_integer("wait-ack")?
                .unwrap_or(DEFAULT_WAIT_ACK as i64)
                .max(1) as u64,
        );
        let wait_ack_action = match grp.get("wait-ack-expire") {
            None => WaitAckAction::Requeue,
            Some("reconnect") => WaitAckAction::Reconnect,
            Some("requeue") => WaitAckAction::Requeue,
            Some("never-expire") => WaitAckAction::NeverExpire,
            Some(v) => return Err(bad("wait-ack-expire", v)),
        };

        let priority = match grp.get_integer("priority")?.unwrap_or(DEFAULT_PRIORITY as i64) {
            p @ 0..=5 => p as u8,
            _ => DEFAULT_PRIORITY,
        };

        let opt_u8 = |key: &str| -> Result<Option<u8>, CfgError> {
            Ok(grp.get_integer(key)?.map(|v| v as u8))
        };

        Ok(SmppConfig {
            host,
            port,
            receive_port,
            transceiver_mode: grp.get_bool("transceiver-mode")?.unwrap_or(false),
            username,
            password,
            system_type,
            address_range: grp.get_string("address-range").unwrap_or_default(),
            my_number: grp.get_string("my-number"),
            service_type,
            source_addr_ton: opt_u8("source-addr-ton")?,
            source_addr_npi: opt_u8("source-addr-npi")?,
            dest_addr_ton: opt_u8("dest-addr-ton")?,
            dest_addr_npi: opt_u8("dest-addr-npi")?,
            autodetect_addr: grp.get_bool("source-addr-autodetect")?.unwrap_or(true),
            interface_version,
            priority,
            enquire_link_interval,
            max_pending_submits: grp
                .get_integer("max-pending-submits")?
                .unwrap_or(DEFAULT_MAX_PENDING_SUBMITS as i64)
                .max(1) as usize,
            msg_id_type,
            alt_charset: grp.get_string("alt-charset"),
            connection_timeout,
            wait_ack,
            wait_ack_action,
        })
    }

    /// Descriptive connection name, also the default smsc-id.
    pub fn connection_name(&self) -> String {
        format!(
            "SMPP:{}:{}/{}:{}:{}",
            self.host,
            self.port,
            if self.receive_port != 0 {
                self.receive_port
            } else {
                self.port
            },
            self.username,
            self.system_type
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindMode {
    Transmitter,
    Receiver,
    Transceiver,
}

impl BindMode {
    fn transmitting(self) -> bool {
        !matches!(self, BindMode::Receiver)
    }
}

struct SmppCore {
    cfg: SmppConfig,
    setup: ConnSetup,
    queue: MsgQueue<Msg>,
    sequence: AtomicU32,
    quitting: AtomicBool,
    finish_sending: AtomicBool,
}

impl SmppCore {
    fn id(&self) -> &str {
        &self.setup.id
    }

    fn quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    /// Next sequence number; monotonic, wraps above 2^31-1 back to 1.
    fn next_seq(&self) -> u32 {
        let mut prev = self.sequence.load(Ordering::Relaxed);
        loop {
            let next = if prev >= 0x7FFF_FFFF { 1 } else { prev + 1 };
            match self.sequence.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(now) => prev = now,
            }
        }
    }
}

/// The SMPP protocol driver behind one [`crate::smscconn::SmscConn`].
pub struct SmppDriver {
    core: Arc<SmppCore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SmppDriver {
    pub fn create(cfg: SmppConfig, setup: ConnSetup) -> Self {
        let core = Arc::new(SmppCore {
            cfg,
            setup,
            queue: MsgQueue::new(),
            sequence: AtomicU32::new(0),
            quitting: AtomicBool::new(false),
            finish_sending: AtomicBool::new(false),
        });
        core.queue.add_producer();

        // each IO task carries the connection identity in its span; a
        // subscriber can route these to the connection's own log file
        let conn_span = || {
            tracing::info_span!(
                "smsc",
                id = %core.setup.id,
                log_file = core.setup.log_file.as_deref().unwrap_or(""),
                log_level = core.setup.log_level,
            )
        };

        let mut io_tasks = Vec::new();
        if core.cfg.port != 0 {
            let mode = if core.cfg.transceiver_mode {
                BindMode::Transceiver
            } else {
                BindMode::Transmitter
            };
            io_tasks.push(tokio::spawn(
                io_loop(core.clone(), mode).instrument(conn_span()),
            ));
        }
        if core.cfg.receive_port != 0 && !core.cfg.transceiver_mode {
            io_tasks.push(tokio::spawn(
                io_loop(core.clone(), BindMode::Receiver).instrument(conn_span()),
            ));
        }

        // supervisor: the connection is dead once every IO task is done
        let supervisor = {
            let core = core.clone();
            tokio::spawn(async move {
                for task in io_tasks {
                    let _ = task.await;
                }
                core.setup.state.set_status(SmscConnStatus::Dead);
                let reason = core
                    .setup
                    .state
                    .why_killed()
                    .unwrap_or(KillReason::Shutdown);
                core.setup.events.killed(reason);
                info!("SMPP[{}]: connection now dead", core.id());
            })
        };

        SmppDriver {
            core,
            tasks: Mutex::new(vec![supervisor]),
        }
    }
}

impl SmscDriver for SmppDriver {
    fn send_msg(&self, msg: Msg) -> Result<(), Msg> {
        if self.core.quitting() {
            return Err(msg);
        }
        self.core.queue.produce(msg);
        Ok(())
    }

    fn shutdown(&self, finish_sending: bool) {
        debug!(
            "SMPP[{}]: shutting down ({})",
            self.core.id(),
            if finish_sending { "slow" } else { "instant" }
        );
        self.core
            .finish_sending
            .store(finish_sending, Ordering::SeqCst);
        self.core.setup.state.kill(KillReason::Shutdown);
        if !self.core.quitting.swap(true, Ordering::SeqCst) {
            // wake any session blocked on the queue
            self.core.queue.remove_producer();
        }
    }

    fn queued(&self) -> usize {
        self.core.queue.len()
    }
}

impl Drop for SmppDriver {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

struct PendingSubmit {
    sent_at: Instant,
    msg: Msg,
}

enum Wake {
    Frame(Result<Option<Frame>, crate::codec::CodecError>),
    Queued(Option<Msg>),
    Tick,
}

enum SessionEnd {
    /// Transport lost or protocol forced a reconnect.
    Reconnect,
    /// Orderly unbind completed or shutdown in progress.
    Closed,
}

/// Main IO loop for one socket: connect, bind, run the session, fail
/// whatever is left, reconnect until shutdown.
async fn io_loop(core: Arc<SmppCore>, mode: BindMode) {
    let id = core.setup.id.clone();
    while !core.quitting() {
        core.setup.state.mark_connecting();
        let port = if mode == BindMode::Receiver {
            core.cfg.receive_port
        } else {
            core.cfg.port
        };

        match Connection::open(&core.cfg.host, port, core.setup.our_host.as_deref()).await {
            Ok(mut conn) => {
                if let Err(e) = send_bind(&core, &mut conn, mode).await {
                    error!("SMPP[{id}]: failed to send bind: {e}");
                } else {
                    let mut session = Session::new(&core, mode);
                    let _ = session.run(&mut conn).await;
                    session.fail_leftovers();
                }
            }
            Err(e) => {
                error!("SMPP[{id}]: couldn't connect to server: {e}");
            }
        }

        // messages that queued up while the link was down
        if mode.transmitting() {
            fail_queued(&core);
        }

        if core.quitting() {
            break;
        }
        error!(
            "SMPP[{id}]: connection lost, retrying in {} seconds",
            core.setup.reconnect_delay.as_secs()
        );
        core.setup.state.set_status(SmscConnStatus::Reconnecting);
        sleep(core.setup.reconnect_delay).await;
    }

    if mode.transmitting() {
        fail_queued(&core);
    }
    core.setup.state.set_status(SmscConnStatus::Disconnected);
}

fn fail_queued(core: &SmppCore) {
    let reason = if core.quitting() {
        FailReason::Shutdown
    } else {
        FailReason::Temporary
    };
    for msg in core.queue.extract_all() {
        core.setup.events.send_failed(msg, reason);
    }
}

async fn send_bind(
    core: &SmppCore,
    conn: &mut Connection,
    mode: BindMode,
) -> Result<(), crate::codec::CodecError> {
    let seq = core.next_seq();
    let cfg = &core.cfg;
    let frame = match mode {
        BindMode::Transmitter => Frame::BindTransmitter(pdu::BindTransmitter {
            command_status: pdu::status::ESME_ROK,
            sequence_number: seq,
            system_id: cfg.username.clone(),
            password: cfg.password.clone(),
            system_type: cfg.system_type.clone(),
            interface_version: cfg.interface_version,
            addr_ton: ton::UNKNOWN,
            addr_npi: npi::UNKNOWN,
            address_range: cfg.address_range.clone(),
        }),
        BindMode::Receiver => Frame::BindReceiver(pdu::BindReceiver {
            command_status: pdu::status::ESME_ROK,
            sequence_number: seq,
            system_id: cfg.username.clone(),
            password: cfg.password.clone(),
            system_type: cfg.system_type.clone(),
            interface_version: cfg.interface_version,
            addr_ton: ton::UNKNOWN,
            addr_npi: npi::UNKNOWN,
            address_range: cfg.address_range.clone(),
        }),
        BindMode::Transceiver => Frame::BindTransceiver(pdu::BindTransceiver {
            command_status: pdu::status::ESME_ROK,
            sequence_number: seq,
            system_id: cfg.username.clone(),
            password: cfg.password.clone(),
            system_type: cfg.system_type.clone(),
            interface_version: cfg.interface_version,
            addr_ton: ton::UNKNOWN,
            addr_npi: npi::UNKNOWN,
            address_range: cfg.address_range.clone(),
        }),
    };
    debug!("SMPP[{}]: sending bind, seq {seq}", core.id());
    conn.write_frame(&frame).await
}

struct Session<'a> {
    core: &'a SmppCore,
    mode: BindMode,
    pending: HashMap<u32, PendingSubmit>,
    bound: bool,
    last_enquire: Instant,
    last_pdu: Instant,
    last_cleanup: Instant,
    throttle_until: Option<Instant>,
    quit_started: Option<Instant>,
}

impl<'a> Session<'a> {
    fn new(core: &'a SmppCore, mode: BindMode) -> Self {
        let now = Instant::now();
        Session {
            core,
            mode,
            pending: HashMap::new(),
            bound: false,
            last_enquire: now,
            last_pdu: now,
            last_cleanup: now,
            throttle_until: None,
            quit_started: None,
        }
    }

    fn id(&self) -> &str {
        self.core.id()
    }

    fn can_send(&self) -> bool {
        if !self.mode.transmitting() || !self.bound {
            return false;
        }
        if self.pending.len() >= self.core.cfg.max_pending_submits {
            return false;
        }
        if let Some(until) = self.throttle_until {
            if Instant::now() < until {
                return false;
            }
        }
        if self.core.quitting() {
            // drain the queue on a slow shutdown, but once it is empty
            // the producer side is gone and consume would spin
            if !self.core.finish_sending.load(Ordering::SeqCst) || self.core.queue.is_empty() {
                return false;
            }
        }
        true
    }

    async fn run(&mut self, conn: &mut Connection) -> SessionEnd {
        loop {
            if self.core.quitting() {
                let started = *self.quit_started.get_or_insert_with(Instant::now);
                let draining = self.core.finish_sending.load(Ordering::SeqCst)
                    && self.mode.transmitting()
                    && (!self.core.queue.is_empty() || !self.pending.is_empty());
                if !draining || started.elapsed() > SHUTDOWN_TIMEOUT {
                    return self.unbind_and_drain(conn).await;
                }
            }

            if self.last_enquire.elapsed() >= self.core.cfg.enquire_link_interval {
                self.last_enquire = Instant::now();
                let seq = self.core.next_seq();
                debug!("SMPP[{}]: sending enquire_link, seq {seq}", self.id());
                if conn
                    .write_frame(&Frame::EnquireLink(pdu::EnquireLink::new(seq)))
                    .await
                    .is_err()
                {
                    return SessionEnd::Reconnect;
                }
            }

            if self.core.cfg.connection_timeout > Duration::ZERO
                && self.last_pdu.elapsed() > self.core.cfg.connection_timeout
            {
                error!(
                    "SMPP[{}]: no PDUs from SMSC within {} seconds, reconnecting",
                    self.id(),
                    self.core.cfg.connection_timeout.as_secs()
                );
                return SessionEnd::Reconnect;
            }

            if self.mode.transmitting()
                && self.bound
                && self.last_cleanup.elapsed() > self.core.cfg.wait_ack
            {
                self.last_cleanup = Instant::now();
                if self.cleanup_pending() {
                    return SessionEnd::Reconnect;
                }
            }

            // the borrow of `conn` held by the read future must end
            // before a handler can write responses, so the select only
            // picks the wakeup and the work happens after it
            let wake = tokio::select! {
                res = conn.read_frame() => Wake::Frame(res),
                maybe_msg = self.core.queue.consume(), if self.can_send() => {
                    Wake::Queued(maybe_msg)
                }
                _ = sleep(TICK) => Wake::Tick,
            };

            match wake {
                Wake::Frame(Ok(Some(frame))) => {
                    self.last_pdu = Instant::now();
                    match self.handle_frame(conn, frame).await {
                        Ok(true) => {}
                        Ok(false) => return SessionEnd::Closed,
                        Err(_) => return SessionEnd::Reconnect,
                    }
                }
                Wake::Frame(Ok(None)) => {
                    debug!("SMPP[{}]: SMSC closed the connection", self.id());
                    return SessionEnd::Reconnect;
                }
                Wake::Frame(Err(e)) => {
                    error!("SMPP[{}]: read error: {e}", self.id());
                    return SessionEnd::Reconnect;
                }
                Wake::Queued(Some(msg)) => {
                    if self.submit_one(conn, msg).await.is_err() {
                        return SessionEnd::Reconnect;
                    }
                }
                // producers gone, shutdown checks run at the loop top
                Wake::Queued(None) => {}
                Wake::Tick => {}
            }
        }
    }

    /// Unbind handshake: send unbind, then read until unbind_resp, EOF
    /// or the shutdown timeout.
    async fn unbind_and_drain(&mut self, conn: &mut Connection) -> SessionEnd {
        let seq = self.core.next_seq();
        debug!("SMPP[{}]: sending unbind, seq {seq}", self.id());
        if conn
            .write_frame(&Frame::Unbind(pdu::Unbind::new(seq)))
            .await
            .is_err()
        {
            return SessionEnd::Closed;
        }
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while Instant::now() < deadline {
            match timeout(Duration::from_secs(1), conn.read_frame()).await {
                Ok(Ok(Some(frame))) => match self.handle_frame(conn, frame).await {
                    Ok(true) => {
                        if self.core.setup.state.status() == SmscConnStatus::Disconnected {
                            break;
                        }
                    }
                    _ => break,
                },
                Ok(_) => break,
                Err(_) => continue,
            }
        }
        debug!("SMPP[{}]: unbind complete, closing", self.id());
        SessionEnd::Closed
    }

    /// After the session ends, every message still awaiting an ack gets
    /// its terminal callback.
    fn fail_leftovers(&mut self) {
        let reason = if self.core.quitting() {
            FailReason::Shutdown
        } else {
            FailReason::Temporary
        };
        for (_, pending) in self.pending.drain() {
            self.core.setup.events.send_failed(pending.msg, reason);
        }
    }

    /// Sweep the pending-ack map for overdue submits. Returns true when
    /// the configured action demands a reconnect.
    fn cleanup_pending(&mut self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        match self.core.cfg.wait_ack_action {
            WaitAckAction::NeverExpire => false,
            WaitAckAction::Reconnect => {
                let overdue = self
                    .pending
                    .values()
                    .any(|p| p.sent_at.elapsed() > self.core.cfg.wait_ack);
                if overdue {
                    warn!("SMPP[{}]: not ACKED message found, reconnecting", self.id());
                }
                overdue
            }
            WaitAckAction::Requeue => {
                let wait_ack = self.core.cfg.wait_ack;
                let expired: Vec<u32> = self
                    .pending
                    .iter()
                    .filter(|(_, p)| p.sent_at.elapsed() > wait_ack)
                    .map(|(&seq, _)| seq)
                    .collect();
                for seq in expired {
                    if let Some(p) = self.pending.remove(&seq) {
                        warn!(
                            "SMPP[{}]: not ACKED message found, will retransmit; seq <{seq}>",
                            self.id()
                        );
                        self.core.setup.events.send_failed(p.msg, FailReason::Temporary);
                    }
                }
                false
            }
        }
    }

    /// Build and write one submit_sm, recording it in the pending map.
    async fn submit_one(&mut self, conn: &mut Connection, msg: Msg) -> Result<(), ()> {
        let Msg::Sms(sms) = &msg else {
            warn!("SMPP[{}]: non-sms message in send queue, dropped", self.id());
            return Ok(());
        };
        let seq = self.core.next_seq();
        let Some(body) = msg_to_pdu(self.core, sms) else {
            self.core
                .setup
                .events
                .send_failed(msg, FailReason::Malformed);
            return Ok(());
        };
        let submit = pdu::SubmitSm {
            command_status: pdu::status::ESME_ROK,
            sequence_number: seq,
            body,
        };
        debug!("SMPP[{}]: sending submit_sm, seq {seq}", self.id());
        match conn.write_frame(&Frame::SubmitSm(Box::new(submit))).await {
            Ok(()) => {
                self.pending.insert(
                    seq,
                    PendingSubmit {
                        sent_at: Instant::now(),
                        msg,
                    },
                );
                if self.core.setup.throughput > 0 {
                    sleep(Duration::from_secs_f64(
                        1.0 / self.core.setup.throughput as f64,
                    ))
                    .await;
                }
                Ok(())
            }
            Err(e) => {
                error!("SMPP[{}]: write error on submit: {e}", self.id());
                self.core
                    .setup
                    .events
                    .send_failed(msg, FailReason::Temporary);
                Err(())
            }
        }
    }

    /// Dispatch one inbound PDU. `Ok(true)` keeps the session running,
    /// `Ok(false)` closes it cleanly, `Err` forces a reconnect.
    async fn handle_frame(&mut self, conn: &mut Connection, frame: Frame) -> Result<bool, ()> {
        match frame {
            Frame::DeliverSm(deliver) => {
                let resp = self.handle_deliver_sm(*deliver);
                conn.write_frame(&Frame::DeliverSmResp(resp))
                    .await
                    .map_err(|_| ())?;
                Ok(true)
            }
            Frame::EnquireLink(el) => {
                conn.write_frame(&Frame::EnquireLinkResp(pdu::EnquireLinkResp::new(
                    el.sequence_number,
                )))
                .await
                .map_err(|_| ())?;
                Ok(true)
            }
            Frame::EnquireLinkResp(_) => Ok(true),
            Frame::SubmitSmResp(resp) => {
                self.handle_submit_resp(resp.sequence_number, resp.command_status, &resp.message_id);
                Ok(true)
            }
            Frame::GenericNack(nack) => {
                self.handle_submit_resp(nack.sequence_number, nack.command_status, "");
                Ok(true)
            }
            Frame::BindTransmitterResp(resp) => {
                self.handle_bind_resp(resp.command_status, false)
            }
            Frame::BindTransceiverResp(resp) => {
                self.handle_bind_resp(resp.command_status, false)
            }
            Frame::BindReceiverResp(resp) => self.handle_bind_resp(resp.command_status, true),
            Frame::Unbind(unbind) => {
                conn.write_frame(&Frame::UnbindResp(pdu::UnbindResp::new(
                    unbind.sequence_number,
                )))
                .await
                .map_err(|_| ())?;
                self.core
                    .setup
                    .state
                    .set_status(SmscConnStatus::Disconnected);
                Ok(false)
            }
            Frame::UnbindResp(_) => {
                self.core
                    .setup
                    .state
                    .set_status(SmscConnStatus::Disconnected);
                Ok(false)
            }
            other @ (Frame::BindTransmitter(_)
            | Frame::BindReceiver(_)
            | Frame::BindTransceiver(_)
            | Frame::SubmitSm(_)
            | Frame::DeliverSmResp(_)) => {
                warn!(
                    "SMPP[{}]: unexpected PDU {:#010x} ignored",
                    self.id(),
                    other.command_id()
                );
                Ok(true)
            }
            Frame::Unknown { header, .. } => {
                error!(
                    "SMPP[{}]: unknown PDU type {:#010x}, sending generic_nack",
                    self.id(),
                    header.command_id
                );
                conn.write_frame(&Frame::GenericNack(pdu::GenericNack::error(
                    header.sequence_number,
                    pdu::status::ESME_RINVCMDID,
                )))
                .await
                .map_err(|_| ())?;
                Ok(true)
            }
        }
    }

    fn handle_bind_resp(&mut self, status: CommandStatus, receiver: bool) -> Result<bool, ()> {
        if !status.is_ok() {
            error!("SMPP[{}]: SMSC rejected login, {status}", self.id());
            if status.is_credential_failure() {
                self.core.quitting.store(true, Ordering::SeqCst);
                self.core.setup.state.kill(KillReason::WrongPassword);
            }
            return Err(());
        }
        if receiver {
            // do not clobber Active when a transmitter link is up too
            if self.core.setup.state.status() != SmscConnStatus::Active {
                self.core.setup.state.mark_connected(SmscConnStatus::ActiveRecv);
            }
        } else {
            self.bound = true;
            self.core.setup.state.mark_connected(SmscConnStatus::Active);
            self.core.setup.events.connected();
        }
        info!("SMPP[{}]: bind successful", self.id());
        Ok(true)
    }

    fn handle_submit_resp(&mut self, seq: u32, status: CommandStatus, message_id: &str) {
        let Some(pending) = self.pending.remove(&seq) else {
            warn!(
                "SMPP[{}]: SMSC sent submit_sm_resp with wrong sequence number {seq:#010x}",
                self.id()
            );
            return;
        };
        if !status.is_ok() {
            error!(
                "SMPP[{}]: SMSC returned error code {status} in response to submit_sm",
                self.id()
            );
            if status == pdu::status::ESME_RTHROTTLED {
                self.throttle_until = Some(Instant::now() + THROTTLING_SLEEP_TIME);
            } else {
                self.throttle_until = None;
            }
            let reason = if status.is_temporary() {
                FailReason::Temporary
            } else {
                FailReason::Rejected
            };
            self.core.setup.events.send_failed(pending.msg, reason);
            return;
        }

        let msg_id = self.core.cfg.msg_id_type.normalize_submit(message_id);
        if let Msg::Sms(sms) = &pending.msg {
            if msg::dlr_wants_device_ack(sms.dlr_mask) {
                self.core.setup.dlr.add(self.id(), &msg_id, &pending.msg);
            }
        }
        self.core.setup.events.sent(pending.msg);
    }

    fn handle_deliver_sm(&mut self, deliver: pdu::DeliverSm) -> pdu::DeliverSmResp {
        let seq = deliver.sequence_number;
        if self.core.setup.state.is_stopped() || self.core.quitting() {
            // tell the SMSC to retry later
            return pdu::DeliverSmResp::error(seq, pdu::status::ESME_RX_T_APPN);
        }

        if esm::is_delivery_receipt(deliver.body.esm_class) {
            debug!("SMPP[{}]: got DLR", self.id());
            self.handle_receipt(&deliver.body);
            // missed or uninteresting DLRs are acknowledged anyway
            return pdu::DeliverSmResp::ok(seq);
        }

        match pdu_to_msg(self.core, &deliver.body) {
            Err(reason) => pdu::DeliverSmResp::error(seq, reason),
            Ok(mut sms) => {
                if let Some(my_number) = &self.core.cfg.my_number {
                    sms.receiver = Some(my_number.clone());
                }
                sms.time = unix_now();
                sms.smsc_id = Some(self.id().to_string());
                self.core.setup.events.received(Msg::Sms(sms));
                pdu::DeliverSmResp::ok(seq)
            }
        }
    }

    fn handle_receipt(&mut self, body: &SmBody) {
        let raw = if !body.short_message.is_empty() {
            body.short_message.clone()
        } else {
            find_tlv(&body.tlvs, tags::MESSAGE_PAYLOAD)
                .map(|tlv| tlv.value.clone())
                .unwrap_or_default()
        };
        let text = String::from_utf8_lossy(&raw).into_owned();
        let msgid = parse_receipt_field(&text, "id:");
        let stat = parse_receipt_field(&text, "stat:");

        let dlr_status = match stat.as_deref() {
            Some("DELIVRD") => DlrStatus::Success,
            Some("ACKED") | Some("ENROUTE") | Some("ACCEPTD") | Some("BUFFRED") => {
                DlrStatus::Buffered
            }
            _ => DlrStatus::Fail,
        };

        let Some(raw_id) = msgid else {
            error!(
                "SMPP[{}]: got DLR without message id, ignored: {text}",
                self.id()
            );
            return;
        };
        let msg_id = self.core.cfg.msg_id_type.normalize_deliver(&raw_id);

        match self.core.setup.dlr.find(
            self.id(),
            &msg_id,
            &body.destination_addr,
            dlr_status,
        ) {
            Some(Msg::Sms(mut sms)) => {
                sms.msgdata = Some(Bytes::copy_from_slice(text.as_bytes()));
                sms.sms_type = SmsType::Report;
                sms.time = unix_now();
                self.core.setup.events.received(Msg::Sms(sms));
            }
            _ => {
                error!(
                    "SMPP[{}]: got DLR but could not find message or was not interested in it",
                    self.id()
                );
            }
        }
    }
}

/// Extract a `key:value` field from a delivery receipt text; the value
/// runs to the next space or the end of the text.
fn parse_receipt_field(text: &str, key: &str) -> Option<String> {
    let start = text.find(key)? + key.len();
    let rest = &text[start..];
    let value = rest.split(' ').next().unwrap_or(rest);
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn unix_now() -> i32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i32)
        .unwrap_or(PARAM_UNDEFINED)
}

/// Decode the DCS groups that carry structured fields (message class,
/// message-waiting indication, compression) into the message record.
pub(crate) fn dcs_to_fields(sms: &mut Sms, dcs: u8) {
    match dcs {
        0x00..=0x3F => {
            // general data coding group
            if dcs & 0x20 != 0 {
                sms.compress = 1;
            }
            if dcs & 0x10 != 0 {
                sms.mclass = (dcs & 0x03) as i32;
            }
            match (dcs >> 2) & 0x03 {
                0 => sms.coding = Coding::SevenBit,
                1 => sms.coding = Coding::EightBit,
                2 => sms.coding = Coding::Ucs2,
                _ => {}
            }
        }
        0xC0..=0xEF => {
            // message-waiting groups: discard (0xC0), store GSM (0xD0),
            // store UCS-2 (0xE0)
            let mut mwi = (dcs & 0x03) as i32;
            if dcs & 0x08 == 0 {
                mwi += 4; // indication inactive
            }
            sms.mwi = mwi;
            sms.coding = if dcs & 0xF0 == 0xE0 {
                Coding::Ucs2
            } else {
                Coding::SevenBit
            };
        }
        0xF0..=0xFF => {
            sms.mclass = (dcs & 0x03) as i32;
            sms.coding = if dcs & 0x04 != 0 {
                Coding::EightBit
            } else {
                Coding::SevenBit
            };
        }
        _ => {}
    }
}

/// Derive the outbound DCS from coding, mclass, mwi and the alt-dcs
/// flag. A set message class forces the 0xFX group, since the plain
/// group has no class slot without reserved values.
pub(crate) fn fields_to_dcs(sms: &Sms, alt_dcs: bool) -> u8 {
    let charset_bits: u8 = match sms.coding {
        Coding::EightBit => 0x04,
        Coding::Ucs2 => 0x08,
        _ => 0x00,
    };

    if sms.mwi != PARAM_UNDEFINED {
        let mwi = sms.mwi as u8;
        let mut dcs = if mwi & 0x04 != 0 {
            0xC0 | (mwi & 0x03) // indication inactive
        } else {
            0xC8 | (mwi & 0x03) // indication active
        };
        if sms.coding == Coding::Ucs2 {
            dcs |= 0x20;
        }
        dcs
    } else if sms.mclass != PARAM_UNDEFINED {
        let class = (sms.mclass as u8) & 0x03;
        if sms.coding == Coding::Ucs2 {
            // UCS-2 has no slot in the 0xFX group
            0x10 | charset_bits | class
        } else {
            0xF0 | (charset_bits & 0x04) | class
        }
    } else if alt_dcs && charset_bits == 0 {
        0xF0
    } else {
        charset_bits
    }
}

/// SMPP relative time format for validity/deferred minutes:
/// `YYMMDDhhmmss000R`.
fn relative_time(minutes: i32) -> String {
    let mut m = minutes.max(0) as u64;
    let years = m / 525_600;
    m %= 525_600;
    let months = m / 43_800;
    m %= 43_800;
    let days = m / 1_440;
    m %= 1_440;
    let hours = m / 60;
    let mins = m % 60;
    format!(
        "{:02}{:02}{:02}{:02}{:02}00000R",
        years.min(99),
        months,
        days,
        hours,
        mins
    )
}

/// Convert an inbound deliver_sm body to a message record, applying
/// address normalization, UDH extraction and the inbound DCS table.
/// Errors carry the SMPP status to answer with.
fn pdu_to_msg(core: &SmppCore, body: &SmBody) -> Result<Sms, CommandStatus> {
    let mut sms = Sms::new();

    // source address: international numbers gain a '+' prefix so the
    // boxes can tell national from international
    let mut source = body.source_addr.clone();
    let source_digits = charset::all_digits(source.strip_prefix('+').unwrap_or(&source));
    if body.source_addr_ton == ton::INTERNATIONAL && source.len() >= 7 && source_digits {
        if let Some(rest) = source.strip_prefix("00") {
            source = rest.to_string();
        }
        if !source.starts_with('+') {
            source = format!("+{source}");
        }
    } else if (body.source_addr_ton == ton::ALPHANUMERIC || !source_digits) && source.len() > 11 {
        // max alphanumeric sender length per GSM specs
        return Err(pdu::status::ESME_RINVSRCADR);
    }
    sms.sender = Some(source);

    if body.destination_addr.is_empty() {
        return Err(pdu::status::ESME_RINVDSTADR);
    }
    let mut dest = body.destination_addr.clone();
    if body.dest_addr_ton == ton::INTERNATIONAL && !dest.starts_with('+') {
        if let Some(rest) = dest.strip_prefix("00") {
            dest = rest.to_string();
        }
        dest = format!("+{dest}");
    }
    if !charset::all_digits(dest.strip_prefix('+').unwrap_or(&dest)) {
        return Err(pdu::status::ESME_RINVDSTADR);
    }
    sms.receiver = Some(dest);

    // SMSCs use service_type for billing information
    if !body.service_type.is_empty() {
        sms.binfo = Some(body.service_type.clone());
    }

    if body.esm_class & esm::REPLY_PATH != 0 {
        sms.rpi = 1;
    }

    // payloads too long for sm_length arrive in the message_payload
    // TLV with an empty short_message
    let mut payload = if !body.short_message.is_empty() {
        body.short_message.to_vec()
    } else {
        find_tlv(&body.tlvs, tags::MESSAGE_PAYLOAD)
            .map(|tlv| tlv.value.to_vec())
            .unwrap_or_default()
    };
    if body.esm_class & esm::UDH_INDICATOR != 0 {
        let udh_len = payload.first().map(|&b| b as usize + 1).unwrap_or(1);
        debug!("SMPP[{}]: UDH length read as {udh_len}", core.id());
        if udh_len > payload.len() {
            error!(
                "SMPP[{}]: malformed UDH length {udh_len} with message length {}, discarding MO",
                core.id(),
                payload.len()
            );
            return Err(pdu::status::ESME_RINVESMCLASS);
        }
        sms.udhdata = Some(Bytes::copy_from_slice(&payload[..udh_len]));
        payload.drain(..udh_len);
    }

    dcs_to_fields(&mut sms, body.data_coding);

    match body.data_coding {
        0x00 => {
            if core.cfg.alt_charset.is_some() && sms.coding != Coding::EightBit {
                // alternate charsets are passed through as-is; only the
                // GSM default alphabet is transcoded
                sms.coding = Coding::SevenBit;
            } else {
                charset::gsm_to_latin1(&mut payload);
                sms.coding = Coding::SevenBit;
            }
        }
        0x01 | 0x03 => sms.coding = Coding::SevenBit,
        0x02 | 0x04 => sms.coding = Coding::EightBit,
        0x06 | 0x07 => {
            // Latin-5 / Latin-8: widened byte-wise, close enough for the
            // shared Latin range
            charset::latin1_to_ucs2(&mut payload);
            sms.coding = Coding::Ucs2;
        }
        0x08 => sms.coding = Coding::Ucs2,
        _ => {
            if sms.coding == Coding::Undef && body.esm_class & esm::UDH_INDICATOR != 0 {
                sms.coding = Coding::EightBit;
            } else if sms.coding == Coding::SevenBit || sms.coding == Coding::Undef {
                sms.coding = Coding::SevenBit;
                charset::gsm_to_latin1(&mut payload);
            }
        }
    }
    sms.msgdata = Some(Bytes::from(payload));
    sms.pid = body.protocol_id as i32;
    Ok(sms)
}

/// Build a submit_sm body from an outbound message. `None` means the
/// message cannot be expressed on the wire: oversized addresses, a
/// service_type/binfo beyond its field, or a payload past even the
/// message_payload TLV limit.
fn msg_to_pdu(core: &SmppCore, sms: &Sms) -> Option<SmBody> {
    let cfg = &core.cfg;
    let mut body = SmBody::default();

    body.source_addr = sms.sender.clone().unwrap_or_default();
    body.destination_addr = sms.receiver.clone().unwrap_or_default();

    // service_type: per-message billing info wins over the configured
    // default; binfo arrives over the box wire unbounded
    body.service_type = match &sms.binfo {
        Some(binfo) if !binfo.is_empty() => binfo.clone(),
        _ => cfg.service_type.clone(),
    };
    if body.service_type.len() > pdu::MAX_SERVICE_TYPE {
        return None;
    }

    match (cfg.source_addr_ton, cfg.source_addr_npi) {
        (Some(t), Some(n)) => {
            debug!(
                "SMPP[{}]: manually forced source addr ton = {t}, npi = {n}",
                core.id()
            );
            body.source_addr_ton = t;
            body.source_addr_npi = n;
        }
        _ => {
            body.source_addr_ton = ton::NATIONAL;
            body.source_addr_npi = npi::E164;
        }
    }

    if cfg.autodetect_addr {
        let source = body.source_addr.clone();
        if let Some(rest) = source.strip_prefix('+') {
            if charset::all_digits(rest) {
                // international number: drop the '+'
                body.source_addr = rest.to_string();
                body.source_addr_ton = ton::INTERNATIONAL;
            } else {
                body.source_addr_ton = ton::ALPHANUMERIC;
                body.source_addr_npi = npi::UNKNOWN;
            }
        } else if !charset::all_digits(&source) {
            body.source_addr_ton = ton::ALPHANUMERIC;
            body.source_addr_npi = npi::UNKNOWN;
        }
    }

    match (cfg.dest_addr_ton, cfg.dest_addr_npi) {
        (Some(t), Some(n)) => {
            body.dest_addr_ton = t;
            body.dest_addr_npi = n;
        }
        _ => {
            body.dest_addr_ton = ton::NATIONAL;
            body.dest_addr_npi = npi::E164;
        }
    }
    let dest = body.destination_addr.clone();
    if let Some(rest) = dest.strip_prefix('+') {
        body.destination_addr = rest.to_string();
        body.dest_addr_ton = ton::INTERNATIONAL;
    }

    if body.destination_addr.len() > 20 || body.source_addr.len() > 20 {
        return None;
    }

    // message class forces the alternate DCS group, otherwise the dcs
    // has reserved values
    body.data_coding = if sms.mwi == PARAM_UNDEFINED && sms.mclass != PARAM_UNDEFINED {
        fields_to_dcs(sms, true)
    } else {
        let alt = if sms.alt_dcs != PARAM_UNDEFINED {
            sms.alt_dcs != 0
        } else {
            core.setup.alt_dcs
        };
        fields_to_dcs(sms, alt)
    };

    if sms.pid != PARAM_UNDEFINED {
        body.protocol_id = sms.pid as u8;
    }

    body.esm_class = esm::STORE_AND_FORWARD;
    let has_udh = sms.udhdata.as_ref().map(|u| !u.is_empty()).unwrap_or(false);
    if has_udh {
        body.esm_class |= esm::UDH_INDICATOR;
    }
    if sms.rpi > 0 {
        body.esm_class |= esm::REPLY_PATH;
    }

    let mut payload = sms
        .msgdata
        .as_ref()
        .map(|d| d.to_vec())
        .unwrap_or_default();

    // re-encode text payloads for the GSM default alphabet unless an
    // alternate charset is configured for dcs 0x00
    if sms.coding == Coding::SevenBit || (sms.coding == Coding::Undef && has_udh) {
        if body.data_coding & 0xF0 != 0
            || (cfg.alt_charset.is_none() && body.data_coding == 0)
        {
            charset::latin1_to_gsm(&mut payload);
        }
    }

    if let Some(udh) = &sms.udhdata {
        let mut with_udh = udh.to_vec();
        with_udh.extend_from_slice(&payload);
        payload = with_udh;
    }
    // sm_length tops out at 254 octets; longer payloads ride the
    // message_payload TLV, and past its 16-bit length there is no way
    // to express the message at all
    if payload.len() <= pdu::MAX_SHORT_MESSAGE {
        body.short_message = Bytes::from(payload);
    } else if payload.len() <= u16::MAX as usize {
        body.tlvs
            .push(Tlv::new(tags::MESSAGE_PAYLOAD, Bytes::from(payload)));
    } else {
        return None;
    }

    if sms.validity >= 0 {
        body.validity_period = relative_time(sms.validity);
    }
    if sms.deferred >= 0 {
        body.schedule_delivery_time = relative_time(sms.deferred);
    }

    if msg::dlr_wants_success_or_fail(sms.dlr_mask) {
        body.registered_delivery = 1;
    }
    body.priority_flag = cfg.priority;
    Some(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::Cfg;
    use crate::dlr::MemoryDlrStore;
    use crate::smscconn::{ConnEvents, ConnState};
    use tokio::sync::mpsc;

    fn test_core(extra_cfg: &str) -> (Arc<SmppCore>, mpsc::UnboundedReceiver<crate::smscconn::SmscEvent>) {
        let text = format!(
            "group = smsc\nsmsc = smpp\nsmsc-id = op1\nhost = 127.0.0.1\nport = 2775\n\
             smsc-username = user\nsmsc-password = pass\n{extra_cfg}"
        );
        let cfg_file = Cfg::parse(&text).unwrap();
        let grp = cfg_file.single_group("smsc").unwrap();
        let cfg = SmppConfig::from_group(grp).unwrap();
        let state = Arc::new(ConnState::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let setup = ConnSetup {
            id: "op1".to_string(),
            state: state.clone(),
            events: ConnEvents::new("op1".to_string(), state, tx),
            dlr: Arc::new(MemoryDlrStore::new()),
            throughput: 0,
            reconnect_delay: Duration::from_secs(10),
            alt_dcs: false,
            our_host: None,
            log_file: None,
            log_level: 0,
        };
        let core = Arc::new(SmppCore {
            cfg,
            setup,
            queue: MsgQueue::new(),
            sequence: AtomicU32::new(0),
            quitting: AtomicBool::new(false),
            finish_sending: AtomicBool::new(false),
        });
        (core, rx)
    }

    #[test]
    fn config_defaults() {
        let cfg_file = Cfg::parse(
            "group = smsc\nsmsc = smpp\nhost = 10.0.0.1\nport = 2775\n\
             smsc-username = u\nsmsc-password = p\n",
        )
        .unwrap();
        let cfg = SmppConfig::from_group(cfg_file.single_group("smsc").unwrap()).unwrap();
        assert_eq!(cfg.interface_version, 0x34);
        assert_eq!(cfg.enquire_link_interval, Duration::from_secs(30));
        assert_eq!(cfg.connection_timeout, Duration::from_secs(300));
        assert_eq!(cfg.wait_ack, Duration::from_secs(60));
        assert_eq!(cfg.wait_ack_action, WaitAckAction::Requeue);
        assert_eq!(cfg.max_pending_submits, 10);
        assert_eq!(cfg.msg_id_type, MsgIdType::AsIs);
        assert_eq!(cfg.system_type, "VMA");
        assert!(cfg.autodetect_addr);
    }

    #[test]
    fn config_interface_version_bcd() {
        let cfg_file = Cfg::parse(
            "group = smsc\nsmsc = smpp\nhost = h\nport = 1\nsmsc-username = u\n\
             smsc-password = p\ninterface-version = 33\n",
        )
        .unwrap();
        let cfg = SmppConfig::from_group(cfg_file.single_group("smsc").unwrap()).unwrap();
        assert_eq!(cfg.interface_version, 0x33);
    }

    #[test]
    fn config_rejects_long_service_type() {
        let cfg_file = Cfg::parse(
            "group = smsc\nsmsc = smpp\nhost = h\nport = 1\nsmsc-username = u\n\
             smsc-password = p\nservice-type = toolong!\n",
        )
        .unwrap();
        assert!(SmppConfig::from_group(cfg_file.single_group("smsc").unwrap()).is_err());
    }

    #[test]
    fn msg_id_type_variants() {
        let as_is = MsgIdType::AsIs;
        assert_eq!(as_is.normalize_submit("1A"), "1A");

        let hex_submit = MsgIdType::Numeric {
            submit_hex: true,
            deliver_hex: false,
        };
        assert_eq!(hex_submit.normalize_submit("1A"), "26");
        assert_eq!(hex_submit.normalize_deliver("26"), "26");

        let hex_both = MsgIdType::Numeric {
            submit_hex: true,
            deliver_hex: true,
        };
        assert_eq!(hex_both.normalize_deliver("ff"), "255");
    }

    #[test]
    fn receipt_field_parsing() {
        let text = "id:m1 sub:001 dlvrd:001 stat:DELIVRD err:000 text:ok";
        assert_eq!(parse_receipt_field(text, "id:").as_deref(), Some("m1"));
        assert_eq!(
            parse_receipt_field(text, "stat:").as_deref(),
            Some("DELIVRD")
        );
        assert_eq!(parse_receipt_field(text, "err:").as_deref(), Some("000"));
        assert_eq!(parse_receipt_field(text, "sub:").as_deref(), Some("001"));
        assert_eq!(parse_receipt_field("no fields here", "id:"), None);
        // value at end of text
        assert_eq!(parse_receipt_field("stat:EXPIRED", "stat:").as_deref(), Some("EXPIRED"));
    }

    #[test]
    fn dcs_decoding_table() {
        let mut sms = Sms::new();
        dcs_to_fields(&mut sms, 0x00);
        assert_eq!(sms.coding, Coding::SevenBit);
        assert_eq!(sms.mclass, PARAM_UNDEFINED);

        let mut sms = Sms::new();
        dcs_to_fields(&mut sms, 0x11);
        assert_eq!(sms.mclass, 1);
        assert_eq!(sms.coding, Coding::SevenBit);

        let mut sms = Sms::new();
        dcs_to_fields(&mut sms, 0x18);
        assert_eq!(sms.coding, Coding::Ucs2);

        let mut sms = Sms::new();
        dcs_to_fields(&mut sms, 0xF5);
        assert_eq!(sms.mclass, 1);
        assert_eq!(sms.coding, Coding::EightBit);

        let mut sms = Sms::new();
        dcs_to_fields(&mut sms, 0xC9);
        assert_eq!(sms.mwi, 1);
        assert_eq!(sms.coding, Coding::SevenBit);

        let mut sms = Sms::new();
        dcs_to_fields(&mut sms, 0xC1);
        assert_eq!(sms.mwi, 5); // indication inactive
    }

    #[test]
    fn dcs_encoding_table() {
        let mut sms = Sms::new();
        sms.coding = Coding::SevenBit;
        assert_eq!(fields_to_dcs(&sms, false), 0x00);
        assert_eq!(fields_to_dcs(&sms, true), 0xF0);

        sms.coding = Coding::EightBit;
        assert_eq!(fields_to_dcs(&sms, false), 0x04);

        sms.coding = Coding::Ucs2;
        assert_eq!(fields_to_dcs(&sms, false), 0x08);

        // message class forces the 0xFX group
        let mut sms = Sms::new();
        sms.coding = Coding::SevenBit;
        sms.mclass = 2;
        assert_eq!(fields_to_dcs(&sms, true), 0xF2);
        sms.coding = Coding::EightBit;
        assert_eq!(fields_to_dcs(&sms, true), 0xF6);

        // mwi active voicemail
        let mut sms = Sms::new();
        sms.mwi = 0;
        assert_eq!(fields_to_dcs(&sms, false), 0xC8);
        sms.mwi = 4;
        assert_eq!(fields_to_dcs(&sms, false), 0xC0);
    }

    #[test]
    fn dcs_roundtrip_mclass() {
        let mut sms = Sms::new();
        sms.coding = Coding::SevenBit;
        sms.mclass = 3;
        let dcs = fields_to_dcs(&sms, true);
        let mut decoded = Sms::new();
        dcs_to_fields(&mut decoded, dcs);
        assert_eq!(decoded.mclass, 3);
        assert_eq!(decoded.coding, Coding::SevenBit);
    }

    #[test]
    fn relative_time_format() {
        assert_eq!(relative_time(0), "000000000000000R");
        assert_eq!(relative_time(60), "000000010000000R");
        assert_eq!(relative_time(1500), "000001010000000R"); // 1 day, 1 hour
        assert_eq!(relative_time(90), "000000013000000R");
    }

    #[test]
    fn pdu_to_msg_international_source() {
        let (core, _rx) = test_core("");
        let mut body = SmBody::default();
        body.source_addr = "00358409876543".to_string();
        body.source_addr_ton = ton::INTERNATIONAL;
        body.destination_addr = "12345".to_string();
        body.short_message = Bytes::from_static(b"hello");

        let sms = pdu_to_msg(&core, &body).unwrap();
        assert_eq!(sms.sender.as_deref(), Some("+358409876543"));
        assert_eq!(sms.receiver.as_deref(), Some("12345"));
        assert_eq!(sms.coding, Coding::SevenBit);
    }

    #[test]
    fn pdu_to_msg_rejects_long_alphanumeric_sender() {
        let (core, _rx) = test_core("");
        let mut body = SmBody::default();
        body.source_addr = "WAYTOOLONGSENDER".to_string();
        body.source_addr_ton = ton::ALPHANUMERIC;
        body.destination_addr = "12345".to_string();
        assert_eq!(
            pdu_to_msg(&core, &body).unwrap_err(),
            pdu::status::ESME_RINVSRCADR
        );
    }

    #[test]
    fn pdu_to_msg_rejects_missing_destination() {
        let (core, _rx) = test_core("");
        let mut body = SmBody::default();
        body.source_addr = "12345".to_string();
        assert_eq!(
            pdu_to_msg(&core, &body).unwrap_err(),
            pdu::status::ESME_RINVDSTADR
        );
    }

    #[test]
    fn pdu_to_msg_extracts_udh() {
        let (core, _rx) = test_core("");
        let mut body = SmBody::default();
        body.source_addr = "12345".to_string();
        body.destination_addr = "67890".to_string();
        body.esm_class = esm::UDH_INDICATOR;
        body.data_coding = 0x04;
        body.short_message = Bytes::from_static(&[0x05, 0x00, 0x03, 0x01, 0x02, 0x01, 0xAA, 0xBB]);

        let sms = pdu_to_msg(&core, &body).unwrap();
        assert_eq!(
            sms.udhdata.as_deref(),
            Some(&[0x05, 0x00, 0x03, 0x01, 0x02, 0x01][..])
        );
        assert_eq!(sms.msgdata.as_deref(), Some(&[0xAA, 0xBB][..]));
        assert_eq!(sms.coding, Coding::EightBit);
    }

    #[test]
    fn pdu_to_msg_rejects_bad_udh_length() {
        let (core, _rx) = test_core("");
        let mut body = SmBody::default();
        body.source_addr = "12345".to_string();
        body.destination_addr = "67890".to_string();
        body.esm_class = esm::UDH_INDICATOR;
        body.short_message = Bytes::from_static(&[0x30, 0x00]); // claims 0x31 bytes
        assert_eq!(
            pdu_to_msg(&core, &body).unwrap_err(),
            pdu::status::ESME_RINVESMCLASS
        );
    }

    #[test]
    fn msg_to_pdu_international_receiver() {
        let (core, _rx) = test_core("");
        let mut sms = Sms::new();
        sms.sender = Some("12345".to_string());
        sms.receiver = Some("+358401234567".to_string());
        sms.msgdata = Some(Bytes::from_static(b"hi"));
        sms.coding = Coding::SevenBit;

        let body = msg_to_pdu(&core, &sms).unwrap();
        assert_eq!(body.destination_addr, "358401234567");
        assert_eq!(body.dest_addr_ton, ton::INTERNATIONAL);
        assert_eq!(body.source_addr, "12345");
        assert_eq!(body.data_coding, 0x00);
        assert_eq!(body.short_message.as_ref(), b"hi");
        assert_eq!(body.esm_class, esm::STORE_AND_FORWARD);
        assert_eq!(body.registered_delivery, 0);
    }

    #[test]
    fn msg_to_pdu_alphanumeric_sender_autodetect() {
        let (core, _rx) = test_core("");
        let mut sms = Sms::new();
        sms.sender = Some("INFOTEXT".to_string());
        sms.receiver = Some("358401234567".to_string());
        sms.msgdata = Some(Bytes::from_static(b"x"));

        let body = msg_to_pdu(&core, &sms).unwrap();
        assert_eq!(body.source_addr_ton, ton::ALPHANUMERIC);
        assert_eq!(body.source_addr_npi, npi::UNKNOWN);
    }

    #[test]
    fn msg_to_pdu_requests_receipt_for_dlr_mask() {
        let (core, _rx) = test_core("");
        let mut sms = Sms::new();
        sms.sender = Some("1".to_string());
        sms.receiver = Some("2".to_string());
        sms.dlr_mask = DlrStatus::Success as i32 | DlrStatus::Fail as i32;
        let body = msg_to_pdu(&core, &sms).unwrap();
        assert_eq!(body.registered_delivery, 1);
    }

    #[test]
    fn msg_to_pdu_prepends_udh() {
        let (core, _rx) = test_core("");
        let mut sms = Sms::new();
        sms.sender = Some("1".to_string());
        sms.receiver = Some("2".to_string());
        sms.coding = Coding::EightBit;
        sms.udhdata = Some(Bytes::from_static(&[0x05, 0x00, 0x03, 0x2A, 0x02, 0x01]));
        sms.msgdata = Some(Bytes::from_static(&[0xDE, 0xAD]));

        let body = msg_to_pdu(&core, &sms).unwrap();
        assert!(body.esm_class & esm::UDH_INDICATOR != 0);
        assert_eq!(
            body.short_message.as_ref(),
            &[0x05, 0x00, 0x03, 0x2A, 0x02, 0x01, 0xDE, 0xAD]
        );
    }

    #[test]
    fn msg_to_pdu_oversized_address_is_malformed() {
        let (core, _rx) = test_core("");
        let mut sms = Sms::new();
        sms.sender = Some("1".to_string());
        sms.receiver = Some("123456789012345678901".to_string());
        assert!(msg_to_pdu(&core, &sms).is_none());
    }

    #[test]
    fn msg_to_pdu_oversized_binfo_is_malformed() {
        let (core, _rx) = test_core("");
        let mut sms = Sms::new();
        sms.sender = Some("1".to_string());
        sms.receiver = Some("2".to_string());
        sms.binfo = Some("billing-tag".to_string());
        assert!(msg_to_pdu(&core, &sms).is_none());

        sms.binfo = Some("bill".to_string());
        assert_eq!(msg_to_pdu(&core, &sms).unwrap().service_type, "bill");
    }

    #[test]
    fn msg_to_pdu_long_payload_rides_message_payload_tlv() {
        let (core, _rx) = test_core("");
        let mut sms = Sms::new();
        sms.sender = Some("1".to_string());
        sms.receiver = Some("2".to_string());
        sms.coding = Coding::EightBit;
        sms.msgdata = Some(Bytes::from(vec![0x55; 300]));

        let body = msg_to_pdu(&core, &sms).unwrap();
        assert!(body.short_message.is_empty());
        let tlv = find_tlv(&body.tlvs, tags::MESSAGE_PAYLOAD).unwrap();
        assert_eq!(tlv.value.len(), 300);
    }

    #[test]
    fn msg_to_pdu_payload_at_sm_length_limit_stays_inline() {
        let (core, _rx) = test_core("");
        let mut sms = Sms::new();
        sms.sender = Some("1".to_string());
        sms.receiver = Some("2".to_string());
        sms.coding = Coding::EightBit;
        sms.msgdata = Some(Bytes::from(vec![0x55; pdu::MAX_SHORT_MESSAGE]));

        let body = msg_to_pdu(&core, &sms).unwrap();
        assert_eq!(body.short_message.len(), pdu::MAX_SHORT_MESSAGE);
        assert!(body.tlvs.is_empty());
    }

    #[test]
    fn msg_to_pdu_rejects_payload_beyond_tlv_limit() {
        let (core, _rx) = test_core("");
        let mut sms = Sms::new();
        sms.sender = Some("1".to_string());
        sms.receiver = Some("2".to_string());
        sms.coding = Coding::EightBit;
        sms.msgdata = Some(Bytes::from(vec![0x55; u16::MAX as usize + 1]));
        assert!(msg_to_pdu(&core, &sms).is_none());
    }

    #[test]
    fn pdu_to_msg_reads_message_payload_tlv() {
        let (core, _rx) = test_core("");
        let mut body = SmBody::default();
        body.source_addr = "12345".to_string();
        body.destination_addr = "67890".to_string();
        body.data_coding = 0x04;
        body.tlvs.push(Tlv::new(
            tags::MESSAGE_PAYLOAD,
            Bytes::from(vec![0xAB; 300]),
        ));

        let sms = pdu_to_msg(&core, &body).unwrap();
        assert_eq!(sms.msgdata.as_ref().unwrap().len(), 300);
        assert_eq!(sms.coding, Coding::EightBit);
    }

    #[test]
    fn msg_to_pdu_validity_and_deferred() {
        let (core, _rx) = test_core("");
        let mut sms = Sms::new();
        sms.sender = Some("1".to_string());
        sms.receiver = Some("2".to_string());
        sms.validity = 60;
        sms.deferred = 30;
        let body = msg_to_pdu(&core, &sms).unwrap();
        assert_eq!(body.validity_period, "000000010000000R");
        assert_eq!(body.schedule_delivery_time, "000000003000000R");
    }

    #[test]
    fn sequence_wraps_before_reserved_range() {
        let (core, _rx) = test_core("");
        core.sequence.store(0x7FFF_FFFE, Ordering::Relaxed);
        assert_eq!(core.next_seq(), 0x7FFF_FFFF);
        assert_eq!(core.next_seq(), 1);
        assert_eq!(core.next_seq(), 2);
    }

    fn pending_now() -> PendingSubmit {
        PendingSubmit {
            sent_at: Instant::now(),
            msg: Msg::Sms(Sms::new()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ack_requeue_fails_overdue_submits() {
        let (core, mut rx) = test_core("wait-ack-expire = requeue\n");
        let mut session = Session::new(&core, BindMode::Transceiver);
        session.pending.insert(7, pending_now());
        tokio::time::advance(core.cfg.wait_ack + Duration::from_secs(1)).await;
        session.pending.insert(8, pending_now());

        assert!(!session.cleanup_pending());
        // only the overdue entry was swept
        assert_eq!(session.pending.len(), 1);
        assert!(session.pending.contains_key(&8));
        match rx.try_recv().unwrap() {
            crate::smscconn::SmscEvent::SendFailed { reason, .. } => {
                assert_eq!(reason, FailReason::Temporary);
            }
            other => panic!("expected SendFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ack_reconnect_action_requests_reconnect() {
        let (core, _rx) = test_core("wait-ack-expire = reconnect\n");
        let mut session = Session::new(&core, BindMode::Transceiver);
        session.pending.insert(7, pending_now());
        tokio::time::advance(core.cfg.wait_ack + Duration::from_secs(1)).await;
        assert!(session.cleanup_pending());
        // the entries stay for the post-session requeue
        assert_eq!(session.pending.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ack_never_expire_leaves_entries() {
        let (core, _rx) = test_core("wait-ack-expire = never-expire\n");
        let mut session = Session::new(&core, BindMode::Transceiver);
        session.pending.insert(7, pending_now());
        tokio::time::advance(core.cfg.wait_ack + Duration::from_secs(1)).await;
        assert!(!session.cleanup_pending());
        assert_eq!(session.pending.len(), 1);
    }
}
