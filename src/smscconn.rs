// ABOUTME: SMSC connection framework: lifecycle state, routing filters and the driver contract
// ABOUTME: Drivers plug in behind the SmscDriver trait and report through ConnEvents

use crate::cfg::{CfgError, CfgGroup};
use crate::msg::Msg;
use crate::queue::Counter;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Connection lifecycle states.
///
/// `Connecting → Active | ActiveRecv → Reconnecting → Connecting` loops
/// until shutdown; any state can fall to `Disconnected → Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmscConnStatus {
    Connecting,
    Active,
    ActiveRecv,
    Reconnecting,
    Disconnected,
    Dead,
}

/// Why a connection was put down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Shutdown,
    Removed,
    WrongPassword,
}

/// Terminal outcome classes for a message handed to a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// The driver could not express the message on its wire.
    Malformed,
    /// Connection was shut down with messages still pending.
    Shutdown,
    /// Transient transport or SMSC condition, retry elsewhere/later.
    Temporary,
    /// SMSC permanently rejected the message.
    Rejected,
}

/// Callback events a driver raises towards the router. Every message
/// accepted by a driver produces exactly one `Sent` or `SendFailed`.
#[derive(Debug)]
pub enum SmscEvent {
    Connected {
        id: String,
    },
    Received {
        id: String,
        msg: Msg,
    },
    Sent {
        id: String,
        msg: Msg,
    },
    SendFailed {
        id: String,
        msg: Msg,
        reason: FailReason,
    },
    Killed {
        id: String,
        reason: KillReason,
    },
}

/// Shared mutable state of one connection. The flow mutex guards status
/// and flags only; it is never held across IO.
#[derive(Debug)]
pub struct ConnState {
    flow: Mutex<Flow>,
    pub received: Counter,
    pub sent: Counter,
    pub failed: Counter,
}

#[derive(Debug)]
struct Flow {
    status: SmscConnStatus,
    why_killed: Option<KillReason>,
    is_stopped: bool,
    connect_time: Option<Instant>,
    load: i64,
}

impl ConnState {
    pub fn new(start_as_stopped: bool) -> Self {
        ConnState {
            flow: Mutex::new(Flow {
                status: SmscConnStatus::Connecting,
                why_killed: None,
                is_stopped: start_as_stopped,
                connect_time: None,
                load: 0,
            }),
            received: Counter::new(),
            sent: Counter::new(),
            failed: Counter::new(),
        }
    }

    pub fn status(&self) -> SmscConnStatus {
        self.flow.lock().unwrap().status
    }

    pub fn set_status(&self, status: SmscConnStatus) {
        self.flow.lock().unwrap().status = status;
    }

    pub fn mark_connected(&self, status: SmscConnStatus) {
        let mut flow = self.flow.lock().unwrap();
        flow.status = status;
        flow.connect_time = Some(Instant::now());
    }

    pub fn mark_connecting(&self) {
        let mut flow = self.flow.lock().unwrap();
        flow.connect_time = None;
    }

    pub fn is_stopped(&self) -> bool {
        self.flow.lock().unwrap().is_stopped
    }

    pub fn set_stopped(&self, stopped: bool) {
        self.flow.lock().unwrap().is_stopped = stopped;
    }

    pub fn kill(&self, reason: KillReason) {
        let mut flow = self.flow.lock().unwrap();
        if flow.why_killed.is_none() {
            flow.why_killed = Some(reason);
        }
    }

    pub fn why_killed(&self) -> Option<KillReason> {
        self.flow.lock().unwrap().why_killed
    }

    pub fn is_alive(&self) -> bool {
        let flow = self.flow.lock().unwrap();
        flow.status != SmscConnStatus::Dead && flow.why_killed.is_none()
    }

    pub fn set_load(&self, load: i64) {
        self.flow.lock().unwrap().load = load;
    }

    fn snapshot(&self) -> (SmscConnStatus, Option<KillReason>, bool, Option<Instant>, i64) {
        let flow = self.flow.lock().unwrap();
        (
            flow.status,
            flow.why_killed,
            flow.is_stopped,
            flow.connect_time,
            flow.load,
        )
    }
}

/// Admin-facing snapshot of one connection.
#[derive(Debug, Clone)]
pub struct StatusInfo {
    pub status: SmscConnStatus,
    pub killed: Option<KillReason>,
    pub is_stopped: bool,
    pub online_seconds: u64,
    pub sent: u64,
    pub received: u64,
    pub failed: u64,
    pub queued: usize,
    pub load: i64,
}

/// Event wrapper a driver reports through; keeps the per-connection
/// counters in step with the callbacks.
#[derive(Clone)]
pub struct ConnEvents {
    id: String,
    state: Arc<ConnState>,
    tx: mpsc::UnboundedSender<SmscEvent>,
}

impl ConnEvents {
    pub fn new(id: String, state: Arc<ConnState>, tx: mpsc::UnboundedSender<SmscEvent>) -> Self {
        ConnEvents { id, state, tx }
    }

    pub fn connected(&self) {
        let _ = self.tx.send(SmscEvent::Connected {
            id: self.id.clone(),
        });
    }

    pub fn received(&self, msg: Msg) {
        self.state.received.increase();
        let _ = self.tx.send(SmscEvent::Received {
            id: self.id.clone(),
            msg,
        });
    }

    pub fn sent(&self, msg: Msg) {
        self.state.sent.increase();
        let _ = self.tx.send(SmscEvent::Sent {
            id: self.id.clone(),
            msg,
        });
    }

    pub fn send_failed(&self, msg: Msg, reason: FailReason) {
        self.state.failed.increase();
        let _ = self.tx.send(SmscEvent::SendFailed {
            id: self.id.clone(),
            msg,
            reason,
        });
    }

    pub fn killed(&self, reason: KillReason) {
        let _ = self.tx.send(SmscEvent::Killed {
            id: self.id.clone(),
            reason,
        });
    }
}

/// The polymorphism seam every SMSC protocol module implements.
///
/// `send_msg` may not block and may not keep the message on rejection;
/// all other lifecycle work happens on the driver's own tasks.
pub trait SmscDriver: Send + Sync {
    /// Enqueue a message for transmission. `Err` hands the message back
    /// when the driver is unable to accept it at all.
    fn send_msg(&self, msg: Msg) -> Result<(), Msg>;

    /// Begin shutdown. With `finish_sending` the driver drains its
    /// queue and pending window first; otherwise it fails everything
    /// still in flight with [`FailReason::Shutdown`].
    fn shutdown(&self, finish_sending: bool);

    /// Suspend inbound flow.
    fn stop(&self) {}

    /// Resume inbound flow.
    fn start(&self) {}

    /// Current outbound backlog, used for load balancing.
    fn queued(&self) -> usize;
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection is dead")]
    Dead,
    #[error("driver rejected the message")]
    Rejected,
}

/// How well a connection fits a message, per the routing filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Usability {
    Unusable,
    Usable,
    Preferred,
}

/// Routing filters of one connection, parsed from its `smsc` group.
#[derive(Debug, Default)]
pub struct RouteFilters {
    allowed_smsc_id: Option<Vec<String>>,
    denied_smsc_id: Option<Vec<String>>,
    preferred_smsc_id: Option<Vec<String>>,
    allowed_prefix: Option<String>,
    denied_prefix: Option<String>,
    preferred_prefix: Option<String>,
    allowed_smsc_id_regex: Option<Regex>,
    denied_smsc_id_regex: Option<Regex>,
    allowed_prefix_regex: Option<Regex>,
    denied_prefix_regex: Option<Regex>,
    preferred_prefix_regex: Option<Regex>,
}

fn split_semicolon_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// True when `number` starts with any prefix in the semicolon-separated
/// `prefixes` list. An empty prefix matches everything.
pub fn does_prefix_match(prefixes: &str, number: &str) -> bool {
    prefixes.split(';').any(|p| number.starts_with(p.trim()))
}

fn compile_regex(
    grp: &CfgGroup,
    key: &str,
) -> Result<Option<Regex>, CfgError> {
    match grp.get(key) {
        None => Ok(None),
        Some(pattern) => Regex::new(pattern).map(Some).map_err(|_| CfgError::BadValue {
            group: grp.name().to_string(),
            key: key.to_string(),
            value: pattern.to_string(),
        }),
    }
}

impl RouteFilters {
    pub fn from_group(grp: &CfgGroup) -> Result<Self, CfgError> {
        let filters = RouteFilters {
            allowed_smsc_id: grp.get("allowed-smsc-id").map(split_semicolon_list),
            denied_smsc_id: grp.get("denied-smsc-id").map(split_semicolon_list),
            preferred_smsc_id: grp.get("preferred-smsc-id").map(split_semicolon_list),
            allowed_prefix: grp.get_string("allowed-prefix"),
            denied_prefix: grp.get_string("denied-prefix"),
            preferred_prefix: grp.get_string("preferred-prefix"),
            allowed_smsc_id_regex: compile_regex(grp, "allowed-smsc-id-regex")?,
            denied_smsc_id_regex: compile_regex(grp, "denied-smsc-id-regex")?,
            allowed_prefix_regex: compile_regex(grp, "allowed-prefix-regex")?,
            denied_prefix_regex: compile_regex(grp, "denied-prefix-regex")?,
            preferred_prefix_regex: compile_regex(grp, "preferred-prefix-regex")?,
        };
        if filters.allowed_smsc_id.is_some() && filters.denied_smsc_id.is_some() {
            warn!("both 'allowed-smsc-id' and 'denied-smsc-id' set, deny list ignored");
        }
        if filters.allowed_smsc_id_regex.is_some() && filters.denied_smsc_id_regex.is_some() {
            warn!("both 'allowed-smsc-id-regex' and 'denied-smsc-id-regex' set, deny regex ignored");
        }
        Ok(filters)
    }

    /// Evaluate the filter chain for an outbound message: smsc-id
    /// allow/deny, receiver prefix allow/deny, then preference.
    pub fn usable(&self, smsc_id: Option<&str>, receiver: &str) -> Usability {
        if let Some(allowed) = &self.allowed_smsc_id {
            match smsc_id {
                None => return Usability::Unusable,
                Some(id) if !allowed.iter().any(|a| a == id) => return Usability::Unusable,
                _ => {}
            }
        } else if let (Some(denied), Some(id)) = (&self.denied_smsc_id, smsc_id) {
            if denied.iter().any(|d| d == id) {
                return Usability::Unusable;
            }
        }

        if let Some(re) = &self.allowed_smsc_id_regex {
            match smsc_id {
                None => return Usability::Unusable,
                Some(id) if !re.is_match(id) => return Usability::Unusable,
                _ => {}
            }
        } else if let (Some(re), Some(id)) = (&self.denied_smsc_id_regex, smsc_id) {
            if re.is_match(id) {
                return Usability::Unusable;
            }
        }

        // allowed without denied: must match
        if let (Some(allowed), None) = (&self.allowed_prefix, &self.denied_prefix) {
            if !does_prefix_match(allowed, receiver) {
                return Usability::Unusable;
            }
        }
        if let (Some(re), None) = (&self.allowed_prefix_regex, &self.denied_prefix_regex) {
            if !re.is_match(receiver) {
                return Usability::Unusable;
            }
        }

        // denied without allowed: must not match
        if let (Some(denied), None) = (&self.denied_prefix, &self.allowed_prefix) {
            if does_prefix_match(denied, receiver) {
                return Usability::Unusable;
            }
        }
        if let (Some(re), None) = (&self.denied_prefix_regex, &self.allowed_prefix_regex) {
            if re.is_match(receiver) {
                return Usability::Unusable;
            }
        }

        // both set: reject only when allow misses and deny hits
        if let (Some(allowed), Some(denied)) = (&self.allowed_prefix, &self.denied_prefix) {
            if !does_prefix_match(allowed, receiver) && does_prefix_match(denied, receiver) {
                return Usability::Unusable;
            }
        }
        if let (Some(are), Some(dre)) = (&self.allowed_prefix_regex, &self.denied_prefix_regex) {
            if !are.is_match(receiver) && dre.is_match(receiver) {
                return Usability::Unusable;
            }
        }

        if let (Some(preferred), Some(id)) = (&self.preferred_smsc_id, smsc_id) {
            if preferred.iter().any(|p| p == id) {
                return Usability::Preferred;
            }
        }
        if let Some(preferred) = &self.preferred_prefix {
            if does_prefix_match(preferred, receiver) {
                return Usability::Preferred;
            }
        }
        if let Some(re) = &self.preferred_prefix_regex {
            if re.is_match(receiver) {
                return Usability::Preferred;
            }
        }

        Usability::Usable
    }
}

/// Rewrite any equivalent prefix at the start of `number` to its
/// canonical form. `unified_prefix` is a semicolon-separated list of
/// groups; each group is comma-separated with the canonical prefix
/// first.
pub fn normalize_number(unified_prefix: &str, number: &str) -> String {
    for group in unified_prefix.split(';') {
        let mut parts = group.split(',').map(str::trim);
        let Some(canonical) = parts.next() else {
            continue;
        };
        for equivalent in parts {
            if !equivalent.is_empty() && number.starts_with(equivalent) {
                return format!("{canonical}{}", &number[equivalent.len()..]);
            }
        }
    }
    number.to_string()
}

/// Internal rerouting rules, priority order: reroute, reroute-smsc-id,
/// reroute-receiver.
#[derive(Debug, Default)]
pub struct RerouteRules {
    pub reroute: bool,
    pub to_smsc: Option<String>,
    pub by_receiver: HashMap<String, String>,
}

impl RerouteRules {
    pub fn from_group(grp: &CfgGroup) -> Result<Self, CfgError> {
        let mut rules = RerouteRules::default();
        if let Some(flag) = grp.get_bool("reroute")? {
            rules.reroute = flag;
            if flag {
                debug!("adding general internal routing for smsc group");
                return Ok(rules);
            }
        }
        if let Some(to_smsc) = grp.get_string("reroute-smsc-id") {
            debug!("adding internal routing to smsc id <{to_smsc}>");
            rules.to_smsc = Some(to_smsc);
            return Ok(rules);
        }
        if let Some(rule) = grp.get("reroute-receiver") {
            for route in rule.split(';') {
                let mut parts = route.split(',').map(str::trim);
                let Some(smsc) = parts.next() else { continue };
                for receiver in parts {
                    if !receiver.is_empty() {
                        rules
                            .by_receiver
                            .insert(receiver.to_string(), smsc.to_string());
                    }
                }
            }
        }
        Ok(rules)
    }

    pub fn is_active(&self) -> bool {
        self.reroute || self.to_smsc.is_some() || !self.by_receiver.is_empty()
    }

    /// Returns the smsc-id to reroute an inbound message to, if any.
    pub fn target_for(&self, receiver: Option<&str>) -> Option<Option<&str>> {
        if self.reroute {
            return Some(None);
        }
        if let Some(to) = &self.to_smsc {
            return Some(Some(to));
        }
        if let Some(receiver) = receiver {
            if let Some(to) = self.by_receiver.get(receiver) {
                return Some(Some(to));
            }
        }
        None
    }
}

/// One SMSC-side connection: identity, filters and the protocol driver
/// behind it.
pub struct SmscConn {
    pub(crate) name: String,
    pub(crate) id: String,
    pub(crate) filters: RouteFilters,
    pub(crate) unified_prefix: Option<String>,
    pub(crate) reroute: RerouteRules,
    pub(crate) state: Arc<ConnState>,
    pub(crate) driver: Box<dyn SmscDriver>,
}

impl std::fmt::Debug for SmscConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmscConn")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

impl SmscConn {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SmscConnStatus {
        self.state.status()
    }

    pub fn queued(&self) -> usize {
        self.driver.queued()
    }

    /// Evaluate routing filters for an outbound message.
    pub fn usable(&self, msg: &Msg) -> Usability {
        if !self.state.is_alive() {
            return Usability::Unusable;
        }
        let Msg::Sms(sms) = msg else {
            return Usability::Unusable;
        };
        let receiver = sms.receiver.as_deref().unwrap_or("");
        self.filters.usable(sms.smsc_id.as_deref(), receiver)
    }

    /// Hand a message to the driver. The caller keeps ownership of its
    /// copy; the driver gets a normalized duplicate.
    pub fn send(&self, msg: &Msg) -> Result<(), SendError> {
        if !self.state.is_alive() {
            return Err(SendError::Dead);
        }
        let mut dup = msg.duplicate();
        if let (Some(uf), Msg::Sms(sms)) = (&self.unified_prefix, &mut dup) {
            if let Some(receiver) = &sms.receiver {
                sms.receiver = Some(normalize_number(uf, receiver));
            }
        }
        self.driver.send_msg(dup).map_err(|_| SendError::Rejected)
    }

    pub fn shutdown(&self, finish_sending: bool) {
        if self.state.status() == SmscConnStatus::Dead {
            return;
        }
        self.state.kill(KillReason::Shutdown);
        self.driver.shutdown(finish_sending);
    }

    /// Suspend inbound flow. Fails when already stopped or dying.
    pub fn stop(&self) -> Result<(), SendError> {
        if !self.state.is_alive() || self.state.is_stopped() {
            return Err(SendError::Dead);
        }
        self.state.set_stopped(true);
        self.driver.stop();
        Ok(())
    }

    pub fn start(&self) {
        if self.state.status() == SmscConnStatus::Dead || !self.state.is_stopped() {
            return;
        }
        self.state.set_stopped(false);
        self.driver.start();
    }

    pub fn info(&self) -> StatusInfo {
        let (status, killed, is_stopped, connect_time, load) = self.state.snapshot();
        StatusInfo {
            status,
            killed,
            is_stopped,
            online_seconds: connect_time.map(|t| t.elapsed().as_secs()).unwrap_or(0),
            sent: self.state.sent.value(),
            received: self.state.received.value(),
            failed: self.state.failed.value(),
            queued: self.driver.queued(),
            load,
        }
    }
}
