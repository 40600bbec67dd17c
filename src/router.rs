// ABOUTME: Outbound connection selection and the gateway event loop
// ABOUTME: Preferred connections win, then the least-queued usable one; inbound applies reroute rules

use crate::boxc::{BoxcEvent, BoxcRegistry};
use crate::msg::{self, DlrStatus, Msg, SmsType};
use crate::smscconn::{FailReason, SmscConn, SmscEvent, StatusInfo, Usability};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// The set of live SMSC connections and the selection policy over them.
pub struct Router {
    conns: Vec<Arc<SmscConn>>,
}

impl Router {
    pub fn new(conns: Vec<Arc<SmscConn>>) -> Self {
        Router { conns }
    }

    pub fn conns(&self) -> &[Arc<SmscConn>] {
        &self.conns
    }

    pub fn find(&self, id: &str) -> Option<&Arc<SmscConn>> {
        self.conns.iter().find(|c| c.id() == id)
    }

    /// Pick the connection for an outbound message: any preferred
    /// candidate beats any merely usable one; within a tier the
    /// smallest backlog wins, ties to the lowest index.
    pub fn route(&self, msg: &Msg) -> Option<Arc<SmscConn>> {
        let mut best: Option<(Usability, usize, &Arc<SmscConn>)> = None;
        for conn in &self.conns {
            let usability = conn.usable(msg);
            if usability == Usability::Unusable {
                continue;
            }
            let queued = conn.queued();
            let better = match &best {
                None => true,
                Some((best_use, best_queued, _)) => {
                    usability > *best_use || (usability == *best_use && queued < *best_queued)
                }
            };
            if better {
                best = Some((usability, queued, conn));
            }
        }
        best.map(|(_, _, conn)| conn.clone())
    }

    /// Route and hand over; the message comes back when no connection
    /// can take it.
    pub fn send(&self, msg: Msg) -> Result<(), Msg> {
        match self.route(&msg) {
            None => Err(msg),
            Some(conn) => match conn.send(&msg) {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!("send to smsc <{}> failed: {e}", conn.id());
                    Err(msg)
                }
            },
        }
    }

    pub fn status(&self) -> Vec<(String, StatusInfo)> {
        self.conns
            .iter()
            .map(|c| (c.id().to_string(), c.info()))
            .collect()
    }

    pub fn stop_all(&self) {
        for conn in &self.conns {
            let _ = conn.stop();
        }
    }

    pub fn start_all(&self) {
        for conn in &self.conns {
            conn.start();
        }
    }

    pub fn shutdown_all(&self, finish_sending: bool) {
        for conn in &self.conns {
            conn.shutdown(finish_sending);
        }
    }
}

/// Build the failure report for a message the SMSC side rejected, when
/// its dlr_mask asks for failure classes.
fn rejection_report(msg: &Msg) -> Option<Msg> {
    let Msg::Sms(sms) = msg else { return None };
    if sms.dlr_mask <= 0
        || sms.dlr_mask & (DlrStatus::Fail as i32 | DlrStatus::SmscReject as i32) == 0
    {
        return None;
    }
    let mut report = sms.clone();
    report.sms_type = SmsType::Report;
    report.msgdata = Some(bytes::Bytes::from_static(b"NACK/Rejected"));
    Some(Msg::Sms(report))
}

/// The central event loop: consumes driver and box events, applies
/// reroute rules, retries temporary failures and forwards inbound
/// traffic to the boxes.
pub async fn run_events(
    router: Arc<Router>,
    registry: Arc<BoxcRegistry>,
    mut smsc_rx: mpsc::UnboundedReceiver<SmscEvent>,
    mut boxc_rx: mpsc::UnboundedReceiver<BoxcEvent>,
) {
    loop {
        tokio::select! {
            event = smsc_rx.recv() => match event {
                None => break,
                Some(event) => handle_smsc_event(&router, &registry, event),
            },
            event = boxc_rx.recv() => match event {
                None => break,
                Some(event) => handle_boxc_event(&router, &registry, event),
            },
        }
    }
    debug!("router event loop finished");
}

fn handle_smsc_event(router: &Router, registry: &BoxcRegistry, event: SmscEvent) {
    match event {
        SmscEvent::Connected { id } => {
            info!("smsc <{id}> is now connected");
        }
        SmscEvent::Received { id, msg } => {
            deliver_inbound(router, registry, &id, msg);
        }
        SmscEvent::Sent { id, msg } => {
            debug!("smsc <{id}> sent {}", msg.type_name());
        }
        SmscEvent::SendFailed { id, msg, reason } => match reason {
            FailReason::Temporary => {
                // reschedule; routing may pick another connection
                if let Err(msg) = router.send(msg) {
                    error!("smsc <{id}>: no route left for temporarily failed message");
                    if let Some(report) = rejection_report(&msg) {
                        let _ = registry.route(report);
                    }
                }
            }
            FailReason::Shutdown => {
                warn!("smsc <{id}>: message failed by shutdown");
            }
            FailReason::Rejected | FailReason::Malformed => {
                error!("smsc <{id}>: message permanently failed ({reason:?})");
                if let Some(report) = rejection_report(&msg) {
                    let _ = registry.route(report);
                }
            }
        },
        SmscEvent::Killed { id, reason } => {
            info!("smsc <{id}> killed ({reason:?})");
        }
    }
}

/// Inbound MO or report: reroute rules first, else hand to the boxes.
fn deliver_inbound(router: &Router, registry: &BoxcRegistry, id: &str, msg: Msg) {
    if let Msg::Sms(sms) = &msg {
        if sms.sms_type == SmsType::Mo {
            if let Some(conn) = router.find(id) {
                let receiver = sms.receiver.as_deref();
                if let Some(target) = conn.reroute.target_for(receiver) {
                    let mut rerouted = sms.clone();
                    rerouted.sms_type = SmsType::MtPush;
                    if let Some(target) = target {
                        rerouted.smsc_id = Some(target.to_string());
                    }
                    debug!("smsc <{id}>: rerouting message internally");
                    if let Err(_unrouted) = router.send(Msg::Sms(rerouted)) {
                        error!("smsc <{id}>: reroute found no usable connection, dropped");
                    }
                    return;
                }
            }
        }
    }
    if let Err(msg) = registry.route(msg) {
        error!(
            "no box connected, inbound {} from <{id}> dropped",
            msg.type_name()
        );
    }
}

fn handle_boxc_event(router: &Router, registry: &BoxcRegistry, event: BoxcEvent) {
    match event {
        BoxcEvent::Connected(handle) => {
            info!("box <{}> from {} attached", handle.id, handle.client_ip);
        }
        BoxcEvent::FromBox { boxc_id, msg } => {
            let msg = stamp_origin(msg, boxc_id);
            if let Err(msg) = router.send(msg) {
                error!("box <{boxc_id}>: no usable smsc connection, MT dropped");
                if let Some(report) = rejection_report(&msg) {
                    let _ = registry.route(report);
                }
            }
        }
        BoxcEvent::Disconnected {
            boxc_id,
            undelivered,
        } => {
            info!("box <{boxc_id}> detached");
            for msg in undelivered {
                if let Err(msg) = registry.route(msg) {
                    error!(
                        "box <{boxc_id}>: undelivered {} lost, no other box",
                        msg.type_name()
                    );
                }
            }
        }
    }
}

/// Record which box a MT message came from, so replies and reports can
/// find their way back.
fn stamp_origin(mut msg: Msg, boxc_id: usize) -> Msg {
    if let Msg::Sms(sms) = &mut msg {
        if sms.boxc_id.is_none() {
            sms.boxc_id = Some(boxc_id.to_string());
        }
        if sms.time == msg::PARAM_UNDEFINED {
            sms.time = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i32)
                .unwrap_or(msg::PARAM_UNDEFINED);
        }
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::Cfg;
    use crate::msg::Sms;
    use crate::queue::MsgQueue;
    use crate::smscconn::{
        ConnState, RerouteRules, RouteFilters, SmscConnStatus, SmscDriver,
    };
    use bytes::Bytes;
    use std::sync::Mutex;

    /// Driver stub: accepts everything into a queue, reports its depth.
    struct StubDriver {
        queue: MsgQueue<Msg>,
        sent: Mutex<Vec<Msg>>,
    }

    impl StubDriver {
        fn new(backlog: usize) -> Self {
            let queue = MsgQueue::new();
            for _ in 0..backlog {
                queue.produce(Msg::Sms(Sms::new()));
            }
            StubDriver {
                queue,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl SmscDriver for StubDriver {
        fn send_msg(&self, msg: Msg) -> Result<(), Msg> {
            self.sent.lock().unwrap().push(msg.duplicate());
            self.queue.produce(msg);
            Ok(())
        }
        fn shutdown(&self, _finish_sending: bool) {}
        fn queued(&self) -> usize {
            self.queue.len()
        }
    }

    fn stub_conn(id: &str, grp_text: &str, backlog: usize) -> Arc<SmscConn> {
        let cfg = Cfg::parse(grp_text).unwrap();
        let grp = cfg.single_group("smsc").unwrap();
        let state = Arc::new(ConnState::new(false));
        state.set_status(SmscConnStatus::Active);
        Arc::new(SmscConn {
            name: id.to_string(),
            id: id.to_string(),
            filters: RouteFilters::from_group(grp).unwrap(),
            unified_prefix: grp.get_string("unified-prefix"),
            reroute: RerouteRules::from_group(grp).unwrap(),
            state,
            driver: Box::new(StubDriver::new(backlog)),
        })
    }

    fn mt(receiver: &str, smsc_id: Option<&str>) -> Msg {
        let mut sms = Sms::new();
        sms.sender = Some("100".to_string());
        sms.receiver = Some(receiver.to_string());
        sms.smsc_id = smsc_id.map(str::to_string);
        sms.msgdata = Some(Bytes::from_static(b"x"));
        sms.sms_type = SmsType::MtPush;
        Msg::Sms(sms)
    }

    #[test]
    fn preferred_wins_over_lower_queue() {
        let router = Router::new(vec![
            stub_conn("a", "group = smsc\n", 0),
            stub_conn("b", "group = smsc\npreferred-prefix = 358\n", 10),
        ]);
        let conn = router.route(&mt("35840", None)).unwrap();
        assert_eq!(conn.id(), "b");
        // non-preferred receiver goes by queue depth
        let conn = router.route(&mt("49171", None)).unwrap();
        assert_eq!(conn.id(), "a");
    }

    #[test]
    fn least_queued_with_index_tiebreak() {
        let router = Router::new(vec![
            stub_conn("a", "group = smsc\n", 3),
            stub_conn("b", "group = smsc\n", 1),
            stub_conn("c", "group = smsc\n", 1),
        ]);
        let conn = router.route(&mt("123", None)).unwrap();
        assert_eq!(conn.id(), "b");
    }

    #[test]
    fn denied_smsc_id_never_selected() {
        let router = Router::new(vec![
            stub_conn("a", "group = smsc\ndenied-smsc-id = op9\nallowed-prefix = 1\n", 0),
            stub_conn("b", "group = smsc\n", 5),
        ]);
        let conn = router.route(&mt("123", Some("op9"))).unwrap();
        assert_eq!(conn.id(), "b");
    }

    #[test]
    fn no_usable_connection_returns_message() {
        let router = Router::new(vec![stub_conn(
            "a",
            "group = smsc\nallowed-smsc-id = only-this\n",
            0,
        )]);
        assert!(router.send(mt("123", None)).is_err());
        assert!(router.send(mt("123", Some("other"))).is_err());
    }

    #[test]
    fn dead_connection_is_skipped() {
        let conns = vec![stub_conn("a", "group = smsc\n", 0)];
        conns[0].state.set_status(SmscConnStatus::Dead);
        let router = Router::new(conns);
        assert!(router.route(&mt("123", None)).is_none());
    }

    #[test]
    fn rejection_report_requires_mask() {
        let plain = mt("1", None);
        assert!(rejection_report(&plain).is_none());

        let mut sms = Sms::new();
        sms.dlr_mask = DlrStatus::Fail as i32;
        let with_mask = Msg::Sms(sms);
        let report = rejection_report(&with_mask).unwrap();
        match report {
            Msg::Sms(sms) => assert_eq!(sms.sms_type, SmsType::Report),
            other => panic!("unexpected {other:?}"),
        }
    }
}
