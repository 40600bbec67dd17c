// ABOUTME: End-to-end driver scenarios against a stub SMSC on a local socket
// ABOUTME: Covers submit round-trip, DLR correlation, throttling backoff and reconnect requeue

use crate::cfg::Cfg;
use crate::codec::Frame;
use crate::connection::Connection;
use crate::dlr::{DlrStore, MemoryDlrStore};
use crate::msg::{Coding, DlrStatus, Msg, Sms, SmsType};
use crate::pdu::{self, ton};
use crate::smsc;
use crate::smscconn::{FailReason, SmscConn, SmscConnStatus, SmscEvent};
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, timeout};

struct StubSmsc {
    listener: TcpListener,
    port: u16,
}

impl StubSmsc {
    async fn bind() -> StubSmsc {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        StubSmsc { listener, port }
    }

    async fn accept(&self) -> Connection {
        let (socket, _) = self.listener.accept().await.unwrap();
        Connection::new(socket)
    }
}

/// Read frames, answering keepalives transparently, until something
/// else arrives.
async fn next_request(conn: &mut Connection) -> Option<Frame> {
    loop {
        let frame = timeout(Duration::from_secs(60), conn.read_frame())
            .await
            .expect("stub timed out waiting for a frame")
            .expect("stub read error")?;
        match frame {
            Frame::EnquireLink(el) => {
                conn.write_frame(&Frame::EnquireLinkResp(pdu::EnquireLinkResp::new(
                    el.sequence_number,
                )))
                .await
                .unwrap();
            }
            other => return Some(other),
        }
    }
}

/// Accept the bind request and answer it with the given status.
async fn answer_bind(conn: &mut Connection, status: pdu::CommandStatus) {
    match next_request(conn).await.expect("expected a bind") {
        Frame::BindTransceiver(bind) => {
            assert_eq!(bind.interface_version, 0x34);
            let resp = if status.is_ok() {
                pdu::BindTransceiverResp::ok(bind.sequence_number, "STUB")
            } else {
                pdu::BindTransceiverResp::error(bind.sequence_number, status)
            };
            conn.write_frame(&Frame::BindTransceiverResp(resp)).await.unwrap();
        }
        other => panic!("expected bind_transceiver, got {other:?}"),
    }
}

fn driver_cfg(port: u16, extra: &str) -> Cfg {
    Cfg::parse(&format!(
        "group = smsc\nsmsc = smpp\nsmsc-id = op1\nhost = 127.0.0.1\nport = {port}\n\
         transceiver-mode = true\nsmsc-username = user\nsmsc-password = pass\n\
         max-pending-submits = 1\nreconnect-delay = 1\n{extra}"
    ))
    .unwrap()
}

fn start_conn(
    cfg: &Cfg,
    dlr: Arc<dyn DlrStore>,
) -> (SmscConn, mpsc::UnboundedReceiver<SmscEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let grp = cfg.single_group("smsc").unwrap();
    let conn = smsc::create(grp, tx, dlr, false).unwrap();
    (conn, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SmscEvent>) -> SmscEvent {
    timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

fn test_mt(receiver: &str, text: &str, dlr_mask: i32) -> Msg {
    let mut sms = Sms::new();
    sms.sender = Some("12345".to_string());
    sms.receiver = Some(receiver.to_string());
    sms.msgdata = Some(Bytes::copy_from_slice(text.as_bytes()));
    sms.coding = Coding::SevenBit;
    sms.dlr_mask = dlr_mask;
    sms.sms_type = SmsType::MtPush;
    Msg::Sms(sms)
}

#[tokio::test(start_paused = true)]
async fn submit_round_trip() {
    let stub = StubSmsc::bind().await;
    let cfg = driver_cfg(stub.port, "");
    let (conn, mut events) = start_conn(&cfg, Arc::new(MemoryDlrStore::new()));

    let mut smsc_side = stub.accept().await;
    answer_bind(&mut smsc_side, pdu::status::ESME_ROK).await;
    assert!(matches!(next_event(&mut events).await, SmscEvent::Connected { .. }));
    assert_eq!(conn.status(), SmscConnStatus::Active);

    conn.send(&test_mt("+358401234567", "hi", 0)).unwrap();

    let submit = match next_request(&mut smsc_side).await.unwrap() {
        Frame::SubmitSm(submit) => submit,
        other => panic!("expected submit_sm, got {other:?}"),
    };
    assert_eq!(submit.body.destination_addr, "358401234567");
    assert_eq!(submit.body.dest_addr_ton, ton::INTERNATIONAL);
    assert_eq!(submit.body.source_addr, "12345");
    assert_eq!(submit.body.data_coding, 0x00);
    assert_eq!(submit.body.short_message.as_ref(), b"hi");

    smsc_side
        .write_frame(&Frame::SubmitSmResp(pdu::SubmitSmResp::ok(
            submit.sequence_number,
            "m1",
        )))
        .await
        .unwrap();

    match next_event(&mut events).await {
        SmscEvent::Sent { msg: Msg::Sms(sms), .. } => {
            assert_eq!(sms.receiver.as_deref(), Some("358401234567"));
        }
        other => panic!("expected Sent, got {other:?}"),
    }
    // the window is free again
    assert_eq!(conn.queued(), 0);
}

#[tokio::test(start_paused = true)]
async fn inbound_dlr_correlation() {
    let stub = StubSmsc::bind().await;
    let cfg = driver_cfg(stub.port, "");
    let dlr: Arc<dyn DlrStore> = Arc::new(MemoryDlrStore::new());
    let (conn, mut events) = start_conn(&cfg, dlr.clone());

    let mut smsc_side = stub.accept().await;
    answer_bind(&mut smsc_side, pdu::status::ESME_ROK).await;
    assert!(matches!(next_event(&mut events).await, SmscEvent::Connected { .. }));

    // submit with device-ack requested
    let mask = DlrStatus::Success as i32 | DlrStatus::Fail as i32;
    conn.send(&test_mt("+358401234567", "hi", mask)).unwrap();
    let submit = match next_request(&mut smsc_side).await.unwrap() {
        Frame::SubmitSm(submit) => submit,
        other => panic!("expected submit_sm, got {other:?}"),
    };
    assert_eq!(submit.body.registered_delivery, 1);
    smsc_side
        .write_frame(&Frame::SubmitSmResp(pdu::SubmitSmResp::ok(
            submit.sequence_number,
            "m1",
        )))
        .await
        .unwrap();
    assert!(matches!(next_event(&mut events).await, SmscEvent::Sent { .. }));
    assert_eq!(dlr.len(), 1);

    // the SMSC reports delivery
    let receipt_text = "id:m1 stat:DELIVRD err:0";
    let mut body = pdu::SmBody::default();
    body.esm_class = 0x04;
    body.source_addr = "358401234567".to_string();
    body.destination_addr = "12345".to_string();
    body.short_message = Bytes::copy_from_slice(receipt_text.as_bytes());
    smsc_side
        .write_frame(&Frame::DeliverSm(Box::new(pdu::DeliverSm {
            command_status: pdu::status::ESME_ROK,
            sequence_number: 777,
            body,
        })))
        .await
        .unwrap();

    match next_event(&mut events).await {
        SmscEvent::Received { msg: Msg::Sms(sms), .. } => {
            assert_eq!(sms.sms_type, SmsType::Report);
            assert_eq!(sms.msgdata.as_deref(), Some(receipt_text.as_bytes()));
        }
        other => panic!("expected Received report, got {other:?}"),
    }

    match next_request(&mut smsc_side).await.unwrap() {
        Frame::DeliverSmResp(resp) => {
            assert_eq!(resp.sequence_number, 777);
            assert!(resp.command_status.is_ok());
        }
        other => panic!("expected deliver_sm_resp, got {other:?}"),
    }
    // final status consumed the store entry
    assert_eq!(dlr.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn throttling_backoff() {
    let stub = StubSmsc::bind().await;
    let cfg = driver_cfg(stub.port, "");
    let (conn, mut events) = start_conn(&cfg, Arc::new(MemoryDlrStore::new()));

    let mut smsc_side = stub.accept().await;
    answer_bind(&mut smsc_side, pdu::status::ESME_ROK).await;
    assert!(matches!(next_event(&mut events).await, SmscEvent::Connected { .. }));

    conn.send(&test_mt("+358401111111", "one", 0)).unwrap();
    conn.send(&test_mt("+358402222222", "two", 0)).unwrap();

    let first = match next_request(&mut smsc_side).await.unwrap() {
        Frame::SubmitSm(submit) => submit,
        other => panic!("expected submit_sm, got {other:?}"),
    };
    let throttled_at = Instant::now();
    smsc_side
        .write_frame(&Frame::SubmitSmResp(pdu::SubmitSmResp::error(
            first.sequence_number,
            pdu::status::ESME_RTHROTTLED,
        )))
        .await
        .unwrap();

    match next_event(&mut events).await {
        SmscEvent::SendFailed { reason, .. } => assert_eq!(reason, FailReason::Temporary),
        other => panic!("expected SendFailed, got {other:?}"),
    }

    // the second submit is held back for the throttling sleep
    let second = match next_request(&mut smsc_side).await.unwrap() {
        Frame::SubmitSm(submit) => submit,
        other => panic!("expected submit_sm, got {other:?}"),
    };
    assert!(throttled_at.elapsed() >= Duration::from_secs(15));
    smsc_side
        .write_frame(&Frame::SubmitSmResp(pdu::SubmitSmResp::ok(
            second.sequence_number,
            "m2",
        )))
        .await
        .unwrap();
    assert!(matches!(next_event(&mut events).await, SmscEvent::Sent { .. }));
}

#[tokio::test(start_paused = true)]
async fn reconnect_requeues_pending_and_queued() {
    let stub = StubSmsc::bind().await;
    let cfg = driver_cfg(stub.port, "");
    let (conn, mut events) = start_conn(&cfg, Arc::new(MemoryDlrStore::new()));

    let mut smsc_side = stub.accept().await;
    answer_bind(&mut smsc_side, pdu::status::ESME_ROK).await;
    assert!(matches!(next_event(&mut events).await, SmscEvent::Connected { .. }));

    conn.send(&test_mt("+358401111111", "one", 0)).unwrap();
    conn.send(&test_mt("+358402222222", "two", 0)).unwrap();
    conn.send(&test_mt("+358403333333", "three", 0)).unwrap();

    // first message goes in flight (window of one), then the link dies
    let _submit = match next_request(&mut smsc_side).await.unwrap() {
        Frame::SubmitSm(submit) => submit,
        other => panic!("expected submit_sm, got {other:?}"),
    };
    drop(smsc_side);

    let mut failed = 0;
    while failed < 3 {
        match next_event(&mut events).await {
            SmscEvent::SendFailed { reason, .. } => {
                assert_eq!(reason, FailReason::Temporary);
                failed += 1;
            }
            other => panic!("expected SendFailed, got {other:?}"),
        }
    }

    // after reconnect-delay the driver binds again
    let mut smsc_side = stub.accept().await;
    answer_bind(&mut smsc_side, pdu::status::ESME_ROK).await;
    assert!(matches!(next_event(&mut events).await, SmscEvent::Connected { .. }));
    assert_eq!(conn.status(), SmscConnStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn credential_rejection_kills_connection() {
    let stub = StubSmsc::bind().await;
    let cfg = driver_cfg(stub.port, "");
    let (conn, mut events) = start_conn(&cfg, Arc::new(MemoryDlrStore::new()));

    let mut smsc_side = stub.accept().await;
    answer_bind(&mut smsc_side, pdu::status::ESME_RINVPASWD).await;

    match next_event(&mut events).await {
        SmscEvent::Killed { reason, .. } => {
            assert_eq!(reason, crate::smscconn::KillReason::WrongPassword);
        }
        other => panic!("expected Killed, got {other:?}"),
    }
    assert_eq!(conn.status(), SmscConnStatus::Dead);
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_queued_messages() {
    let stub = StubSmsc::bind().await;
    let cfg = driver_cfg(stub.port, "");
    let (conn, mut events) = start_conn(&cfg, Arc::new(MemoryDlrStore::new()));

    let mut smsc_side = stub.accept().await;
    answer_bind(&mut smsc_side, pdu::status::ESME_ROK).await;
    assert!(matches!(next_event(&mut events).await, SmscEvent::Connected { .. }));

    conn.send(&test_mt("+358401111111", "one", 0)).unwrap();
    let submit = match next_request(&mut smsc_side).await.unwrap() {
        Frame::SubmitSm(submit) => submit,
        other => panic!("expected submit_sm, got {other:?}"),
    };
    // a second message stays queued behind the single-slot window
    conn.send(&test_mt("+358402222222", "two", 0)).unwrap();

    conn.shutdown(false);

    // instant shutdown: both messages fail with the shutdown reason
    let mut failed = 0;
    let mut killed = false;
    while failed < 2 || !killed {
        match next_event(&mut events).await {
            SmscEvent::SendFailed { reason, .. } => {
                assert_eq!(reason, FailReason::Shutdown);
                failed += 1;
            }
            SmscEvent::Killed { .. } => killed = true,
            SmscEvent::Sent { .. } => panic!("nothing should be sent after shutdown"),
            _ => {}
        }
    }
    assert_eq!(conn.status(), SmscConnStatus::Dead);

    // the stub sees the unbind; answering it lets the driver finish
    match next_request(&mut smsc_side).await {
        Some(Frame::Unbind(unbind)) => {
            smsc_side
                .write_frame(&Frame::UnbindResp(pdu::UnbindResp::new(
                    unbind.sequence_number,
                )))
                .await
                .ok();
        }
        _ => {}
    }
    let _ = submit;
}

#[tokio::test(start_paused = true)]
async fn mo_message_is_delivered_upward() {
    let stub = StubSmsc::bind().await;
    let cfg = driver_cfg(stub.port, "");
    let (_conn, mut events) = start_conn(&cfg, Arc::new(MemoryDlrStore::new()));

    let mut smsc_side = stub.accept().await;
    answer_bind(&mut smsc_side, pdu::status::ESME_ROK).await;
    assert!(matches!(next_event(&mut events).await, SmscEvent::Connected { .. }));

    let mut body = pdu::SmBody::default();
    body.source_addr = "358409876543".to_string();
    body.source_addr_ton = ton::INTERNATIONAL;
    body.destination_addr = "12345".to_string();
    body.data_coding = 0x00;
    body.short_message = Bytes::from_static(b"info weather");
    smsc_side
        .write_frame(&Frame::DeliverSm(Box::new(pdu::DeliverSm {
            command_status: pdu::status::ESME_ROK,
            sequence_number: 42,
            body,
        })))
        .await
        .unwrap();

    match next_event(&mut events).await {
        SmscEvent::Received { msg: Msg::Sms(sms), .. } => {
            assert_eq!(sms.sender.as_deref(), Some("+358409876543"));
            assert_eq!(sms.receiver.as_deref(), Some("12345"));
            assert_eq!(sms.smsc_id.as_deref(), Some("op1"));
            assert_eq!(sms.sms_type, SmsType::Mo);
            assert_eq!(sms.msgdata.as_deref(), Some(&b"info weather"[..]));
        }
        other => panic!("expected Received, got {other:?}"),
    }
    match next_request(&mut smsc_side).await.unwrap() {
        Frame::DeliverSmResp(resp) => {
            assert_eq!(resp.sequence_number, 42);
            assert!(resp.command_status.is_ok());
        }
        other => panic!("expected deliver_sm_resp, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn stopped_connection_defers_inbound() {
    let stub = StubSmsc::bind().await;
    let cfg = driver_cfg(stub.port, "");
    let (conn, mut events) = start_conn(&cfg, Arc::new(MemoryDlrStore::new()));

    let mut smsc_side = stub.accept().await;
    answer_bind(&mut smsc_side, pdu::status::ESME_ROK).await;
    assert!(matches!(next_event(&mut events).await, SmscEvent::Connected { .. }));

    conn.stop().unwrap();

    let mut body = pdu::SmBody::default();
    body.source_addr = "358409876543".to_string();
    body.destination_addr = "12345".to_string();
    body.short_message = Bytes::from_static(b"hello");
    smsc_side
        .write_frame(&Frame::DeliverSm(Box::new(pdu::DeliverSm {
            command_status: pdu::status::ESME_ROK,
            sequence_number: 9,
            body,
        })))
        .await
        .unwrap();

    match next_request(&mut smsc_side).await.unwrap() {
        Frame::DeliverSmResp(resp) => {
            assert_eq!(resp.sequence_number, 9);
            // retry-later towards the SMSC while stopped
            assert_eq!(resp.command_status, pdu::status::ESME_RX_T_APPN);
        }
        other => panic!("expected deliver_sm_resp, got {other:?}"),
    }
}
