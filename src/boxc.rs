// ABOUTME: Box connection handling: framed Msg exchange with smsbox/wapbox processes
// ABOUTME: Admission by IP, heartbeat/load tracking, and requeue of undelivered messages

use crate::cfg::{CfgError, CfgGroup};
use crate::msg::{Msg, MsgError};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info, warn};

const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(120);
/// Upper bound on one framed message, matches the router's own limits.
const MAX_FRAME: u32 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum BoxcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("oversized frame: {0} bytes")]
    Oversized(u32),
    #[error("malformed message: {0}")]
    Malformed(#[from] MsgError),
    #[error("box connection closed")]
    Closed,
}

/// Match one IP list entry: exact string or `*` wildcard segments.
fn ip_entry_matches(entry: &str, ip: &str) -> bool {
    if entry == ip {
        return true;
    }
    let entry_segs: Vec<&str> = entry.split('.').collect();
    let ip_segs: Vec<&str> = ip.split('.').collect();
    entry_segs.len() == ip_segs.len()
        && entry_segs
            .iter()
            .zip(&ip_segs)
            .all(|(e, i)| *e == "*" || e == i)
}

fn ip_list_matches(list: &str, ip: &str) -> bool {
    list.split(';')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .any(|e| ip_entry_matches(e, ip))
}

/// Admission check: an allow-list hit admits; the deny list is
/// consulted only when the allow list did not admit.
pub fn ip_allowed(allow: Option<&str>, deny: Option<&str>, ip: &str) -> bool {
    if let Some(allow) = allow {
        if ip_list_matches(allow, ip) {
            return true;
        }
    }
    if let Some(deny) = deny {
        if ip_list_matches(deny, ip) {
            return false;
        }
    }
    true
}

/// Read one length-framed packed message.
///
/// `Ok(None)` is a clean EOF between frames. A frame that unpacks to
/// garbage is a [`BoxcError::Malformed`]; the caller logs it and keeps
/// the link running.
pub async fn read_msg<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Msg>, BoxcError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(BoxcError::Oversized(len));
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    Ok(Some(Msg::unpack(&data)?))
}

/// Write one length-framed packed message.
pub async fn write_msg<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Msg) -> Result<(), BoxcError> {
    let packed = msg.pack();
    writer.write_all(&(packed.len() as u32).to_be_bytes()).await?;
    writer.write_all(&packed).await?;
    writer.flush().await?;
    Ok(())
}

/// Listener configuration from the `core` group.
#[derive(Debug, Clone, Default)]
pub struct BoxcConfig {
    pub port: u16,
    pub allow_ip: Option<String>,
    pub deny_ip: Option<String>,
    pub heartbeat_timeout: Duration,
}

impl BoxcConfig {
    pub fn from_group(grp: &CfgGroup) -> Result<Self, CfgError> {
        Ok(BoxcConfig {
            port: grp.get_integer("smsbox-port")?.unwrap_or(0) as u16,
            allow_ip: grp.get_string("box-allow-ip"),
            deny_ip: grp.get_string("box-deny-ip"),
            heartbeat_timeout: grp
                .get_integer("box-heartbeat-timeout")?
                .map(|s| Duration::from_secs(s.max(1) as u64))
                .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT),
        })
    }
}

/// Handle to one connected box: the outbound channel plus its reported
/// load for load-aware dispatch.
#[derive(Debug)]
pub struct BoxcHandle {
    pub id: usize,
    pub client_ip: String,
    load: AtomicI64,
    tx: mpsc::UnboundedSender<Msg>,
}

impl BoxcHandle {
    pub fn load(&self) -> i64 {
        self.load.load(Ordering::Relaxed)
    }

    /// Queue a message towards the box. The message comes back on
    /// failure so the caller can requeue it elsewhere.
    pub fn deliver(&self, msg: Msg) -> Result<(), Msg> {
        self.tx.send(msg).map_err(|e| e.0)
    }
}

/// What the box side reports to the gateway event loop.
#[derive(Debug)]
pub enum BoxcEvent {
    Connected(Arc<BoxcHandle>),
    /// MT message (or WAP datagram) produced by a box.
    FromBox { boxc_id: usize, msg: Msg },
    Disconnected {
        boxc_id: usize,
        undelivered: Vec<Msg>,
    },
}

/// Live box connections, shared between the acceptor and the router.
#[derive(Debug, Default)]
pub struct BoxcRegistry {
    boxes: Mutex<Vec<Arc<BoxcHandle>>>,
    next_id: AtomicUsize,
}

impl BoxcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, client_ip: String, tx: mpsc::UnboundedSender<Msg>) -> Arc<BoxcHandle> {
        let handle = Arc::new(BoxcHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            client_ip,
            load: AtomicI64::new(0),
            tx,
        });
        self.boxes.lock().unwrap().push(handle.clone());
        handle
    }

    fn unregister(&self, id: usize) {
        self.boxes.lock().unwrap().retain(|b| b.id != id);
    }

    pub fn count(&self) -> usize {
        self.boxes.lock().unwrap().len()
    }

    /// Pick the box with the lowest reported load, ties to the oldest
    /// connection.
    pub fn least_loaded(&self) -> Option<Arc<BoxcHandle>> {
        self.boxes
            .lock()
            .unwrap()
            .iter()
            .min_by_key(|b| (b.load(), b.id))
            .cloned()
    }

    /// Deliver to the least-loaded box; the message comes back when no
    /// box is connected.
    pub fn route(&self, msg: Msg) -> Result<(), Msg> {
        match self.least_loaded() {
            Some(handle) => handle.deliver(msg),
            None => Err(msg),
        }
    }

    /// Register an in-process box: same semantics as a TCP box with no
    /// wire encoding. Returns the handle and the box-side inbox.
    pub fn direct(
        &self,
        events: mpsc::UnboundedSender<BoxcEvent>,
    ) -> (Arc<BoxcHandle>, mpsc::UnboundedReceiver<Msg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.register("local".to_string(), tx);
        let _ = events.send(BoxcEvent::Connected(handle.clone()));
        (handle, rx)
    }
}

/// Accept loop: admit clients by IP and run one connection task each.
pub async fn run_listener(
    listener: TcpListener,
    config: BoxcConfig,
    registry: Arc<BoxcRegistry>,
    events: mpsc::UnboundedSender<BoxcEvent>,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("BOXC: accept failed: {e}");
                continue;
            }
        };
        let ip = peer.ip().to_string();
        if !ip_allowed(config.allow_ip.as_deref(), config.deny_ip.as_deref(), &ip) {
            warn!("BOXC: non-allowed connect tried from <{ip}>, disconnected");
            continue;
        }
        info!("BOXC: client connected from <{ip}>");
        let registry = registry.clone();
        let events = events.clone();
        let heartbeat_timeout = config.heartbeat_timeout;
        tokio::spawn(async move {
            run_connection(socket, ip, heartbeat_timeout, registry, events).await;
        });
    }
}

/// One box link: reads frames until EOF, heartbeat timeout or a hard
/// error, writing queued messages concurrently.
async fn run_connection(
    socket: TcpStream,
    client_ip: String,
    heartbeat_timeout: Duration,
    registry: Arc<BoxcRegistry>,
    events: mpsc::UnboundedSender<BoxcEvent>,
) {
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
    let handle = registry.register(client_ip.clone(), tx);
    let boxc_id = handle.id;
    let _ = events.send(BoxcEvent::Connected(handle.clone()));

    let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
    let writer_task = tokio::spawn(async move {
        let mut undelivered = Vec::new();
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                maybe_msg = rx.recv() => match maybe_msg {
                    Some(msg) => {
                        if let Err(e) = write_msg(&mut writer, &msg).await {
                            error!("BOXC: send message failed: {e}");
                            undelivered.push(msg);
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        while let Ok(msg) = rx.try_recv() {
            undelivered.push(msg);
        }
        undelivered
    });

    loop {
        match timeout(heartbeat_timeout, read_msg(&mut reader)).await {
            Err(_) => {
                warn!("BOXC: client <{client_ip}> heartbeat timeout, closing");
                break;
            }
            Ok(Ok(None)) => {
                info!("BOXC: client <{client_ip}> closed connection");
                break;
            }
            Ok(Ok(Some(msg))) => match msg {
                Msg::Heartbeat(hb) => {
                    handle.load.store(hb.load as i64, Ordering::Relaxed);
                }
                Msg::Ack(_) => {}
                other => {
                    debug!("BOXC: got {} from <{client_ip}>", other.type_name());
                    let _ = events.send(BoxcEvent::FromBox {
                        boxc_id,
                        msg: other,
                    });
                }
            },
            Ok(Err(BoxcError::Malformed(e))) => {
                error!("BOXC: malformed message from <{client_ip}>, discarded: {e}");
            }
            Ok(Err(e)) => {
                error!("BOXC: read error from <{client_ip}>: {e}");
                break;
            }
        }
    }

    // removing the handle first stops new deliveries racing the drain
    registry.unregister(boxc_id);
    let _ = stop_tx.send(());
    let undelivered = writer_task.await.unwrap_or_default();
    let _ = events.send(BoxcEvent::Disconnected {
        boxc_id,
        undelivered,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{Heartbeat, Sms};
    use bytes::Bytes;

    #[test]
    fn ip_admission_rules() {
        // allow hit admits even when deny would match
        assert!(ip_allowed(Some("10.0.0.1"), Some("10.0.0.1"), "10.0.0.1"));
        // deny consulted only when allow missed
        assert!(!ip_allowed(Some("10.0.0.2"), Some("10.0.0.1"), "10.0.0.1"));
        // no lists: open
        assert!(ip_allowed(None, None, "1.2.3.4"));
        // wildcard segments
        assert!(ip_allowed(Some("192.168.*.*"), None, "192.168.4.7"));
        assert!(!ip_allowed(None, Some("192.168.*.*"), "192.168.4.7"));
        // list form
        assert!(!ip_allowed(None, Some("10.0.0.1;10.0.0.2"), "10.0.0.2"));
    }

    #[tokio::test]
    async fn framed_roundtrip_over_buffer() {
        let mut sms = Sms::new();
        sms.sender = Some("123".into());
        sms.msgdata = Some(Bytes::from_static(b"payload"));
        let msg = Msg::Sms(sms);

        let mut buf = std::io::Cursor::new(Vec::new());
        write_msg(&mut buf, &msg).await.unwrap();
        // two messages back to back
        write_msg(&mut buf, &Msg::Heartbeat(Heartbeat { load: 3 })).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf.into_inner());
        let first = read_msg(&mut cursor).await.unwrap().unwrap();
        assert_eq!(first, msg);
        let second = read_msg(&mut cursor).await.unwrap().unwrap();
        assert_eq!(second, Msg::Heartbeat(Heartbeat { load: 3 }));
        assert!(read_msg(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_msg(&mut cursor).await,
            Err(BoxcError::Oversized(_))
        ));
    }

    #[tokio::test]
    async fn registry_routes_to_least_loaded() {
        let registry = BoxcRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = registry.register("a".into(), tx_a);
        let b = registry.register("b".into(), tx_b);
        a.load.store(5, Ordering::Relaxed);
        b.load.store(2, Ordering::Relaxed);

        registry.route(Msg::Heartbeat(Heartbeat { load: 0 })).unwrap();
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn route_without_boxes_returns_message() {
        let registry = BoxcRegistry::new();
        let msg = Msg::Heartbeat(Heartbeat { load: 0 });
        assert!(registry.route(msg).is_err());
    }

    #[tokio::test]
    async fn box_connection_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(BoxcRegistry::new());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let config = BoxcConfig {
            port: addr.port(),
            allow_ip: None,
            deny_ip: None,
            heartbeat_timeout: Duration::from_secs(5),
        };
        tokio::spawn(run_listener(listener, config, registry.clone(), events_tx));

        // a box connects, reports load, sends one MT message
        let mut box_socket = TcpStream::connect(addr).await.unwrap();
        write_msg(&mut box_socket, &Msg::Heartbeat(Heartbeat { load: 1 }))
            .await
            .unwrap();
        let mut mt = Sms::new();
        mt.receiver = Some("+358401234567".into());
        mt.msgdata = Some(Bytes::from_static(b"hello"));
        write_msg(&mut box_socket, &Msg::Sms(mt.clone())).await.unwrap();

        let connected = events_rx.recv().await.unwrap();
        let handle = match connected {
            BoxcEvent::Connected(h) => h,
            other => panic!("expected Connected, got {other:?}"),
        };
        let from_box = events_rx.recv().await.unwrap();
        match from_box {
            BoxcEvent::FromBox { msg: Msg::Sms(sms), .. } => {
                assert_eq!(sms.msgdata.as_deref(), Some(&b"hello"[..]));
            }
            other => panic!("expected FromBox sms, got {other:?}"),
        }

        // MO delivery towards the box arrives framed
        let mut mo = Sms::new();
        mo.sender = Some("999".into());
        handle.deliver(Msg::Sms(mo.clone())).unwrap();
        let delivered = read_msg(&mut box_socket).await.unwrap().unwrap();
        assert_eq!(delivered, Msg::Sms(mo));

        // dropping the socket disconnects and unregisters
        drop(box_socket);
        loop {
            match events_rx.recv().await.unwrap() {
                BoxcEvent::Disconnected { .. } => break,
                _ => continue,
            }
        }
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn direct_box_exchanges_without_wire() {
        let registry = Arc::new(BoxcRegistry::new());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (handle, mut inbox) = registry.direct(events_tx);

        assert!(matches!(
            events_rx.recv().await.unwrap(),
            BoxcEvent::Connected(_)
        ));
        let msg = Msg::Heartbeat(Heartbeat { load: 9 });
        handle.deliver(msg.clone()).unwrap();
        assert_eq!(inbox.recv().await.unwrap(), msg);
    }
}
