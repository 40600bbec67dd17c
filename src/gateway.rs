// ABOUTME: Gateway context: wires configuration into connections, routing and box handling
// ABOUTME: Replaces file-scope singletons with one explicitly passed object

use crate::boxc::{BoxcConfig, BoxcEvent, BoxcRegistry, run_listener};
use crate::cfg::{Cfg, CfgError};
use crate::dlr::{DlrStore, MemoryDlrStore};
use crate::msg::Msg;
use crate::router::{Router, run_events};
use crate::smsbox::{Dispatcher, ServiceExecutor};
use crate::smsc;
use crate::smscconn::{SmscConn, SmscEvent, StatusInfo};
use crate::urltrans::{TransType, Translation, TranslationTable};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Cfg(#[from] CfgError),
    #[error(transparent)]
    Smsc(#[from] smsc::SmscError),
    #[error(transparent)]
    Translation(#[from] crate::urltrans::TransError),
    #[error("cannot bind smsbox port: {0}")]
    Bind(std::io::Error),
}

/// One running gateway core.
pub struct Gateway {
    pub router: Arc<Router>,
    pub registry: Arc<BoxcRegistry>,
    pub translations: Arc<TranslationTable>,
    pub dlr: Arc<dyn DlrStore>,
    boxc_events: mpsc::UnboundedSender<BoxcEvent>,
}

impl Gateway {
    /// Bring up everything a parsed configuration describes: one
    /// connection per `smsc` group, the translation table, the DLR
    /// store and the box listener.
    pub async fn start(cfg: &Cfg) -> Result<Gateway, GatewayError> {
        Gateway::start_with_dlr(cfg, Arc::new(MemoryDlrStore::new())).await
    }

    pub async fn start_with_dlr(
        cfg: &Cfg,
        dlr: Arc<dyn DlrStore>,
    ) -> Result<Gateway, GatewayError> {
        let (smsc_tx, smsc_rx) = mpsc::unbounded_channel::<SmscEvent>();
        let (boxc_tx, boxc_rx) = mpsc::unbounded_channel::<BoxcEvent>();

        let mut conns: Vec<Arc<SmscConn>> = Vec::new();
        for grp in cfg.groups("smsc") {
            let conn = smsc::create(grp, smsc_tx.clone(), dlr.clone(), false)?;
            info!("starting smsc connection <{}>", conn.id());
            conns.push(Arc::new(conn));
        }

        let router = Arc::new(Router::new(conns));
        let registry = Arc::new(BoxcRegistry::new());
        let translations = Arc::new(TranslationTable::from_cfg(cfg)?);

        if let Some(core_grp) = cfg.single_group("core") {
            let boxc_cfg = BoxcConfig::from_group(core_grp)?;
            if boxc_cfg.port != 0 {
                let listener = TcpListener::bind(("0.0.0.0", boxc_cfg.port))
                    .await
                    .map_err(GatewayError::Bind)?;
                tokio::spawn(run_listener(
                    listener,
                    boxc_cfg,
                    registry.clone(),
                    boxc_tx.clone(),
                ));
            }
        }

        tokio::spawn(run_events(
            router.clone(),
            registry.clone(),
            smsc_rx,
            boxc_rx,
        ));

        Ok(Gateway {
            router,
            registry,
            translations,
            dlr,
            boxc_events: boxc_tx,
        })
    }

    /// Attach an in-process service dispatcher as a direct box: MO
    /// messages flow into per-request workers, replies come back as MT
    /// traffic. Identical semantics to a TCP smsbox, no wire encoding.
    pub fn attach_dispatcher<E: ServiceExecutor>(&self, executor: Arc<E>) {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Msg>();
        let dispatcher = Dispatcher::new(self.translations.clone(), executor, reply_tx);
        let (handle, mut inbox) = self.registry.direct(self.boxc_events.clone());

        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                dispatcher.dispatch(msg);
            }
        });

        let events = self.boxc_events.clone();
        let boxc_id = handle.id;
        tokio::spawn(async move {
            while let Some(msg) = reply_rx.recv().await {
                let _ = events.send(BoxcEvent::FromBox { boxc_id, msg });
            }
        });
    }

    /// Accept an MT message from an HTTP frontend on behalf of a
    /// sendsms account, applying the account's smsc pinning and default
    /// sender.
    pub fn send_from_account(&self, account: &Translation, msg: Msg) -> Result<(), Msg> {
        debug_assert_eq!(account.trans_type, TransType::SendSms);
        let mut msg = msg;
        if let Msg::Sms(sms) = &mut msg {
            if sms.sender.as_deref().unwrap_or("").is_empty() {
                sms.sender = account.default_sender.clone();
            }
            if let Some(forced) = &account.forced_smsc {
                sms.smsc_id = Some(forced.clone());
            } else if sms.smsc_id.is_none() {
                sms.smsc_id = account.default_smsc.clone();
            }
            if sms.dlr_url.is_none() {
                sms.dlr_url = account.dlr_url.clone();
            }
            sms.service = Some(account.name.clone());
        }
        self.router.send(msg)
    }

    /// Admin snapshot over every connection.
    pub fn status(&self) -> Vec<(String, StatusInfo)> {
        self.router.status()
    }

    pub fn stop_smsc(&self, id: &str) -> bool {
        match self.router.find(id) {
            Some(conn) => conn.stop().is_ok(),
            None => false,
        }
    }

    pub fn start_smsc(&self, id: &str) -> bool {
        match self.router.find(id) {
            Some(conn) => {
                conn.start();
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self, finish_sending: bool) {
        self.router.shutdown_all(finish_sending);
    }
}
