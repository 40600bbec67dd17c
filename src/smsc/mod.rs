// ABOUTME: SMSC driver construction: turns an `smsc` config group into a live connection
// ABOUTME: SMPP is the only wire protocol implemented here; others plug in via SmscDriver

pub mod smpp;

use crate::cfg::{CfgError, CfgGroup};
use crate::dlr::DlrStore;
use crate::smscconn::{ConnEvents, ConnState, RerouteRules, RouteFilters, SmscConn, SmscEvent};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SmscError {
    #[error(transparent)]
    Cfg(#[from] CfgError),
    #[error("unsupported smsc type '{0}'")]
    UnsupportedType(String),
}

/// Everything a protocol driver needs from the surrounding framework.
pub struct ConnSetup {
    pub id: String,
    pub state: Arc<ConnState>,
    pub events: ConnEvents,
    pub dlr: Arc<dyn DlrStore>,
    /// Messages per second, 0 for unlimited.
    pub throughput: u32,
    pub reconnect_delay: Duration,
    pub alt_dcs: bool,
    pub our_host: Option<String>,
    pub log_file: Option<String>,
    pub log_level: i64,
}

/// Build an [`SmscConn`] from an `smsc` configuration group, starting
/// its driver tasks. Driver events arrive on `events_tx`.
pub fn create(
    grp: &CfgGroup,
    events_tx: mpsc::UnboundedSender<SmscEvent>,
    dlr: Arc<dyn DlrStore>,
    start_as_stopped: bool,
) -> Result<SmscConn, SmscError> {
    let smsc_type = grp.require("smsc")?;

    let filters = RouteFilters::from_group(grp)?;
    let reroute = RerouteRules::from_group(grp)?;
    let unified_prefix = grp.get_string("unified-prefix");
    let throughput = grp.get_integer("throughput")?.unwrap_or(0).max(0) as u32;
    let reconnect_delay = grp
        .get_integer("reconnect-delay")?
        .map(|secs| Duration::from_secs(secs.max(0) as u64))
        .unwrap_or(DEFAULT_RECONNECT_DELAY);
    let alt_dcs = grp.get_bool("alt-dcs")?.unwrap_or(false);

    let state = Arc::new(ConnState::new(start_as_stopped));

    match smsc_type.as_str() {
        "smpp" => {
            let cfg = smpp::SmppConfig::from_group(grp)?;
            let id = grp
                .get_string("smsc-id")
                .unwrap_or_else(|| cfg.connection_name());
            let name = cfg.connection_name();
            let setup = ConnSetup {
                id: id.clone(),
                state: state.clone(),
                events: ConnEvents::new(id.clone(), state.clone(), events_tx),
                dlr,
                throughput,
                reconnect_delay,
                alt_dcs,
                our_host: grp.get_string("our-host"),
                log_file: grp.get_string("log-file"),
                log_level: grp.get_integer("log-level")?.unwrap_or(0),
            };
            let driver = smpp::SmppDriver::create(cfg, setup);
            Ok(SmscConn {
                name,
                id,
                filters,
                unified_prefix,
                reroute,
                state,
                driver: Box::new(driver),
            })
        }
        other => Err(SmscError::UnsupportedType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::Cfg;
    use crate::dlr::MemoryDlrStore;

    #[tokio::test]
    async fn unsupported_type_is_an_error() {
        let cfg = Cfg::parse("group = smsc\nsmsc = cimd2\n").unwrap();
        let grp = cfg.single_group("smsc").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = create(grp, tx, Arc::new(MemoryDlrStore::new()), false).unwrap_err();
        assert!(matches!(err, SmscError::UnsupportedType(t) if t == "cimd2"));
    }

    #[tokio::test]
    async fn missing_smsc_type_is_an_error() {
        let cfg = Cfg::parse("group = smsc\nhost = 1.2.3.4\n").unwrap();
        let grp = cfg.single_group("smsc").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(create(grp, tx, Arc::new(MemoryDlrStore::new()), false).is_err());
    }
}
