// ABOUTME: Delivery-report store: the narrow interface the driver correlates DLRs through
// ABOUTME: Ships an in-memory implementation; persistent backends plug in behind the trait

use crate::msg::{DlrStatus, Msg, Sms, SmsType};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Store of messages awaiting delivery reports, keyed by
/// `(smsc_id, smsc message id)`. Persistence semantics are the
/// implementation's business; the core only adds and finds.
pub trait DlrStore: Send + Sync {
    /// Register an accepted message under the id the SMSC assigned it.
    fn add(&self, smsc_id: &str, message_id: &str, msg: &Msg);

    /// Look up the message a report refers to. Returns a reconstituted
    /// template with sender/receiver swapped to the report direction,
    /// or `None` when the entry is missing or its dlr_mask does not ask
    /// for this status class.
    fn find(
        &self,
        smsc_id: &str,
        message_id: &str,
        destination: &str,
        status: DlrStatus,
    ) -> Option<Msg>;

    /// Number of entries currently held.
    fn len(&self) -> usize;
}

#[derive(Debug, Clone)]
struct DlrEntry {
    source: Option<String>,
    destination: Option<String>,
    service: Option<String>,
    dlr_url: Option<String>,
    dlr_mask: i32,
    boxc_id: Option<String>,
}

/// Hash-map backed store; entries for final statuses are consumed by
/// the lookup, intermediate ones stay for the final report.
#[derive(Default)]
pub struct MemoryDlrStore {
    entries: Mutex<HashMap<(String, String), DlrEntry>>,
}

impl MemoryDlrStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DlrStore for MemoryDlrStore {
    fn add(&self, smsc_id: &str, message_id: &str, msg: &Msg) {
        let Msg::Sms(sms) = msg else {
            return;
        };
        let entry = DlrEntry {
            source: sms.sender.clone(),
            destination: sms.receiver.clone(),
            service: sms.service.clone(),
            dlr_url: sms.dlr_url.clone(),
            dlr_mask: sms.dlr_mask,
            boxc_id: sms.boxc_id.clone(),
        };
        debug!("DLR[{smsc_id}]: registered message id <{message_id}>");
        self.entries
            .lock()
            .unwrap()
            .insert((smsc_id.to_string(), message_id.to_string()), entry);
    }

    fn find(
        &self,
        smsc_id: &str,
        message_id: &str,
        _destination: &str,
        status: DlrStatus,
    ) -> Option<Msg> {
        let key = (smsc_id.to_string(), message_id.to_string());
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get(&key)?;

        if entry.dlr_mask <= 0 || entry.dlr_mask & status as i32 == 0 {
            debug!(
                "DLR[{smsc_id}]: message id <{message_id}> not interested in status {status:?}"
            );
            return None;
        }
        let entry = if status.is_final() {
            entries.remove(&key).unwrap()
        } else {
            entry.clone()
        };

        let mut sms = Sms::new();
        // reports travel back towards the originator
        sms.sender = entry.destination;
        sms.receiver = entry.source;
        sms.service = entry.service;
        sms.dlr_url = entry.dlr_url;
        sms.dlr_mask = entry.dlr_mask;
        sms.boxc_id = entry.boxc_id;
        sms.smsc_id = Some(smsc_id.to_string());
        sms.sms_type = SmsType::Report;
        Some(Msg::Sms(sms))
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::DlrStatus;

    fn stored_msg(mask: i32) -> Msg {
        let mut sms = Sms::new();
        sms.sender = Some("12345".into());
        sms.receiver = Some("+358401234567".into());
        sms.service = Some("svc".into());
        sms.dlr_url = Some("http://cb/dlr".into());
        sms.dlr_mask = mask;
        Msg::Sms(sms)
    }

    #[test]
    fn add_and_find_final_consumes_entry() {
        let store = MemoryDlrStore::new();
        store.add("op1", "m1", &stored_msg(DlrStatus::Success as i32));
        assert_eq!(store.len(), 1);

        let found = store
            .find("op1", "m1", "358401234567", DlrStatus::Success)
            .unwrap();
        match found {
            Msg::Sms(sms) => {
                assert_eq!(sms.sms_type, SmsType::Report);
                assert_eq!(sms.sender.as_deref(), Some("+358401234567"));
                assert_eq!(sms.receiver.as_deref(), Some("12345"));
                assert_eq!(sms.dlr_url.as_deref(), Some("http://cb/dlr"));
                assert_eq!(sms.smsc_id.as_deref(), Some("op1"));
            }
            other => panic!("expected sms, got {other:?}"),
        }
        assert_eq!(store.len(), 0);
        assert!(
            store
                .find("op1", "m1", "358401234567", DlrStatus::Success)
                .is_none()
        );
    }

    #[test]
    fn buffered_report_keeps_entry_for_final() {
        let store = MemoryDlrStore::new();
        store.add(
            "op1",
            "m2",
            &stored_msg(DlrStatus::Success as i32 | DlrStatus::Buffered as i32),
        );
        assert!(
            store
                .find("op1", "m2", "358401234567", DlrStatus::Buffered)
                .is_some()
        );
        assert_eq!(store.len(), 1);
        assert!(
            store
                .find("op1", "m2", "358401234567", DlrStatus::Success)
                .is_some()
        );
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn mask_mismatch_returns_none() {
        let store = MemoryDlrStore::new();
        store.add("op1", "m3", &stored_msg(DlrStatus::Fail as i32));
        assert!(
            store
                .find("op1", "m3", "358401234567", DlrStatus::Buffered)
                .is_none()
        );
        // entry survives a mismatched lookup
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unknown_id_returns_none() {
        let store = MemoryDlrStore::new();
        assert!(
            store
                .find("op1", "nope", "358401234567", DlrStatus::Success)
                .is_none()
        );
    }
}
