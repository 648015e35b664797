//! Dialog manager - tracks confirmed dialogs and their state machines
//!
//! Dialogs are indexed by (Call-ID, from-tag, to-tag). On ENDED the CDR is
//! written and the media session released.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::domain::cdr::{CallRecord, CdrRepository, Disposition};
use crate::infrastructure::media::MediaSessionManager;
use crate::{DomainError, Result};

/// Dialog lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogState {
    Created,
    Ringing,
    Answered,
    Held,
    Ending,
    Ended,
    Cancelled,
    Failed,
}

impl DialogState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DialogState::Ended | DialogState::Cancelled | DialogState::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Events driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogEvent {
    /// 180/183 observed
    Provisional,
    /// 200 + ACK
    Answer,
    /// re-INVITE with hold SDP
    Hold,
    /// re-INVITE resuming
    Resume,
    /// BYE sent or received
    Bye,
    /// CANCEL before answer
    Cancel,
    /// non-2xx final before ACK, or media failure
    Fail,
    /// teardown complete
    Terminated,
}

/// Pure transition function. Invalid combinations are errors.
pub fn transition(state: DialogState, event: DialogEvent) -> Result<DialogState> {
    use DialogEvent::*;
    use DialogState::*;
    let next = match (state, event) {
        (Created, Provisional) => Ringing,
        (Created, Answer) => Answered,
        (Created, Cancel) => Cancelled,
        (Created, Fail) => Failed,
        (Ringing, Provisional) => Ringing,
        (Ringing, Answer) => Answered,
        (Ringing, Cancel) => Cancelled,
        (Ringing, Fail) => Failed,
        (Answered, Hold) => Held,
        (Held, Resume) => Answered,
        (Answered, Bye) | (Held, Bye) => Ending,
        (Answered, Fail) | (Held, Fail) => Failed,
        (Ending, Terminated) => Ended,
        (Ending, Bye) => Ending,
        _ => {
            return Err(DomainError::Internal(format!(
                "invalid dialog transition {:?} + {:?}",
                state, event
            )))
        }
    };
    Ok(next)
}

/// Dialog index key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogKey {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

struct DialogEntry {
    state: DialogState,
    cdr: CallRecord,
    /// Extension on the answering side, for longest-idle bookkeeping
    extension_id: Option<i64>,
}

/// A snapshot row for the active-calls collaborator query
#[derive(Debug, Clone, Serialize)]
pub struct ActiveCall {
    pub call_id: String,
    pub state: DialogState,
    pub caller: String,
    pub callee: String,
    pub started_at: DateTime<Utc>,
}

pub struct DialogManager {
    dialogs: RwLock<HashMap<DialogKey, Mutex<DialogEntry>>>,
    cdr: Arc<dyn CdrRepository>,
    media: Arc<MediaSessionManager>,
    /// extension id -> end time of its most recent answered dialog
    last_answered_end: RwLock<HashMap<i64, DateTime<Utc>>>,
}

impl DialogManager {
    pub fn new(cdr: Arc<dyn CdrRepository>, media: Arc<MediaSessionManager>) -> Self {
        Self {
            dialogs: RwLock::new(HashMap::new()),
            cdr,
            media,
            last_answered_end: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, key: DialogKey, cdr: CallRecord, extension_id: Option<i64>) {
        debug!(call_id = %key.call_id, "dialog created");
        let entry = DialogEntry {
            state: DialogState::Created,
            cdr,
            extension_id,
        };
        self.dialogs.write().await.insert(key, Mutex::new(entry));
        metrics::gauge!("pbx_dialogs_active").increment(1.0);
    }

    /// Apply an event. Answer also stamps the CDR answer time.
    pub async fn apply(&self, key: &DialogKey, event: DialogEvent) -> Result<DialogState> {
        let dialogs = self.dialogs.read().await;
        let entry = dialogs
            .get(key)
            .ok_or_else(|| DomainError::NotFound(format!("dialog {}", key.call_id)))?;
        let mut entry = entry.lock().await;
        let next = transition(entry.state, event)?;
        debug!(call_id = %key.call_id, from = ?entry.state, to = ?next, "dialog transition");
        entry.state = next;
        if event == DialogEvent::Answer {
            entry.cdr.mark_answered();
        }
        Ok(next)
    }

    pub async fn state(&self, key: &DialogKey) -> Option<DialogState> {
        let dialogs = self.dialogs.read().await;
        let entry = dialogs.get(key)?;
        let state = entry.lock().await.state;
        Some(state)
    }

    /// Find a key by call-id and tags. BYE from the callee swaps tags, so
    /// both orientations match; an empty to-tag matches any.
    pub async fn resolve_key(
        &self,
        call_id: &str,
        from_tag: &str,
        to_tag: &str,
    ) -> Option<DialogKey> {
        let dialogs = self.dialogs.read().await;
        dialogs
            .keys()
            .find(|k| {
                k.call_id == call_id
                    && ((k.from_tag == from_tag && (to_tag.is_empty() || k.to_tag == to_tag))
                        || (k.from_tag == to_tag && k.to_tag == from_tag))
            })
            .cloned()
    }

    /// Terminate the dialog: final CDR write, media release, index removal.
    pub async fn finish(
        &self,
        key: &DialogKey,
        disposition: Disposition,
        cause: Option<&str>,
    ) -> Result<()> {
        let entry = self.dialogs.write().await.remove(key);
        let entry = match entry {
            Some(entry) => entry.into_inner(),
            None => return Ok(()),
        };
        metrics::gauge!("pbx_dialogs_active").decrement(1.0);

        let mut cdr = entry.cdr;
        cdr.mark_ended(disposition, cause.map(|c| c.to_string()));

        if disposition == Disposition::Answered {
            if let Some(extension_id) = entry.extension_id {
                self.last_answered_end
                    .write()
                    .await
                    .insert(extension_id, cdr.end_time.unwrap_or_else(Utc::now));
            }
        }

        self.media.release_for_call(&key.call_id).await;

        info!(
            call_id = %key.call_id,
            disposition = disposition.as_str(),
            duration = cdr.duration_secs.unwrap_or(0),
            "dialog ended"
        );
        if let Err(e) = self.cdr.create(&cdr).await {
            warn!(call_id = %key.call_id, "CDR write failed: {}", e);
        }
        Ok(())
    }

    /// Append a node id to the dialog's CDR flow path.
    pub async fn record_flow_path(&self, key: &DialogKey, path: &[String]) {
        let dialogs = self.dialogs.read().await;
        if let Some(entry) = dialogs.get(key) {
            let mut entry = entry.lock().await;
            entry.cdr.flow_path = path.to_vec();
        }
    }

    pub async fn set_recording_file(&self, key: &DialogKey, file: &str) {
        let dialogs = self.dialogs.read().await;
        if let Some(entry) = dialogs.get(key) {
            entry.lock().await.cdr.recording_file = Some(file.to_string());
        }
    }

    /// End time of the extension's most recent answered dialog, for the
    /// longest-idle ring strategy.
    pub async fn last_answered_end(&self, extension_id: i64) -> Option<DateTime<Utc>> {
        self.last_answered_end
            .read()
            .await
            .get(&extension_id)
            .copied()
    }

    /// Ringing and answered dialogs for the admin collaborator.
    pub async fn active_calls(&self) -> Vec<ActiveCall> {
        let dialogs = self.dialogs.read().await;
        let mut calls = Vec::new();
        for (key, entry) in dialogs.iter() {
            let entry = entry.lock().await;
            if entry.state.is_active() {
                calls.push(ActiveCall {
                    call_id: key.call_id.clone(),
                    state: entry.state,
                    caller: entry.cdr.caller_id_number.clone(),
                    callee: entry.cdr.callee.clone(),
                    started_at: entry.cdr.start_time,
                });
            }
        }
        calls
    }

    pub async fn active_count(&self) -> usize {
        let dialogs = self.dialogs.read().await;
        let mut count = 0;
        for entry in dialogs.values() {
            if entry.lock().await.state.is_active() {
                count += 1;
            }
        }
        count
    }

    /// Tear down every dialog owned by a call id (media timeout path).
    pub async fn fail_call(&self, call_id: &str, cause: &str) {
        let keys: Vec<DialogKey> = {
            let dialogs = self.dialogs.read().await;
            dialogs
                .keys()
                .filter(|k| k.call_id == call_id)
                .cloned()
                .collect()
        };
        for key in keys {
            let _ = self.finish(&key, Disposition::Failed, Some(cause)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cdr::{CallDirection, MockCdrRepository};
    use crate::infrastructure::media::RtpPortPool;

    fn key(call_id: &str) -> DialogKey {
        DialogKey {
            call_id: call_id.into(),
            from_tag: "ft".into(),
            to_tag: "tt".into(),
        }
    }

    fn cdr(call_id: &str) -> CallRecord {
        CallRecord::new(
            call_id.into(),
            CallDirection::Inbound,
            None,
            "0400000000".into(),
            "5551000".into(),
            Some(1),
        )
    }

    fn manager(cdr_repo: MockCdrRepository) -> DialogManager {
        let pool = Arc::new(RtpPortPool::new(41000, 41015));
        let (media, _events) =
            MediaSessionManager::new(pool, std::time::Duration::from_secs(30));
        DialogManager::new(Arc::new(cdr_repo), media)
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut state = DialogState::Created;
        for event in [
            DialogEvent::Provisional,
            DialogEvent::Answer,
            DialogEvent::Hold,
            DialogEvent::Resume,
            DialogEvent::Bye,
            DialogEvent::Terminated,
        ] {
            state = transition(state, event).unwrap();
        }
        assert_eq!(state, DialogState::Ended);
    }

    #[test]
    fn test_cancel_and_fail_branches() {
        assert_eq!(
            transition(DialogState::Ringing, DialogEvent::Cancel).unwrap(),
            DialogState::Cancelled
        );
        assert_eq!(
            transition(DialogState::Created, DialogEvent::Fail).unwrap(),
            DialogState::Failed
        );
        assert!(transition(DialogState::Ended, DialogEvent::Answer).is_err());
        assert!(transition(DialogState::Created, DialogEvent::Hold).is_err());
    }

    #[tokio::test]
    async fn test_finish_writes_cdr_once() {
        let mut cdr_repo = MockCdrRepository::new();
        cdr_repo
            .expect_create()
            .times(1)
            .withf(|record| {
                record.disposition == Disposition::Answered
                    && record.billable_secs.is_some()
                    && record.end_time.is_some()
            })
            .returning(|record| Ok(record.clone()));

        let manager = manager(cdr_repo);
        let k = key("c1");
        manager.create(k.clone(), cdr("c1"), Some(101)).await;
        manager.apply(&k, DialogEvent::Provisional).await.unwrap();
        manager.apply(&k, DialogEvent::Answer).await.unwrap();
        manager
            .finish(&k, Disposition::Answered, None)
            .await
            .unwrap();

        // double finish is a no-op
        manager
            .finish(&k, Disposition::Answered, None)
            .await
            .unwrap();

        assert_eq!(manager.last_answered_end(101).await.is_some(), true);
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_resolve_key_matches_swapped_tags() {
        let manager = manager(MockCdrRepository::new());
        let k = key("c2");
        manager.create(k.clone(), cdr("c2"), None).await;

        // callee-originated BYE: tags arrive swapped
        let found = manager.resolve_key("c2", "tt", "ft").await;
        assert_eq!(found, Some(k.clone()));
        // empty to-tag still matches
        let found = manager.resolve_key("c2", "ft", "").await;
        assert_eq!(found, Some(k));
        assert_eq!(manager.resolve_key("nope", "ft", "tt").await, None);
    }

    #[tokio::test]
    async fn test_active_calls_snapshot() {
        let manager = manager(MockCdrRepository::new());
        let k = key("c3");
        manager.create(k.clone(), cdr("c3"), None).await;
        manager.apply(&k, DialogEvent::Provisional).await.unwrap();

        let calls = manager.active_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].state, DialogState::Ringing);
        assert_eq!(calls[0].callee, "5551000");
    }

    #[tokio::test]
    async fn test_fail_call_emits_failed_cdr() {
        let mut cdr_repo = MockCdrRepository::new();
        cdr_repo
            .expect_create()
            .times(1)
            .withf(|record| {
                record.disposition == Disposition::Failed
                    && record.hangup_cause.as_deref() == Some("media_timeout")
            })
            .returning(|record| Ok(record.clone()));

        let manager = manager(cdr_repo);
        manager.create(key("c4"), cdr("c4"), None).await;
        manager.fail_call("c4", "media_timeout").await;
        assert_eq!(manager.active_count().await, 0);
    }
}
