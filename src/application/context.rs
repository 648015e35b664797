//! Per-call context shared between the flow engine and the media path

use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// DTMF digits queued between media read loop and `PlayAndCollect`.
const DTMF_CHANNEL_CAPACITY: usize = 32;

/// Per-call context. One node handler runs at a time, but DTMF digits
/// arrive concurrently from the media relay's read loop.
pub struct CallContext {
    pub call_id: String,
    pub caller_id_name: Option<String>,
    pub caller_id_number: String,
    /// Dialled string
    pub callee: String,
    /// Matched inbound number id
    pub did_id: i64,
    /// Trunk the call arrived on, if any
    pub inbound_trunk_id: Option<i64>,
    /// Opaque handle to the originating SIP request; the SIP layer
    /// downcasts it, the engine never looks inside.
    pub sip_handle: Option<Arc<dyn Any + Send + Sync>>,
    pub started_at: DateTime<Utc>,

    variables: Mutex<HashMap<String, String>>,
    flow_path: Mutex<Vec<String>>,
    answered: AtomicBool,

    dtmf_tx: mpsc::Sender<char>,
    dtmf_rx: tokio::sync::Mutex<mpsc::Receiver<char>>,

    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl CallContext {
    pub fn new(
        call_id: String,
        caller_id_name: Option<String>,
        caller_id_number: String,
        callee: String,
        did_id: i64,
        inbound_trunk_id: Option<i64>,
    ) -> Self {
        let (dtmf_tx, dtmf_rx) = mpsc::channel(DTMF_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            call_id,
            caller_id_name,
            caller_id_number,
            callee,
            did_id,
            inbound_trunk_id,
            sip_handle: None,
            started_at: Utc::now(),
            variables: Mutex::new(HashMap::new()),
            flow_path: Mutex::new(Vec::new()),
            answered: AtomicBool::new(false),
            dtmf_tx,
            dtmf_rx: tokio::sync::Mutex::new(dtmf_rx),
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn with_sip_handle(mut self, handle: Arc<dyn Any + Send + Sync>) -> Self {
        self.sip_handle = Some(handle);
        self
    }

    // --- variables ---

    pub fn set_variable(&self, key: &str, value: &str) {
        self.variables
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn get_variable(&self, key: &str) -> Option<String> {
        self.variables.lock().unwrap().get(key).cloned()
    }

    // --- flow path ---

    pub fn push_flow_node(&self, node_id: &str) {
        self.flow_path.lock().unwrap().push(node_id.to_string());
    }

    pub fn flow_path(&self) -> Vec<String> {
        self.flow_path.lock().unwrap().clone()
    }

    // --- answer tracking ---

    pub fn mark_answered(&self) {
        self.answered.store(true, Ordering::Relaxed);
    }

    pub fn was_answered(&self) -> bool {
        self.answered.load(Ordering::Relaxed)
    }

    // --- DTMF ---

    /// Sender handed to the media relay; digits are dropped when the
    /// bounded queue is full.
    pub fn dtmf_sender(&self) -> mpsc::Sender<char> {
        self.dtmf_tx.clone()
    }

    /// Queue a digit from the media path.
    pub fn push_dtmf(&self, digit: char) {
        if self.dtmf_tx.try_send(digit).is_err() {
            debug!(call_id = %self.call_id, digit = %digit, "DTMF queue full, digit dropped");
        }
    }

    /// Await the next digit, up to `timeout`. Returns None on timeout or
    /// cancellation.
    pub async fn next_digit(&self, timeout: Duration) -> Option<char> {
        let mut rx = self.dtmf_rx.lock().await;
        let mut cancel = self.cancel_rx.clone();
        tokio::select! {
            digit = rx.recv() => digit,
            _ = tokio::time::sleep(timeout) => None,
            _ = cancel.wait_for(|cancelled| *cancelled) => None,
        }
    }

    /// Discard any queued digits.
    pub async fn drain_dtmf(&self) {
        let mut rx = self.dtmf_rx.lock().await;
        while rx.try_recv().is_ok() {}
    }

    // --- cancellation ---

    /// Cancel the call: node execution stops at the next await point.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Watchable cancellation signal, handed to media tasks.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    /// Resolves when the context is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
