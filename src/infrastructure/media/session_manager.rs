//! Media session lifecycle
//!
//! Owns the port pool and every live relay session. Sessions move through
//! NEW -> ACTIVE -> STOPPED and their port pair returns to the pool on
//! RELEASED, exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::port_pool::RtpPortPool;
use super::relay::{MediaSession, SessionState};
use crate::Result;

/// Events the media plane raises towards the signalling layer
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// No inbound packets on either leg for the idle window; the owning
    /// dialog should be torn down with cause `media_timeout`.
    IdleTimeout { session_id: Uuid, call_id: String },
}

pub struct MediaSessionManager {
    pool: Arc<RtpPortPool>,
    sessions: RwLock<HashMap<Uuid, Arc<MediaSession>>>,
    idle_timeout: Duration,
    events_tx: mpsc::Sender<MediaEvent>,
}

impl MediaSessionManager {
    pub fn new(
        pool: Arc<RtpPortPool>,
        idle_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<MediaEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let manager = Arc::new(Self {
            pool,
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
            events_tx,
        });
        (manager, events_rx)
    }

    /// Allocate a port pair, bind the sockets and start relaying.
    pub async fn create_session(
        &self,
        call_id: &str,
        allowed_payloads: Vec<u8>,
        telephone_event_pt: u8,
        dtmf_tx: Option<mpsc::Sender<char>>,
    ) -> Result<Arc<MediaSession>> {
        let pair = self.pool.allocate()?;

        let session = match MediaSession::bind(
            call_id.to_string(),
            pair,
            allowed_payloads,
            telephone_event_pt,
            dtmf_tx,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                self.pool.release(pair);
                return Err(e);
            }
        };

        session.start();
        let session = Arc::new(session);
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        metrics::gauge!("pbx_media_sessions_active").increment(1.0);
        info!(call_id, session = %session.id, rtp_port = session.rtp_port(), "media session created");
        Ok(session)
    }

    /// Stop a session and return its ports to the pool.
    pub async fn release(&self, session_id: Uuid) {
        let session = self.sessions.write().await.remove(&session_id);
        if let Some(session) = session {
            session.stop();
            self.pool.release(session.port_pair());
            session.mark_released();
            metrics::gauge!("pbx_media_sessions_active").decrement(1.0);
            debug!(session = %session_id, "media session released");
        }
    }

    /// Release every session owned by a call.
    pub async fn release_for_call(&self, call_id: &str) {
        let ids: Vec<Uuid> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.call_id == call_id)
            .map(|s| s.id)
            .collect();
        for id in ids {
            self.release(id).await;
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn get(&self, session_id: Uuid) -> Option<Arc<MediaSession>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    pub async fn for_call(&self, call_id: &str) -> Option<Arc<MediaSession>> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.call_id == call_id)
            .cloned()
    }

    /// Background sweep: stop sessions with no inbound traffic for the
    /// idle window and notify the signalling layer.
    pub fn spawn_idle_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let idle: Vec<(Uuid, String)> = {
                    let sessions = manager.sessions.read().await;
                    sessions
                        .values()
                        .filter(|s| {
                            matches!(s.state(), SessionState::Active)
                                && s.last_activity().elapsed() > manager.idle_timeout
                        })
                        .map(|s| (s.id, s.call_id.clone()))
                        .collect()
                };
                for (session_id, call_id) in idle {
                    warn!(%session_id, %call_id, "media idle timeout, stopping session");
                    manager.release(session_id).await;
                    let event = MediaEvent::IdleTimeout {
                        session_id,
                        call_id,
                    };
                    if manager.events_tx.send(event).await.is_err() {
                        return; // receiver gone, the process is shutting down
                    }
                }
            }
        })
    }
}
