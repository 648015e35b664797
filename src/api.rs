//! Surface exported to the HTTP/admin collaborator
//!
//! The admin layer lives outside the core; this is everything it may ask
//! of the call-processing pipeline.

use std::sync::Arc;

use crate::domain::trunk::{Trunk, TrunkRepository, TrunkStatus};
use crate::infrastructure::sip::call_router::CallRegistry;
use crate::infrastructure::sip::dialog::{ActiveCall, DialogManager};
use crate::infrastructure::sip::trunk_registrar::TrunkRegistrar;
use crate::{DomainError, Result};

pub struct CoreApi {
    trunk_registrar: Arc<TrunkRegistrar>,
    trunks: Arc<dyn TrunkRepository>,
    dialogs: Arc<DialogManager>,
    calls: Arc<CallRegistry>,
}

impl CoreApi {
    pub fn new(
        trunk_registrar: Arc<TrunkRegistrar>,
        trunks: Arc<dyn TrunkRepository>,
        dialogs: Arc<DialogManager>,
        calls: Arc<CallRegistry>,
    ) -> Self {
        Self {
            trunk_registrar,
            trunks,
            dialogs,
            calls,
        }
    }

    /// Live status of one trunk.
    pub async fn trunk_status(&self, trunk_id: i64) -> Option<TrunkStatus> {
        self.trunk_registrar.status(trunk_id).await
    }

    /// Live status of every trunk.
    pub async fn trunk_statuses(&self) -> Vec<TrunkStatus> {
        self.trunk_registrar.all_statuses().await
    }

    /// Single-shot REGISTER against an arbitrary trunk record; returns the
    /// granted expiry.
    pub async fn test_trunk_register(&self, trunk: &Trunk) -> Result<u32> {
        self.trunk_registrar.test_register(trunk).await
    }

    /// Single-shot OPTIONS probe; returns the response code.
    pub async fn test_trunk_options(&self, trunk: &Trunk) -> Result<u16> {
        self.trunk_registrar.test_options(trunk).await
    }

    /// Start the state machine for a stored trunk.
    pub async fn start_trunk(&self, trunk_id: i64) -> Result<()> {
        let trunk = self
            .trunks
            .get(trunk_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("trunk {}", trunk_id)))?;
        self.trunk_registrar.start_trunk(trunk).await;
        Ok(())
    }

    /// Stop a running trunk.
    pub async fn stop_trunk(&self, trunk_id: i64) -> Result<()> {
        self.trunk_registrar.stop_trunk(trunk_id).await;
        Ok(())
    }

    /// Stop every trunk and restart from the enabled set in the store.
    pub async fn reload_configuration(&self) -> Result<()> {
        self.trunk_registrar.reload().await
    }

    /// Ringing and answered calls: confirmed dialogs plus pending INVITEs.
    pub async fn active_calls(&self) -> Vec<ActiveCall> {
        self.dialogs.active_calls().await
    }

    /// Count of live inbound call legs.
    pub async fn active_call_count(&self) -> usize {
        self.calls.count().await
    }
}
