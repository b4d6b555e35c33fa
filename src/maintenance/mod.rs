//! Maintenance Module
//!
//! Balance and scrub orchestration. Both are state machines over persisted
//! operation rows: `start` registers a row and launches the external
//! operation, a separate poll step advances the row until it is terminal.
//!
//! ```text
//!   none ──start──▶ started ──progress──▶ running ──┬──▶ finished
//!                      │                            ├──▶ failed
//!                      └────────────────────────────┴──▶ cancelled
//! ```
//!
//! Handlers are reached through a `MaintenanceDispatch` table keyed by
//! `MaintenanceKind`, built once at startup and handed to whoever needs it.

pub mod balance;
pub mod poller;
pub mod scrub;

pub use balance::*;
pub use poller::*;
pub use scrub::*;

use crate::domain::model::{BalanceOp, EntityId, OpStatus, ScrubOp};
use crate::error::{Error, Result};
use crate::metrics::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

// =============================================================================
// Operation Kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceKind {
    Balance,
    Scrub,
}

impl MaintenanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceKind::Balance => "balance",
            MaintenanceKind::Scrub => "scrub",
        }
    }
}

impl std::fmt::Display for MaintenanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaintenanceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "balance" => Ok(MaintenanceKind::Balance),
            "scrub" => Ok(MaintenanceKind::Scrub),
            other => Err(Error::Validation(format!(
                "unknown maintenance kind: {}",
                other
            ))),
        }
    }
}

/// A balance or scrub row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MaintenanceOp {
    Balance(BalanceOp),
    Scrub(ScrubOp),
}

impl MaintenanceOp {
    pub fn kind(&self) -> MaintenanceKind {
        match self {
            MaintenanceOp::Balance(_) => MaintenanceKind::Balance,
            MaintenanceOp::Scrub(_) => MaintenanceKind::Scrub,
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            MaintenanceOp::Balance(op) => op.id,
            MaintenanceOp::Scrub(op) => op.id,
        }
    }

    pub fn pool_id(&self) -> EntityId {
        match self {
            MaintenanceOp::Balance(op) => op.pool_id,
            MaintenanceOp::Scrub(op) => op.pool_id,
        }
    }

    pub fn status(&self) -> OpStatus {
        match self {
            MaintenanceOp::Balance(op) => op.status,
            MaintenanceOp::Scrub(op) => op.status,
        }
    }
}

pub(crate) fn record_transition(kind: MaintenanceKind, status: OpStatus) {
    let status = status.to_string();
    metrics()
        .transitions
        .with_label_values(&[kind.as_str(), status.as_str()])
        .inc();
}

// =============================================================================
// Handler Port
// =============================================================================

/// One kind of maintenance operation
#[async_trait]
pub trait MaintenanceHandler: Send + Sync {
    fn kind(&self) -> MaintenanceKind;

    /// Launch the operation and register its row
    async fn start(&self, pool_id: EntityId, force: bool) -> Result<MaintenanceOp>;

    /// Advance the pool's current operation; returns the latest row
    async fn poll(&self, pool_id: EntityId) -> Result<Option<MaintenanceOp>>;

    /// Request cancellation of the pool's current operation
    async fn cancel(&self, pool_id: EntityId) -> Result<MaintenanceOp>;

    /// Whether the pool has a non-terminal row of this kind
    async fn active(&self, pool_id: EntityId) -> Result<bool>;
}

// =============================================================================
// Dispatch Table
// =============================================================================

/// Maintenance handlers keyed by kind
#[derive(Clone)]
pub struct MaintenanceDispatch {
    handlers: BTreeMap<MaintenanceKind, Arc<dyn MaintenanceHandler>>,
}

impl MaintenanceDispatch {
    pub fn new(handlers: impl IntoIterator<Item = Arc<dyn MaintenanceHandler>>) -> Self {
        Self {
            handlers: handlers
                .into_iter()
                .map(|handler| (handler.kind(), handler))
                .collect(),
        }
    }

    pub fn handler(&self, kind: MaintenanceKind) -> Result<&Arc<dyn MaintenanceHandler>> {
        self.handlers
            .get(&kind)
            .ok_or_else(|| Error::Internal(format!("no handler registered for {}", kind)))
    }

    pub fn kinds(&self) -> impl Iterator<Item = MaintenanceKind> + '_ {
        self.handlers.keys().copied()
    }

    pub async fn start(
        &self,
        kind: MaintenanceKind,
        pool_id: EntityId,
        force: bool,
    ) -> Result<MaintenanceOp> {
        self.handler(kind)?.start(pool_id, force).await
    }

    pub async fn poll(&self, kind: MaintenanceKind, pool_id: EntityId) -> Result<Option<MaintenanceOp>> {
        self.handler(kind)?.poll(pool_id).await
    }

    pub async fn cancel(&self, kind: MaintenanceKind, pool_id: EntityId) -> Result<MaintenanceOp> {
        self.handler(kind)?.cancel(pool_id).await
    }

    /// Poll every kind with an active operation on the pool. A failing
    /// handler is logged and does not hold back the others.
    pub async fn poll_pool(&self, pool_id: EntityId) -> Vec<MaintenanceOp> {
        let mut polled = Vec::new();
        for (kind, handler) in &self.handlers {
            let result = match handler.active(pool_id).await {
                Ok(true) => handler.poll(pool_id).await,
                Ok(false) => Ok(None),
                Err(e) => Err(e),
            };
            match result {
                Ok(Some(op)) => polled.push(op),
                Ok(None) => {}
                Err(e) => warn!(pool_id, %kind, error = %e, "maintenance poll failed"),
            }
        }
        polled
    }
}
