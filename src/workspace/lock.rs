//! The exclusive workspace lock.
//!
//! One holder at a time, either an interactive writer or a heartbeat cycle. The
//! heartbeat only ever calls [`WorkspaceLock::try_acquire`] and skips when busy;
//! interactive writers wait up to a bounded timeout via [`WorkspaceLock::acquire`].
//! Release is tied to dropping the [`WorkspaceGuard`], so an aborted task or an early
//! `?` return cannot leave the lock held.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use crate::error::CairnError;

/// Who is holding the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Session,
    Heartbeat,
    Indexer,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Heartbeat => "heartbeat",
            Self::Indexer => "indexer",
        }
    }
}

/// Holder token: acquirer kind, acquirer id, and acquisition time.
#[derive(Debug, Clone, Serialize)]
pub struct LockHolder {
    pub actor: Actor,
    pub id: String,
    pub acquired_at: DateTime<Utc>,
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} since {}",
            self.actor.as_str(),
            self.id,
            self.acquired_at.to_rfc3339()
        )
    }
}

#[derive(Clone, Default)]
pub struct WorkspaceLock {
    permit: Arc<tokio::sync::Mutex<()>>,
    holder: Arc<Mutex<Option<LockHolder>>>,
}

impl WorkspaceLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking acquisition. Fails with [`CairnError::LockContention`] if held.
    pub fn try_acquire(
        &self,
        actor: Actor,
        id: impl Into<String>,
    ) -> Result<WorkspaceGuard, CairnError> {
        match Arc::clone(&self.permit).try_lock_owned() {
            Ok(permit) => Ok(self.install(permit, actor, id.into())),
            Err(_) => Err(CairnError::LockContention {
                holder: self.describe_holder(),
            }),
        }
    }

    /// Wait up to `timeout` for the lock, then fail with [`CairnError::LockTimeout`].
    pub async fn acquire(
        &self,
        actor: Actor,
        id: impl Into<String>,
        timeout: Duration,
    ) -> Result<WorkspaceGuard, CairnError> {
        let id = id.into();
        match tokio::time::timeout(timeout, Arc::clone(&self.permit).lock_owned()).await {
            Ok(permit) => Ok(self.install(permit, actor, id)),
            Err(_) => {
                tracing::warn!(
                    actor = actor.as_str(),
                    id = %id,
                    holder = %self.describe_holder(),
                    "gave up waiting for workspace lock"
                );
                Err(CairnError::LockTimeout { waited: timeout })
            }
        }
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<LockHolder> {
        self.holder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_held(&self) -> bool {
        self.permit.try_lock().is_err()
    }

    fn describe_holder(&self) -> String {
        self.holder()
            .map(|h| h.to_string())
            .unwrap_or_else(|| "another actor".into())
    }

    fn install(&self, permit: OwnedMutexGuard<()>, actor: Actor, id: String) -> WorkspaceGuard {
        let info = LockHolder {
            actor,
            id,
            acquired_at: Utc::now(),
        };
        *self.holder.lock().unwrap_or_else(|e| e.into_inner()) = Some(info.clone());
        tracing::debug!(holder = %info, "workspace lock acquired");
        WorkspaceGuard {
            slot: Arc::clone(&self.holder),
            info,
            _permit: permit,
        }
    }
}

/// Proof of holding the workspace lock. Mutating workspace APIs take `&WorkspaceGuard`.
pub struct WorkspaceGuard {
    slot: Arc<Mutex<Option<LockHolder>>>,
    info: LockHolder,
    // Dropped after `Drop::drop` clears the slot.
    _permit: OwnedMutexGuard<()>,
}

impl WorkspaceGuard {
    pub fn holder(&self) -> &LockHolder {
        &self.info
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        tracing::debug!(holder = %self.info, "workspace lock released");
    }
}
