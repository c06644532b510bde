//! The single active-build slot and the RAII guard that releases it.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use opsdash_core::{BuildKind, BuildSession, BuildState};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancellationController;

/// The build currently holding the slot.
#[derive(Debug, Clone)]
pub struct ActiveBuild {
    pub session_id: Uuid,
    pub kind: BuildKind,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationController,
    /// Flips to `true` once the worker has released the slot
    pub done: watch::Receiver<bool>,
}

/// Holds at most one running build plus the last finished session.
#[derive(Default)]
pub struct SessionSlot {
    active: Mutex<Option<ActiveBuild>>,
    last: Mutex<Option<BuildSession>>,
}

impl SessionSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Atomically claim the slot for `session`.
    ///
    /// Fails with the id of the running session when the slot is taken.
    pub fn try_claim(
        self: &Arc<Self>,
        session: &BuildSession,
        cancel: CancellationController,
    ) -> Result<SlotGuard, Uuid> {
        let mut active = lock(&self.active);
        if let Some(running) = active.as_ref() {
            return Err(running.session_id);
        }

        let (done_tx, done_rx) = watch::channel(false);
        *active = Some(ActiveBuild {
            session_id: session.id,
            kind: session.kind,
            started_at: session.started_at,
            cancel,
            done: done_rx,
        });
        debug!(session_id = %session.id, "Build slot claimed");

        Ok(SlotGuard {
            slot: Arc::clone(self),
            session: Some(session.clone()),
            done: done_tx,
        })
    }

    pub fn active(&self) -> Option<ActiveBuild> {
        lock(&self.active).clone()
    }

    pub fn last(&self) -> Option<BuildSession> {
        lock(&self.last).clone()
    }

    fn release(&self, session: BuildSession) {
        let id = session.id;
        *lock(&self.last) = Some(session);

        let mut active = lock(&self.active);
        if active.as_ref().is_some_and(|a| a.session_id == id) {
            *active = None;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// RAII guard owned by the build worker.
///
/// [`SlotGuard::release`] records the terminal session and frees the slot.
/// Dropping the guard without releasing it (a panicking worker) records the
/// session as failed and frees the slot anyway, so a crashed build never
/// blocks the next one.
pub struct SlotGuard {
    slot: Arc<SessionSlot>,
    /// Snapshot taken at claim time, used if the worker never releases
    session: Option<BuildSession>,
    done: watch::Sender<bool>,
}

impl SlotGuard {
    pub fn release(mut self, session: BuildSession) {
        debug!(session_id = %session.id, state = session.state.as_str(), "Build slot released");
        self.session = None;
        self.slot.release(session);
        self.done.send_replace(true);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            warn!(
                session_id = %session.id,
                "Build worker ended without releasing its slot - recording failure"
            );
            if let Err(e) = session.finish(BuildState::Failed) {
                warn!(error = %e, "Could not mark abandoned session as failed");
            }
            self.slot.release(session);
            self.done.send_replace(true);
        }
    }
}
