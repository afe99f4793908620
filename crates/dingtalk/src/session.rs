//! Sender → session key bookkeeping with inactivity-based rotation.
//!
//! A sender's first turn gets a stable key derived from the sender alone.
//! The key is replaced (rotated) on an explicit reset, a forced-new request,
//! or when the sender was idle longer than the configured timeout. Sessions
//! live for the lifetime of the process.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tracing::{debug, info};

use crate::store::{MemoryStore, StateStore, unix_now_ms};

/// Distinguishes rotations that happen within the same millisecond.
static ROTATION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Active session of one sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub owner_key: String,
    pub session_key: String,
    pub last_activity_at: u64,
}

/// Outcome of [`SessionManager::resolve_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResolution {
    pub session_key: String,
    /// True when the session was rotated by this call. First contact is not
    /// reported as new.
    pub is_new: bool,
}

pub struct SessionManager {
    store: Arc<dyn StateStore<Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn StateStore<Session>>) -> Self {
        Self { store }
    }

    pub fn resolve_session(
        &self,
        sender_id: &str,
        force_new: bool,
        timeout_ms: u64,
    ) -> SessionResolution {
        self.resolve_session_at(sender_id, force_new, timeout_ms, unix_now_ms())
    }

    /// Current session of `sender_id`, if any.
    pub fn get(&self, sender_id: &str) -> Option<Session> {
        self.store.get(sender_id)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub(crate) fn resolve_session_at(
        &self,
        sender_id: &str,
        force_new: bool,
        timeout_ms: u64,
        now: u64,
    ) -> SessionResolution {
        if sender_id.is_empty() {
            return SessionResolution {
                session_key: stable_session_key(sender_id),
                is_new: false,
            };
        }

        let mut is_new = false;
        let session = self.store.update(sender_id, &mut |current| match current {
            Some(existing) => {
                let idle = now.saturating_sub(existing.last_activity_at);
                if force_new || idle > timeout_ms {
                    is_new = true;
                    Session {
                        owner_key: sender_id.to_string(),
                        session_key: rotated_session_key(sender_id, now),
                        last_activity_at: now,
                    }
                } else {
                    Session {
                        last_activity_at: now,
                        ..existing.clone()
                    }
                }
            },
            None if force_new => {
                is_new = true;
                Session {
                    owner_key: sender_id.to_string(),
                    session_key: rotated_session_key(sender_id, now),
                    last_activity_at: now,
                }
            },
            None => Session {
                owner_key: sender_id.to_string(),
                session_key: stable_session_key(sender_id),
                last_activity_at: now,
            },
        });

        if is_new {
            info!(
                sender_id,
                session_key = %session.session_key,
                force_new,
                "rotated session"
            );
        } else {
            debug!(sender_id, session_key = %session.session_key, "resolved session");
        }

        SessionResolution {
            session_key: session.session_key,
            is_new,
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn stable_session_key(sender_id: &str) -> String {
    format!("dingtalk:{sender_id}")
}

fn rotated_session_key(sender_id: &str, now: u64) -> String {
    let seq = ROTATION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("dingtalk:{sender_id}:{now}-{seq}")
}
