//! Exclusive-access session tokens.
//!
//! A [`Session`] is plain data: an id, the descriptor path it is bound to and
//! the epoch it was issued at.  Validity is never stored in the token itself.
//! The arbitrator that issued it decides whether `(id, epoch)` still matches
//! the current holder of the path, so copies held by callers cannot be
//! "revived" by anyone but the arbitrator.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::domain::descriptor::BackendKind;

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token granting exclusive access to one device path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    id: SessionId,
    path: String,
    backend: BackendKind,
    epoch: u64,
}

impl Session {
    pub fn new(id: SessionId, path: impl Into<String>, backend: BackendKind, epoch: u64) -> Self {
        Self {
            id,
            path: path.into(),
            backend,
            epoch,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Epoch of the descriptor at the moment this session was issued.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Lock-free generator of [`SessionId`]s.
///
/// Ids start at 1 and are never reused within a process; wrap-around at
/// `u64::MAX` is not a practical concern.
#[derive(Debug)]
pub struct SessionIdGenerator {
    next: AtomicU64,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        // Relaxed is enough: uniqueness only, no ordering with other memory.
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
