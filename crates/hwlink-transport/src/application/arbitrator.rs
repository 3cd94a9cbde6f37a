//! Session arbitration: who may talk to which device right now.
//!
//! Each descriptor path has a slot that is either free or held by exactly
//! one session.  Slots move through
//!
//! ```text
//! Free ──acquire──▶ Held(id, epoch) ──release / sweep──▶ Free
//!                      │
//!                      └──acquire (steal)──▶ Held(id', epoch + 1)
//! ```
//!
//! Epochs are per path and never reset: the first acquire of a path gets
//! epoch 0 and every later acquire gets the previous epoch plus one, even
//! after a release.  A [`Session`] is valid only while both its id and its
//! epoch match the slot's holder.
//!
//! Every transition on one path runs under that path's async mutex, so
//! acquire, call, release and sweep on the same descriptor never interleave.
//! Different paths proceed independently; the path table itself is only
//! locked long enough to find or insert a slot.  Only `acquire` inserts;
//! lookups for an existing session never grow the table.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use hwlink_core::domain::{Descriptor, Session, SessionIdGenerator};
use hwlink_core::error::{TransportError, TransportResult};
use hwlink_core::protocol::LogicalMessage;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::infrastructure::backend::{ChannelBackend, ChannelHandle};

/// What happens when a held descriptor is acquired again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquirePolicy {
    /// The newer caller takes over; the previous session goes stale.
    #[default]
    Steal,
    /// A held descriptor can only be taken with [`AcquireOptions::force`].
    RequireForce,
}

/// Per-call acquire flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcquireOptions {
    pub force: bool,
}

impl AcquireOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

#[derive(Debug)]
struct Holder {
    session: Session,
    handle: ChannelHandle,
}

#[derive(Debug, Default)]
struct Slot {
    /// Epoch handed out most recently; `None` until the first acquire.
    last_epoch: Option<u64>,
    holder: Option<Holder>,
}

impl Slot {
    fn next_epoch(&self) -> u64 {
        self.last_epoch.map_or(0, |e| e + 1)
    }

    fn holds(&self, session: &Session) -> bool {
        self.holder.as_ref().is_some_and(|h| h.session == *session)
    }
}

/// Owns the descriptor → session map.
pub struct SessionArbitrator {
    slots: StdMutex<HashMap<String, Arc<Mutex<Slot>>>>,
    ids: SessionIdGenerator,
    policy: AcquirePolicy,
    call_timeout: Duration,
}

impl SessionArbitrator {
    pub fn new(policy: AcquirePolicy, call_timeout: Duration) -> Self {
        Self {
            slots: StdMutex::new(HashMap::new()),
            ids: SessionIdGenerator::new(),
            policy,
            call_timeout,
        }
    }

    pub fn policy(&self) -> AcquirePolicy {
        self.policy
    }

    fn slot(&self, path: &str) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(slots.entry(path.to_string()).or_default())
    }

    fn existing_slot(&self, path: &str) -> Option<Arc<Mutex<Slot>>> {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.get(path).map(Arc::clone)
    }

    /// Number of paths that have ever been acquired.
    pub fn tracked_paths(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn existing_slots(&self) -> Vec<(String, Arc<Mutex<Slot>>)> {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots
            .iter()
            .map(|(path, slot)| (path.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Grants a new session on `descriptor`.
    ///
    /// Under [`AcquirePolicy::Steal`] a held descriptor is taken over and the
    /// previous session becomes stale.  Under [`AcquirePolicy::RequireForce`]
    /// the same situation fails with `DeviceUnreachable` unless
    /// `options.force` is set.
    ///
    /// # Errors
    ///
    /// `DeviceUnreachable` when the backend cannot open the device or the
    /// policy refuses; any other backend failure as mapped by the backend.
    /// On failure the slot is left exactly as it was.
    pub async fn acquire(
        &self,
        backend: &dyn ChannelBackend,
        descriptor: &Descriptor,
        options: AcquireOptions,
    ) -> TransportResult<Session> {
        let slot = self.slot(&descriptor.path);
        let mut slot = slot.lock().await;

        let held_here = slot.holder.is_some();
        let held_elsewhere = !held_here && descriptor.session_hint.is_some();
        if (held_here || held_elsewhere) && self.policy == AcquirePolicy::RequireForce && !options.force {
            return Err(TransportError::unreachable(format!(
                "{} is held by another session; acquire with force to take it over",
                descriptor.path
            )));
        }

        let previous = slot.holder.as_ref().map(|h| h.handle.token.clone());
        let handle = backend.open(descriptor, previous).await?;

        let epoch = slot.next_epoch();
        let session = Session::new(self.ids.next_id(), &descriptor.path, backend.kind(), epoch);
        if let Some(old) = slot.holder.take() {
            info!(
                path = %descriptor.path,
                stale = %old.session.id(),
                new = %session.id(),
                epoch,
                "session stolen"
            );
        } else {
            debug!(path = %descriptor.path, session = %session.id(), epoch, "session acquired");
        }
        slot.last_epoch = Some(epoch);
        slot.holder = Some(Holder {
            session: session.clone(),
            handle,
        });
        Ok(session)
    }

    /// Sends `message` over the session's channel and waits for the reply.
    ///
    /// # Errors
    ///
    /// `SessionStale` without touching the backend when the session was
    /// superseded, released or swept; `Timeout` after the call deadline;
    /// otherwise whatever the backend reports.
    pub async fn call(
        &self,
        backend: &dyn ChannelBackend,
        session: &Session,
        message: &LogicalMessage,
    ) -> TransportResult<LogicalMessage> {
        let stale = || {
            TransportError::stale(format!(
                "session {} (epoch {}) on {} is no longer valid",
                session.id(),
                session.epoch(),
                session.path()
            ))
        };
        let Some(slot) = self.existing_slot(session.path()) else {
            return Err(stale());
        };
        let slot = slot.lock().await;

        let handle = match &slot.holder {
            Some(h) if h.session == *session && h.handle.backend == backend.kind() => &h.handle,
            _ => return Err(stale()),
        };

        match tokio::time::timeout(
            self.call_timeout,
            backend.call(handle, message, self.call_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(format!(
                "call on {} exceeded {:?}",
                session.path(),
                self.call_timeout
            ))),
        }
    }

    /// Frees the descriptor if `session` still holds it.
    ///
    /// Releasing a stale session is a silent no-op.
    pub async fn release(
        &self,
        backend: &dyn ChannelBackend,
        session: &Session,
    ) -> TransportResult<()> {
        let Some(slot) = self.existing_slot(session.path()) else {
            debug!(path = %session.path(), session = %session.id(), "ignoring release of unknown session");
            return Ok(());
        };
        let mut slot = slot.lock().await;

        if !slot.holds(session) {
            debug!(path = %session.path(), session = %session.id(), "ignoring release of stale session");
            return Ok(());
        }
        let Some(holder) = slot.holder.take() else {
            return Ok(());
        };
        debug!(path = %session.path(), session = %session.id(), "session released");
        backend.close(&holder.handle).await
    }

    /// Frees every held descriptor whose path is missing from `present`.
    ///
    /// Only sessions opened through a backend of `backend`'s kind are
    /// considered; `present` says nothing about another backend's devices.
    /// Returns the freed paths.
    pub async fn sweep(&self, backend: &dyn ChannelBackend, present: &[Descriptor]) -> Vec<String> {
        let present: HashSet<&str> = present.iter().map(|d| d.path.as_str()).collect();
        let mut freed = Vec::new();

        for (path, slot) in self.existing_slots() {
            if present.contains(path.as_str()) {
                continue;
            }
            let mut slot = slot.lock().await;
            if slot
                .holder
                .as_ref()
                .is_some_and(|h| h.handle.backend != backend.kind())
            {
                continue;
            }
            if let Some(holder) = slot.holder.take() {
                info!(%path, session = %holder.session.id(), "device gone, session invalidated");
                if let Err(e) = backend.close(&holder.handle).await {
                    debug!(%path, error = %e, "close after disconnect failed");
                }
                freed.push(path);
            }
        }
        freed
    }

    /// Invalidates every session, e.g. when the active backend changes.
    ///
    /// Channels are closed through `backend` only when they were opened by
    /// a backend of the same kind.
    pub async fn invalidate_all(&self, backend: Option<&dyn ChannelBackend>) -> usize {
        let mut count = 0;
        for (path, slot) in self.existing_slots() {
            let mut slot = slot.lock().await;
            if let Some(holder) = slot.holder.take() {
                count += 1;
                if let Some(backend) = backend.filter(|b| b.kind() == holder.handle.backend) {
                    if let Err(e) = backend.close(&holder.handle).await {
                        warn!(%path, error = %e, "close during invalidation failed");
                    }
                }
            }
        }
        if count > 0 {
            info!(count, "all sessions invalidated");
        }
        count
    }

    /// `true` while `session` is the current holder of its descriptor.
    pub async fn is_valid(&self, session: &Session) -> bool {
        match self.existing_slot(session.path()) {
            Some(slot) => slot.lock().await.holds(session),
            None => false,
        }
    }

    /// Current holder of `path`, if any.
    pub async fn holder(&self, path: &str) -> Option<Session> {
        let slot = self.existing_slot(path)?;
        let slot = slot.lock().await;
        slot.holder.as_ref().map(|h| h.session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::backend::mock::MockBackend;
    use crate::infrastructure::backend::MockChannelBackend;
    use hwlink_core::domain::BackendKind;
    use hwlink_core::error::ErrorKind;
    use tokio_test::assert_ok;

    fn desc(path: &str) -> Descriptor {
        Descriptor::new(path, BackendKind::Hid)
    }

    fn backend_with(paths: &[&str]) -> MockBackend {
        paths
            .iter()
            .fold(MockBackend::new(BackendKind::Hid), |b, p| b.with_device(desc(p)))
    }

    fn arbitrator() -> SessionArbitrator {
        SessionArbitrator::new(AcquirePolicy::Steal, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_first_acquire_gets_epoch_zero() {
        // Arrange
        let backend = backend_with(&["D"]);
        let arb = arbitrator();

        // Act
        let s = arb.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();

        // Assert
        assert_eq!(s.epoch(), 0);
        assert_eq!(s.path(), "D");
        assert!(arb.is_valid(&s).await);
    }

    #[tokio::test]
    async fn test_steal_invalidates_previous_session() {
        // Arrange
        let backend = backend_with(&["D"]);
        let arb = arbitrator();
        let first = arb.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();

        // Act
        let second = arb.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();
        let stale = arb.call(&backend, &first, &LogicalMessage::new(1, vec![1])).await;
        let fresh = arb.call(&backend, &second, &LogicalMessage::new(1, vec![1])).await;

        // Assert
        assert_eq!(second.epoch(), first.epoch() + 1);
        assert_eq!(stale.unwrap_err().kind(), ErrorKind::SessionStale);
        assert_eq!(fresh.unwrap().message_type, 2);
        assert!(!arb.is_valid(&first).await);
        assert!(arb.is_valid(&second).await);
    }

    #[tokio::test]
    async fn test_stale_call_never_touches_backend() {
        // Arrange: open succeeds once; no call may ever reach the backend.
        let mut mock = MockChannelBackend::new();
        mock.expect_kind().return_const(BackendKind::Hid);
        mock.expect_open()
            .returning(|d, _| Ok(ChannelHandle::new(&d.path, BackendKind::Hid, "t")));
        mock.expect_call().times(0);
        let arb = arbitrator();
        let first = arb.acquire(&mock, &desc("D"), AcquireOptions::default()).await.unwrap();
        let _second = arb.acquire(&mock, &desc("D"), AcquireOptions::default()).await.unwrap();

        // Act
        let err = arb
            .call(&mock, &first, &LogicalMessage::new(1, vec![]))
            .await
            .unwrap_err();

        // Assert
        assert_eq!(err.kind(), ErrorKind::SessionStale);
    }

    #[tokio::test]
    async fn test_release_of_stale_session_is_noop() {
        let backend = backend_with(&["D"]);
        let arb = arbitrator();
        let first = arb.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();
        let second = arb.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();

        assert_ok!(arb.release(&backend, &first).await);

        assert!(arb.is_valid(&second).await);
        assert_eq!(arb.holder("D").await, Some(second));
        assert_eq!(backend.close_count(), 0);
    }

    #[tokio::test]
    async fn test_release_frees_and_epoch_keeps_counting() {
        let backend = backend_with(&["D"]);
        let arb = arbitrator();
        let s0 = arb.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();

        assert_ok!(arb.release(&backend, &s0).await);
        assert_ok!(arb.release(&backend, &s0).await);
        let s1 = arb.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();

        assert_eq!(backend.close_count(), 1);
        assert_eq!(s1.epoch(), 1);
        assert_ne!(s0.id(), s1.id());
    }

    #[tokio::test]
    async fn test_failed_open_leaves_holder_untouched() {
        let backend = backend_with(&["D"]);
        let arb = arbitrator();
        let s = arb.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();

        let err = arb
            .acquire(&backend, &desc("missing"), AcquireOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeviceUnreachable);
        assert!(arb.is_valid(&s).await);
        assert_eq!(arb.holder("missing").await, None);
    }

    #[tokio::test]
    async fn test_require_force_policy_refuses_held_descriptor() {
        // Arrange
        let backend = backend_with(&["D"]);
        let arb = SessionArbitrator::new(AcquirePolicy::RequireForce, Duration::from_secs(1));
        let first = arb.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();

        // Act
        let refused = arb.acquire(&backend, &desc("D"), AcquireOptions::default()).await;
        let forced = arb.acquire(&backend, &desc("D"), AcquireOptions::forced()).await;

        // Assert
        assert_eq!(refused.unwrap_err().kind(), ErrorKind::DeviceUnreachable);
        assert!(!arb.is_valid(&first).await);
        assert_eq!(forced.unwrap().epoch(), 1);
    }

    #[tokio::test]
    async fn test_require_force_respects_foreign_session_hint() {
        let backend = backend_with(&["D"]);
        backend.hold_elsewhere("D");
        let arb = SessionArbitrator::new(AcquirePolicy::RequireForce, Duration::from_secs(1));
        let mut hinted = desc("D");
        hinted.session_hint = Some("7".to_string());

        let refused = arb.acquire(&backend, &hinted, AcquireOptions::default()).await;

        assert_eq!(refused.unwrap_err().kind(), ErrorKind::DeviceUnreachable);
        assert_eq!(backend.open_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_frees_missing_descriptors_only() {
        // Arrange
        let backend = backend_with(&["A", "B"]);
        let arb = arbitrator();
        let a = arb.acquire(&backend, &desc("A"), AcquireOptions::default()).await.unwrap();
        let b = arb.acquire(&backend, &desc("B"), AcquireOptions::default()).await.unwrap();

        // Act
        let freed = arb.sweep(&backend, &[desc("B")]).await;

        // Assert
        assert_eq!(freed, vec!["A".to_string()]);
        assert!(!arb.is_valid(&a).await);
        assert!(arb.is_valid(&b).await);
        let err = arb.call(&backend, &a, &LogicalMessage::new(1, vec![])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionStale);
    }

    #[tokio::test]
    async fn test_call_timeout_maps_to_timeout() {
        let backend = backend_with(&["D"]);
        backend.set_silent(true);
        let arb = SessionArbitrator::new(AcquirePolicy::Steal, Duration::from_millis(50));
        let s = arb.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();

        let err = arb.call(&backend, &s, &LogicalMessage::new(1, vec![1])).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(arb.is_valid(&s).await);
    }

    #[tokio::test]
    async fn test_invalidate_all_stales_every_session() {
        let backend = backend_with(&["A", "B"]);
        let arb = arbitrator();
        let a = arb.acquire(&backend, &desc("A"), AcquireOptions::default()).await.unwrap();
        let b = arb.acquire(&backend, &desc("B"), AcquireOptions::default()).await.unwrap();

        let n = arb.invalidate_all(Some(&backend)).await;

        assert_eq!(n, 2);
        assert!(!arb.is_valid(&a).await);
        assert!(!arb.is_valid(&b).await);
    }

    #[tokio::test]
    async fn test_sweep_leaves_sessions_of_other_backend_alone() {
        // Arrange: a session opened over HID, then a bridge listing without it
        let hid = backend_with(&["D"]);
        let bridge = MockBackend::new(BackendKind::Bridge);
        let arb = arbitrator();
        let s = arb.acquire(&hid, &desc("D"), AcquireOptions::default()).await.unwrap();

        // Act
        let freed = arb.sweep(&bridge, &[]).await;

        // Assert
        assert!(freed.is_empty());
        assert!(arb.is_valid(&s).await);
        assert_eq!(bridge.close_count(), 0);
        assert_eq!(hid.close_count(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_all_closes_only_through_matching_backend() {
        let hid = backend_with(&["D"]);
        let mut bridge = MockChannelBackend::new();
        bridge.expect_kind().return_const(BackendKind::Bridge);
        bridge.expect_close().times(0);
        let arb = arbitrator();
        let s = arb.acquire(&hid, &desc("D"), AcquireOptions::default()).await.unwrap();

        let n = arb.invalidate_all(Some(&bridge)).await;

        assert_eq!(n, 1);
        assert!(!arb.is_valid(&s).await);
    }

    #[tokio::test]
    async fn test_lookups_of_unknown_paths_do_not_grow_the_table() {
        // Arrange: a session for a path this arbitrator never granted
        let backend = backend_with(&["D"]);
        let other = arbitrator();
        let foreign = other.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();
        let arb = arbitrator();

        // Act
        let valid = arb.is_valid(&foreign).await;
        let holder = arb.holder("nowhere").await;
        let call = arb.call(&backend, &foreign, &LogicalMessage::new(1, vec![])).await;
        let release = arb.release(&backend, &foreign).await;

        // Assert
        assert!(!valid);
        assert_eq!(holder, None);
        assert_eq!(call.unwrap_err().kind(), ErrorKind::SessionStale);
        assert_ok!(release);
        assert_eq!(arb.tracked_paths(), 0);
    }

    #[tokio::test]
    async fn test_session_from_other_backend_is_stale() {
        let hid = backend_with(&["D"]);
        let bridge = MockBackend::new(BackendKind::Bridge).with_device(Descriptor::new("D", BackendKind::Bridge));
        let arb = arbitrator();
        let s = arb.acquire(&hid, &desc("D"), AcquireOptions::default()).await.unwrap();

        let err = arb.call(&bridge, &s, &LogicalMessage::new(1, vec![])).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SessionStale);
    }
}
