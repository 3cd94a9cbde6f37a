//! Transport facade: backend selection, enumeration polling and events.
//!
//! The facade owns the single active [`ChannelBackend`] and the
//! [`SessionArbitrator`].  Callers never touch either directly; every
//! session operation goes through here so a backend switch can invalidate
//! sessions in one place.
//!
//! Polling runs only while at least one [`Subscription`] is alive.  The poll
//! task holds a weak reference, so dropping the facade also ends it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use hwlink_core::domain::{
    BackendKind, BackendStatus, ChangeInfo, Descriptor, DescriptorDiff, ErrorInfo, Session,
    StartInfo, StopInfo, TransportEvent,
};
use hwlink_core::error::{TransportError, TransportResult};
use hwlink_core::protocol::LogicalMessage;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::arbitrator::{AcquireOptions, AcquirePolicy, SessionArbitrator};
use crate::application::events::{EventBus, Subscription};
use crate::infrastructure::backend::{BackendFactory, BackendInfo, ChannelBackend};

/// Runtime knobs for [`TransportFacade`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacadeSettings {
    /// Probe order.
    pub backends: Vec<BackendKind>,
    pub disabled: Vec<BackendKind>,
    pub poll_interval: Duration,
    pub call_timeout: Duration,
    pub acquire_policy: AcquirePolicy,
}

impl Default for FacadeSettings {
    fn default() -> Self {
        Self {
            backends: BackendKind::ALL.to_vec(),
            disabled: Vec::new(),
            poll_interval: Duration::from_millis(500),
            call_timeout: Duration::from_secs(60),
            acquire_policy: AcquirePolicy::Steal,
        }
    }
}

#[derive(Debug)]
struct PollState {
    descriptors: Vec<Descriptor>,
    status: BackendStatus,
    started: Option<StartInfo>,
}

impl Default for PollState {
    fn default() -> Self {
        Self {
            descriptors: Vec::new(),
            status: BackendStatus::Stopped,
            started: None,
        }
    }
}

struct Inner {
    factory: Box<dyn BackendFactory>,
    preference: StdMutex<Vec<BackendKind>>,
    disabled: StdMutex<HashSet<BackendKind>>,
    poll_interval: Duration,
    active: RwLock<Option<Arc<dyn ChannelBackend>>>,
    arbitrator: SessionArbitrator,
    bus: Arc<EventBus>,
    state: StdMutex<PollState>,
    /// Live poll task tagged with its generation.  The task clears this
    /// slot itself, under the same lock, when it decides to exit.
    poller: StdMutex<Option<(u64, JoinHandle<()>)>>,
    poller_generation: AtomicU64,
    /// Serializes start, stop and backend switches.
    lifecycle: Mutex<()>,
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn no_backend() -> TransportError {
    TransportError::unavailable("no active backend")
}

/// Process-scoped entry point to the transport.
pub struct TransportFacade {
    inner: Arc<Inner>,
}

impl TransportFacade {
    pub fn new(settings: FacadeSettings, factory: impl BackendFactory + 'static) -> Self {
        let inner = Inner {
            factory: Box::new(factory),
            preference: StdMutex::new(settings.backends),
            disabled: StdMutex::new(settings.disabled.into_iter().collect()),
            poll_interval: settings.poll_interval,
            active: RwLock::new(None),
            arbitrator: SessionArbitrator::new(settings.acquire_policy, settings.call_timeout),
            bus: Arc::new(EventBus::new()),
            state: StdMutex::new(PollState::default()),
            poller: StdMutex::new(None),
            poller_generation: AtomicU64::new(0),
            lifecycle: Mutex::new(()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Probes backends in priority order and activates the first usable one.
    ///
    /// Calling `start` on a running facade returns the current start info.
    ///
    /// # Errors
    ///
    /// `TransportUnavailable` when no enabled backend could be started.
    pub async fn start(&self) -> TransportResult<StartInfo> {
        let _guard = self.inner.lifecycle.lock().await;
        if let Some(info) = lock(&self.inner.state).started.clone() {
            return Ok(info);
        }
        Inner::select_backend(&self.inner, &[]).await
    }

    /// Deactivates the backend and invalidates every session.
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.teardown().await;
    }

    /// Replaces the probe order.  A running facade moves to a higher-ranked
    /// backend if one is now available.
    pub async fn set_backend_preference(&self, backends: Vec<BackendKind>) -> TransportResult<()> {
        let _guard = self.inner.lifecycle.lock().await;
        *lock(&self.inner.preference) = backends;
        Inner::reconcile(&self.inner).await
    }

    /// Excludes `kind` from probing, switching away from it if active.
    pub async fn disable_backend(&self, kind: BackendKind) -> TransportResult<()> {
        let _guard = self.inner.lifecycle.lock().await;
        lock(&self.inner.disabled).insert(kind);
        Inner::reconcile(&self.inner).await
    }

    /// Asks the active backend for user consent to a new device.
    ///
    /// A granted device shows up in the next enumeration; one pass is run
    /// immediately so subscribers see it.
    pub async fn request_device_selection(&self) -> TransportResult<Option<Descriptor>> {
        let backend = self.inner.backend().await?;
        let chosen = backend.request_device_selection().await?;
        if chosen.is_some() {
            self.inner.enumerate_pass().await?;
        }
        Ok(chosen)
    }

    /// Runs one enumeration pass now and returns the full snapshot.
    pub async fn enumerate(&self) -> TransportResult<Vec<Descriptor>> {
        self.inner.enumerate_pass().await
    }

    pub async fn acquire(
        &self,
        descriptor: &Descriptor,
        options: AcquireOptions,
    ) -> TransportResult<Session> {
        let backend = self.inner.backend().await?;
        let result = self
            .inner
            .arbitrator
            .acquire(backend.as_ref(), descriptor, options)
            .await;
        if let Err(e) = &result {
            if let Some(udev) = backend.udev_hint() {
                let mut info = ErrorInfo::from(e.clone());
                info.udev_info = Some(udev);
                self.inner.bus.publish(TransportEvent::Error(info));
            }
        }
        result
    }

    pub async fn call(
        &self,
        session: &Session,
        message: &LogicalMessage,
    ) -> TransportResult<LogicalMessage> {
        let backend = self.inner.backend().await.map_err(|_| {
            TransportError::stale(format!("session {} outlived its backend", session.id()))
        })?;
        self.inner
            .arbitrator
            .call(backend.as_ref(), session, message)
            .await
    }

    /// Releasing a stale session, or any session after `stop`, is a no-op.
    pub async fn release(&self, session: &Session) -> TransportResult<()> {
        match self.inner.backend().await {
            Ok(backend) => self.inner.arbitrator.release(backend.as_ref(), session).await,
            Err(_) => Ok(()),
        }
    }

    /// Registers an event subscriber and makes sure polling runs.
    pub fn subscribe(&self) -> Subscription {
        let sub = Subscription::new(Arc::clone(&self.inner.bus));
        Inner::ensure_poller(&self.inner);
        sub
    }

    pub async fn active_backend(&self) -> Option<BackendKind> {
        self.inner.active.read().await.as_ref().map(|b| b.kind())
    }

    /// Snapshot from the most recent successful enumeration.
    pub fn descriptors(&self) -> Vec<Descriptor> {
        lock(&self.inner.state).descriptors.clone()
    }

    pub fn status(&self) -> BackendStatus {
        lock(&self.inner.state).status
    }

    /// `true` while the background poll task is alive.
    pub fn is_polling(&self) -> bool {
        lock(&self.inner.poller)
            .as_ref()
            .is_some_and(|(_, h)| !h.is_finished())
    }

    pub async fn is_valid(&self, session: &Session) -> bool {
        self.inner.arbitrator.is_valid(session).await
    }
}

impl Inner {
    async fn backend(&self) -> TransportResult<Arc<dyn ChannelBackend>> {
        self.active.read().await.clone().ok_or_else(no_backend)
    }

    /// Enabled kinds in probe order.
    fn candidates(&self) -> Vec<BackendKind> {
        let disabled = lock(&self.disabled).clone();
        let mut seen = HashSet::new();
        lock(&self.preference)
            .iter()
            .copied()
            .filter(|k| !disabled.contains(k) && seen.insert(*k))
            .collect()
    }

    async fn probe(&self, kind: BackendKind) -> Option<(Arc<dyn ChannelBackend>, BackendInfo)> {
        let Some(backend) = self.factory.create(kind) else {
            debug!(backend = %kind, "backend not available in this build");
            return None;
        };
        match backend.init().await {
            Ok(info) => Some((backend, info)),
            Err(e) => {
                warn!(backend = %kind, error = %e, "backend probe failed");
                None
            }
        }
    }

    /// Activates the first candidate that initialises, skipping `exclude`.
    async fn select_backend(self: &Arc<Self>, exclude: &[BackendKind]) -> TransportResult<StartInfo> {
        for kind in self.candidates() {
            if exclude.contains(&kind) {
                continue;
            }
            if let Some((backend, info)) = self.probe(kind).await {
                return Ok(Self::install(self, backend, info).await);
            }
        }

        let err = TransportError::unavailable("no transport backend could be started");
        warn!("{err}");
        self.bus.publish(TransportEvent::Error(ErrorInfo::from(err.clone())));
        Err(err)
    }

    async fn install(
        self: &Arc<Self>,
        backend: Arc<dyn ChannelBackend>,
        info: BackendInfo,
    ) -> StartInfo {
        let kind = backend.kind();
        let start = StartInfo {
            backend_type: kind,
            version: info.version,
            outdated: info.outdated,
            bridge_info: info.bridge_info,
            udev_info: backend.udev_hint(),
        };
        *self.active.write().await = Some(backend);
        {
            let mut state = lock(&self.state);
            state.descriptors.clear();
            state.status = BackendStatus::Running;
            state.started = Some(start.clone());
        }
        info!(backend = %kind, version = %start.version, "transport started");
        self.bus.publish(TransportEvent::Started(start.clone()));
        Self::ensure_poller(self);
        start
    }

    async fn teardown(&self) {
        if let Some((_, handle)) = lock(&self.poller).take() {
            handle.abort();
        }
        let Some(backend) = self.active.write().await.take() else {
            return;
        };
        let kind = backend.kind();
        self.arbitrator.invalidate_all(Some(backend.as_ref())).await;
        backend.stop().await;
        *lock(&self.state) = PollState::default();
        info!(backend = %kind, "transport stopped");
        self.bus.publish(TransportEvent::Stopped(StopInfo { backend_type: kind }));
    }

    /// Re-applies preference and disabled lists to a running facade.
    async fn reconcile(self: &Arc<Self>) -> TransportResult<()> {
        let Some(active) = self.active.read().await.as_ref().map(|b| b.kind()) else {
            return Ok(());
        };
        let ranked = self.candidates();

        let Some(position) = ranked.iter().position(|k| *k == active) else {
            info!(backend = %active, "active backend no longer allowed, switching");
            self.teardown().await;
            return Self::select_backend(self, &[]).await.map(|_| ());
        };

        for kind in &ranked[..position] {
            if let Some((backend, info)) = self.probe(*kind).await {
                info!(from = %active, to = %kind, "switching to preferred backend");
                self.teardown().await;
                Self::install(self, backend, info).await;
                return Ok(());
            }
        }
        Ok(())
    }

    /// One poll: enumerate, diff, sweep departed devices, publish changes.
    async fn enumerate_pass(&self) -> TransportResult<Vec<Descriptor>> {
        let backend = self.backend().await?;
        let kind = backend.kind();
        let result = backend.enumerate().await;

        // A switch while enumerating makes this pass meaningless.  The guard
        // stays held through the sweep so a switch cannot start underneath it.
        let active = self.active.read().await;
        if !active.as_ref().is_some_and(|b| Arc::ptr_eq(b, &backend)) {
            return result;
        }

        match result {
            Ok(descriptors) => {
                let (diff, recovered) = {
                    let mut state = lock(&self.state);
                    let diff = DescriptorDiff::between(&state.descriptors, &descriptors);
                    let recovered = state.status == BackendStatus::Error;
                    state.descriptors = descriptors.clone();
                    state.status = BackendStatus::Running;
                    (diff, recovered)
                };

                let freed = self.arbitrator.sweep(backend.as_ref(), &descriptors).await;
                if !diff.is_empty() || recovered {
                    debug!(
                        added = diff.added.len(),
                        removed = diff.removed.len(),
                        freed = freed.len(),
                        "device set changed"
                    );
                    self.bus.publish(TransportEvent::Changed(ChangeInfo {
                        backend_type: kind,
                        status: BackendStatus::Running,
                        name: Some(kind.display_name().to_string()),
                        error: None,
                        devices: Some(diff),
                    }));
                }
                Ok(descriptors)
            }
            Err(e) => {
                let was_usable = {
                    let mut state = lock(&self.state);
                    let was = state.status != BackendStatus::Error;
                    state.status = BackendStatus::Error;
                    was
                };
                if was_usable {
                    warn!(backend = %kind, error = %e, "enumeration failed");
                    let mut info = ErrorInfo::from(e.clone());
                    info.udev_info = backend.udev_hint();
                    self.bus.publish(TransportEvent::Error(info));
                    self.bus.publish(TransportEvent::Changed(ChangeInfo {
                        backend_type: kind,
                        status: BackendStatus::Error,
                        name: Some(kind.display_name().to_string()),
                        error: Some(e.to_string()),
                        devices: None,
                    }));
                } else {
                    debug!(backend = %kind, error = %e, "enumeration still failing");
                }
                Err(e)
            }
        }
    }

    fn ensure_poller(self: &Arc<Self>) {
        let mut poller = lock(&self.poller);
        if poller.is_some() || self.bus.subscriber_count() == 0 {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime; enumeration polling disabled");
            return;
        };
        let generation = self.poller_generation.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        *poller = Some((generation, runtime.spawn(poll_loop(weak, generation))));
    }

    /// Clears the poller slot if polling should end; `true` means exit.
    fn should_stop_polling(&self, generation: u64) -> bool {
        let mut poller = lock(&self.poller);
        let owns_slot = poller.as_ref().is_some_and(|(g, _)| *g == generation);
        if !owns_slot {
            return true;
        }
        let idle = self.bus.subscriber_count() == 0;
        let stopped = lock(&self.state).status == BackendStatus::Stopped;
        if idle || stopped {
            *poller = None;
            debug!(idle, stopped, "polling suspended");
            return true;
        }
        false
    }
}

async fn poll_loop(weak: Weak<Inner>, generation: u64) {
    debug!(generation, "polling started");
    loop {
        let interval = {
            let Some(inner) = weak.upgrade() else { break };
            if inner.should_stop_polling(generation) {
                break;
            }
            // Failures are published as events; the next tick retries.
            let _ = inner.enumerate_pass().await;
            inner.poll_interval
        };
        tokio::time::sleep(interval).await;
    }
}
