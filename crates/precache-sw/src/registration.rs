//! Registration state machine: which worker is installing, waiting, active.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::manifest::CacheName;
use crate::ServiceWorkerError;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Script loaded, nothing run yet.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed or replaced by a newer worker.
    Redundant,
}

impl ServiceWorkerState {
    fn can_transition_to(self, to: ServiceWorkerState) -> bool {
        use ServiceWorkerState::*;

        matches!(
            (self, to),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (_, Redundant)
        ) && self != Redundant
    }
}

/// One version of the worker.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Cache namespace this version owns.
    pub cache_name: CacheName,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Set by `SKIP_WAITING`: activate as soon as install completes.
    pub skip_waiting: bool,

    /// Error message if install failed.
    pub error: Option<String>,
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(cache_name: CacheName) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            cache_name,
            state: ServiceWorkerState::Parsed,
            skip_waiting: false,
            error: None,
        }
    }

    /// Move to `state`, rejecting transitions the lifecycle does not allow.
    pub fn set_state(&mut self, state: ServiceWorkerState) -> Result<(), ServiceWorkerError> {
        if !self.state.can_transition_to(state) {
            return Err(ServiceWorkerError::State(format!(
                "{}: cannot go from {:?} to {:?}",
                self.id, self.state, state
            )));
        }
        self.state = state;
        Ok(())
    }

    fn retire(&mut self) {
        self.state = ServiceWorkerState::Redundant;
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

/// How many retired workers a registration remembers.
pub const RETIRED_HISTORY: usize = 8;

/// A registration: one scope, up to three worker slots.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// The most recently retired workers, oldest first. At most
    /// [`RETIRED_HISTORY`] are kept.
    pub retired: VecDeque<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            retired: VecDeque::new(),
        }
    }

    fn retire(&mut self, mut worker: ServiceWorker) {
        worker.retire();
        if self.retired.len() == RETIRED_HISTORY {
            self.retired.pop_front();
        }
        self.retired.push_back(worker);
    }

    /// Find a live or retired worker.
    pub fn worker(&self, id: ServiceWorkerId) -> Option<&ServiceWorker> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .chain(self.retired.iter())
            .find(|w| w.id == id)
    }

    fn live_worker_mut(&mut self, id: ServiceWorkerId) -> Option<&mut ServiceWorker> {
        [&mut self.installing, &mut self.waiting, &mut self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
    }

    /// The controlling worker, if one is activated.
    pub fn controller(&self) -> Option<&ServiceWorker> {
        self.active.as_ref().filter(|w| w.is_active())
    }

    /// Start installing a new version. A worker still installing is replaced.
    pub fn update(&mut self, cache_name: CacheName) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let mut worker = ServiceWorker::new(cache_name);
        worker.set_state(ServiceWorkerState::Installing)?;
        let id = worker.id;

        if let Some(previous) = self.installing.replace(worker) {
            self.retire(previous);
        }
        Ok(id)
    }

    /// Transition installing to waiting. A previously waiting worker is retired.
    pub fn install_complete(&mut self, id: ServiceWorkerId) -> Result<(), ServiceWorkerError> {
        let mut worker = self.take_installing(id)?;
        worker.set_state(ServiceWorkerState::Installed)?;

        if let Some(previous) = self.waiting.replace(worker) {
            self.retire(previous);
        }
        Ok(())
    }

    /// Install failed: the installing worker becomes redundant.
    pub fn install_failed(
        &mut self,
        id: ServiceWorkerId,
        reason: impl Into<String>,
    ) -> Result<(), ServiceWorkerError> {
        let mut worker = self.take_installing(id)?;
        worker.error = Some(reason.into());
        self.retire(worker);
        Ok(())
    }

    fn take_installing(&mut self, id: ServiceWorkerId) -> Result<ServiceWorker, ServiceWorkerError> {
        match self.installing.take() {
            Some(worker) if worker.id == id => Ok(worker),
            other => {
                self.installing = other;
                Err(ServiceWorkerError::State(format!("{id} is not installing")))
            }
        }
    }

    /// Promote the waiting worker into the active slot in the `Activating`
    /// state. The old active worker is retired.
    pub fn begin_activate(&mut self) -> Result<Option<ServiceWorkerId>, ServiceWorkerError> {
        let Some(mut worker) = self.waiting.take() else {
            return Ok(None);
        };
        worker.set_state(ServiceWorkerState::Activating)?;
        let id = worker.id;

        if let Some(old) = self.active.replace(worker) {
            self.retire(old);
        }
        Ok(Some(id))
    }

    /// Finish activation of the worker in the active slot.
    pub fn finish_activate(&mut self, id: ServiceWorkerId) -> Result<(), ServiceWorkerError> {
        match self.active.as_mut() {
            Some(worker) if worker.id == id => worker.set_state(ServiceWorkerState::Activated),
            _ => Err(ServiceWorkerError::State(format!("{id} is not activating"))),
        }
    }

    /// Flag a live worker to skip waiting. Returns whether it is waiting
    /// right now and so can be activated immediately.
    pub fn skip_waiting(&mut self, id: ServiceWorkerId) -> Result<bool, ServiceWorkerError> {
        let worker = self
            .live_worker_mut(id)
            .ok_or_else(|| ServiceWorkerError::State(format!("{id} is not live")))?;
        worker.skip_waiting = true;
        Ok(worker.state == ServiceWorkerState::Installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> ServiceWorkerRegistration {
        ServiceWorkerRegistration::new(Url::parse("https://example.com/").unwrap())
    }

    fn name(version: &str) -> CacheName {
        CacheName::for_version("cache-", version)
    }

    #[test]
    fn test_state_transitions() {
        let mut worker = ServiceWorker::new(name("1"));
        assert_eq!(worker.state, ServiceWorkerState::Parsed);

        worker.set_state(ServiceWorkerState::Installing).unwrap();
        assert!(worker.set_state(ServiceWorkerState::Activated).is_err());
        worker.set_state(ServiceWorkerState::Installed).unwrap();
        worker.set_state(ServiceWorkerState::Activating).unwrap();
        worker.set_state(ServiceWorkerState::Activated).unwrap();
        assert!(worker.is_active());

        worker.set_state(ServiceWorkerState::Redundant).unwrap();
        assert!(worker.set_state(ServiceWorkerState::Installing).is_err());
    }

    #[test]
    fn test_registration_lifecycle() {
        let mut registration = registration();
        let id = registration.update(name("1")).unwrap();
        assert!(registration.installing.is_some());

        registration.install_complete(id).unwrap();
        assert!(registration.installing.is_none());
        assert_eq!(
            registration.waiting.as_ref().unwrap().state,
            ServiceWorkerState::Installed
        );
        assert!(registration.controller().is_none());

        assert_eq!(registration.begin_activate().unwrap(), Some(id));
        assert!(registration.controller().is_none());
        registration.finish_activate(id).unwrap();
        assert_eq!(registration.controller().unwrap().id, id);
    }

    #[test]
    fn test_new_version_retires_old_active() {
        let mut registration = registration();
        let first = registration.update(name("1")).unwrap();
        registration.install_complete(first).unwrap();
        registration.begin_activate().unwrap();
        registration.finish_activate(first).unwrap();

        let second = registration.update(name("2")).unwrap();
        registration.install_complete(second).unwrap();
        assert_eq!(registration.controller().unwrap().id, first);

        registration.begin_activate().unwrap();
        registration.finish_activate(second).unwrap();
        assert_eq!(registration.controller().unwrap().id, second);
        assert!(registration.worker(first).unwrap().is_redundant());
    }

    #[test]
    fn test_install_failed_is_redundant() {
        let mut registration = registration();
        let id = registration.update(name("1")).unwrap();
        registration.install_failed(id, "404 on /app.js").unwrap();

        let worker = registration.worker(id).unwrap();
        assert!(worker.is_redundant());
        assert_eq!(worker.error.as_deref(), Some("404 on /app.js"));
        assert!(registration.waiting.is_none());
    }

    #[test]
    fn test_install_complete_wrong_id() {
        let mut registration = registration();
        let id = registration.update(name("1")).unwrap();
        let stale = registration.update(name("2")).unwrap();
        assert!(registration.install_complete(id).is_err());
        assert!(registration.worker(id).unwrap().is_redundant());
        registration.install_complete(stale).unwrap();
    }

    #[test]
    fn test_skip_waiting() {
        let mut registration = registration();
        let id = registration.update(name("1")).unwrap();
        assert!(!registration.skip_waiting(id).unwrap());

        registration.install_complete(id).unwrap();
        assert!(registration.waiting.as_ref().unwrap().skip_waiting);
        assert!(registration.skip_waiting(id).unwrap());
    }

    #[test]
    fn test_retired_history_is_bounded() {
        let mut registration = registration();
        let first = registration.update(name("0")).unwrap();
        registration.install_failed(first, "offline").unwrap();

        let mut ids = Vec::new();
        for version in 1..=(RETIRED_HISTORY as u32 + 3) {
            let id = registration.update(name(&version.to_string())).unwrap();
            registration.install_failed(id, "offline").unwrap();
            ids.push(id);
        }
        let last = ids[ids.len() - 1];

        assert_eq!(registration.retired.len(), RETIRED_HISTORY);
        assert!(registration.worker(first).is_none());
        assert!(registration.worker(last).unwrap().is_redundant());
        assert_eq!(
            registration.worker(last).unwrap().error.as_deref(),
            Some("offline")
        );
    }
}
