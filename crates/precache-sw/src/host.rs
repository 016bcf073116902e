//! Host-side dispatch: drives the registration state machine and routes
//! events to the handler of the right worker version.

use std::sync::Arc;

use hashbrown::HashMap;
use precache_net::Request;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::handler::{CacheLifecycleHandler, ControlMessage, FetchDisposition};
use crate::registration::{ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState};
use crate::ServiceWorkerError;

/// Events the host publishes as the lifecycle advances.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new worker took control of the scope.
    ControllerChange { worker_id: ServiceWorkerId },
    /// Activation removed these cache namespaces.
    CachesPruned {
        worker_id: ServiceWorkerId,
        deleted: Vec<String>,
    },
}

/// Owns one registration and the handlers of its live workers.
pub struct ServiceWorkerHost {
    registration: RwLock<ServiceWorkerRegistration>,
    handlers: RwLock<HashMap<ServiceWorkerId, Arc<CacheLifecycleHandler>>>,
    event_tx: mpsc::UnboundedSender<HostEvent>,
}

impl ServiceWorkerHost {
    /// Create a host for `scope`.
    pub fn new(scope: Url) -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(ServiceWorkerRegistration::new(scope)),
                handlers: RwLock::new(HashMap::new()),
                event_tx,
            },
            event_rx,
        )
    }

    fn emit(&self, event: HostEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        self.emit(HostEvent::StateChange {
            worker_id,
            new_state,
        });
    }

    /// Install a new worker version and wait for its install handler.
    ///
    /// On success the worker waits, unless nothing is active yet or it was
    /// told to skip waiting, in which case it is activated straight away.
    /// On failure the worker becomes redundant and the error is returned.
    pub async fn register(
        &self,
        handler: CacheLifecycleHandler,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let handler = Arc::new(handler);
        let id = self
            .registration
            .write()
            .await
            .update(handler.cache_name().clone())?;
        self.handlers.write().await.insert(id, Arc::clone(&handler));
        self.prune_handlers().await;
        info!(worker = %id, cache = %handler.cache_name(), "Installing worker");
        self.emit_state(id, ServiceWorkerState::Installing);

        if let Err(e) = handler.install().await {
            warn!(worker = %id, error = %e, "Install failed");
            self.registration
                .write()
                .await
                .install_failed(id, e.to_string())?;
            self.handlers.write().await.remove(&id);
            self.emit_state(id, ServiceWorkerState::Redundant);
            return Err(e);
        }

        let activate_now = {
            let mut registration = self.registration.write().await;
            registration.install_complete(id)?;
            let skip = registration
                .waiting
                .as_ref()
                .map(|w| w.skip_waiting)
                .unwrap_or(false);
            skip || registration.active.is_none()
        };
        self.prune_handlers().await;
        self.emit_state(id, ServiceWorkerState::Installed);

        if activate_now {
            self.activate_waiting().await?;
        }
        Ok(id)
    }

    /// Activate the waiting worker, if any, and run its activate handler.
    ///
    /// A failing activate handler is logged; the worker still activates.
    pub async fn activate_waiting(&self) -> Result<Option<ServiceWorkerId>, ServiceWorkerError> {
        let (id, retired) = {
            let mut registration = self.registration.write().await;
            let previous = registration.active.as_ref().map(|w| w.id);
            match registration.begin_activate()? {
                Some(id) => (id, previous),
                None => return Ok(None),
            }
        };

        if let Some(old) = retired {
            self.emit_state(old, ServiceWorkerState::Redundant);
        }
        self.prune_handlers().await;
        self.emit_state(id, ServiceWorkerState::Activating);

        let handler = self.handler(id).await?;
        match handler.activate().await {
            Ok(deleted) => self.emit(HostEvent::CachesPruned {
                worker_id: id,
                deleted,
            }),
            Err(e) => warn!(worker = %id, error = %e, "Activate handler failed"),
        }

        self.registration.write().await.finish_activate(id)?;
        info!(worker = %id, "Worker activated");
        self.emit_state(id, ServiceWorkerState::Activated);
        self.emit(HostEvent::ControllerChange { worker_id: id });
        Ok(Some(id))
    }

    /// Every page controlled by the old worker has gone away: the waiting
    /// worker can take over.
    pub async fn release_clients(&self) -> Result<Option<ServiceWorkerId>, ServiceWorkerError> {
        self.activate_waiting().await
    }

    /// Route a request to the controlling worker. Without a controller the
    /// request passes through.
    pub async fn handle_fetch(&self, request: &Request) -> Result<FetchDisposition, ServiceWorkerError> {
        let controller = self.registration.read().await.controller().map(|w| w.id);
        let Some(id) = controller else {
            debug!(url = %request.url, "No controller, passing through");
            return Ok(FetchDisposition::Passthrough);
        };
        self.handler(id).await?.fetch(request).await
    }

    /// Deliver a message to a live worker. Returns whether the payload was a
    /// recognised control message.
    pub async fn post_message(
        &self,
        target: ServiceWorkerId,
        data: &JsonValue,
    ) -> Result<bool, ServiceWorkerError> {
        let handler = self.handler(target).await?;
        match handler.message(data) {
            Some(ControlMessage::SkipWaiting) => {
                let waiting_now = self.registration.write().await.skip_waiting(target)?;
                debug!(worker = %target, waiting_now, "Skip waiting requested");
                if waiting_now {
                    self.activate_waiting().await?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Wait for background cache writes of every live worker.
    pub async fn flush(&self) {
        let handlers: Vec<_> = self.handlers.read().await.values().cloned().collect();
        for handler in handlers {
            handler.flush().await;
        }
    }

    /// Current state of a worker this host has seen.
    pub async fn state_of(&self, id: ServiceWorkerId) -> Option<ServiceWorkerState> {
        self.registration.read().await.worker(id).map(|w| w.state)
    }

    /// The controlling worker.
    pub async fn controller(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.controller().map(|w| w.id)
    }

    /// The waiting worker.
    pub async fn waiting(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.waiting.as_ref().map(|w| w.id)
    }

    /// Drop handlers of workers that are no longer live.
    async fn prune_handlers(&self) {
        let registration = self.registration.read().await;
        let live: Vec<ServiceWorkerId> = [
            &registration.installing,
            &registration.waiting,
            &registration.active,
        ]
        .into_iter()
        .flatten()
        .map(|w| w.id)
        .collect();
        drop(registration);

        self.handlers.write().await.retain(|id, _| live.contains(id));
    }

    async fn handler(
        &self,
        id: ServiceWorkerId,
    ) -> Result<Arc<CacheLifecycleHandler>, ServiceWorkerError> {
        self.handlers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::State(format!("{id} has no live handler")))
    }
}
