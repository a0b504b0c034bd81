//! Registry of live sessions and fan-out to their outbound queues.
//!
//! Sessions are indexed three ways:
//! - driver id → the single session of that driver
//! - customer id → every session of that customer
//! - delivery id → customer sessions watching that delivery
//!
//! All index mutation and all fan-out reads go through one `RwLock`, so a
//! broadcast never observes a session that is half registered or half removed.
//!
//! Sends never wait. A session whose queue is full is dropped from the hub
//! and its queue closed; it has to reconnect to receive events again.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::observability::metrics::Metrics;

pub use session::{Frame, PushError, Role, Session};

#[derive(Default)]
struct Registry {
    sessions: HashMap<Uuid, Arc<Session>>,
    drivers: HashMap<String, Uuid>,
    customers: HashMap<String, Vec<Uuid>>,
    deliveries: HashMap<String, Vec<Uuid>>,
}

impl Registry {
    fn insert(&mut self, session: Arc<Session>) {
        let id = session.id();
        match session.role() {
            Role::Driver => {
                self.drivers.insert(session.user_id().to_string(), id);
            }
            Role::Customer => {
                self.customers
                    .entry(session.user_id().to_string())
                    .or_default()
                    .push(id);
                if let Some(delivery_id) = session.delivery_id() {
                    self.deliveries
                        .entry(delivery_id.to_string())
                        .or_default()
                        .push(id);
                }
            }
        }
        self.sessions.insert(id, session);
    }

    fn remove(&mut self, id: Uuid) -> Option<Arc<Session>> {
        let session = self.sessions.remove(&id)?;

        match session.role() {
            Role::Driver => {
                // a newer session may already own this driver id
                if self.drivers.get(session.user_id()) == Some(&id) {
                    self.drivers.remove(session.user_id());
                }
            }
            Role::Customer => {
                remove_from_index(&mut self.customers, session.user_id(), id);
                if let Some(delivery_id) = session.delivery_id() {
                    remove_from_index(&mut self.deliveries, delivery_id, id);
                }
            }
        }

        Some(session)
    }

    fn watchers(&self, delivery_id: &str) -> impl Iterator<Item = &Arc<Session>> + '_ {
        self.deliveries
            .get(delivery_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.sessions.get(id))
    }
}

fn remove_from_index(index: &mut HashMap<String, Vec<Uuid>>, key: &str, id: Uuid) {
    if let Some(ids) = index.get_mut(key) {
        ids.retain(|candidate| *candidate != id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

pub struct Hub {
    registry: RwLock<Registry>,
    metrics: Metrics,
}

impl Hub {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            metrics,
        }
    }

    /// Adds a session to every index its role belongs to.
    ///
    /// A driver id maps to one session only: if another session is still
    /// registered under the same driver id it is unregistered first.
    pub async fn register(&self, session: Arc<Session>) {
        let mut registry = self.registry.write().await;

        if registry.sessions.contains_key(&session.id()) {
            return;
        }

        if session.role() == Role::Driver {
            let superseded = registry.drivers.get(session.user_id()).copied();
            if let Some(old) = superseded.and_then(|old_id| registry.remove(old_id)) {
                self.retire(&old);
                info!(
                    driver_id = %old.user_id(),
                    session_id = %old.id(),
                    "superseded driver session closed"
                );
            }
        }

        info!(
            user_id = %session.user_id(),
            role = %session.role(),
            delivery_id = session.delivery_id().unwrap_or(""),
            session_id = %session.id(),
            "session registered"
        );
        self.metrics
            .sessions_connected
            .with_label_values(&[session.role().as_str()])
            .inc();
        registry.insert(session);
    }

    /// Removes a session from all indices and closes its queue.
    ///
    /// Returns `false` when the session was not registered; calling this more
    /// than once for the same session is harmless.
    pub async fn unregister(&self, session_id: Uuid) -> bool {
        let removed = self.registry.write().await.remove(session_id);

        match removed {
            Some(session) => {
                self.retire(&session);
                info!(
                    user_id = %session.user_id(),
                    role = %session.role(),
                    session_id = %session.id(),
                    "session unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Enqueues a frame for one session. Returns whether it was accepted.
    pub async fn send_to_session(&self, session_id: Uuid, frame: Frame) -> bool {
        let outcome = {
            let registry = self.registry.read().await;
            registry
                .sessions
                .get(&session_id)
                .map(|session| session.try_send(frame))
        };

        match outcome {
            Some(Ok(())) => true,
            Some(Err(err)) => {
                self.drop_lagging(vec![(session_id, err)]).await;
                false
            }
            None => false,
        }
    }

    /// Enqueues a frame for every registered session.
    pub async fn broadcast_all(&self, frame: Frame) -> usize {
        let (delivered, failed) = {
            let registry = self.registry.read().await;
            fan_out(registry.sessions.values(), &frame)
        };

        self.drop_lagging(failed).await;
        delivered
    }

    /// Enqueues a frame for every session watching `delivery_id`.
    pub async fn send_to_watchers(&self, delivery_id: &str, frame: Frame) -> usize {
        let (delivered, failed) = {
            let registry = self.registry.read().await;
            fan_out(registry.watchers(delivery_id), &frame)
        };

        debug!(delivery_id, delivered, "sent to delivery watchers");
        self.drop_lagging(failed).await;
        delivered
    }

    pub async fn session_count(&self) -> usize {
        self.registry.read().await.sessions.len()
    }

    pub async fn watcher_count(&self, delivery_id: &str) -> usize {
        self.registry.read().await.watchers(delivery_id).count()
    }

    pub async fn is_registered(&self, session_id: Uuid) -> bool {
        self.registry.read().await.sessions.contains_key(&session_id)
    }

    pub async fn driver_session(&self, driver_id: &str) -> Option<Uuid> {
        self.registry.read().await.drivers.get(driver_id).copied()
    }

    pub async fn customer_session_count(&self, customer_id: &str) -> usize {
        self.registry
            .read()
            .await
            .customers
            .get(customer_id)
            .map_or(0, Vec::len)
    }

    fn retire(&self, session: &Session) {
        session.close();
        self.metrics
            .sessions_connected
            .with_label_values(&[session.role().as_str()])
            .dec();
    }

    async fn drop_lagging(&self, failed: Vec<(Uuid, PushError)>) {
        for (session_id, err) in failed {
            if err == PushError::Full {
                warn!(session_id = %session_id, "outbound queue full; dropping session");
            }
            if self.unregister(session_id).await && err == PushError::Full {
                self.metrics.sessions_dropped_total.inc();
            }
        }
    }
}

fn fan_out<'a>(
    sessions: impl Iterator<Item = &'a Arc<Session>>,
    frame: &Frame,
) -> (usize, Vec<(Uuid, PushError)>) {
    let mut delivered = 0;
    let mut failed = Vec::new();

    for session in sessions {
        match session.try_send(frame.clone()) {
            Ok(()) => delivered += 1,
            Err(err) => failed.push((session.id(), err)),
        }
    }

    (delivered, failed)
}
