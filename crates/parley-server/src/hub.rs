//! Connection hub.
//!
//! A single task owns every mutation of the session registry. Callers reach
//! it through three queues (register, unregister, fan-out) and wait on a
//! oneshot ack, so a returned call has taken effect. Lookups read the shared
//! table directly; only the hub task writes it.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::UserId;

use crate::errors::HubError;
use crate::metrics as names;
use crate::session::{SendFailure, Session};

type Registry = Arc<RwLock<HashMap<UserId, Arc<Session>>>>;

/// Outcome of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub evicted: usize,
}

struct RegisterRequest {
    session: Arc<Session>,
    ack: oneshot::Sender<()>,
}

struct UnregisterRequest {
    session: Arc<Session>,
    ack: oneshot::Sender<bool>,
}

struct FanoutRequest {
    payload: Bytes,
    ack: oneshot::Sender<FanoutReport>,
}

/// Cloneable front door to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<RegisterRequest>,
    unregister_tx: mpsc::Sender<UnregisterRequest>,
    fanout_tx: mpsc::Sender<FanoutRequest>,
    registry: Registry,
}

impl HubHandle {
    /// Insert `session`, replacing any session of the same user. The
    /// replaced session is closed.
    pub async fn register(&self, session: Arc<Session>) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.register_tx
            .send(RegisterRequest { session, ack })
            .await
            .map_err(|_| HubError::Stopped)?;
        done.await.map_err(|_| HubError::Stopped)
    }

    /// Remove `session` if it is still the registered one for its user, and
    /// close it either way. Returns whether the registry changed.
    pub async fn unregister(&self, session: Arc<Session>) -> Result<bool, HubError> {
        let (ack, done) = oneshot::channel();
        self.unregister_tx
            .send(UnregisterRequest { session, ack })
            .await
            .map_err(|_| HubError::Stopped)?;
        done.await.map_err(|_| HubError::Stopped)
    }

    /// Deliver `payload` to every registered session without blocking.
    /// Sessions whose buffer is full or closed are evicted.
    pub async fn fanout(&self, payload: Bytes) -> Result<FanoutReport, HubError> {
        let (ack, done) = oneshot::channel();
        self.fanout_tx
            .send(FanoutRequest { payload, ack })
            .await
            .map_err(|_| HubError::Stopped)?;
        done.await.map_err(|_| HubError::Stopped)
    }

    pub fn lookup(&self, user: UserId) -> Option<Arc<Session>> {
        self.registry.read().get(&user).cloned()
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.registry.read().contains_key(&user)
    }

    pub fn online_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Best-effort targeted delivery. A full buffer is reported but does not
    /// evict the session.
    pub fn send_to_user(&self, user: UserId, payload: Bytes) -> Result<(), HubError> {
        let session = self.lookup(user).ok_or(HubError::NotConnected(user))?;
        match session.try_send(payload) {
            Ok(()) => Ok(()),
            Err(SendFailure::Full) => {
                counter!(names::OUTBOUND_DROPS_TOTAL).increment(1);
                warn!(user_id = %user, conn_id = %session.id(), "outbound buffer full, dropping message");
                Err(HubError::BufferFull(user))
            }
            Err(SendFailure::Closed) => Err(HubError::NotConnected(user)),
        }
    }
}

/// The hub task state.
pub struct Hub {
    register_rx: mpsc::Receiver<RegisterRequest>,
    unregister_rx: mpsc::Receiver<UnregisterRequest>,
    fanout_rx: mpsc::Receiver<FanoutRequest>,
    registry: Registry,
}

impl Hub {
    pub fn new(queue_depth: usize) -> (Self, HubHandle) {
        let depth = queue_depth.max(1);
        let (register_tx, register_rx) = mpsc::channel(depth);
        let (unregister_tx, unregister_rx) = mpsc::channel(depth);
        let (fanout_tx, fanout_rx) = mpsc::channel(depth);
        let registry: Registry = Arc::default();
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            fanout_tx,
            registry: registry.clone(),
        };
        let hub = Self {
            register_rx,
            unregister_rx,
            fanout_rx,
            registry,
        };
        (hub, handle)
    }

    /// Spawn the hub task. It runs until `token` is cancelled.
    pub fn spawn(queue_depth: usize, token: CancellationToken) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(queue_depth);
        let task = tokio::spawn(hub.run(token));
        (handle, task)
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!("connection hub started");
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                Some(req) = self.unregister_rx.recv() => {
                    let removed = self.remove(&req.session);
                    let _ = req.ack.send(removed);
                }
                Some(req) = self.register_rx.recv() => {
                    self.insert(req.session);
                    let _ = req.ack.send(());
                }
                Some(req) = self.fanout_rx.recv() => {
                    let report = self.broadcast(&req.payload);
                    let _ = req.ack.send(report);
                }
                else => break,
            }
        }
        self.close_all();
        info!("connection hub stopped");
    }

    fn insert(&self, session: Arc<Session>) {
        let user = session.user_id();
        let displaced = self.registry.write().insert(user, session.clone());
        if let Some(old) = displaced.filter(|old| !old.same_connection(&session)) {
            debug!(user_id = %user, old_conn = %old.id(), new_conn = %session.id(), "replacing session");
            let _ = old.close();
        }
        self.publish_gauge();
        debug!(user_id = %user, conn_id = %session.id(), "session registered");
    }

    fn remove(&self, session: &Arc<Session>) -> bool {
        let user = session.user_id();
        let removed = {
            let mut registry = self.registry.write();
            let current = registry.get(&user).is_some_and(|s| s.same_connection(session));
            if current {
                let _ = registry.remove(&user);
            }
            current
        };
        let _ = session.close();
        if removed {
            self.publish_gauge();
            debug!(user_id = %user, conn_id = %session.id(), "session unregistered");
        }
        removed
    }

    fn broadcast(&self, payload: &Bytes) -> FanoutReport {
        let sessions: Vec<Arc<Session>> = self.registry.read().values().cloned().collect();
        let mut report = FanoutReport::default();
        let mut evict = Vec::new();
        for session in sessions {
            match session.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    warn!(
                        user_id = %session.user_id(),
                        conn_id = %session.id(),
                        ?failure,
                        "evicting session during fan-out"
                    );
                    evict.push(session);
                }
            }
        }
        if !evict.is_empty() {
            {
                let mut registry = self.registry.write();
                for session in &evict {
                    if registry
                        .get(&session.user_id())
                        .is_some_and(|s| s.same_connection(session))
                    {
                        let _ = registry.remove(&session.user_id());
                    }
                }
            }
            for session in &evict {
                let _ = session.close();
            }
            report.evicted = evict.len();
            counter!(names::FANOUT_EVICTIONS_TOTAL).increment(report.evicted as u64);
            self.publish_gauge();
        }
        report
    }

    fn close_all(&self) {
        let drained: Vec<Arc<Session>> = self.registry.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            let _ = session.close();
        }
        self.publish_gauge();
    }

    fn publish_gauge(&self) {
        gauge!(names::SESSIONS_ACTIVE).set(self.registry.read().len() as f64);
    }
}
