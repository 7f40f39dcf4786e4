//! One live transport connection bound to a user.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use parley_core::{ConnectionId, UserId};

/// Why a payload could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    Full,
    Closed,
}

/// A connected session.
///
/// The session holds the only sender of its outbound buffer, so closing the
/// session ends the send loop once the queued frames are written.
pub struct Session {
    id: ConnectionId,
    user_id: UserId,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    closed: AtomicBool,
    connected_at: Instant,
    last_heartbeat: Mutex<Instant>,
}

impl Session {
    pub fn new(user_id: UserId, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let now = Instant::now();
        let session = Arc::new(Self {
            id: ConnectionId::new(),
            user_id,
            outbound: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            connected_at: now,
            last_heartbeat: Mutex::new(now),
        });
        (session, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Queue a payload without waiting.
    pub fn try_send(&self, payload: Bytes) -> Result<(), SendFailure> {
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(SendFailure::Closed);
        };
        tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => SendFailure::Full,
            TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Close the outbound buffer. Returns `true` for the call that closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        drop(self.outbound.lock().take());
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether `other` is this very connection rather than another one of
    /// the same user.
    pub fn same_connection(&self, other: &Session) -> bool {
        self.id == other.id
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
