//! Public surface for attaching transports and pushing to users.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::{Sink, Stream};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use parley_core::{ConnectionId, UserId};

use crate::errors::{HubError, TransportError};
use crate::hub::{FanoutReport, HubHandle};
use crate::pump::{run_session, InboundHandler, PumpConfig};
use crate::session::Session;
use crate::transport::Frame;

/// A session whose pumps are running.
pub struct SessionHandle {
    session: Arc<Session>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn conn_id(&self) -> &ConnectionId {
        self.session.id()
    }

    pub fn user_id(&self) -> UserId {
        self.session.user_id()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until both pumps have stopped and the session is unregistered.
    pub async fn closed(self) {
        if let Err(e) = self.task.await {
            debug!(conn_id = %self.session.id(), error = %e, "session task ended abnormally");
        }
    }
}

#[derive(Clone)]
pub struct ConnectionService {
    hub: HubHandle,
    handler: Arc<dyn InboundHandler>,
    pump: PumpConfig,
    buffer: usize,
}

impl ConnectionService {
    pub fn new(hub: HubHandle, handler: Arc<dyn InboundHandler>, pump: PumpConfig, buffer: usize) -> Self {
        Self {
            hub,
            handler,
            pump,
            buffer: buffer.max(1),
        }
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Register a session for `user` over the given transport halves and
    /// start its pumps. A previous session of the same user is displaced.
    pub async fn connect<Tx, Rx>(&self, user: UserId, sink: Tx, stream: Rx) -> Result<SessionHandle, HubError>
    where
        Tx: Sink<Frame, Error = TransportError> + Send + Unpin + 'static,
        Rx: Stream<Item = Result<Frame, TransportError>> + Send + Unpin + 'static,
    {
        if !user.is_valid() {
            return Err(HubError::InvalidUser(user));
        }
        let (session, outbound) = Session::new(user, self.buffer);
        self.hub.register(session.clone()).await?;

        let greeting = json!({
            "type": "connection.established",
            "timestamp": Utc::now().to_rfc3339(),
            "data": { "connId": session.id(), "userId": user },
        });
        // fresh buffer, cannot be full
        let _ = session.try_send(Bytes::from(greeting.to_string()));
        info!(user_id = %user, conn_id = %session.id(), "client connected");

        let task = tokio::spawn(run_session(
            session.clone(),
            outbound,
            sink,
            stream,
            self.hub.clone(),
            self.handler.clone(),
            self.pump.clone(),
        ));
        Ok(SessionHandle { session, task })
    }

    pub fn send_to_user(&self, user: UserId, payload: Bytes) -> Result<(), HubError> {
        self.hub.send_to_user(user, payload)
    }

    pub async fn broadcast_all(&self, payload: Bytes) -> Result<FanoutReport, HubError> {
        self.hub.fanout(payload).await
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.hub.is_online(user)
    }

    /// Drop the user's session. Returns `false` when the user was not
    /// connected.
    pub async fn disconnect(&self, user: UserId) -> Result<bool, HubError> {
        match self.hub.lookup(user) {
            Some(session) => self.hub.unregister(session).await,
            None => Ok(false),
        }
    }
}
