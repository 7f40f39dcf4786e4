//! Per-session send and receive loops.
//!
//! The receive loop reads frames under a sliding read deadline and hands
//! data frames to an [`InboundHandler`]. The send loop drains the session's
//! outbound buffer and sends keepalive pings. Whichever loop ends first tears
//! the session down: it is unregistered from the hub (which closes its
//! buffer), the send loop writes a close frame, and the transport is dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, histogram};
use parley_settings::HubSettings;
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::errors::TransportError;
use crate::hub::HubHandle;
use crate::metrics as names;
use crate::session::Session;
use crate::transport::{outbound_frame, Frame};

/// Consumer of inbound data frames. Frames of one session are handled in
/// arrival order; the next frame is not read until `handle` returns.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle(&self, session: &Arc<Session>, payload: Bytes);
}

#[derive(Clone, Debug)]
pub struct PumpConfig {
    pub ping_interval: Duration,
    pub read_deadline: Duration,
    pub write_deadline: Duration,
    pub max_frame_bytes: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self::from(&HubSettings::default())
    }
}

impl From<&HubSettings> for PumpConfig {
    fn from(s: &HubSettings) -> Self {
        Self {
            ping_interval: s.ping_interval(),
            read_deadline: s.read_deadline(),
            write_deadline: s.write_deadline(),
            max_frame_bytes: s.max_frame_bytes,
        }
    }
}

/// Drive a registered session until either side of its transport ends.
#[instrument(skip_all, fields(user_id = %session.user_id(), conn_id = %session.id()))]
pub async fn run_session<Tx, Rx>(
    session: Arc<Session>,
    outbound: mpsc::Receiver<Bytes>,
    sink: Tx,
    stream: Rx,
    hub: HubHandle,
    handler: Arc<dyn InboundHandler>,
    config: PumpConfig,
) where
    Tx: Sink<Frame, Error = TransportError> + Send + Unpin + 'static,
    Rx: Stream<Item = Result<Frame, TransportError>> + Send + Unpin + 'static,
{
    info!("session started");
    counter!(names::CONNECTIONS_TOTAL).increment(1);

    let mut sender = tokio::spawn(send_loop(sink, outbound, config.clone()));

    let reason = tokio::select! {
        res = receive_loop(stream, &session, handler.as_ref(), &config) => match res {
            Ok(()) => "peer_closed",
            Err(e) => {
                debug!(error = %e, "receive loop ended");
                receive_reason(&e)
            }
        },
        res = &mut sender => match res {
            Ok(Ok(())) => "buffer_closed",
            Ok(Err(e)) => {
                debug!(error = %e, "send loop ended");
                "write_failed"
            }
            Err(e) => {
                warn!(error = %e, "send loop task failed");
                "write_failed"
            }
        },
    };

    if let Err(e) = hub.unregister(session.clone()).await {
        debug!(error = %e, "hub unavailable during teardown");
        let _ = session.close();
    }

    // The buffer is closed now, so a live send loop flushes and writes its
    // close frame. Give it one write deadline to get there.
    if !sender.is_finished() && timeout(config.write_deadline, &mut sender).await.is_err() {
        sender.abort();
    }

    info!(reason, "session ended");
    counter!(names::DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
    histogram!(names::SESSION_DURATION_SECONDS)
        .record(session.connected_at().elapsed().as_secs_f64());
}

fn receive_reason(err: &TransportError) -> &'static str {
    match err {
        TransportError::ReadTimeout(_) => "read_timeout",
        TransportError::FrameTooLarge { .. } => "frame_too_large",
        TransportError::Closed => "peer_closed",
        TransportError::WriteTimeout(_) | TransportError::Io(_) => "read_failed",
    }
}

/// Read until the peer closes, a read fails, the deadline passes or a frame
/// is too large. `Ok` means a clean close.
async fn receive_loop<Rx>(
    mut stream: Rx,
    session: &Arc<Session>,
    handler: &dyn InboundHandler,
    config: &PumpConfig,
) -> Result<(), TransportError>
where
    Rx: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    loop {
        let frame = match timeout(config.read_deadline, stream.next()).await {
            Err(_) => return Err(TransportError::ReadTimeout(config.read_deadline)),
            Ok(None) => return Ok(()),
            Ok(Some(res)) => res?,
        };
        if frame.len() > config.max_frame_bytes {
            warn!(size = frame.len(), limit = config.max_frame_bytes, "inbound frame too large");
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                limit: config.max_frame_bytes,
            });
        }
        match frame {
            Frame::Text(payload) | Frame::Binary(payload) => {
                handler.handle(session, payload).await;
            }
            Frame::Close => return Ok(()),
            // Any frame, pongs included, has already refreshed the deadline.
            Frame::Ping(_) | Frame::Pong(_) => {}
        }
    }
}

/// Write queued payloads and keepalive pings. When the buffer closes, write
/// a close frame and finish.
async fn send_loop<Tx>(
    mut sink: Tx,
    mut outbound: mpsc::Receiver<Bytes>,
    config: PumpConfig,
) -> Result<(), TransportError>
where
    Tx: Sink<Frame, Error = TransportError> + Unpin,
{
    let mut ping = tokio::time::interval(config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(payload) => write(&mut sink, outbound_frame(payload), config.write_deadline).await?,
                None => {
                    let _ = write(&mut sink, Frame::Close, config.write_deadline).await;
                    return Ok(());
                }
            },
            _ = ping.tick() => write(&mut sink, Frame::Ping(Bytes::new()), config.write_deadline).await?,
        }
    }
}

async fn write<Tx>(sink: &mut Tx, frame: Frame, deadline: Duration) -> Result<(), TransportError>
where
    Tx: Sink<Frame, Error = TransportError> + Unpin,
{
    match timeout(deadline, sink.send(frame)).await {
        Ok(res) => res,
        Err(_) => Err(TransportError::WriteTimeout(deadline)),
    }
}
