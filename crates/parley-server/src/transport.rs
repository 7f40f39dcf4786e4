//! Transport-neutral frames and the axum WebSocket adapter.
//!
//! The session pumps only see a `Stream` of inbound [`Frame`]s and a `Sink`
//! of outbound ones, so any bidirectional framed transport can carry a
//! session.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream, StreamExt};

use crate::errors::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl Frame {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(b) | Self::Binary(b) | Self::Ping(b) | Self::Pong(b) => b.len(),
            Self::Close => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outbound payloads go out as text when they are valid UTF-8.
pub fn outbound_frame(payload: Bytes) -> Frame {
    if std::str::from_utf8(&payload).is_ok() {
        Frame::Text(payload)
    } else {
        Frame::Binary(payload)
    }
}

fn from_message(msg: Message) -> Frame {
    match msg {
        Message::Text(t) => Frame::Text(Bytes::copy_from_slice(t.as_str().as_bytes())),
        Message::Binary(b) => Frame::Binary(b),
        Message::Ping(b) => Frame::Ping(b),
        Message::Pong(b) => Frame::Pong(b),
        Message::Close(_) => Frame::Close,
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(b) => match String::from_utf8(b.to_vec()) {
            Ok(text) => Message::Text(text.into()),
            Err(_) => Message::Binary(b),
        },
        Frame::Binary(b) => Message::Binary(b),
        Frame::Ping(b) => Message::Ping(b),
        Frame::Pong(b) => Message::Pong(b),
        Frame::Close => Message::Close(None),
    }
}

/// Split an upgraded axum socket into a frame sink and a frame stream.
pub fn split_websocket(
    socket: WebSocket,
) -> (
    impl Sink<Frame, Error = TransportError> + Send + Unpin + 'static,
    impl Stream<Item = Result<Frame, TransportError>> + Send + Unpin + 'static,
) {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| TransportError::Io(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_message(frame))));
    let stream = stream.map(|msg| {
        msg.map(from_message)
            .map_err(|e| TransportError::Io(e.to_string()))
    });
    (sink, stream)
}
