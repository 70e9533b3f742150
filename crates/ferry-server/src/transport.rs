//! Frame model and the transport adapters unifying both WebSocket stacks.
//!
//! Directly-accepted connections speak axum's [`WebSocket`]; handed-off
//! connections speak a raw [`WebSocketStream`] over the adopted TCP socket
//! (the front-end already performed the HTTP upgrade before handing the
//! descriptor over). Both split into one reader half and one writer half so
//! a session's two loops never share a sink.

use axum::extract::ws::{Message as DirectMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as HandoffMessage;
use tokio_tungstenite::WebSocketStream;

use crate::errors::TransportError;

/// One inbound unit of the framed protocol. Ephemeral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text payload, opaque to the backend.
    Text(String),
    /// Binary payload; no defined behavior.
    Binary(Vec<u8>),
    /// Ping with its application data.
    Ping(Vec<u8>),
    /// Pong with its application data.
    Pong(Vec<u8>),
    /// Peer-initiated close.
    Close,
}

/// A whole transport, before splitting.
pub enum Transport {
    /// Directly-accepted connection (axum upgrade on `/ws`).
    Direct(WebSocket),
    /// Handed-off connection adopted from a received descriptor.
    Handoff(WebSocketStream<TcpStream>),
}

impl Transport {
    /// Split into the reader half (owned by the inbound loop) and the
    /// writer half (serialized through the connection's writer slot).
    pub fn split(self) -> (TransportReader, TransportWriter) {
        match self {
            Self::Direct(ws) => {
                let (tx, rx) = ws.split();
                (TransportReader::Direct(rx), TransportWriter::Direct(tx))
            }
            Self::Handoff(ws) => {
                let (tx, rx) = ws.split();
                (TransportReader::Handoff(rx), TransportWriter::Handoff(tx))
            }
        }
    }
}

/// Read half of a split transport.
pub enum TransportReader {
    /// Stream half of an axum socket.
    Direct(SplitStream<WebSocket>),
    /// Stream half of a handed-off socket.
    Handoff(SplitStream<WebSocketStream<TcpStream>>),
}

impl TransportReader {
    /// Next inbound frame. `None` means the stream ended.
    pub async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let frame = match self {
                Self::Direct(rx) => match rx.next().await? {
                    Ok(msg) => frame_from_direct(msg),
                    Err(e) => return Some(Err(e.into())),
                },
                Self::Handoff(rx) => match rx.next().await? {
                    Ok(msg) => match frame_from_handoff(msg) {
                        Some(frame) => frame,
                        None => continue,
                    },
                    Err(e) => return Some(Err(e.into())),
                },
            };
            return Some(Ok(frame));
        }
    }
}

/// Write half of a split transport. All application writes for one
/// connection flow through this, behind the connection's writer slot.
pub enum TransportWriter {
    /// Sink half of an axum socket.
    Direct(SplitSink<WebSocket, DirectMessage>),
    /// Sink half of a handed-off socket.
    Handoff(SplitSink<WebSocketStream<TcpStream>, HandoffMessage>),
}

impl TransportWriter {
    /// Send one text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        match self {
            Self::Direct(tx) => tx
                .send(DirectMessage::Text(text.into()))
                .await
                .map_err(TransportError::Direct),
            Self::Handoff(tx) => tx
                .send(HandoffMessage::Text(text.into()))
                .await
                .map_err(TransportError::Handoff),
        }
    }

    /// Flush and close the underlying socket. The codec performs its own
    /// close handshake on the way out.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Direct(tx) => tx.close().await.map_err(TransportError::Direct),
            Self::Handoff(tx) => tx.close().await.map_err(TransportError::Handoff),
        }
    }
}

fn frame_from_direct(msg: DirectMessage) -> Frame {
    match msg {
        DirectMessage::Text(t) => Frame::Text(t.as_str().to_owned()),
        DirectMessage::Binary(b) => Frame::Binary(b.to_vec()),
        DirectMessage::Ping(p) => Frame::Ping(p.to_vec()),
        DirectMessage::Pong(p) => Frame::Pong(p.to_vec()),
        DirectMessage::Close(_) => Frame::Close,
    }
}

/// `None` for raw protocol frames the codec surfaces but sessions never
/// dispatch on.
fn frame_from_handoff(msg: HandoffMessage) -> Option<Frame> {
    match msg {
        HandoffMessage::Text(t) => Some(Frame::Text(t.as_str().to_owned())),
        HandoffMessage::Binary(b) => Some(Frame::Binary(b.to_vec())),
        HandoffMessage::Ping(p) => Some(Frame::Ping(p.to_vec())),
        HandoffMessage::Pong(p) => Some(Frame::Pong(p.to_vec())),
        HandoffMessage::Close(_) => Some(Frame::Close),
        HandoffMessage::Frame(_) => None,
    }
}
