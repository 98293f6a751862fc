//! Session halves for WebSockets upgraded through axum.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use crate::traits::{frame_text, ConnectionReader, ConnectionWriter, Incoming, TransportError};

/// Reading half of an upgraded axum WebSocket.
pub struct UpgradedReader {
    stream: SplitStream<WebSocket>,
}

/// Writing half of an upgraded axum WebSocket.
pub struct UpgradedWriter {
    sink: SplitSink<WebSocket, Message>,
}

/// Split an upgraded socket into session halves.
#[must_use]
pub fn split_upgraded(socket: WebSocket) -> (UpgradedReader, UpgradedWriter) {
    let (sink, stream) = socket.split();
    (UpgradedReader { stream }, UpgradedWriter { sink })
}

#[async_trait]
impl ConnectionReader for UpgradedReader {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(Incoming::Message(Bytes::from(text)))),
            Some(Ok(Message::Binary(data))) => Ok(Some(Incoming::Message(Bytes::from(data)))),
            Some(Ok(Message::Ping(_))) => Ok(Some(Incoming::Ping)),
            Some(Ok(Message::Pong(_))) => Ok(Some(Incoming::Pong)),
            Some(Ok(Message::Close(_))) | None => {
                debug!("Upgraded socket closed by peer");
                Ok(None)
            }
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
        }
    }
}

#[async_trait]
impl ConnectionWriter for UpgradedWriter {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let message = match frame_text(frame) {
            Ok(text) => Message::Text(text),
            Err(data) => Message::Binary(data),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}
