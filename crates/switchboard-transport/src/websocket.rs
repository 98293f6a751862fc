//! WebSocket connections over tokio-tungstenite.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, info};

use crate::traits::{frame_text, ConnectionReader, ConnectionWriter, Incoming, TransportError};

/// Reading half of a WebSocket.
pub struct WebSocketReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

/// Writing half of a WebSocket.
pub struct WebSocketWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

/// Split an established WebSocket into session halves.
pub fn split<S>(ws: WebSocketStream<S>) -> (WebSocketReader<S>, WebSocketWriter<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (WebSocketReader { stream }, WebSocketWriter { sink })
}

#[async_trait]
impl<S> ConnectionReader for WebSocketReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Incoming::Message(Bytes::from(text))));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(Incoming::Message(Bytes::from(data))));
                }
                Some(Ok(Message::Ping(_))) => return Ok(Some(Incoming::Ping)),
                Some(Ok(Message::Pong(_))) => return Ok(Some(Incoming::Pong)),
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Ok(Message::Frame(_))) => {
                    // Raw frame, ignore
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl<S> ConnectionWriter for WebSocketWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
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
        match self.sink.send(Message::Close(None)).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(e.to_string())),
        }
    }
}

/// A plain TCP listener that upgrades every accepted stream to a WebSocket.
pub struct WebSocketListener {
    listener: TcpListener,
}

impl WebSocketListener {
    /// Bind a listener.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "WebSocket listener bound");
        Ok(Self { listener })
    }

    /// Get the local address this listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept the next connection and complete the WebSocket handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting or the handshake fails.
    pub async fn accept(
        &self,
    ) -> Result<(WebSocketReader<TcpStream>, WebSocketWriter<TcpStream>, SocketAddr), TransportError>
    {
        let (stream, addr) = self.listener.accept().await?;
        debug!(peer = %addr, "Accepted TCP connection");

        let ws = accept_async(stream)
            .await
            .map_err(|e| TransportError::ReceiveFailed(format!("WebSocket handshake failed: {e}")))?;

        let (reader, writer) = split(ws);
        Ok((reader, writer, addr))
    }
}
