use axum::extract::ws::{Message, WebSocket};
use unblink_protocol::{CodecError, Envelope};

/// Errors surfaced by an envelope transport.
///
/// `Codec` invalidates a single envelope; the caller should log and keep
/// reading. Everything else is terminal for the connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("websocket error: {0}")]
    Ws(#[from] axum::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl TransportError {
    /// True when the error spoils one envelope but not the connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Codec(_))
    }
}

/// One envelope per frame over a persistent bidirectional channel.
///
/// Reads are single-consumer and writes must be serialized by the caller;
/// the connection loop owns both ends.
pub(crate) trait Transport {
    fn read(&mut self) -> impl Future<Output = Result<Envelope, TransportError>> + Send;
    fn write(&mut self, envelope: &Envelope)
    -> impl Future<Output = Result<(), TransportError>> + Send;
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Production transport over an accepted WebSocket.
pub(crate) struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl Transport for WsTransport {
    async fn read(&mut self) -> Result<Envelope, TransportError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Binary(bytes))) => return Ok(Envelope::decode(&bytes)?),
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                // Text frames are not part of the protocol; skip alongside
                // ping/pong, which axum answers for us.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Ws(e)),
            }
        }
    }

    async fn write(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let bytes = envelope.encode()?;
        self.socket
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(TransportError::Ws)
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::mpsc;

    /// Channel-backed transport for exercising the connection state machine
    /// without a socket. `pair()` returns the two ends.
    pub(crate) struct PairTransport {
        tx: mpsc::Sender<Envelope>,
        rx: mpsc::Receiver<Envelope>,
    }

    pub(crate) fn pair() -> (PairTransport, PairTransport) {
        let (a_tx, a_rx) = mpsc::channel(64);
        let (b_tx, b_rx) = mpsc::channel(64);
        (
            PairTransport { tx: a_tx, rx: b_rx },
            PairTransport { tx: b_tx, rx: a_rx },
        )
    }

    impl Transport for PairTransport {
        async fn read(&mut self) -> Result<Envelope, TransportError> {
            self.rx.recv().await.ok_or(TransportError::Closed)
        }

        async fn write(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
            // Round-trip through the codec so tests exercise the wire shape.
            let bytes = envelope.encode()?;
            let decoded = Envelope::decode(&bytes)?;
            self.tx
                .send(decoded)
                .await
                .map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) {
            self.rx.close();
        }
    }
}
