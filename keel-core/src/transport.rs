//! Node stream transport
//!
//! The long-lived stream between a node and the dispatch server is modelled by
//! [`NodeStream`]. Two implementations exist: [`JsonLinesStream`], carrying one
//! JSON document per line over any byte stream (TCP in production), and
//! [`ChannelStream`], an in-process pair used by tests.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::dto::stream::{StreamRequest, StreamResponse};

/// Longest accepted frame, in bytes
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(String),

    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("stream closed")]
    Closed,
}

impl From<LinesCodecError> for TransportError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::Io(e) => TransportError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => {
                TransportError::Frame(format!("frame exceeds {MAX_FRAME_LEN} bytes"))
            }
        }
    }
}

/// A message that can travel over a node stream
pub trait Frame: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Frame for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// One end of a bidirectional, ordered message stream
#[async_trait]
pub trait NodeStream<In: Frame, Out: Frame>: Send {
    /// Next inbound frame, `None` once the peer has closed the stream.
    ///
    /// Must be cancel-safe: dropping the future before completion loses no
    /// frame.
    async fn recv(&mut self) -> Result<Option<In>, TransportError>;

    async fn send(&mut self, frame: Out) -> Result<(), TransportError>;
}

/// The dispatch server's end of a node stream
pub type ServerStream = Box<dyn NodeStream<StreamRequest, StreamResponse>>;

/// The agent's end of a node stream
pub type AgentStream = Box<dyn NodeStream<StreamResponse, StreamRequest>>;

/// Newline-delimited JSON over a byte stream
pub struct JsonLinesStream<T, In, Out> {
    framed: Framed<T, LinesCodec>,
    _frames: PhantomData<fn() -> (In, Out)>,
}

impl<T, In, Out> JsonLinesStream<T, In, Out>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T) -> Self {
        Self {
            framed: Framed::new(io, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
            _frames: PhantomData,
        }
    }
}

#[async_trait]
impl<T, In, Out> NodeStream<In, Out> for JsonLinesStream<T, In, Out>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    In: Frame,
    Out: Frame,
{
    async fn recv(&mut self) -> Result<Option<In>, TransportError> {
        loop {
            match self.framed.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => return Ok(Some(serde_json::from_str(&line)?)),
            }
        }
    }

    async fn send(&mut self, frame: Out) -> Result<(), TransportError> {
        let line = serde_json::to_string(&frame)?;
        self.framed.send(line).await?;
        Ok(())
    }
}

/// Opens the agent's end of a node stream over TCP
pub async fn connect(addr: impl ToSocketAddrs) -> Result<AgentStream, TransportError> {
    let socket = TcpStream::connect(addr).await?;
    socket.set_nodelay(true)?;
    Ok(Box::new(JsonLinesStream::new(socket)))
}

/// Wraps an accepted TCP connection as the server's end of a node stream
pub fn accept(socket: TcpStream) -> ServerStream {
    Box::new(JsonLinesStream::new(socket))
}

/// In-process stream end backed by bounded channels
pub struct ChannelStream<In, Out> {
    rx: mpsc::Receiver<In>,
    tx: mpsc::Sender<Out>,
}

impl<A: Frame, B: Frame> ChannelStream<A, B> {
    /// Two connected ends; what one sends the other receives
    pub fn pair(capacity: usize) -> (ChannelStream<A, B>, ChannelStream<B, A>) {
        let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
        (
            ChannelStream { rx: a_rx, tx: b_tx },
            ChannelStream { rx: b_rx, tx: a_tx },
        )
    }
}

#[async_trait]
impl<In: Frame, Out: Frame> NodeStream<In, Out> for ChannelStream<In, Out> {
    async fn recv(&mut self) -> Result<Option<In>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn send(&mut self, frame: Out) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::stream::CancelCommand;

    #[tokio::test]
    async fn test_json_lines_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut agent: JsonLinesStream<_, StreamResponse, StreamRequest> =
            JsonLinesStream::new(client_io);
        let mut server: JsonLinesStream<_, StreamRequest, StreamResponse> =
            JsonLinesStream::new(server_io);

        agent
            .send(StreamRequest::heartbeat("node-1", vec!["exec-1".into()]))
            .await
            .unwrap();
        let frame = server.recv().await.unwrap().unwrap();
        assert_eq!(frame.node_id(), "node-1");

        let cancel = StreamResponse::Cancel(CancelCommand {
            execution_id: Some("exec-1".into()),
            reason: "operator".into(),
        });
        server.send(cancel.clone()).await.unwrap();
        assert_eq!(agent.recv().await.unwrap(), Some(cancel));

        drop(server);
        assert_eq!(agent.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_an_error() {
        use tokio::io::AsyncWriteExt;

        let (mut raw, server_io) = tokio::io::duplex(1024);
        let mut server: JsonLinesStream<_, StreamRequest, StreamResponse> =
            JsonLinesStream::new(server_io);

        raw.write_all(b"\n{not json}\n").await.unwrap();
        assert!(matches!(server.recv().await, Err(TransportError::Decode(_))));
    }

    #[tokio::test]
    async fn test_channel_pair() {
        let (mut server, mut agent) = ChannelStream::<StreamRequest, StreamResponse>::pair(4);

        agent.send(StreamRequest::heartbeat("node-1", vec![])).await.unwrap();
        assert!(server.recv().await.unwrap().is_some());

        drop(agent);
        assert!(matches!(
            server.send(StreamResponse::heartbeat_ack()).await,
            Err(TransportError::Closed)
        ));
        assert_eq!(server.recv().await.unwrap(), None);
    }
}
