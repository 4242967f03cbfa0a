use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::target::Target;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Dial in progress.
    Pending,
    /// Both sockets open, forwarding in both directions.
    Active,
    /// One direction has finished.
    Closing,
    Closed,
    /// Dial failed; nothing was relayed.
    Failed,
}

impl SessionState {
    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Failed)
                | (Active, Closing)
                | (Active, Closed)
                | (Closing, Closed)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: Uuid,
    pub bytes_to_target: u64,
    pub bytes_to_client: u64,
}

/// One pairing of a client WebSocket with a TCP connection to `target`.
pub struct Session {
    id: Uuid,
    target: Target,
    state: watch::Sender<SessionState>,
}

impl Session {
    pub fn new(target: Target) -> Self {
        let (state, _) = watch::channel(SessionState::Pending);
        Self {
            id: Uuid::new_v4(),
            target,
            state,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn advance(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|state| {
            if state.can_advance_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(session = %self.id, target = %self.target, state = ?next, "session state changed");
        }
    }

    /// Dials the target and relays bytes until both directions have ended.
    ///
    /// If the dial fails the WebSocket is closed without relaying anything.
    pub async fn run<S>(self, mut ws: WebSocketStream<S>) -> Result<SessionSummary, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let tcp = match TcpStream::connect((self.target.host(), self.target.port())).await {
            Ok(tcp) => tcp,
            Err(source) => {
                self.advance(SessionState::Failed);
                let _ = ws.close(None).await;
                return Err(RelayError::Dial {
                    target: self.target.to_string(),
                    source,
                });
            }
        };
        self.advance(SessionState::Active);
        info!(session = %self.id, target = %self.target, "relay session started");

        let (tcp_read, tcp_write) = tcp.into_split();
        let (ws_sink, ws_stream) = ws.split();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = oneshot::channel();

        let (inbound, to_target, to_client) = tokio::join!(
            async {
                let res = read_client_frames(ws_stream, frames_tx).await;
                self.advance(SessionState::Closing);
                res
            },
            async {
                let res = write_frames_to_tcp(tcp_write, frames_rx, closed_tx).await;
                self.advance(SessionState::Closing);
                res
            },
            async {
                let res = forward_tcp_to_client(tcp_read, ws_sink, closed_rx).await;
                self.advance(SessionState::Closing);
                res
            },
        );
        self.advance(SessionState::Closed);

        inbound?;
        let summary = SessionSummary {
            id: self.id,
            bytes_to_target: to_target?,
            bytes_to_client: to_client?,
        };
        debug!(
            session = %self.id,
            target = %self.target,
            bytes_to_target = summary.bytes_to_target,
            bytes_to_client = summary.bytes_to_client,
            "relay session closed"
        );
        Ok(summary)
    }
}

/// Convenience wrapper for callers that do not need to observe the session.
pub async fn run<S>(ws: WebSocketStream<S>, target: Target) -> Result<SessionSummary, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Session::new(target).run(ws).await
}

/// Queues each client message for the TCP writer without waiting for the
/// write to finish. Dropping `frames` tells the writer the client is gone.
async fn read_client_frames<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    frames: mpsc::UnboundedSender<Vec<u8>>,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = stream.next().await {
        let payload = match message? {
            Message::Binary(data) => data,
            Message::Text(text) => text.into_bytes(),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };
        if frames.send(payload).is_err() {
            break;
        }
    }
    Ok(())
}

/// Sole writer to the TCP connection. Once the queue is closed the write side
/// is shut down, then the read loop is told to release the connection.
async fn write_frames_to_tcp(
    mut tcp_write: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: oneshot::Sender<()>,
) -> Result<u64, RelayError> {
    let mut written = 0u64;
    let result = async {
        while let Some(frame) = frames.recv().await {
            tcp_write.write_all(&frame).await?;
            written += frame.len() as u64;
        }
        tcp_write.shutdown().await
    }
    .await;

    drop(frames);
    drop(tcp_write);
    let _ = closed.send(());

    match result {
        Ok(()) => Ok(written),
        Err(err) => {
            warn!(error = %err, "failed writing to tcp target");
            Err(RelayError::TcpWrite(err))
        }
    }
}

/// Sends each chunk read from TCP as one binary message. Ends on EOF, on any
/// error, or when the client side has closed the connection, and closes the
/// WebSocket exactly once on the way out.
async fn forward_tcp_to_client<S>(
    mut tcp_read: OwnedReadHalf,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut closed: oneshot::Receiver<()>,
) -> Result<u64, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut forwarded = 0u64;
    let result = loop {
        let n = tokio::select! {
            read = tcp_read.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(err) => break Err(RelayError::TcpRead(err)),
            },
            _ = &mut closed => break Ok(()),
        };
        match sink.send(Message::Binary(buf[..n].to_vec())).await {
            Ok(()) => {}
            // The client closed first; its close handshake is already under way.
            Err(
                WsError::ConnectionClosed
                | WsError::AlreadyClosed
                | WsError::Protocol(ProtocolError::SendAfterClosing),
            ) => break Ok(()),
            Err(err) => break Err(RelayError::WebSocket(err)),
        }
        forwarded += n as u64;
    };

    drop(tcp_read);
    let _ = sink.close().await;

    result.map(|()| forwarded)
}
