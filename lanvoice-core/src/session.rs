//! Signaling session over a duplex byte stream
//!
//! A session owns one connection to one peer. A background task reads
//! newline-delimited messages and publishes them into a bounded buffer; when
//! the consumer falls behind the oldest buffered message is dropped. Sending
//! is serialized through a single writer lock so each line hits the wire
//! whole.

use crate::signaling::{decode, encode, SignalingError, SignalingMessage, LINE_TERMINATOR};
use crate::types::SessionId;
use futures::Stream;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Number of decoded messages buffered for a slow consumer
pub const INCOMING_CAPACITY: usize = 64;

/// Lines longer than this are discarded whole
pub const MAX_LINE_LENGTH: usize = 256 * 1024;

/// Upper bound on a single send (write + flush)
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the graceful shutdown of the write half in `close`
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One signaling connection to one peer
pub struct SignalingSession {
    id: SessionId,
    remote_addr: Option<SocketAddr>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    incoming: parking_lot::Mutex<Option<broadcast::Receiver<SignalingMessage>>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SignalingSession {
    /// Wrap an established stream and start decoding it
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream<S>(stream: S, remote_addr: Option<SocketAddr>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = SessionId::new();
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = broadcast::channel(INCOMING_CAPACITY);

        let reader = tokio::spawn(read_loop(id, BufReader::new(read_half), tx));

        tracing::debug!(session_id = %id, remote = ?remote_addr, "Signaling session opened");

        Self {
            id,
            remote_addr,
            writer: tokio::sync::Mutex::new(Some(Box::new(write_half))),
            incoming: parking_lot::Mutex::new(Some(rx)),
            reader: parking_lot::Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        }
    }

    /// Wrap an accepted or connected TCP stream
    pub fn from_tcp(stream: TcpStream) -> Self {
        let remote_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY on signaling stream");
        }
        Self::from_stream(stream, remote_addr)
    }

    /// Open an outbound session to a peer's signaling endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be established within `timeout`
    #[tracing::instrument(skip_all, fields(addr = %addr))]
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, SignalingError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SignalingError::ConnectError(format!("Timed out connecting to {addr}")))?
            .map_err(|e| SignalingError::ConnectError(format!("Failed to connect to {addr}: {e}")))?;

        tracing::debug!("Signaling connection established");
        Ok(Self::from_tcp(stream))
    }

    /// Session identifier
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote socket address, when the stream has one
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Check if `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Check if the decode task is still reading
    #[must_use]
    pub fn is_receiving(&self) -> bool {
        self.reader
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Take the incoming message sequence
    ///
    /// There is exactly one consumer per session; later calls return `None`.
    pub fn incoming(&self) -> Option<IncomingMessages> {
        self.incoming.lock().take().map(|rx| IncomingMessages {
            session_id: self.id,
            rx,
        })
    }

    /// Send one message as a single line
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` after `close`, or `TransportError` if the write
    /// fails. Either way the session should be treated as dead.
    #[tracing::instrument(skip(self, message), fields(session_id = %self.id, message_type = message.kind()))]
    pub async fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::SessionClosed);
        }

        let mut frame = encode(message)?.into_bytes();
        frame.push(LINE_TERMINATOR);

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(SignalingError::SessionClosed)?;

        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        tokio::time::timeout(SEND_TIMEOUT, write)
            .await
            .map_err(|_| SignalingError::TransportError("Send timed out".to_string()))??;

        tracing::trace!(len = frame.len(), "Sent signaling message");
        Ok(())
    }

    /// Release the stream and stop the decode task
    ///
    /// Idempotent; never fails.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(session_id = %self.id, error = %e, "Error shutting down signaling stream"),
                Err(_) => tracing::debug!(session_id = %self.id, "Timed out shutting down signaling stream"),
            }
        }

        tracing::debug!(session_id = %self.id, "Signaling session closed");
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for SignalingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingSession")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Decoded messages of one session, in arrival order
///
/// Ends once the stream reaches EOF, fails, or the session is closed.
pub struct IncomingMessages {
    session_id: SessionId,
    rx: broadcast::Receiver<SignalingMessage>,
}

impl IncomingMessages {
    /// Session these messages belong to
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Receive the next message, or `None` once the session has ended
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    tracing::warn!(session_id = %self.session_id, dropped, "Signaling consumer lagging, dropped oldest messages");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a `Stream` of messages
    pub fn into_stream(self) -> impl Stream<Item = SignalingMessage> + Send + 'static {
        let session_id = self.session_id;
        BroadcastStream::new(self.rx).filter_map(move |item| match item {
            Ok(message) => Some(message),
            Err(BroadcastStreamRecvError::Lagged(dropped)) => {
                tracing::warn!(session_id = %session_id, dropped, "Signaling consumer lagging, dropped oldest messages");
                None
            }
        })
    }
}

enum LineRead {
    Line,
    TooLong,
    Eof,
}

async fn read_loop<R>(session_id: SessionId, mut reader: R, tx: broadcast::Sender<SignalingMessage>)
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(4096);
    loop {
        line.clear();
        match read_bounded_line(&mut reader, &mut line, MAX_LINE_LENGTH).await {
            Ok(LineRead::Line) => {
                if let Some(message) = decode(&line) {
                    tracing::trace!(session_id = %session_id, message_type = message.kind(), "Received signaling message");
                    // No receiver means nobody is listening any more; keep
                    // draining so the peer never blocks on a full socket.
                    let _ = tx.send(message);
                }
            }
            Ok(LineRead::TooLong) => {
                tracing::warn!(session_id = %session_id, max = MAX_LINE_LENGTH, "Discarded oversized signaling line");
            }
            Ok(LineRead::Eof) => {
                tracing::debug!(session_id = %session_id, "Signaling stream ended");
                break;
            }
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Signaling stream read failed");
                break;
            }
        }
    }
}

/// Read up to and including the next `\n`, keeping at most `max` bytes
///
/// An oversized line is consumed up to its terminator and reported as
/// `TooLong` with `buf` left empty. A final unterminated line is returned
/// before `Eof`.
async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut overflowed = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if overflowed {
                LineRead::TooLong
            } else if buf.is_empty() {
                LineRead::Eof
            } else {
                LineRead::Line
            });
        }

        let (take, complete) = match available.iter().position(|&b| b == LINE_TERMINATOR) {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };

        if !overflowed {
            if buf.len() + take > max {
                overflowed = true;
                buf.clear();
            } else {
                buf.extend_from_slice(&available[..take]);
            }
        }
        reader.consume(take);

        if complete {
            return Ok(if overflowed {
                LineRead::TooLong
            } else {
                LineRead::Line
            });
        }
    }
}
