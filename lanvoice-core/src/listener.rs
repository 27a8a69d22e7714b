//! Inbound signaling listener
//!
//! Accepts TCP connections on the signaling port and hands each one out as a
//! new [`SignalingSession`].

use crate::session::SignalingSession;
use crate::signaling::SignalingError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Accepted sessions waiting for the consumer
const ACCEPT_QUEUE: usize = 16;

/// Back-off after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Listens for inbound signaling connections
pub struct SignalingListener {
    bind_addr: IpAddr,
    sessions_tx: mpsc::Sender<SignalingSession>,
    sessions_rx: parking_lot::Mutex<Option<mpsc::Receiver<SignalingSession>>>,
    shutdown: watch::Sender<bool>,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl SignalingListener {
    /// Create a listener that will bind to `bind_addr`
    #[must_use]
    pub fn new(bind_addr: IpAddr) -> Self {
        let (sessions_tx, sessions_rx) = mpsc::channel(ACCEPT_QUEUE);
        let (shutdown, _) = watch::channel(false);
        Self {
            bind_addr,
            sessions_tx,
            sessions_rx: parking_lot::Mutex::new(Some(sessions_rx)),
            shutdown,
            accept_task: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
        }
    }

    /// Bind and start accepting
    ///
    /// Port 0 picks an ephemeral port. Returns the bound port; calling this
    /// while already running returns the current port.
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound
    pub async fn start(&self, port: u16) -> Result<u16, SignalingError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr.port());
        }

        let listener = TcpListener::bind((self.bind_addr, port)).await.map_err(|e| {
            SignalingError::TransportError(format!(
                "Failed to bind signaling listener on {}:{port}: {e}",
                self.bind_addr
            ))
        })?;
        let local_addr = listener.local_addr()?;

        self.shutdown.send_replace(false);
        let mut shutdown_rx = self.shutdown.subscribe();
        let sessions_tx = self.sessions_tx.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("Shutting down signaling accept loop");
                            break;
                        }
                    }
                    result = listener.accept() => match result {
                        Ok((stream, remote)) => {
                            tracing::debug!(%remote, "Accepted signaling connection");
                            let session = SignalingSession::from_tcp(stream);
                            if sessions_tx.send(session).await.is_err() {
                                tracing::debug!("Session consumer gone, stopping accept loop");
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept signaling connection");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        });

        *self.accept_task.lock() = Some(handle);
        *self.local_addr.lock() = Some(local_addr);

        tracing::info!(%local_addr, "Signaling listener started");
        Ok(local_addr.port())
    }

    /// Address the listener is bound to, while running
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Take the receiver of accepted sessions
    ///
    /// Only the first call returns `Some`.
    pub fn accepted(&self) -> Option<mpsc::Receiver<SignalingSession>> {
        self.sessions_rx.lock().take()
    }

    /// Stop accepting and release the port
    ///
    /// Idempotent.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        if let Some(handle) = self.accept_task.lock().take() {
            handle.abort();
            tracing::info!("Signaling listener stopped");
        }
        *self.local_addr.lock() = None;
    }
}

impl Default for SignalingListener {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

impl Drop for SignalingListener {
    fn drop(&mut self) {
        if let Some(handle) = self.accept_task.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::signaling::SignalingMessage;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    fn loopback() -> SignalingListener {
        SignalingListener::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[tokio::test]
    async fn test_accepts_sessions() {
        let listener = loopback();
        let port = listener.start(0).await.unwrap();
        assert_ne!(port, 0);
        let mut accepted = listener.accepted().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let client_addr = client.local_addr().unwrap();
        client.write_all(b"{\"type\":\"bye\"}\n").await.unwrap();

        let session = tokio::time::timeout(Duration::from_secs(5), accepted.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.remote_addr(), Some(client_addr));

        let mut incoming = session.incoming().unwrap();
        assert_eq!(incoming.recv().await, Some(SignalingMessage::Bye));
    }

    #[tokio::test]
    async fn test_start_twice_returns_same_port() {
        let listener = loopback();
        let first = listener.start(0).await.unwrap();
        let second = listener.start(0).await.unwrap();
        assert_eq!(first, second);
        listener.stop();
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let listener = loopback();
        let port = listener.start(0).await.unwrap();

        listener.stop();
        listener.stop();
        assert!(listener.local_addr().is_none());

        // Give the runtime a moment to drop the aborted accept task
        tokio::time::sleep(Duration::from_millis(50)).await;
        let rebound = tokio::net::TcpListener::bind(("127.0.0.1", port)).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_accepted_taken_once() {
        let listener = loopback();
        assert!(listener.accepted().is_some());
        assert!(listener.accepted().is_none());
    }

    #[tokio::test]
    async fn test_bind_conflict_errors() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let listener = loopback();
        let result = listener.start(port).await;
        assert!(matches!(result, Err(SignalingError::TransportError(_))));
    }
}
