//! Listener and accept loop
//!
//! The dispatcher owns the listening socket and the connection registry. Every
//! accepted socket gets a fresh [`ConnectionId`] and its own worker task; the
//! registry is handed to each worker as a shared handle. Shutdown is a single
//! cancellation token whose children are given to the workers, so cancelling
//! it unblocks every pending read at once.

use crate::config::RelayConfig;
use crate::connection::Connection;
use crate::error::{RelayError, Result};
use crate::registry::{ConnectionId, ConnectionRegistry};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

pub const LISTEN_BACKLOG: u32 = 100;

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long shutdown waits for workers before aborting them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Stops a running dispatcher from outside its task
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    cancel: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct Dispatcher {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    config: Arc<RelayConfig>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Binds the listening socket
    ///
    /// A failure here is fatal for the relay and is reported as
    /// [`RelayError::Bind`]; it is never retried.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let addr = config.bind_address();
        let bind_error = |source: std::io::Error| RelayError::Bind {
            addr: addr.clone(),
            source,
        };

        let socket_addr = lookup_host(addr.as_str())
            .await
            .map_err(bind_error)?
            .next()
            .ok_or_else(|| {
                bind_error(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "address did not resolve",
                ))
            })?;

        let socket = if socket_addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_error)?;
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(socket_addr).map_err(bind_error)?;
        let listener = socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;

        info!("Relay listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            registry: Arc::new(ConnectionRegistry::new()),
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        })
    }

    /// Binds and runs until shut down
    pub async fn start(config: RelayConfig) -> Result<()> {
        Self::bind(config).await?.run().await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            cancel: self.cancel.clone(),
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Accepts connections until shut down, then waits for the workers
    pub async fn run(self) -> Result<()> {
        let mut workers = JoinSet::new();
        let mut next_id: u64 = 1;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = ConnectionId::new(next_id);
                        next_id += 1;

                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("{} could not disable Nagle: {}", id, e);
                        }
                        info!("{} accepted from {}", id, peer);

                        workers.spawn(Connection::serve(
                            stream,
                            id,
                            peer,
                            Arc::clone(&self.registry),
                            Arc::clone(&self.config),
                            self.cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        sleep(ACCEPT_BACKOFF).await;
                    }
                },

                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Connection worker panicked: {}", e);
                        }
                    }
                }
            }
        }

        drop(self.listener);
        info!(
            "Relay shutting down, waiting for {} connection(s)",
            workers.len()
        );

        let drained = timeout(SHUTDOWN_GRACE, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Connections did not close in time, aborting them");
            workers.abort_all();
        }

        info!("Relay stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> RelayConfig {
        RelayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..RelayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let dispatcher = Dispatcher::bind(loopback()).await.unwrap();
        let addr = dispatcher.local_addr().unwrap();

        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert!(dispatcher.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let result = Dispatcher::bind(RelayConfig {
            port,
            ..loopback()
        })
        .await;

        assert!(matches!(result, Err(RelayError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let dispatcher = Dispatcher::bind(loopback()).await.unwrap();
        let handle = dispatcher.shutdown_handle();
        let task = tokio::spawn(dispatcher.run());

        handle.shutdown();
        assert!(handle.is_shutdown());

        let result = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
