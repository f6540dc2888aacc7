//! Dev server lifecycle
//!
//! ```text
//! STARTING -> LISTENING -> STOPPING -> STOPPED
//! ```
//!
//! [`DevServer::serve`] binds the preferred port or the next free one above it
//! and returns a [`ServerHandle`] in LISTENING. [`ServerHandle::stop`] signals
//! the accept loop, waits up to the shutdown timeout for in-flight responses and
//! aborts the server task only if that runs out. Dropping a handle aborts the task,
//! so the port is released on every exit path.

use camino::{Utf8Path, Utf8PathBuf};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::ServerConfig;
use crate::{Error, Result};

use super::http::serve_connection;

/// Lifecycle states of a dev server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Listening,
    Stopping,
    Stopped,
}

/// Serves build directories over HTTP
#[derive(Debug, Clone)]
pub struct DevServer {
    host: String,
    port_attempts: u16,
    shutdown_timeout: Duration,
}

impl DevServer {
    pub fn new(host: impl Into<String>, port_attempts: u16, shutdown_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port_attempts: port_attempts.max(1),
            shutdown_timeout,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.host.clone(),
            config.port_attempts,
            Duration::from_millis(config.shutdown_timeout_ms),
        )
    }

    /// Serve `directory` read-only, starting at `preferred_port`
    pub async fn serve(&self, directory: &Utf8Path, preferred_port: u16) -> Result<ServerHandle> {
        tracing::debug!("Dev server {:?}", ServerState::Starting);

        let root = directory.canonicalize_utf8().map_err(|e| {
            Error::server(
                format!("Cannot serve {}: {}", directory, e),
                "Build the project before serving it",
            )
        })?;
        if !root.is_dir() {
            return Err(Error::server(
                format!("Cannot serve {}: not a directory", root),
                "Pass the build output directory",
            ));
        }

        let listener = bind_with_retry(&self.host, preferred_port, self.port_attempts).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, Arc::new(root.clone()), shutdown_rx));

        tracing::info!("Serving {} on http://{}", root, addr);

        Ok(ServerHandle {
            addr,
            root,
            state: ServerState::Listening,
            shutdown: shutdown_tx,
            task: Some(task),
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// Bind `preferred`, then each following port, `attempts` ports in total
pub async fn bind_with_retry(host: &str, preferred: u16, attempts: u16) -> Result<TcpListener> {
    let last = preferred.saturating_add(attempts.saturating_sub(1));

    for port in preferred..=last {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                if port != preferred {
                    tracing::info!("Port {} is in use, using {} instead", preferred, port);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!("Port {} is in use", port);
            }
            Err(e) => {
                return Err(Error::server(
                    format!("Failed to bind {}:{}: {}", host, port, e),
                    "Check server.host in ~/.fern/config.toml",
                ));
            }
        }
    }

    Err(Error::PortExhausted {
        first: preferred,
        last,
    })
}

async fn accept_loop(
    listener: TcpListener,
    root: Arc<Utf8PathBuf>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let root = root.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(stream, root).await {
                            tracing::debug!("Connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Failed to accept connection: {}", e),
            },
            // Reap finished connections so the set does not grow
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // Release the port before finishing in-flight responses
    drop(listener);
    while connections.join_next().await.is_some() {}
}

/// A running dev server
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    root: Utf8PathBuf,
    state: ServerState,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    /// Bound port
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Directory being served
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// URL of a file below the served directory
    pub fn url(&self, path: &str) -> String {
        let host = match self.addr.ip() {
            ip if ip.is_loopback() || ip.is_unspecified() => "localhost".to_string(),
            IpAddr::V6(ip) => format!("[{}]", ip),
            IpAddr::V4(ip) => ip.to_string(),
        };
        format!("http://{}:{}/{}", host, self.port(), path.trim_start_matches('/'))
    }

    /// Stop serving. Graceful first; the task is aborted if it does not finish
    /// within the shutdown timeout. Stopping twice is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };

        self.state = ServerState::Stopping;
        tracing::debug!("Dev server on port {} {:?}", self.port(), self.state);
        // The receiver is gone only if the task already ended
        let _ = self.shutdown.send(true);

        match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
            Ok(_) => tracing::debug!("Dev server task shut down cleanly"),
            Err(_) => {
                tracing::warn!(
                    "Dev server did not stop within {:?}, aborting it",
                    self.shutdown_timeout
                );
                task.abort();
                let _ = task.await;
            }
        }

        self.state = ServerState::Stopped;
        tracing::info!("Dev server on port {} stopped", self.port());
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
