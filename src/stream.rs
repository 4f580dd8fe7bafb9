//! Raw TCP variant of the gateway
//!
//! Every accepted connection resolves the webspace, dials it and relays bytes
//! both ways. Plain TCP has no way to report errors, so a connection whose
//! webspace cannot be resolved or dialed is closed without writing anything.

use crate::error::{BootError, ConfigError};
use crate::gate::{BootGate, GateOptions};
use crate::webspace::Identity;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Why a connection was closed without being relayed
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Boot(#[from] BootError),

    #[error("failed to dial webspace at {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out dialing webspace at {0}")]
    DialTimeout(String),
}

/// Bytes moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub to_webspace: u64,
    pub to_client: u64,
}

/// Gates every inbound connection on the webspace being booted
pub struct StreamRouter {
    gate: BootGate,
    dial_timeout: Duration,
}

impl StreamRouter {
    pub fn new(identity: Identity, options: GateOptions) -> Result<Self, ConfigError> {
        let gate = BootGate::new(identity, options)?;
        debug!(user_id = gate.identity().user_id, "Created webspace stream router");
        Ok(Self {
            gate,
            dial_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn gate(&self) -> &BootGate {
        &self.gate
    }

    /// Resolve, dial and relay. The inbound stream is closed on every path.
    pub async fn serve_stream<S>(&self, mut inbound: S) -> Result<RelayStats, StreamError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut outbound = match self.connect().await {
            Ok(outbound) => outbound,
            Err(e) => {
                let _ = inbound.shutdown().await;
                return Err(e);
            }
        };

        // A reset from either peer just ends the relay.
        let stats = match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
            Ok((to_webspace, to_client)) => RelayStats {
                to_webspace,
                to_client,
            },
            Err(e) => {
                debug!(user_id = self.gate.identity().user_id, error = %e, "Relay closed with error");
                RelayStats::default()
            }
        };

        Ok(stats)
    }

    async fn connect(&self) -> Result<TcpStream, StreamError> {
        let addr = self.gate.resolve().await?;

        match tokio::time::timeout(self.dial_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(source)) => Err(StreamError::Dial { addr, source }),
            Err(_) => Err(StreamError::DialTimeout(addr)),
        }
    }
}

/// TCP listener in front of a [`StreamRouter`]
pub struct TcpServer {
    bind_addr: SocketAddr,
    router: Arc<StreamRouter>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TcpServer {
    pub fn new(
        bind_addr: SocketAddr,
        router: Arc<StreamRouter>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            router,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "TCP gateway listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                let _ = stream.set_nodelay(true);
                                let user_id = router.gate().identity().user_id;
                                match router.serve_stream(stream).await {
                                    Ok(stats) => {
                                        debug!(
                                            addr = %addr,
                                            user_id,
                                            to_webspace = stats.to_webspace,
                                            to_client = stats.to_client,
                                            "TCP connection closed"
                                        );
                                    }
                                    Err(StreamError::Boot(e)) => {
                                        error!(addr = %addr, user_id, kind = e.kind(), error = %e, "Failed to ensure webspace is booted");
                                    }
                                    Err(e) => {
                                        error!(addr = %addr, user_id, error = %e, "Failed to connect to webspace");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("TCP gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}
