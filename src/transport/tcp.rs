//! TCP server and client.
//!
//! Every accepted or opened stream becomes a [`Connection`] running over a
//! `Framed` stream with the [`FrameCodec`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConnectionConfig, NetworkConfig, ServerConfig};
use crate::connection::engine::{self, Setup};
use crate::connection::{relock, CloseReason, Connection, ConnectionRole, TransportKind};
use crate::core::codec::FrameCodec;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::assembly::AssemblyCatalog;
use crate::transport::Wire;
use crate::utils::timeout::{self, with_timeout_error};

fn tcp_wire(stream: TcpStream, max_frame_size: usize) -> Result<Wire> {
    stream.set_nodelay(true)?;
    let peer_addr = stream.peer_addr()?;
    let local_addr = stream.local_addr()?;
    let (writer, reader) = Framed::new(stream, FrameCodec::new(max_frame_size)).split();

    Ok(Wire {
        reader: Box::pin(reader),
        writer: Box::pin(writer),
        peer_addr,
        local_addr,
    })
}

fn start(stream: TcpStream, role: ConnectionRole, config: ConnectionConfig, catalog: AssemblyCatalog) -> Result<Connection> {
    let wire = tcp_wire(stream, config.max_frame_size)?;
    Ok(engine::launch(
        wire,
        Setup::new(TransportKind::Tcp, role, config, catalog),
    ))
}

/// Connect to a server using the default connect timeout
pub async fn connect<A>(addr: A, config: ConnectionConfig, catalog: AssemblyCatalog) -> Result<Connection>
where
    A: ToSocketAddrs + std::fmt::Debug,
{
    connect_with_timeout(addr, timeout::CONNECT_TIMEOUT, config, catalog).await
}

/// Connect to a server, giving up after `limit`
#[instrument(skip(config, catalog))]
pub async fn connect_with_timeout<A>(
    addr: A,
    limit: Duration,
    config: ConnectionConfig,
    catalog: AssemblyCatalog,
) -> Result<Connection>
where
    A: ToSocketAddrs + std::fmt::Debug,
{
    let stream = with_timeout_error(
        async { TcpStream::connect(addr).await.map_err(ProtocolError::from) },
        limit,
    )
    .await
    .map_err(|e| match e {
        ProtocolError::Timeout => {
            ProtocolError::TransportError(constants::ERR_CONNECT_TIMEOUT.to_string())
        }
        other => other,
    })?;

    start(stream, ConnectionRole::Client, config, catalog)
}

/// Connect using the client section of a [`NetworkConfig`]
pub async fn connect_with_config(config: &NetworkConfig, catalog: AssemblyCatalog) -> Result<Connection> {
    connect_with_timeout(
        config.client.address.as_str(),
        config.client.connection_timeout,
        config.connection.clone(),
        catalog,
    )
    .await
}

/// TCP listener producing server-side connections
pub struct TcpServer {
    listener: TcpListener,
    config: ServerConfig,
    connection: ConnectionConfig,
    catalog: AssemblyCatalog,
    live: Arc<Mutex<Vec<Connection>>>,
}

impl TcpServer {
    /// Bind to `config.server.address`
    #[instrument(skip(config, catalog), fields(address = %config.server.address))]
    pub async fn bind(config: &NetworkConfig, catalog: AssemblyCatalog) -> Result<Self> {
        let listener = TcpListener::bind(config.server.address.as_str()).await?;
        info!(address = %listener.local_addr()?, "Listening");
        Ok(Self {
            listener,
            config: config.server.clone(),
            connection: config.connection.clone(),
            catalog,
            live: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Connections accepted by this server that are still open
    pub fn connections(&self) -> Vec<Connection> {
        let mut live = relock(&self.live);
        live.retain(Connection::is_alive);
        live.clone()
    }

    /// Accept the next connection.
    ///
    /// Sockets beyond `max_connections` are dropped and the call keeps
    /// waiting for the next one.
    pub async fn accept(&self) -> Result<Connection> {
        loop {
            let (stream, peer) = self.listener.accept().await?;

            if self.connections().len() >= self.config.max_connections {
                warn!(
                    %peer,
                    max = self.config.max_connections,
                    "Connection limit reached, rejecting"
                );
                drop(stream);
                continue;
            }

            let connection = start(
                stream,
                ConnectionRole::Server,
                self.connection.clone(),
                self.catalog.clone(),
            )?;
            relock(&self.live).push(connection.clone());
            return Ok(connection);
        }
    }

    /// Accept connections until `shutdown_rx` fires, passing each one to
    /// `on_connection`.
    ///
    /// On shutdown every live connection is closed with
    /// [`CloseReason::ServerClosed`], bounded by the server's
    /// `shutdown_timeout`.
    pub async fn run<F>(&self, on_connection: F, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()>
    where
        F: Fn(Connection) + Send + Sync + 'static,
    {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutting down server. Closing connections...");
                    self.shutdown().await;
                    return Ok(());
                }

                accepted = self.accept() => {
                    match accepted {
                        Ok(connection) => {
                            debug!(peer = %connection.peer_addr(), "Accepted connection");
                            on_connection(connection);
                        }
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                        }
                    }
                }
            }
        }
    }

    /// Close every live connection with [`CloseReason::ServerClosed`]
    pub async fn shutdown(&self) {
        let connections = self.connections();
        let closing = futures::future::join_all(
            connections
                .iter()
                .map(|connection| connection.close(CloseReason::ServerClosed)),
        );

        if tokio::time::timeout(self.config.shutdown_timeout, closing)
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached, forcing exit");
            for connection in &connections {
                connection.inner.terminate(CloseReason::ServerClosed);
            }
        }
        info!(closed = connections.len(), "All connections closed");
    }
}

/// Start a server on `config.server.address` that stops on CTRL+C
pub async fn serve<F>(config: &NetworkConfig, catalog: AssemblyCatalog, on_connection: F) -> Result<()>
where
    F: Fn(Connection) + Send + Sync + 'static,
{
    let server = TcpServer::bind(config, catalog).await?;
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL+C signal, shutting down");
            let _ = shutdown_tx.send(()).await;
        }
    });

    server.run(on_connection, shutdown_rx).await
}
