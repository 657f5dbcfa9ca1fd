//! UDP child connections of a TCP connection.
//!
//! Establishment takes three steps over the TCP connection:
//!
//! 1. client binds a UDP socket and sends `EstablishUdpRequest { udp_port }`
//! 2. server binds its own socket, starts the child and answers with
//!    `EstablishUdpResponse { udp_port }`
//! 3. client starts its child and sends `EstablishUdpResponseAck`
//!
//! Neither side sends datagrams before both sockets are bound. The server
//! reports the child to its `on_udp_connection` callbacks only after the ack.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use crate::connection::engine::{self, Setup};
use crate::connection::{
    relock, CloseReason, Connection, ConnectionInner, ConnectionRole, TransportKind,
};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::builtin::{EstablishUdpRequest, EstablishUdpResponse, EstablishUdpResponseAck};
use crate::protocol::packet::PacketHeader;
use crate::transport;

type UdpCallback = Arc<dyn Fn(Connection) + Send + Sync>;

#[derive(Default)]
struct Links {
    children: Vec<Connection>,
    /// Client side: our offer, waiting for the server's port
    offer: Option<oneshot::Sender<u16>>,
    /// Client side: offers given up on whose answers are still to come.
    /// Answers arrive in offer order, so these are always the next ones.
    abandoned: usize,
    /// Server side: children started for an offer, waiting for the ack
    awaiting_ack: VecDeque<Connection>,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct UdpLinks {
    links: Mutex<Links>,
    callbacks: Mutex<Vec<UdpCallback>>,
}

impl UdpLinks {
    fn active(&self) -> usize {
        let links = relock(&self.links);
        links.children.iter().filter(|c| c.is_alive()).count() + links.awaiting_ack.len()
    }

    fn add_child(&self, child: Connection) -> bool {
        let mut links = relock(&self.links);
        if links.closed {
            return false;
        }
        links.children.retain(Connection::is_alive);
        links.children.push(child);
        true
    }

    fn children(&self) -> Vec<Connection> {
        relock(&self.links)
            .children
            .iter()
            .filter(|c| c.is_alive())
            .cloned()
            .collect()
    }

    /// Forget all links and return the children that must close with the parent
    pub(crate) fn shutdown(&self) -> Vec<Connection> {
        let mut links = relock(&self.links);
        links.closed = true;
        links.offer = None;
        links.abandoned = 0;
        let mut all: Vec<Connection> = links.children.drain(..).collect();
        all.extend(links.awaiting_ack.drain(..));
        all
    }
}

fn udp_setup(parent: &ConnectionInner, role: ConnectionRole) -> Setup {
    Setup {
        transport: TransportKind::Udp,
        role,
        config: parent.config.clone(),
        catalog: parent.catalog.clone(),
        converters: engine::Converters {
            packet: parent.converter.clone(),
            secure: parent.secure.clone(),
        },
    }
}

impl Connection {
    /// Open a UDP child connection to the same peer.
    ///
    /// Only valid on the client side of a TCP connection. The child shares
    /// this connection's configuration, assemblies and session key, but has
    /// its own type tables and handlers. It closes when this connection does.
    #[instrument(skip(self), fields(peer = %self.inner.peer_addr))]
    pub async fn establish_udp(&self) -> Result<Connection> {
        self.ensure_tcp()?;
        let inner = &self.inner;
        if !self.is_alive() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let socket = transport::udp::bind(inner.local_addr.ip()).await?;
        let udp_port = socket.local_addr()?.port();

        let (tx, rx) = oneshot::channel();
        {
            let mut links = relock(&inner.udp.links);
            if links.closed {
                return Err(ProtocolError::ConnectionClosed);
            }
            if links.offer.is_some() {
                return Err(ProtocolError::TransportError(
                    constants::ERR_UDP_PENDING.to_string(),
                ));
            }
            links.offer = Some(tx);
        }

        inner.enqueue(Box::new(EstablishUdpRequest {
            header: PacketHeader::default(),
            udp_port,
        }));

        let server_port = match tokio::time::timeout(inner.config.timeout, rx).await {
            Ok(Ok(port)) => port,
            Ok(Err(_)) => return Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                let mut links = relock(&inner.udp.links);
                if links.offer.take().is_some() {
                    links.abandoned += 1;
                }
                return Err(ProtocolError::Timeout);
            }
        };

        let server = SocketAddr::new(inner.peer_addr.ip(), server_port);
        let wire = transport::udp::wire(socket, server, inner.config.max_frame_size).await?;
        let child = engine::launch(wire, udp_setup(inner, ConnectionRole::Client));

        inner.enqueue(Box::new(EstablishUdpResponseAck::default()));
        if !inner.udp.add_child(child.clone()) {
            child.inner.terminate(inner.close_reason().unwrap_or_default());
            return Err(ProtocolError::ConnectionClosed);
        }
        info!(udp_peer = %server, "UDP connection established");
        Ok(child)
    }

    /// Run `callback` for every UDP child the peer establishes with this connection
    pub fn on_udp_connection<F>(&self, callback: F)
    where
        F: Fn(Connection) + Send + Sync + 'static,
    {
        relock(&self.inner.udp.callbacks).push(Arc::new(callback));
    }

    /// Live UDP children of this connection
    pub fn udp_connections(&self) -> Vec<Connection> {
        self.inner.udp.children()
    }
}

/// Server side, step 1: bind a socket for the client's offer
pub(crate) async fn on_offer(conn: &Arc<ConnectionInner>, request: EstablishUdpRequest) {
    if conn.transport != TransportKind::Tcp || conn.role != ConnectionRole::Server {
        warn!(peer = %conn.peer_addr, "UDP offer received on the wrong side of a connection");
        conn.abort(CloseReason::InvalidUdpRequest);
        return;
    }

    let limit = conn.config.max_udp_connections;
    if conn.udp.active() >= limit {
        warn!(peer = %conn.peer_addr, limit, "UDP connection limit exceeded");
        conn.abort(CloseReason::UdpLimitExceeded);
        return;
    }

    let client = SocketAddr::new(conn.peer_addr.ip(), request.udp_port);
    let bound = async {
        let socket = transport::udp::bind(conn.local_addr.ip()).await?;
        let port = socket.local_addr()?.port();
        let wire = transport::udp::wire(socket, client, conn.config.max_frame_size).await?;
        Ok::<_, ProtocolError>((wire, port))
    };
    let (wire, udp_port) = match bound.await {
        Ok(bound) => bound,
        Err(e) => {
            error!(peer = %conn.peer_addr, error = %e, "Failed to bind UDP socket");
            conn.abort(CloseReason::InternalException);
            return;
        }
    };

    let child = engine::launch(wire, udp_setup(conn, ConnectionRole::Server));
    {
        let mut links = relock(&conn.udp.links);
        if links.closed {
            drop(links);
            child.inner.terminate(CloseReason::ServerClosed);
            return;
        }
        links.awaiting_ack.push_back(child.clone());
    }
    expire_unacknowledged(conn, child);

    debug!(peer = %conn.peer_addr, udp_port, "Answering UDP offer");
    conn.enqueue(Box::new(EstablishUdpResponse {
        header: PacketHeader::default(),
        udp_port,
    }));
}

/// Terminate `child` if the client has not acknowledged it within the timeout
fn expire_unacknowledged(conn: &Arc<ConnectionInner>, child: Connection) {
    let parent = Arc::downgrade(conn);
    let timeout = conn.config.timeout;
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let Some(parent) = parent.upgrade() else {
            return;
        };
        let expired = {
            let mut links = relock(&parent.udp.links);
            let before = links.awaiting_ack.len();
            links
                .awaiting_ack
                .retain(|pending| !Arc::ptr_eq(&pending.inner, &child.inner));
            links.awaiting_ack.len() < before
        };
        if expired {
            debug!(peer = %parent.peer_addr, "UDP offer was never acknowledged, dropping its child");
            child.inner.terminate(CloseReason::Timeout);
        }
    });
}

/// Client side, step 2: hand the server's port to the waiting `establish_udp`
pub(crate) fn on_answer(conn: &ConnectionInner, response: EstablishUdpResponse) {
    let offer = {
        let mut links = relock(&conn.udp.links);
        if links.abandoned > 0 {
            links.abandoned -= 1;
            debug!(peer = %conn.peer_addr, "Ignoring answer to an abandoned UDP offer");
            return;
        }
        links.offer.take()
    };
    match offer {
        Some(tx) => {
            let _ = tx.send(response.udp_port);
        }
        None => {
            warn!(peer = %conn.peer_addr, "UDP response without an offer");
            conn.abort(CloseReason::InvalidUdpRequest);
        }
    }
}

/// Server side, step 3: the client is ready, publish the child
pub(crate) fn on_ack(conn: &ConnectionInner) {
    let child = relock(&conn.udp.links).awaiting_ack.pop_front();
    let Some(child) = child else {
        warn!(peer = %conn.peer_addr, "UDP ack without a pending offer");
        conn.abort(CloseReason::InvalidUdpRequest);
        return;
    };

    if !conn.udp.add_child(child.clone()) {
        return;
    }
    info!(peer = %conn.peer_addr, udp_peer = %child.peer_addr(), "UDP connection established");

    let callbacks = relock(&conn.udp.callbacks).clone();
    for callback in callbacks {
        let child = child.clone();
        if catch_unwind(AssertUnwindSafe(|| callback(child))).is_err() {
            error!(peer = %conn.peer_addr, "on_udp_connection callback panicked");
        }
    }
}
