//! # Connections
//!
//! A [`Connection`] is one live link to a peer over TCP or UDP. Each
//! connection runs three tasks:
//!
//! - **read loop**: decodes frames and queues packets for dispatch
//! - **dispatch loop**: handles protocol packets and routes the rest to handlers
//! - **write loop**: serializes queued packets and drives the keepalive timer
//!
//! The handle is cheap to clone; all clones refer to the same connection.
//! Nothing on the send path returns an error: failures surface as a
//! [`CloseReason`] through [`Connection::on_closed`] / [`Connection::closed`],
//! or as the [`PacketState`](crate::protocol::packet::PacketState) of a
//! placeholder response.
//!
//! ## Lifecycle
//! `Created -> Initialized -> Closing -> Closed`. A closed connection is
//! never reused; create a new one to reconnect.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::core::converter::{PacketConverter, SecureConverter};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::assembly::AssemblyCatalog;
use crate::protocol::dispatcher::{HandlerRegistry, HandlerScope, Received};
use crate::protocol::handshake::KeyExchange;
use crate::protocol::packet::{AnyPacket, Packet};
use crate::protocol::raw::{RawData, RawValue};
use crate::protocol::registry::TypeRegistry;
use crate::utils::metrics::{ConnectionStats, StatsSnapshot};

pub(crate) mod engine;
mod keepalive;
mod request;
mod sync;
mod udp;

use keepalive::KeepAlive;
use sync::PendingSync;
use udp::UdpLinks;

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CloseReason {
    /// The socket failed or the peer vanished without a close notice
    #[default]
    NetworkError,
    ServerClosed,
    ClientClosed,
    /// A frame carried a wire id the receiver could not resolve
    UnknownPacket,
    /// The peer stopped answering pings
    Timeout,
    DifferentVersion,
    /// A UDP handshake step arrived without the step before it
    InvalidUdpRequest,
    /// The peer asked for more UDP sub-connections than allowed
    UdpLimitExceeded,
    InternalException,
    WritePacketThreadException,
    ReadPacketThreadException,
    InvokePacketThreadException,
    /// The peer announced an assembly this process does not know
    AssemblyDoesNotExist,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::NetworkError => "network error",
            CloseReason::ServerClosed => "closed by server",
            CloseReason::ClientClosed => "closed by client",
            CloseReason::UnknownPacket => "unknown packet",
            CloseReason::Timeout => "timeout",
            CloseReason::DifferentVersion => "different protocol version",
            CloseReason::InvalidUdpRequest => "invalid UDP request",
            CloseReason::UdpLimitExceeded => "UDP connection limit exceeded",
            CloseReason::InternalException => "internal error",
            CloseReason::WritePacketThreadException => "write loop failed",
            CloseReason::ReadPacketThreadException => "read loop failed",
            CloseReason::InvokePacketThreadException => "dispatch loop failed",
            CloseReason::AssemblyDoesNotExist => "assembly does not exist",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    /// Loops running, packets flow
    Initialized,
    /// Flushing queued packets before the close notice
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Client,
    Server,
}

impl ConnectionRole {
    /// Reason reported when this side ends the connection on purpose
    pub fn close_reason(self) -> CloseReason {
        match self {
            ConnectionRole::Client => CloseReason::ClientClosed,
            ConnectionRole::Server => CloseReason::ServerClosed,
        }
    }
}

/// Work item of the write loop
pub(crate) enum Outbound {
    Packet(Box<dyn AnyPacket>),
    /// Encrypt everything written after this marker
    EnableEncryption,
    /// Write the close notice, then tear down
    Close(CloseReason),
}

/// Work item of the dispatch loop
pub(crate) enum Inbound {
    Packet(Received),
    /// The read loop stopped. Processed in order so earlier packets still reach their handlers.
    Disconnected { reason: CloseReason, notify: bool },
}

struct Lifecycle {
    state: ConnectionState,
    reason: Option<CloseReason>,
}

type ClosedCallback = Box<dyn FnOnce(CloseReason) + Send>;

/// State shared by the handle and the three loops
pub(crate) struct ConnectionInner {
    pub(crate) transport: TransportKind,
    pub(crate) role: ConnectionRole,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
    pub(crate) config: ConnectionConfig,
    pub(crate) catalog: AssemblyCatalog,
    pub(crate) types: TypeRegistry,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) converter: Arc<dyn PacketConverter>,
    pub(crate) secure: Option<Arc<SecureConverter>>,
    pub(crate) key_exchange: Mutex<Option<KeyExchange>>,
    pub(crate) outbound: mpsc::UnboundedSender<Outbound>,
    pub(crate) inbound: mpsc::UnboundedSender<Inbound>,
    pub(crate) pending: PendingSync,
    pub(crate) keepalive: KeepAlive,
    pub(crate) udp: UdpLinks,
    pub(crate) stats: ConnectionStats,
    pub(crate) cancel: CancellationToken,
    /// Packets taken from the unhandled buffer by a newly registered handler.
    /// Dispatched ahead of anything still in the inbound channel.
    pub(crate) claimed: Mutex<VecDeque<Received>>,
    pub(crate) claimed_ready: Notify,
    next_request_id: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    closed_tx: watch::Sender<Option<CloseReason>>,
    on_closed: Mutex<Vec<ClosedCallback>>,
}

/// Take a lock whose data stays consistent even if a holder panicked
pub(crate) fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionInner {
    pub(crate) fn new(
        setup: engine::Setup,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(None);
        Self {
            transport: setup.transport,
            role: setup.role,
            peer_addr,
            local_addr,
            handlers: HandlerRegistry::new(setup.config.packet_buffer),
            config: setup.config,
            catalog: setup.catalog,
            types: TypeRegistry::new(),
            converter: setup.converters.packet,
            secure: setup.converters.secure,
            key_exchange: Mutex::new(None),
            outbound,
            inbound,
            pending: PendingSync::default(),
            keepalive: KeepAlive::new(),
            udp: UdpLinks::default(),
            stats: ConnectionStats::new(),
            cancel: CancellationToken::new(),
            claimed: Mutex::new(VecDeque::new()),
            claimed_ready: Notify::new(),
            next_request_id: AtomicU64::new(1),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Created,
                reason: None,
            }),
            closed_tx,
            on_closed: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        relock(&self.lifecycle).state
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Initialized
    }

    pub(crate) fn mark_initialized(&self) {
        let mut lifecycle = relock(&self.lifecycle);
        if lifecycle.state == ConnectionState::Created {
            lifecycle.state = ConnectionState::Initialized;
        }
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a packet whose wire id is known to be confirmed
    pub(crate) fn enqueue(&self, packet: Box<dyn AnyPacket>) {
        if self.outbound.send(Outbound::Packet(packet)).is_err() {
            debug!(peer = %self.peer_addr, "Write loop gone, dropping packet");
        }
    }

    /// Entry point of every application send
    pub(crate) fn send_packet(&self, packet: Box<dyn AnyPacket>) {
        if matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            debug!(
                peer = %self.peer_addr,
                packet = packet.type_name(),
                "Connection not alive, dropping packet"
            );
            return;
        }

        match self.types.confirmed_id(packet.type_key()) {
            Ok(Some(_)) => self.enqueue(packet),
            Ok(None) => self.pending.submit(self, packet),
            Err(e) => error!(error = %e, packet = packet.type_name(), "Wire id lookup failed"),
        }
    }

    /// Register a handler and queue the buffered packets it claims.
    ///
    /// The claimed queue stays locked across the registration so the dispatch
    /// loop never routes a newer packet to the handler before the claimed ones.
    pub(crate) fn register_with<F>(&self, register: F) -> Result<()>
    where
        F: FnOnce(&HandlerRegistry) -> Result<Vec<Received>>,
    {
        let mut queue = relock(&self.claimed);
        let claimed = register(&self.handlers)?;
        if claimed.is_empty() {
            return Ok(());
        }
        queue.extend(claimed);
        drop(queue);
        self.claimed_ready.notify_one();
        Ok(())
    }

    pub(crate) fn next_claimed(&self) -> Option<Received> {
        relock(&self.claimed).pop_front()
    }

    /// Enter `Closing`. Returns false if a close is already underway.
    pub(crate) fn begin_close(&self, reason: CloseReason) -> bool {
        let mut lifecycle = relock(&self.lifecycle);
        match lifecycle.state {
            ConnectionState::Created | ConnectionState::Initialized => {
                lifecycle.state = ConnectionState::Closing;
                lifecycle.reason = Some(reason);
                true
            }
            ConnectionState::Closing | ConnectionState::Closed => false,
        }
    }

    /// Close after a protocol violation: the peer gets a notice once the
    /// packets already queued are written.
    pub(crate) fn abort(&self, reason: CloseReason) {
        if !self.begin_close(reason) {
            return;
        }
        warn!(peer = %self.peer_addr, %reason, "Closing connection");
        self.pending.clear();
        if self.outbound.send(Outbound::Close(reason)).is_err() {
            self.terminate(reason);
        }
    }

    /// Tear down immediately without notifying the peer. Runs once; a close
    /// already underway keeps its own reason.
    pub(crate) fn terminate(&self, reason: CloseReason) {
        let reason = {
            let mut lifecycle = relock(&self.lifecycle);
            if lifecycle.state == ConnectionState::Closed {
                return;
            }
            lifecycle.state = ConnectionState::Closed;
            *lifecycle.reason.get_or_insert(reason)
        };

        self.cancel.cancel();
        self.pending.clear();
        self.closed_tx.send_replace(Some(reason));
        info!(
            peer = %self.peer_addr,
            transport = ?self.transport,
            role = ?self.role,
            %reason,
            "Connection closed"
        );
        self.stats.log_stats();

        for child in self.udp.shutdown() {
            child.inner.terminate(reason);
        }

        let callbacks = std::mem::take(&mut *relock(&self.on_closed));
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(reason))).is_err() {
                error!(peer = %self.peer_addr, "on_closed callback panicked");
            }
        }
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        *self.closed_tx.borrow()
    }
}

/// Handle to a live connection
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer_addr)
            .field("transport", &self.inner.transport)
            .field("role", &self.inner.role)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl Connection {
    /// Queue `packet` for the peer.
    ///
    /// If the peer does not know the packet's type yet, the packet waits
    /// until the type-sync round for its assembly has completed. Packets sent
    /// on a connection that is closing or closed are dropped.
    pub fn send<P: Packet>(&self, packet: P) {
        self.inner.send_packet(Box::new(packet));
    }

    /// Send a single primitive value under `key`
    pub fn send_raw<V: RawValue>(&self, key: impl Into<String>, value: V) {
        self.send(RawData::encode(key, value));
    }

    /// Handle every packet of type `T` that no scoped handler claims.
    ///
    /// Packets of `T` that arrived before this call are delivered to the
    /// new handler. Registering `T` a second time keeps the first handler.
    pub fn register_static<T, F>(&self, handler: F) -> Result<()>
    where
        T: Packet,
        F: Fn(T, &Connection) -> Result<()> + Send + Sync + 'static,
    {
        self.inner
            .register_with(|handlers| handlers.register_static(handler))
    }

    /// Handle packets of type `T` whose header id matches `scope`
    pub fn register_scoped<T, F>(&self, scope: HandlerScope, handler: F) -> Result<()>
    where
        T: Packet,
        F: Fn(T, &Connection) -> Result<()> + Send + Sync + 'static,
    {
        self.inner
            .register_with(|handlers| handlers.register(scope, handler))
    }

    /// Handle raw data packets sent under `key`
    pub fn register_raw<F>(&self, key: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(RawData, &Connection) -> Result<()> + Send + Sync + 'static,
    {
        self.inner
            .register_with(|handlers| handlers.register_raw(key, handler))
    }

    pub fn deregister_static<T: Packet>(&self) -> Result<bool> {
        self.inner.handlers.deregister_static::<T>()
    }

    pub fn deregister_scoped<T: Packet>(&self, scope: HandlerScope) -> Result<bool> {
        self.inner.handlers.deregister::<T>(scope)
    }

    pub fn deregister_raw(&self, key: &str) -> Result<bool> {
        self.inner.handlers.deregister_raw(key)
    }

    pub fn has_handler<T: Packet>(&self, scope: HandlerScope) -> bool {
        self.inner.handlers.is_registered::<T>(scope).unwrap_or(false)
    }

    /// Close the connection gracefully.
    ///
    /// Packets already queued, including those waiting for type sync, are
    /// written before the close notice; the wait is bounded by the
    /// configured `shutdown_timeout`. Does nothing if the connection is
    /// already closing or closed.
    pub async fn close(&self, reason: CloseReason) {
        let inner = &self.inner;
        if !inner.begin_close(reason) {
            return;
        }
        debug!(peer = %inner.peer_addr, %reason, "Closing connection");

        let limit = inner.config.shutdown_timeout;
        if !inner.pending.wait_drained(limit).await {
            warn!(
                peer = %inner.peer_addr,
                pending = inner.pending.len(),
                "Type sync still in flight at close, dropping waiting packets"
            );
        }

        if inner.outbound.send(Outbound::Close(reason)).is_err() {
            inner.terminate(reason);
            return;
        }
        if tokio::time::timeout(limit, self.closed()).await.is_err() {
            warn!(peer = %inner.peer_addr, "Close notice not flushed in time");
            inner.terminate(reason);
        }
    }

    /// Close with the reason matching this side's role
    pub async fn disconnect(&self) {
        self.close(self.inner.role.close_reason()).await;
    }

    /// Run `callback` once when the connection closes. Runs immediately if it
    /// is already closed.
    pub fn on_closed<F>(&self, callback: F)
    where
        F: FnOnce(CloseReason) + Send + 'static,
    {
        let mut callbacks = relock(&self.inner.on_closed);
        match self.inner.close_reason() {
            Some(reason) => {
                drop(callbacks);
                callback(reason);
            }
            None => callbacks.push(Box::new(callback)),
        }
    }

    /// Wait until the connection is closed and return why
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.inner.closed_tx.subscribe();
        let result = rx.wait_for(Option::is_some).await.map(|reason| *reason);
        match result {
            Ok(Some(reason)) => reason,
            _ => CloseReason::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason()
    }

    /// Last measured round-trip time; zero until the first ping was answered
    pub fn rtt(&self) -> Duration {
        self.inner.keepalive.rtt()
    }

    /// One-way latency estimate, half the round-trip time
    pub fn ping(&self) -> Duration {
        self.inner.keepalive.ping()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Packets received that are still waiting for a handler
    pub fn unhandled_count(&self) -> usize {
        self.inner.handlers.unhandled_len()
    }

    /// Packets waiting for their type-sync round to finish
    pub fn pending_sync_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn transport(&self) -> TransportKind {
        self.inner.transport
    }

    pub fn role(&self) -> ConnectionRole {
        self.inner.role
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Whether payloads written by this side are currently encrypted
    pub fn is_encrypted(&self) -> bool {
        self.inner
            .secure
            .as_ref()
            .is_some_and(|secure| secure.is_outbound_encrypted())
    }

    /// Wait until outbound encryption is active, for at most `limit`
    pub async fn wait_encrypted(&self, limit: Duration) -> Result<()> {
        if self.inner.secure.is_none() {
            return Err(ProtocolError::HandshakeError(
                "encryption is not enabled for this connection".to_string(),
            ));
        }
        let poll = async {
            while !self.is_encrypted() {
                if !self.is_alive() {
                    return Err(ProtocolError::ConnectionClosed);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(())
        };
        crate::utils::timeout::with_timeout_error(poll, limit).await
    }

    pub(crate) fn ensure_tcp(&self) -> Result<()> {
        if self.inner.transport == TransportKind::Tcp {
            Ok(())
        } else {
            Err(ProtocolError::TransportError(
                constants::ERR_UDP_NOT_TCP.to_string(),
            ))
        }
    }
}
