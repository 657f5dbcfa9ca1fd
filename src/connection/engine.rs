//! The three per-connection loops.
//!
//! Each loop runs as its own task and stops when the connection's
//! cancellation token fires. A panic inside a loop closes the connection with
//! the reason belonging to that loop.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::connection::keepalive::KeepAliveAction;
use crate::connection::{
    relock, sync, udp, CloseReason, Connection, ConnectionInner, ConnectionRole, Inbound,
    Outbound, TransportKind,
};
use crate::core::converter::{FormatConverter, PacketConverter, SecureConverter};
use crate::core::frame::Frame;
use crate::error::{constants, ProtocolError};
use crate::protocol::assembly::AssemblyCatalog;
use crate::protocol::builtin::{
    ids, AddPacketTypeRequest, AddPacketTypeResponse, CloseRequest, EstablishUdpRequest,
    EstablishUdpResponse, KeyInformationRequest, KeyInformationResponse, PingRequest,
    PingResponse, UdpPingRequest, UdpPingResponse,
};
use crate::protocol::dispatcher::{Dispatch, HandlerFn, HandlerKey, Received};
use crate::protocol::handshake;
use crate::protocol::packet::{AnyPacket, PacketHeader};
use crate::transport::udp::MAX_DATAGRAM_SIZE;
use crate::transport::{FrameSink, FrameStream, Wire};

/// Converter pair of a connection. The secure half is kept separately so the
/// engine can install keys on it.
#[derive(Clone)]
pub(crate) struct Converters {
    pub packet: Arc<dyn PacketConverter>,
    pub secure: Option<Arc<SecureConverter>>,
}

impl Converters {
    pub(crate) fn for_config(config: &ConnectionConfig) -> Self {
        let plain: Arc<dyn PacketConverter> = Arc::new(FormatConverter::new(config.format));
        if config.encryption_enabled {
            let secure = Arc::new(SecureConverter::new(plain));
            Self {
                packet: secure.clone(),
                secure: Some(secure),
            }
        } else {
            Self {
                packet: plain,
                secure: None,
            }
        }
    }
}

/// Everything needed to start a connection except the socket
pub(crate) struct Setup {
    pub transport: TransportKind,
    pub role: ConnectionRole,
    pub config: ConnectionConfig,
    pub catalog: AssemblyCatalog,
    pub converters: Converters,
}

impl Setup {
    pub(crate) fn new(
        transport: TransportKind,
        role: ConnectionRole,
        config: ConnectionConfig,
        catalog: AssemblyCatalog,
    ) -> Self {
        let converters = Converters::for_config(&config);
        Self {
            transport,
            role,
            config,
            catalog,
            converters,
        }
    }
}

/// Start the loops of a new connection over `wire`.
///
/// Must be called from within a tokio runtime.
pub(crate) fn launch(wire: Wire, setup: Setup) -> Connection {
    let Wire {
        reader,
        writer,
        peer_addr,
        local_addr,
    } = wire;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let inner = Arc::new(ConnectionInner::new(
        setup,
        peer_addr,
        local_addr,
        outbound_tx,
        inbound_tx,
    ));

    if inner.transport == TransportKind::Tcp
        && inner.role == ConnectionRole::Client
        && inner.secure.is_some()
    {
        let (exchange, request) = handshake::initiate();
        *relock(&inner.key_exchange) = Some(exchange);
        inner.enqueue(Box::new(request));
    }

    inner.mark_initialized();
    info!(
        peer = %peer_addr,
        local = %local_addr,
        transport = ?inner.transport,
        role = ?inner.role,
        "Connection established"
    );

    tokio::spawn(supervise(
        inner.clone(),
        CloseReason::ReadPacketThreadException,
        read_loop(inner.clone(), reader),
    ));
    tokio::spawn(supervise(
        inner.clone(),
        CloseReason::InvokePacketThreadException,
        dispatch_loop(inner.clone(), inbound_rx),
    ));
    tokio::spawn(supervise(
        inner.clone(),
        CloseReason::WritePacketThreadException,
        write_loop(inner.clone(), writer, outbound_rx),
    ));

    Connection { inner }
}

async fn supervise<F>(inner: Arc<ConnectionInner>, reason: CloseReason, task: F)
where
    F: Future<Output = ()> + Send,
{
    if AssertUnwindSafe(task).catch_unwind().await.is_err() {
        error!(peer = %inner.peer_addr, %reason, "Connection loop panicked");
        inner.terminate(reason);
    }
}

async fn read_loop(inner: Arc<ConnectionInner>, mut reader: FrameStream) {
    loop {
        let next = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            next = reader.next() => next,
        };

        let (reason, notify) = match next {
            Some(Ok(frame)) => match read_frame(&inner, frame) {
                Ok(()) => continue,
                Err(reason) => (reason, true),
            },
            Some(Err(ProtocolError::Io(e))) => {
                debug!(peer = %inner.peer_addr, error = %e, "Read failed");
                (CloseReason::NetworkError, false)
            }
            Some(Err(e)) if inner.transport == TransportKind::Udp => {
                debug!(peer = %inner.peer_addr, error = %e, "Dropping malformed datagram");
                continue;
            }
            Some(Err(e)) => {
                warn!(peer = %inner.peer_addr, error = %e, "Malformed frame");
                (CloseReason::ReadPacketThreadException, true)
            }
            None => {
                debug!(peer = %inner.peer_addr, "Peer closed the stream");
                (CloseReason::NetworkError, false)
            }
        };

        let _ = inner.inbound.send(Inbound::Disconnected { reason, notify });
        return;
    }
}

fn read_frame(inner: &ConnectionInner, frame: Frame) -> Result<(), CloseReason> {
    let frame_len = frame.frame_len();
    let wire_id = frame.type_id;

    let descriptor = match inner.types.resolve_type(wire_id) {
        Ok(descriptor) => descriptor,
        Err(ProtocolError::UnknownPacketType(_)) => {
            inner.stats.unknown_packet();
            return match inner.transport {
                TransportKind::Tcp => {
                    warn!(peer = %inner.peer_addr, wire_id, "Received unknown wire id");
                    Err(CloseReason::UnknownPacket)
                }
                TransportKind::Udp => {
                    debug!(peer = %inner.peer_addr, wire_id, "Dropping datagram with unknown wire id");
                    Ok(())
                }
            };
        }
        Err(e) => {
            error!(error = %e, "Wire id lookup failed");
            return Err(CloseReason::InternalException);
        }
    };

    let mut packet = match inner.converter.deserialize(&descriptor, &frame.payload) {
        Ok(packet) => packet,
        Err(e) if inner.transport == TransportKind::Udp => {
            debug!(peer = %inner.peer_addr, wire_id, error = %e, "Dropping undecodable datagram");
            return Ok(());
        }
        Err(e) => {
            warn!(
                peer = %inner.peer_addr,
                wire_id,
                packet = descriptor.name(),
                error = %e,
                "Failed to decode packet"
            );
            return Err(CloseReason::ReadPacketThreadException);
        }
    };
    packet.packet_header_mut().size = frame_len;
    inner.stats.packet_received(frame_len);
    trace!(peer = %inner.peer_addr, wire_id, packet = descriptor.name(), "Frame received");

    // The key must be in place before the next frame is decoded
    if matches!(
        wire_id,
        ids::KEY_INFORMATION_REQUEST | ids::KEY_INFORMATION_RESPONSE
    ) {
        return exchange_keys(inner, packet);
    }

    let _ = inner
        .inbound
        .send(Inbound::Packet(Received::new(wire_id, packet)));
    Ok(())
}

fn exchange_keys(inner: &ConnectionInner, packet: Box<dyn AnyPacket>) -> Result<(), CloseReason> {
    let Some(secure) = inner.secure.as_ref() else {
        debug!(peer = %inner.peer_addr, "Key exchange on a plaintext connection, ignoring");
        return Ok(());
    };

    let key = if let Some(request) = packet.downcast_ref::<KeyInformationRequest>() {
        let (response, key) = handshake::respond(request).map_err(|e| {
            warn!(peer = %inner.peer_addr, error = %e, "Key exchange failed");
            CloseReason::InternalException
        })?;
        inner.enqueue(Box::new(response));
        key
    } else if let Some(response) = packet.downcast_ref::<KeyInformationResponse>() {
        let Some(exchange) = relock(&inner.key_exchange).take() else {
            warn!(peer = %inner.peer_addr, "{}", constants::ERR_KEY_EXCHANGE_STATE);
            return Err(CloseReason::InternalException);
        };
        handshake::complete(exchange, response).map_err(|e| {
            warn!(peer = %inner.peer_addr, error = %e, "Key exchange failed");
            CloseReason::InternalException
        })?
    } else {
        return Ok(());
    };

    secure.install_key(key).map_err(|e| {
        error!(error = %e, "Failed to install session key");
        CloseReason::InternalException
    })?;
    if inner.outbound.send(Outbound::EnableEncryption).is_err() {
        debug!("Write loop gone before encryption was enabled");
    }
    Ok(())
}

async fn dispatch_loop(inner: Arc<ConnectionInner>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    loop {
        while let Some(claimed) = inner.next_claimed() {
            route(&inner, claimed);
        }

        let item = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = inner.claimed_ready.notified() => continue,
            item = inbound.recv() => item,
        };

        match item {
            Some(Inbound::Packet(mut received)) => {
                received.packet.run_before_receive();
                if is_protocol_packet(received.wire_id) {
                    handle_protocol_packet(&inner, received).await;
                } else {
                    route_arrival(&inner, received);
                }
            }
            Some(Inbound::Disconnected { reason, notify }) => {
                if notify {
                    inner.abort(reason);
                } else {
                    inner.terminate(reason);
                }
                return;
            }
            None => return,
        }
    }
}

/// Built-in packets the engine consumes itself. Raw data goes to handlers.
fn is_protocol_packet(wire_id: u16) -> bool {
    ids::is_reserved(wire_id) && wire_id != ids::RAW_DATA
}

async fn handle_protocol_packet(inner: &Arc<ConnectionInner>, received: Received) {
    let Received { wire_id, packet } = received;
    match wire_id {
        ids::PING_REQUEST => {
            if let Some(ping) = packet.downcast::<PingRequest>() {
                inner.enqueue(Box::new(PingResponse {
                    header: PacketHeader::reply_to(&ping.header),
                }));
            }
        }
        ids::UDP_PING_REQUEST => {
            if let Some(ping) = packet.downcast::<UdpPingRequest>() {
                inner.enqueue(Box::new(UdpPingResponse {
                    header: PacketHeader::reply_to(&ping.header),
                }));
            }
        }
        ids::PING_RESPONSE | ids::UDP_PING_RESPONSE => {
            if let Some(rtt) = inner.keepalive.pong(Instant::now()) {
                trace!(peer = %inner.peer_addr, rtt_us = rtt.as_micros() as u64, "Pong");
            }
        }
        ids::CLOSE_REQUEST => {
            if let Some(close) = packet.downcast::<CloseRequest>() {
                info!(peer = %inner.peer_addr, reason = %close.reason, "Peer closed the connection");
                inner.terminate(close.reason);
            }
        }
        ids::ESTABLISH_UDP_REQUEST => {
            if let Some(request) = packet.downcast::<EstablishUdpRequest>() {
                udp::on_offer(inner, request).await;
            }
        }
        ids::ESTABLISH_UDP_RESPONSE => {
            if let Some(response) = packet.downcast::<EstablishUdpResponse>() {
                udp::on_answer(inner, response);
            }
        }
        ids::ESTABLISH_UDP_RESPONSE_ACK => udp::on_ack(inner),
        ids::ADD_PACKET_TYPE_REQUEST => {
            if let Some(request) = packet.downcast::<AddPacketTypeRequest>() {
                sync::answer(inner, request);
            }
        }
        ids::ADD_PACKET_TYPE_RESPONSE => {
            if let Some(response) = packet.downcast::<AddPacketTypeResponse>() {
                inner.pending.on_response(inner, response);
            }
        }
        other => debug!(wire_id = other, "Ignoring protocol packet"),
    }
}

/// Route a freshly read packet. Packets claimed by a handler registered
/// concurrently are routed first, so a handler sees its packets in arrival order.
fn route_arrival(inner: &Arc<ConnectionInner>, received: Received) {
    let (earlier, outcome) = {
        let mut claimed = relock(&inner.claimed);
        let earlier: Vec<Received> = claimed.drain(..).collect();
        (earlier, inner.handlers.dispatch(received))
    };
    for claimed in earlier {
        route(inner, claimed);
    }
    apply(inner, outcome);
}

fn route(inner: &Arc<ConnectionInner>, received: Received) {
    apply(inner, inner.handlers.dispatch(received));
}

fn apply(inner: &Arc<ConnectionInner>, outcome: crate::error::Result<Dispatch>) {
    match outcome {
        Ok(Dispatch::Invoke {
            key,
            handler,
            received,
        }) => invoke(inner, &key, &*handler, received),
        Ok(Dispatch::Buffered) => {}
        Ok(Dispatch::Dropped(_)) => inner.stats.packet_dropped(),
        Err(e) => error!(error = %e, "Handler lookup failed"),
    }
}

fn invoke(inner: &Arc<ConnectionInner>, key: &HandlerKey, handler: &HandlerFn, received: Received) {
    let connection = Connection {
        inner: inner.clone(),
    };
    let packet = received.packet.type_name();

    match catch_unwind(AssertUnwindSafe(|| handler(received.packet, &connection))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            inner.stats.handler_error();
            warn!(peer = %inner.peer_addr, packet, ?key, error = %e, "Packet handler failed");
        }
        Err(_) => {
            inner.stats.handler_error();
            error!(peer = %inner.peer_addr, packet, ?key, "Packet handler panicked");
        }
    }
}

async fn write_loop(
    inner: Arc<ConnectionInner>,
    mut writer: FrameSink,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut ticker = tokio::time::interval(tick_period(&inner.config, inner.transport));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            item = outbound.recv() => match item {
                Some(Outbound::Packet(packet)) => {
                    if let Err(reason) = write_packet(&inner, &mut writer, packet).await {
                        inner.terminate(reason);
                        break;
                    }
                }
                Some(Outbound::EnableEncryption) => {
                    if let Some(secure) = inner.secure.as_ref() {
                        secure.enable_outbound();
                        debug!(peer = %inner.peer_addr, "Outbound encryption enabled");
                    }
                }
                Some(Outbound::Close(reason)) => {
                    write_close_notice(&inner, &mut writer, reason).await;
                    inner.terminate(reason);
                    break;
                }
                None => break,
            },
            _ = ticker.tick() => on_tick(&inner),
        }
    }

    if tokio::time::timeout(inner.config.shutdown_timeout, writer.close())
        .await
        .is_err()
    {
        debug!(peer = %inner.peer_addr, "Transport did not shut down in time");
    }
}

fn tick_period(config: &ConnectionConfig, transport: TransportKind) -> Duration {
    let mut period = config.ping_interval.min(config.timeout) / 4;
    if transport == TransportKind::Udp {
        period = period.min(config.sync_retry_interval / 2);
    }
    period.max(Duration::from_millis(5))
}

/// Largest frame the transport can carry. A UDP frame must fit one datagram.
fn frame_limit(config: &ConnectionConfig, transport: TransportKind) -> usize {
    match transport {
        TransportKind::Tcp => config.max_frame_size,
        TransportKind::Udp => config.max_frame_size.min(MAX_DATAGRAM_SIZE),
    }
}

async fn write_packet(
    inner: &ConnectionInner,
    writer: &mut FrameSink,
    mut packet: Box<dyn AnyPacket>,
) -> Result<(), CloseReason> {
    packet.run_before_send();

    let wire_id = match inner.types.local_id(packet.type_key()) {
        Ok(Some(id)) => id,
        Ok(None) => {
            error!(packet = packet.type_name(), "Packet type has no wire id, skipping");
            return Ok(());
        }
        Err(e) => {
            error!(error = %e, "Wire id lookup failed");
            return Err(CloseReason::InternalException);
        }
    };

    let payload = match inner.converter.serialize(&*packet) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(packet = packet.type_name(), error = %e, "Failed to serialize packet, skipping");
            return Ok(());
        }
    };

    let frame = Frame::new(wire_id, payload);
    let frame_len = frame.frame_len();
    let max = frame_limit(&inner.config, inner.transport);
    if frame_len > max {
        warn!(
            packet = packet.type_name(),
            frame_len,
            max,
            "Packet exceeds the maximum frame size, skipping"
        );
        return Ok(());
    }

    match writer.send(frame).await {
        Ok(()) => {
            inner.stats.packet_sent(frame_len);
            trace!(peer = %inner.peer_addr, wire_id, packet = packet.type_name(), "Frame written");
            Ok(())
        }
        Err(e) => {
            debug!(peer = %inner.peer_addr, error = %e, "Write failed");
            Err(CloseReason::NetworkError)
        }
    }
}

async fn write_close_notice(inner: &ConnectionInner, writer: &mut FrameSink, reason: CloseReason) {
    let notice = CloseRequest {
        header: PacketHeader::default(),
        reason,
    };
    let frame = match inner.converter.serialize(&notice) {
        Ok(payload) => Frame::new(ids::CLOSE_REQUEST, payload),
        Err(e) => {
            warn!(error = %e, "Failed to serialize close notice");
            return;
        }
    };

    match tokio::time::timeout(inner.config.shutdown_timeout, writer.send(frame)).await {
        Ok(Ok(())) => debug!(peer = %inner.peer_addr, %reason, "Close notice sent"),
        Ok(Err(e)) => debug!(peer = %inner.peer_addr, error = %e, "Failed to send close notice"),
        Err(_) => debug!(peer = %inner.peer_addr, "Timed out sending close notice"),
    }
}

fn on_tick(inner: &ConnectionInner) {
    if !inner.is_alive() {
        return;
    }
    let now = Instant::now();

    if inner.config.keep_alive {
        match inner
            .keepalive
            .poll(now, inner.config.ping_interval, inner.config.timeout)
        {
            KeepAliveAction::Idle => {}
            KeepAliveAction::Ping => {
                let ping: Box<dyn AnyPacket> = match inner.transport {
                    TransportKind::Tcp => Box::new(PingRequest::default()),
                    TransportKind::Udp => Box::new(UdpPingRequest::default()),
                };
                inner.stats.ping_sent();
                inner.enqueue(ping);
            }
            KeepAliveAction::Expired => {
                warn!(
                    peer = %inner.peer_addr,
                    timeout_ms = inner.config.timeout.as_millis() as u64,
                    "Peer stopped answering pings"
                );
                inner.abort(CloseReason::Timeout);
                return;
            }
        }
    }

    if inner.transport == TransportKind::Udp {
        inner.pending.retry_stale(inner, now);
    }
}
