//! Datagram sockets of UDP child connections.
//!
//! Each child connection owns one socket that is `connect`ed to the peer, so
//! the kernel discards datagrams from any other address. One datagram holds
//! exactly one frame.

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures::{sink, stream};
use tokio::net::UdpSocket;
use tracing::{debug, instrument};

use crate::core::frame::Frame;
use crate::error::{ProtocolError, Result};
use crate::transport::Wire;

/// Largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Bind a socket on an ephemeral port of `ip`
#[instrument]
pub async fn bind(ip: IpAddr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
    debug!(local = %socket.local_addr()?, "UDP socket bound");
    Ok(socket)
}

/// Attach `socket` to `peer` and expose it as a frame wire.
///
/// Datagrams announcing more than `max_frame_size` bytes are reported as
/// `OversizedPacket`. Callers keep outgoing frames within [`MAX_DATAGRAM_SIZE`].
pub(crate) async fn wire(socket: UdpSocket, peer: SocketAddr, max_frame_size: usize) -> Result<Wire> {
    socket.connect(peer).await?;
    let local_addr = socket.local_addr()?;
    let socket = Arc::new(socket);

    let reader = stream::unfold(socket.clone(), move |socket| async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match socket.recv(&mut buf).await {
                Ok(len) => return Some((Frame::from_bytes_within(&buf[..len], max_frame_size), socket)),
                // ICMP unreachable from a peer that is not listening yet
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                    debug!(error = %e, "Ignoring transient UDP receive error");
                }
                Err(e) => return Some((Err(ProtocolError::Io(e)), socket)),
            }
        }
    });

    let writer = sink::unfold(socket, |socket, frame: Frame| async move {
        let bytes = frame.to_bytes()?;
        socket.send(&bytes).await?;
        Ok::<_, ProtocolError>(socket)
    });

    Ok(Wire {
        reader: Box::pin(reader),
        writer: Box::pin(writer),
        peer_addr: peer,
        local_addr,
    })
}
