//! Type-sync protocol: packets whose type the peer has not confirmed yet
//! wait here while an `AddPacketTypeRequest` for their assembly is in flight.
//!
//! The confirmation check, the buffer scan and the enqueue all happen under
//! one lock, so concurrent sends of never-seen types from the same assembly
//! trigger exactly one sync round.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::connection::{relock, CloseReason, ConnectionInner};
use crate::error::ProtocolError;
use crate::protocol::builtin::{AddPacketTypeRequest, AddPacketTypeResponse, TypeEntry};
use crate::protocol::packet::{AnyPacket, PacketHeader};

struct Waiting {
    assembly: String,
    packet: Box<dyn AnyPacket>,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Waiting>,
    /// Assemblies with an unanswered sync request, and when it was sent
    in_flight: HashMap<String, Instant>,
}

#[derive(Default)]
pub(crate) struct PendingSync {
    state: Mutex<State>,
    drained: Notify,
}

impl PendingSync {
    /// Hold `packet` until the peer confirms its type, starting a sync round
    /// for its assembly if none is in flight.
    pub(crate) fn submit(&self, conn: &ConnectionInner, packet: Box<dyn AnyPacket>) {
        let mut state = relock(&self.state);
        let type_id = packet.type_key();

        match conn.types.confirmed_id(type_id) {
            Ok(Some(_)) => {
                conn.enqueue(packet);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Wire id lookup failed");
                return;
            }
        }

        let assembly = match conn.catalog.assembly_of(type_id) {
            Ok(Some(assembly)) => assembly,
            Ok(None) => {
                warn!(
                    packet = packet.type_name(),
                    "Packet type belongs to no known assembly, dropping packet"
                );
                conn.stats.packet_dropped();
                return;
            }
            Err(e) => {
                error!(error = %e, "Assembly lookup failed");
                return;
            }
        };

        let entries = match conn.types.register_assembly(&assembly) {
            Ok(entries) => entries,
            Err(e) => {
                error!(
                    assembly = assembly.name(),
                    error = %e,
                    "Failed to assign wire ids, dropping packet"
                );
                conn.stats.packet_dropped();
                return;
            }
        };

        let name = assembly.name().to_string();
        let start_round = !state.in_flight.contains_key(&name);
        state.queue.push_back(Waiting {
            assembly: name.clone(),
            packet,
        });

        if start_round {
            state.in_flight.insert(name.clone(), Instant::now());
            request_sync(conn, name, entries);
        }
    }

    /// Apply the peer's answer: confirm ids and release every waiting packet
    /// whose type is now confirmed, in submission order.
    pub(crate) fn on_response(&self, conn: &ConnectionInner, response: AddPacketTypeResponse) {
        let mut state = relock(&self.state);

        match conn.types.confirm(&response.known_ids) {
            Ok(added) => debug!(
                peer = %conn.peer_addr,
                assembly = %response.assembly,
                confirmed = added,
                "Type sync confirmed"
            ),
            Err(e) => error!(error = %e, "Failed to confirm wire ids"),
        }
        state.in_flight.remove(&response.assembly);

        let queue = std::mem::take(&mut state.queue);
        let mut retry = HashSet::new();
        for waiting in queue {
            match conn.types.confirmed_id(waiting.packet.type_key()) {
                Ok(Some(_)) => conn.enqueue(waiting.packet),
                _ => {
                    if !state.in_flight.contains_key(&waiting.assembly) {
                        retry.insert(waiting.assembly.clone());
                    }
                    state.queue.push_back(waiting);
                }
            }
        }

        for assembly in retry {
            if resend(conn, &assembly) {
                state.in_flight.insert(assembly, Instant::now());
            }
        }

        if state.queue.is_empty() {
            self.drained.notify_waiters();
        }
    }

    /// Re-send sync requests unanswered for longer than the retry interval.
    /// Datagrams can get lost; TCP connections never need this.
    pub(crate) fn retry_stale(&self, conn: &ConnectionInner, now: Instant) {
        let mut state = relock(&self.state);
        let interval = conn.config.sync_retry_interval;
        let stale: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, sent)| now.saturating_duration_since(**sent) >= interval)
            .map(|(name, _)| name.clone())
            .collect();

        for assembly in stale {
            debug!(peer = %conn.peer_addr, %assembly, "Re-sending type sync request");
            if resend(conn, &assembly) {
                state.in_flight.insert(assembly, now);
            } else {
                state.in_flight.remove(&assembly);
            }
        }
    }

    /// Wait until no packet is waiting for type sync. Returns false if
    /// `limit` elapsed first.
    pub(crate) async fn wait_drained(&self, limit: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }

    pub(crate) fn clear(&self) {
        let mut state = relock(&self.state);
        state.queue.clear();
        state.in_flight.clear();
        self.drained.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        relock(&self.state).queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn request_sync(conn: &ConnectionInner, assembly: String, entries: Vec<TypeEntry>) {
    debug!(
        peer = %conn.peer_addr,
        %assembly,
        types = entries.len(),
        "Requesting type sync"
    );
    conn.stats.sync_round();
    conn.enqueue(Box::new(AddPacketTypeRequest {
        header: PacketHeader::default(),
        assembly,
        entries,
    }));
}

fn resend(conn: &ConnectionInner, assembly: &str) -> bool {
    let found = match conn.catalog.get(assembly) {
        Ok(Some(found)) => found,
        _ => return false,
    };
    match conn.types.register_assembly(&found) {
        Ok(entries) => {
            request_sync(conn, assembly.to_string(), entries);
            true
        }
        Err(e) => {
            error!(%assembly, error = %e, "Failed to rebuild type sync request");
            false
        }
    }
}

/// Answer the peer's sync request with every wire id this side can decode.
///
/// An assembly (or a type inside it) unknown to this process makes decoding
/// impossible, so the connection is closed.
pub(crate) fn answer(conn: &ConnectionInner, request: AddPacketTypeRequest) {
    let assembly = match conn.catalog.get(&request.assembly) {
        Ok(Some(assembly)) => assembly,
        Ok(None) => {
            error!(
                peer = %conn.peer_addr,
                assembly = %request.assembly,
                "Peer announced an unknown assembly"
            );
            conn.abort(CloseReason::AssemblyDoesNotExist);
            return;
        }
        Err(e) => {
            error!(error = %e, "Assembly lookup failed");
            conn.abort(CloseReason::InternalException);
            return;
        }
    };

    match conn.types.learn(&assembly, &request.entries) {
        Ok(known_ids) => {
            debug!(
                peer = %conn.peer_addr,
                assembly = %request.assembly,
                known = known_ids.len(),
                "Learned peer wire ids"
            );
            conn.enqueue(Box::new(AddPacketTypeResponse {
                header: PacketHeader::default(),
                assembly: request.assembly,
                known_ids,
            }));
        }
        Err(ProtocolError::AssemblyNotFound(name)) => {
            error!(peer = %conn.peer_addr, %name, "Peer assembly holds a type unknown here");
            conn.abort(CloseReason::AssemblyDoesNotExist);
        }
        Err(ProtocolError::UnknownPacketType(id)) => {
            error!(peer = %conn.peer_addr, wire_id = id, "Peer announced a reserved wire id");
            conn.abort(CloseReason::UnknownPacket);
        }
        Err(e) => {
            error!(error = %e, "Failed to learn peer wire ids");
            conn.abort(CloseReason::InternalException);
        }
    }
}
