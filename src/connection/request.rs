//! Request/response correlation.
//!
//! A request gets a fresh correlation id in its header. A one-shot handler
//! for the response type is registered under that id, so the reply reaches
//! the waiting caller even when a static handler for the same type exists.
//! The handler is always removed again, whether the reply arrived or not.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::{relock, Connection};
use crate::protocol::dispatcher::HandlerScope;
use crate::protocol::packet::{Packet, PacketHeader, PacketState, RequestPacket};

enum Outcome<T> {
    Reply(T),
    Failed(PacketState),
}

impl Connection {
    /// Send `request` and wait for its response using the connection timeout.
    ///
    /// Never fails: if no response arrives in time the result is a default
    /// response whose state is [`PacketState::Timeout`]; if the connection
    /// is not alive, [`PacketState::ConnectionNotAlive`].
    pub async fn send_and_await<R: RequestPacket>(&self, request: R) -> R::Response {
        let limit = self.inner.config.timeout;
        self.send_and_await_timeout(request, limit).await
    }

    /// Like [`send_and_await`](Self::send_and_await) with an explicit timeout
    pub async fn send_and_await_timeout<R: RequestPacket>(
        &self,
        mut request: R,
        limit: Duration,
    ) -> R::Response {
        if !self.is_alive() {
            return placeholder::<R::Response>(PacketState::ConnectionNotAlive);
        }

        let id = self.inner.next_request_id();
        request.header_mut().id = id;
        let scope = HandlerScope::Instance(id);

        let (tx, rx) = oneshot::channel::<R::Response>();
        let slot = Mutex::new(Some(tx));
        let handler = move |response: R::Response, _: &Connection| {
            if let Some(tx) = relock(&slot).take() {
                let _ = tx.send(response);
            }
            Ok(())
        };
        if let Err(e) = self.register_scoped(scope, handler) {
            warn!(request = R::NAME, error = %e, "Failed to register response handler");
            return placeholder::<R::Response>(PacketState::ConnectionNotAlive);
        }

        self.send(request);

        let outcome = tokio::select! {
            received = tokio::time::timeout(limit, rx) => match received {
                Ok(Ok(response)) => Outcome::Reply(response),
                Ok(Err(_)) => Outcome::Failed(PacketState::ConnectionNotAlive),
                Err(_) => Outcome::Failed(PacketState::Timeout),
            },
            _ = self.closed() => Outcome::Failed(PacketState::ConnectionNotAlive),
        };

        if let Err(e) = self.deregister_scoped::<R::Response>(scope) {
            warn!(request = R::NAME, error = %e, "Failed to remove response handler");
        }

        match outcome {
            Outcome::Reply(response) => response,
            Outcome::Failed(state) => {
                debug!(
                    request = R::NAME,
                    id,
                    ?state,
                    timeout_ms = limit.as_millis() as u64,
                    "Request ended without a response"
                );
                placeholder::<R::Response>(state)
            }
        }
    }
}

fn placeholder<T: Packet + Default>(state: PacketState) -> T {
    let mut packet = T::default();
    *packet.header_mut() = PacketHeader::with_state(state);
    packet
}
