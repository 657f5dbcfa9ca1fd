use std::any::TypeId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::packet::{AnyPacket, Packet};
use crate::protocol::raw::RawData;

pub type HandlerFn = dyn Fn(Box<dyn AnyPacket>, &Connection) -> Result<()> + Send + Sync;

/// Which packets of a type a handler receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerScope {
    /// Every packet of the type that no instance handler claims
    Static,
    /// Only packets whose header id equals the given correlation id
    Instance(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    Typed(TypeId, HandlerScope),
    Raw(String),
}

/// A decoded packet together with the wire id it arrived under
#[derive(Debug)]
pub struct Received {
    pub wire_id: u16,
    pub packet: Box<dyn AnyPacket>,
}

impl Received {
    pub fn new(wire_id: u16, packet: Box<dyn AnyPacket>) -> Self {
        Self { wire_id, packet }
    }

    fn raw_key(&self) -> Option<&str> {
        self.packet.downcast_ref::<RawData>().map(|raw| raw.key.as_str())
    }

    fn matches(&self, key: &HandlerKey) -> bool {
        match key {
            HandlerKey::Raw(wanted) => self.raw_key() == Some(wanted.as_str()),
            HandlerKey::Typed(type_id, scope) => {
                self.packet.type_key() == *type_id
                    && self.raw_key().is_none()
                    && match scope {
                        HandlerScope::Static => true,
                        HandlerScope::Instance(id) => self.packet.packet_header().id == *id,
                    }
            }
        }
    }
}

/// Routing decision for one received packet
pub enum Dispatch {
    Invoke {
        key: HandlerKey,
        handler: Arc<HandlerFn>,
        received: Received,
    },
    /// Kept until a matching handler is registered
    Buffered,
    /// The unhandled buffer was full
    Dropped(Received),
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::Invoke { key, received, .. } => f
                .debug_struct("Invoke")
                .field("key", key)
                .field("received", received)
                .finish(),
            Dispatch::Buffered => f.write_str("Buffered"),
            Dispatch::Dropped(received) => f.debug_tuple("Dropped").field(received).finish(),
        }
    }
}

#[derive(Default)]
struct Inner {
    handlers: HashMap<HandlerKey, Arc<HandlerFn>>,
    unhandled: VecDeque<Received>,
}

/// Handler registry with precedence routing and a bounded buffer for packets
/// that arrive before their handler.
///
/// Lookup and buffering happen under one lock, as do registration and the
/// buffer re-scan, so a packet can never slip between a failed lookup and a
/// concurrent registration.
pub struct HandlerRegistry {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl HandlerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| ProtocolError::poisoned(constants::ERR_HANDLER_REGISTRY_LOCK))
    }

    /// Register a handler for every packet of type `T`.
    ///
    /// Returns the buffered packets the new handler now owns, oldest first.
    pub fn register_static<T, F>(&self, handler: F) -> Result<Vec<Received>>
    where
        T: Packet,
        F: Fn(T, &Connection) -> Result<()> + Send + Sync + 'static,
    {
        self.register(HandlerScope::Static, handler)
    }

    /// Register a handler for packets of type `T` within `scope`.
    ///
    /// Registering an occupied `(T, scope)` pair is a no-op and keeps the
    /// existing handler.
    pub fn register<T, F>(&self, scope: HandlerScope, handler: F) -> Result<Vec<Received>>
    where
        T: Packet,
        F: Fn(T, &Connection) -> Result<()> + Send + Sync + 'static,
    {
        let erased: Arc<HandlerFn> = Arc::new(move |packet: Box<dyn AnyPacket>, conn: &Connection| {
            let packet = packet.downcast::<T>().ok_or_else(|| {
                ProtocolError::Custom(constants::ERR_HANDLER_TYPE_MISMATCH.to_string())
            })?;
            handler(packet, conn)
        });
        self.insert(HandlerKey::Typed(TypeId::of::<T>(), scope), erased)
    }

    /// Register a handler for raw data packets carrying `key`
    pub fn register_raw<F>(&self, key: impl Into<String>, handler: F) -> Result<Vec<Received>>
    where
        F: Fn(RawData, &Connection) -> Result<()> + Send + Sync + 'static,
    {
        let erased: Arc<HandlerFn> = Arc::new(move |packet: Box<dyn AnyPacket>, conn: &Connection| {
            let raw = packet.downcast::<RawData>().ok_or_else(|| {
                ProtocolError::Custom(constants::ERR_HANDLER_TYPE_MISMATCH.to_string())
            })?;
            handler(raw, conn)
        });
        self.insert(HandlerKey::Raw(key.into()), erased)
    }

    fn insert(&self, key: HandlerKey, handler: Arc<HandlerFn>) -> Result<Vec<Received>> {
        let mut inner = self.lock()?;
        if inner.handlers.contains_key(&key) {
            debug!(?key, "Handler already registered, keeping the existing one");
            return Ok(Vec::new());
        }
        inner.handlers.insert(key.clone(), handler);

        let mut claimed = Vec::new();
        let mut kept = VecDeque::with_capacity(inner.unhandled.len());
        while let Some(received) = inner.unhandled.pop_front() {
            if received.matches(&key) {
                claimed.push(received);
            } else {
                kept.push_back(received);
            }
        }
        inner.unhandled = kept;

        if !claimed.is_empty() {
            debug!(?key, count = claimed.len(), "Buffered packets claimed by new handler");
        }
        Ok(claimed)
    }

    pub fn deregister_static<T: Packet>(&self) -> Result<bool> {
        self.deregister::<T>(HandlerScope::Static)
    }

    pub fn deregister<T: Packet>(&self, scope: HandlerScope) -> Result<bool> {
        let key = HandlerKey::Typed(TypeId::of::<T>(), scope);
        Ok(self.lock()?.handlers.remove(&key).is_some())
    }

    pub fn deregister_raw(&self, key: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .handlers
            .remove(&HandlerKey::Raw(key.to_string()))
            .is_some())
    }

    pub fn is_registered<T: Packet>(&self, scope: HandlerScope) -> Result<bool> {
        let key = HandlerKey::Typed(TypeId::of::<T>(), scope);
        Ok(self.lock()?.handlers.contains_key(&key))
    }

    pub fn is_raw_registered(&self, key: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .handlers
            .contains_key(&HandlerKey::Raw(key.to_string())))
    }

    /// Decide where `received` goes.
    ///
    /// Precedence: the instance handler matching the packet's correlation id,
    /// then the static handler of its type, then the unhandled buffer.
    pub fn dispatch(&self, received: Received) -> Result<Dispatch> {
        let mut inner = self.lock()?;

        let key = match received.raw_key() {
            Some(raw_key) => {
                let key = HandlerKey::Raw(raw_key.to_string());
                inner.handlers.contains_key(&key).then_some(key)
            }
            None => {
                let type_id = received.packet.type_key();
                let id = received.packet.packet_header().id;
                let scoped = HandlerKey::Typed(type_id, HandlerScope::Instance(id));
                let fallback = HandlerKey::Typed(type_id, HandlerScope::Static);
                if id != 0 && inner.handlers.contains_key(&scoped) {
                    Some(scoped)
                } else if inner.handlers.contains_key(&fallback) {
                    Some(fallback)
                } else {
                    None
                }
            }
        };

        if let Some(key) = key {
            if let Some(handler) = inner.handlers.get(&key).cloned() {
                return Ok(Dispatch::Invoke {
                    key,
                    handler,
                    received,
                });
            }
        }

        if inner.unhandled.len() >= self.capacity {
            warn!(
                packet = received.packet.type_name(),
                capacity = self.capacity,
                "Unhandled packet buffer full, dropping packet"
            );
            return Ok(Dispatch::Dropped(received));
        }

        debug!(
            packet = received.packet.type_name(),
            "No handler registered, buffering packet"
        );
        inner.unhandled.push_back(received);
        Ok(Dispatch::Buffered)
    }

    /// Number of packets waiting for a handler
    pub fn unhandled_len(&self) -> usize {
        self.inner.lock().map(|inner| inner.unhandled.len()).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every handler and buffered packet
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.handlers.clear();
        inner.unhandled.clear();
        Ok(())
    }
}
