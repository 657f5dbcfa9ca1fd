//! Packet type registry: the per-connection mapping between packet types and
//! 16-bit wire ids.
//!
//! Each side numbers its own outbound types (declared id, or the next free id
//! from a counter starting at 100) and learns the ids the peer uses for its
//! outbound types through the type-sync protocol. Encoding looks up the local
//! table, decoding the learned one, so two peers that register different
//! assemblies at the same time can never hand out conflicting meanings for
//! one id. A local id is *confirmed* once the peer has acknowledged it; only
//! confirmed ids may be put on the wire.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::assembly::Assembly;
use crate::protocol::builtin::{self, ids, TypeEntry};
use crate::protocol::packet::{Packet, PacketDescriptor};

#[derive(Debug, Default)]
struct Tables {
    local_by_type: HashMap<TypeId, u16>,
    local_by_id: HashMap<u16, PacketDescriptor>,
    remote_by_id: HashMap<u16, PacketDescriptor>,
    confirmed: HashSet<u16>,
    /// Announcement entries per locally registered assembly
    assemblies: HashMap<String, Vec<TypeEntry>>,
}

#[derive(Debug)]
pub struct TypeRegistry {
    tables: RwLock<Tables>,
    next_id: AtomicU16,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Registry holding only the built-in packets, all of them confirmed
    pub fn new() -> Self {
        let mut tables = Tables::default();
        for descriptor in builtin::descriptors() {
            // built-ins always declare their id
            let id = descriptor.declared_id().unwrap_or_default();
            tables.local_by_type.insert(descriptor.type_id(), id);
            tables.local_by_id.insert(id, descriptor);
            tables.remote_by_id.insert(id, descriptor);
            tables.confirmed.insert(id);
        }

        Self {
            tables: RwLock::new(tables),
            next_id: AtomicU16::new(ids::FIRST_DYNAMIC_ID),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| ProtocolError::poisoned(constants::ERR_TYPE_REGISTRY_LOCK))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| ProtocolError::poisoned(constants::ERR_TYPE_REGISTRY_LOCK))
    }

    /// Assign local wire ids to every type of `assembly` that has none yet.
    ///
    /// Returns the announcement entries for the whole assembly. Registering
    /// the same assembly again is a no-op that returns the same entries.
    pub fn register_assembly(&self, assembly: &Assembly) -> Result<Vec<TypeEntry>> {
        let mut tables = self.write()?;
        if let Some(entries) = tables.assemblies.get(assembly.name()) {
            return Ok(entries.clone());
        }

        // Validate declared ids before touching the tables
        let mut claimed: HashMap<u16, &'static str> = HashMap::new();
        for descriptor in assembly.packets() {
            if tables.local_by_type.contains_key(&descriptor.type_id()) {
                continue;
            }
            if let Some(id) = descriptor.declared_id() {
                if ids::is_reserved(id) {
                    return Err(ProtocolError::ConfigError(format!(
                        "packet `{}` declares reserved wire id {id}",
                        descriptor.name()
                    )));
                }
                let existing = tables
                    .local_by_id
                    .get(&id)
                    .map(|d| d.name())
                    .or_else(|| claimed.get(&id).copied());
                if let Some(existing) = existing {
                    return Err(ProtocolError::WireIdConflict {
                        id,
                        existing,
                        requested: descriptor.name(),
                    });
                }
                claimed.insert(id, descriptor.name());
            }
        }

        let mut entries = Vec::with_capacity(assembly.packets().len());
        for descriptor in assembly.packets() {
            let id = match tables.local_by_type.get(&descriptor.type_id()) {
                Some(id) => *id,
                None => {
                    let id = match descriptor.declared_id() {
                        Some(id) => id,
                        None => self.allocate_id(&tables.local_by_id, &claimed)?,
                    };
                    tables.local_by_type.insert(descriptor.type_id(), id);
                    tables.local_by_id.insert(id, *descriptor);
                    id
                }
            };
            entries.push(TypeEntry {
                name: descriptor.name().to_string(),
                id,
            });
        }

        debug!(
            assembly = assembly.name(),
            types = entries.len(),
            "Assembly registered locally"
        );
        tables
            .assemblies
            .insert(assembly.name().to_string(), entries.clone());
        Ok(entries)
    }

    fn allocate_id(
        &self,
        taken: &HashMap<u16, PacketDescriptor>,
        claimed: &HashMap<u16, &'static str>,
    ) -> Result<u16> {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == u16::MAX {
                self.next_id.store(u16::MAX, Ordering::Relaxed);
                return Err(ProtocolError::WireIdExhausted);
            }
            if !taken.contains_key(&id) && !claimed.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Local wire id of a packet type, if it has one
    pub fn local_id(&self, type_id: TypeId) -> Result<Option<u16>> {
        Ok(self.read()?.local_by_type.get(&type_id).copied())
    }

    /// Local wire id of `T`; fails if `T` was never registered
    pub fn resolve_id<T: Packet>(&self) -> Result<u16> {
        self.local_id(TypeId::of::<T>())?
            .ok_or(ProtocolError::UnregisteredPacket(T::NAME))
    }

    /// Packet type the peer means by wire id `id`
    pub fn resolve_type(&self, id: u16) -> Result<PacketDescriptor> {
        self.read()?
            .remote_by_id
            .get(&id)
            .copied()
            .ok_or(ProtocolError::UnknownPacketType(id))
    }

    /// Whether the peer has acknowledged local wire id `id`
    pub fn is_confirmed(&self, id: u16) -> Result<bool> {
        Ok(self.read()?.confirmed.contains(&id))
    }

    /// Whether the local type `type_id` has a confirmed wire id
    pub fn confirmed_id(&self, type_id: TypeId) -> Result<Option<u16>> {
        let tables = self.read()?;
        Ok(tables
            .local_by_type
            .get(&type_id)
            .copied()
            .filter(|id| tables.confirmed.contains(id)))
    }

    /// Record the peer's ids for `assembly` as announced in a sync request.
    ///
    /// Returns every non-reserved id this side can now decode.
    pub fn learn(&self, assembly: &Assembly, entries: &[TypeEntry]) -> Result<Vec<u16>> {
        let mut tables = self.write()?;
        for entry in entries {
            if ids::is_reserved(entry.id) {
                return Err(ProtocolError::UnknownPacketType(entry.id));
            }
            let descriptor = assembly.find(&entry.name).ok_or_else(|| {
                ProtocolError::AssemblyNotFound(format!("{}::{}", assembly.name(), entry.name))
            })?;
            if let Some(previous) = tables.remote_by_id.insert(entry.id, *descriptor) {
                if previous != *descriptor {
                    warn!(
                        wire_id = entry.id,
                        old = previous.name(),
                        new = descriptor.name(),
                        "Peer remapped wire id"
                    );
                }
            }
        }

        let mut known: Vec<u16> = tables
            .remote_by_id
            .keys()
            .copied()
            .filter(|id| !ids::is_reserved(*id))
            .collect();
        known.sort_unstable();
        Ok(known)
    }

    /// Mark the local ids in `known` as acknowledged by the peer.
    ///
    /// Ids this side never assigned are ignored. Returns how many ids were
    /// newly confirmed.
    pub fn confirm(&self, known: &[u16]) -> Result<usize> {
        let mut tables = self.write()?;
        let mut added = 0;
        for id in known {
            if tables.local_by_id.contains_key(id) && tables.confirmed.insert(*id) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Non-reserved ids this side can decode
    pub fn remote_ids(&self) -> Result<Vec<u16>> {
        let mut ids: Vec<u16> = self
            .read()?
            .remote_by_id
            .keys()
            .copied()
            .filter(|id| !ids::is_reserved(*id))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
