//! Assemblies group packet types that are introduced to a peer together.
//!
//! The type-sync protocol only transmits an assembly name and the sender's
//! wire ids; the receiving process resolves the name against its own
//! [`AssemblyCatalog`]. Both processes therefore need to declare the same
//! assemblies with the same packet names.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::packet::{Packet, PacketDescriptor};

/// A named, ordered group of packet types
#[derive(Debug, Clone)]
pub struct Assembly {
    name: String,
    packets: Vec<PacketDescriptor>,
}

impl Assembly {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            packets: Vec::new(),
        }
    }

    /// Add packet type `T`. Adding the same type twice keeps the first position.
    pub fn with<T: Packet>(mut self) -> Self {
        let descriptor = PacketDescriptor::of::<T>();
        if !self.packets.contains(&descriptor) {
            self.packets.push(descriptor);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn packets(&self) -> &[PacketDescriptor] {
        &self.packets
    }

    pub fn find(&self, name: &str) -> Option<&PacketDescriptor> {
        self.packets.iter().find(|d| d.name() == name)
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.packets.iter().any(|d| d.type_id() == type_id)
    }
}

#[derive(Debug, Default)]
struct CatalogInner {
    by_name: HashMap<String, Arc<Assembly>>,
    by_type: HashMap<TypeId, Arc<Assembly>>,
}

/// Process-wide set of known assemblies, shared by every connection created
/// with it. Cloning shares the same catalog.
#[derive(Debug, Clone, Default)]
pub struct AssemblyCatalog {
    inner: Arc<RwLock<CatalogInner>>,
}

impl AssemblyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-filled with `assemblies`
    pub fn with_assemblies(assemblies: impl IntoIterator<Item = Assembly>) -> Result<Self> {
        let catalog = Self::new();
        for assembly in assemblies {
            catalog.add(assembly)?;
        }
        Ok(catalog)
    }

    /// Register an assembly.
    ///
    /// Fails if the name is taken or one of its packet types already belongs
    /// to another assembly, since a type must resolve to exactly one assembly.
    pub fn add(&self, assembly: Assembly) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| ProtocolError::poisoned(constants::ERR_CATALOG_LOCK))?;

        if inner.by_name.contains_key(assembly.name()) {
            return Err(ProtocolError::ConfigError(format!(
                "assembly `{}` is already registered",
                assembly.name()
            )));
        }

        if let Some(clash) = assembly
            .packets()
            .iter()
            .find(|d| inner.by_type.contains_key(&d.type_id()))
        {
            return Err(ProtocolError::ConfigError(format!(
                "packet `{}` already belongs to another assembly",
                clash.name()
            )));
        }

        debug!(
            assembly = assembly.name(),
            packets = assembly.packets().len(),
            "Assembly registered"
        );

        let assembly = Arc::new(assembly);
        for descriptor in assembly.packets() {
            inner.by_type.insert(descriptor.type_id(), assembly.clone());
        }
        inner.by_name.insert(assembly.name().to_string(), assembly);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<Arc<Assembly>>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| ProtocolError::poisoned(constants::ERR_CATALOG_LOCK))?;
        Ok(inner.by_name.get(name).cloned())
    }

    /// The assembly packet type `type_id` belongs to
    pub fn assembly_of(&self, type_id: TypeId) -> Result<Option<Arc<Assembly>>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| ProtocolError::poisoned(constants::ERR_CATALOG_LOCK))?;
        Ok(inner.by_type.get(&type_id).cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.by_name.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
