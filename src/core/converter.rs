//! Packet converters turn packets into frame payloads and back.
//!
//! The engine only relies on the [`PacketConverter`] contract, so a connection
//! can be given any implementation. [`FormatConverter`] is the default;
//! [`SecureConverter`] wraps another converter and adds a status byte that
//! says whether the rest of the payload is encrypted, which lets frames sent
//! before the key exchange finishes stay readable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;
use zeroize::Zeroize;

use crate::core::serialization::SerializationFormat;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::packet::{AnyPacket, PacketDescriptor};
use crate::utils::crypto::Crypto;

/// Status byte of a plaintext payload
pub const STATUS_PLAIN: u8 = 0x00;
/// Status byte of an encrypted payload
pub const STATUS_ENCRYPTED: u8 = 0x01;

pub trait PacketConverter: Send + Sync {
    fn serialize(&self, packet: &dyn AnyPacket) -> Result<Vec<u8>>;

    fn deserialize(
        &self,
        descriptor: &PacketDescriptor,
        payload: &[u8],
    ) -> Result<Box<dyn AnyPacket>>;
}

/// Converter backed by one of the serde [`SerializationFormat`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatConverter {
    format: SerializationFormat,
}

impl FormatConverter {
    pub fn new(format: SerializationFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }
}

impl PacketConverter for FormatConverter {
    fn serialize(&self, packet: &dyn AnyPacket) -> Result<Vec<u8>> {
        packet.encode(self.format)
    }

    fn deserialize(
        &self,
        descriptor: &PacketDescriptor,
        payload: &[u8],
    ) -> Result<Box<dyn AnyPacket>> {
        descriptor.decode(payload, self.format)
    }
}

/// Converter that encrypts payloads once a session key is installed and
/// outbound encryption has been switched on.
pub struct SecureConverter {
    inner: Arc<dyn PacketConverter>,
    crypto: RwLock<Option<Arc<Crypto>>>,
    outbound: AtomicBool,
}

impl SecureConverter {
    pub fn new(inner: Arc<dyn PacketConverter>) -> Self {
        Self {
            inner,
            crypto: RwLock::new(None),
            outbound: AtomicBool::new(false),
        }
    }

    /// Install the session key. Encrypted payloads can be read from now on.
    pub fn install_key(&self, mut key: [u8; 32]) -> Result<()> {
        let crypto = Arc::new(Crypto::new(&key));
        key.zeroize();
        let mut slot = self
            .crypto
            .write()
            .map_err(|_| ProtocolError::poisoned("session key"))?;
        *slot = Some(crypto);
        debug!("Session key installed");
        Ok(())
    }

    /// Encrypt every payload serialized after this call
    pub fn enable_outbound(&self) {
        self.outbound.store(true, Ordering::Release);
    }

    pub fn has_key(&self) -> bool {
        self.crypto.read().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub fn is_outbound_encrypted(&self) -> bool {
        self.outbound.load(Ordering::Acquire) && self.has_key()
    }

    fn crypto(&self) -> Result<Option<Arc<Crypto>>> {
        Ok(self
            .crypto
            .read()
            .map_err(|_| ProtocolError::poisoned("session key"))?
            .clone())
    }
}

impl PacketConverter for SecureConverter {
    fn serialize(&self, packet: &dyn AnyPacket) -> Result<Vec<u8>> {
        let plain = self.inner.serialize(packet)?;
        let crypto = if self.outbound.load(Ordering::Acquire) {
            self.crypto()?
        } else {
            None
        };

        match crypto {
            Some(crypto) => {
                let sealed = crypto.seal(&plain)?;
                let mut out = Vec::with_capacity(sealed.len() + 1);
                out.push(STATUS_ENCRYPTED);
                out.extend(sealed);
                Ok(out)
            }
            None => {
                let mut out = Vec::with_capacity(plain.len() + 1);
                out.push(STATUS_PLAIN);
                out.extend(plain);
                Ok(out)
            }
        }
    }

    fn deserialize(
        &self,
        descriptor: &PacketDescriptor,
        payload: &[u8],
    ) -> Result<Box<dyn AnyPacket>> {
        let (status, body) = payload.split_first().ok_or_else(|| {
            ProtocolError::DeserializeError(constants::ERR_EMPTY_PAYLOAD.to_string())
        })?;

        match *status {
            STATUS_PLAIN => self.inner.deserialize(descriptor, body),
            STATUS_ENCRYPTED => {
                let crypto = self.crypto()?.ok_or_else(|| {
                    ProtocolError::HandshakeError(constants::ERR_NO_SESSION_KEY.to_string())
                })?;
                let plain = crypto.open(body)?;
                self.inner.deserialize(descriptor, &plain)
            }
            other => Err(ProtocolError::DeserializeError(format!(
                "unknown payload status byte {other:#04x}"
            ))),
        }
    }
}
