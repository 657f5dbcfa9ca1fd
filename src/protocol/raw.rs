//! Raw data packets carry a string key and an opaque byte payload, for
//! sending single primitive values without declaring a packet type.
//!
//! Numbers use their native-endian fixed-width representation, strings are
//! UTF-8. Both peers are expected to run on the same endianness.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::protocol::packet::PacketHeader;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawData {
    pub header: PacketHeader,
    pub key: String,
    pub data: Vec<u8>,
}

impl RawData {
    pub fn new(key: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            header: PacketHeader::default(),
            key: key.into(),
            data,
        }
    }

    /// Build a raw packet holding `value` under `key`
    pub fn encode<T: RawValue>(key: impl Into<String>, value: T) -> Self {
        Self::new(key, value.to_raw())
    }

    /// Interpret the payload as a `T`
    pub fn decode<T: RawValue>(&self) -> Result<T> {
        T::from_raw(&self.data)
    }
}

/// Values that have a fixed raw byte representation
pub trait RawValue: Sized {
    fn to_raw(&self) -> Vec<u8>;

    fn from_raw(data: &[u8]) -> Result<Self>;
}

fn fixed<const N: usize>(data: &[u8], type_name: &'static str) -> Result<[u8; N]> {
    data.try_into().map_err(|_| {
        ProtocolError::DeserializeError(format!(
            "raw {type_name} needs {N} bytes, got {}",
            data.len()
        ))
    })
}

macro_rules! raw_number {
    ($($ty:ty),* $(,)?) => {
        $(
            impl RawValue for $ty {
                fn to_raw(&self) -> Vec<u8> {
                    self.to_ne_bytes().to_vec()
                }

                fn from_raw(data: &[u8]) -> Result<Self> {
                    Ok(<$ty>::from_ne_bytes(fixed(data, stringify!($ty))?))
                }
            }
        )*
    };
}

raw_number!(i8, u8, i16, u16, i32, u32, i64, u64, i128, u128, f32, f64);

impl RawValue for bool {
    fn to_raw(&self) -> Vec<u8> {
        vec![u8::from(*self)]
    }

    fn from_raw(data: &[u8]) -> Result<Self> {
        let [byte] = fixed::<1>(data, "bool")?;
        Ok(byte != 0)
    }
}

impl RawValue for char {
    fn to_raw(&self) -> Vec<u8> {
        u32::from(*self).to_ne_bytes().to_vec()
    }

    fn from_raw(data: &[u8]) -> Result<Self> {
        let code = u32::from_ne_bytes(fixed(data, "char")?);
        char::from_u32(code).ok_or_else(|| {
            ProtocolError::DeserializeError(format!("invalid char code point {code:#x}"))
        })
    }
}

impl RawValue for String {
    fn to_raw(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_raw(data: &[u8]) -> Result<Self> {
        String::from_utf8(data.to_vec())
            .map_err(|e| ProtocolError::DeserializeError(format!("raw string: {e}")))
    }
}

impl RawValue for Vec<u8> {
    fn to_raw(&self) -> Vec<u8> {
        self.clone()
    }

    fn from_raw(data: &[u8]) -> Result<Self> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_numbers() {
        assert_eq!(RawData::encode("n", 42i32).decode::<i32>().unwrap(), 42);
        assert_eq!(RawData::encode("n", u64::MAX).decode::<u64>().unwrap(), u64::MAX);
        assert_eq!(RawData::encode("n", -1.5f64).decode::<f64>().unwrap(), -1.5);
    }

    #[test]
    fn test_width_mismatch() {
        let raw = RawData::encode("n", 7u16);
        assert!(raw.decode::<u32>().is_err());
    }

    #[test]
    fn test_text_and_flags() {
        let raw = RawData::encode("greeting", String::from("grüße"));
        assert_eq!(raw.key, "greeting");
        assert_eq!(raw.decode::<String>().unwrap(), "grüße");
        assert!(RawData::encode("flag", true).decode::<bool>().unwrap());
        assert_eq!(RawData::encode("c", 'λ').decode::<char>().unwrap(), 'λ');
    }

    #[test]
    fn test_invalid_utf8() {
        let raw = RawData::new("bad", vec![0xFF, 0xFE]);
        assert!(raw.decode::<String>().is_err());
    }
}
