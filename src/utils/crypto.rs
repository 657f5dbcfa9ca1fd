//! XChaCha20-Poly1305 AEAD used for encrypted frames.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use zeroize::Zeroize;

use crate::error::{ProtocolError, Result};

/// Nonce length of XChaCha20-Poly1305
pub const NONCE_SIZE: usize = 24;

pub struct Crypto {
    cipher: XChaCha20Poly1305,
}

impl Crypto {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| ProtocolError::EncryptionFailure)
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }

    /// Fresh random nonce from the OS RNG
    pub fn generate_nonce() -> Result<[u8; NONCE_SIZE]> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce).map_err(|_| ProtocolError::EncryptionFailure)?;
        Ok(nonce)
    }

    /// Encrypt under a fresh nonce and prepend it: `[nonce][ciphertext]`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = Self::generate_nonce()?;
        let ciphertext = self.encrypt(plaintext, &nonce)?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend(ciphertext);
        nonce.zeroize();
        Ok(out)
    }

    /// Inverse of [`Crypto::seal`]
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);
        let plaintext = self.decrypt(ciphertext, &nonce);
        nonce.zeroize();
        plaintext
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let crypto = Crypto::new(&[0x42; 32]);
        let sealed = crypto.seal(b"frame payload").expect("seal");
        assert_ne!(&sealed[NONCE_SIZE..], b"frame payload");
        assert_eq!(crypto.open(&sealed).expect("open"), b"frame payload");
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let sealed = Crypto::new(&[1; 32]).seal(b"secret").unwrap();
        assert!(matches!(
            Crypto::new(&[2; 32]).open(&sealed),
            Err(ProtocolError::DecryptionFailure)
        ));
    }

    #[test]
    fn test_open_short_input() {
        let crypto = Crypto::new(&[0; 32]);
        assert!(crypto.open(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_nonce_uniqueness() {
        let a = Crypto::generate_nonce().unwrap();
        let b = Crypto::generate_nonce().unwrap();
        assert_ne!(a, b);
    }
}
