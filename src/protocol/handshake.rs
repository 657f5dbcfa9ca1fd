//! Key exchange for encrypted connections using Elliptic Curve Diffie-Hellman
//! (x25519-dalek).
//!
//! The client side of a TCP connection initiates with a
//! [`KeyInformationRequest`]; the server answers with a
//! [`KeyInformationResponse`]. Both derive the same 32-byte session key from
//! the shared secret and both public keys.
//!
//! State is per connection: each exchange owns its ephemeral secret, which is
//! consumed when the key is derived.

use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};

use crate::error::{ProtocolError, Result};
use crate::protocol::builtin::{KeyInformationRequest, KeyInformationResponse};
use crate::protocol::packet::PacketHeader;

#[allow(unused_imports)]
use tracing::{debug, instrument};

/// Initiator-side state between sending the request and receiving the response
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: [u8; 32],
}

impl KeyExchange {
    fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }
}

/// Derive a session key from the shared secret, ordered as (initiator, responder)
fn derive_session_key(
    shared: &SharedSecret,
    initiator_public: &[u8; 32],
    responder_public: &[u8; 32],
) -> Result<[u8; 32]> {
    if !shared.was_contributory() {
        return Err(ProtocolError::HandshakeError(
            "peer sent a low-order public key".to_string(),
        ));
    }

    let mut hasher = Sha256::new();
    hasher.update(shared.as_bytes());
    hasher.update(b"initiator");
    hasher.update(initiator_public);
    hasher.update(b"responder");
    hasher.update(responder_public);
    Ok(hasher.finalize().into())
}

/// Start a key exchange.
///
/// # Returns
/// The initiator state and the request to send to the peer.
#[instrument]
pub fn initiate() -> (KeyExchange, KeyInformationRequest) {
    let state = KeyExchange::generate();
    let request = KeyInformationRequest {
        header: PacketHeader::default(),
        public_key: state.public,
    };
    debug!("Key exchange initiated");
    (state, request)
}

/// Answer a key exchange request.
///
/// # Returns
/// The response to send back and the derived session key.
#[instrument(skip(request))]
pub fn respond(request: &KeyInformationRequest) -> Result<(KeyInformationResponse, [u8; 32])> {
    let state = KeyExchange::generate();
    let shared = state
        .secret
        .diffie_hellman(&PublicKey::from(request.public_key));
    let key = derive_session_key(&shared, &request.public_key, &state.public)?;

    let response = KeyInformationResponse {
        header: PacketHeader::default(),
        public_key: state.public,
    };
    debug!("Key exchange answered");
    Ok((response, key))
}

/// Finish a key exchange on the initiator side
#[instrument(skip(state, response))]
pub fn complete(state: KeyExchange, response: &KeyInformationResponse) -> Result<[u8; 32]> {
    let initiator_public = state.public;
    let shared = state
        .secret
        .diffie_hellman(&PublicKey::from(response.public_key));
    let key = derive_session_key(&shared, &initiator_public, &response.public_key)?;
    debug!("Key exchange completed");
    Ok(key)
}
