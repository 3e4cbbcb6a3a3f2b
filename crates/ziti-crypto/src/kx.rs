//! X25519 key agreement with edge routers.
//!
//! Each channel carries one ephemeral exchange: the client's public key in
//! HELLO, the router's in the HELLO result. Per-connection [`SessionPair`]s
//! are then derived from the shared secret, both public keys, and the
//! connection id, so no two virtual connections on a channel share keys.

use rand_core::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, KEYBYTES, KX_PUBLIC_KEY_SIZE, SessionPair};

const CLIENT_TO_ROUTER_CONTEXT: &str = "ziti-sdk 2024 secretstream client-to-router";
const ROUTER_TO_CLIENT_CONTEXT: &str = "ziti-sdk 2024 secretstream router-to-client";

/// Which end of the channel holds the key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KxRole {
    /// The SDK side, which sends HELLO
    Client,
    /// The edge router side
    Router,
}

/// Ephemeral X25519 key pair for one channel.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KxKeyPair {
    secret: x25519_dalek::StaticSecret,
}

impl KxKeyPair {
    /// Generate a new key pair from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            secret: x25519_dalek::StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Import a private key.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: x25519_dalek::StaticSecret::from(bytes),
        }
    }

    /// Public half to send to the peer.
    #[must_use]
    pub fn public_key(&self) -> [u8; KX_PUBLIC_KEY_SIZE] {
        x25519_dalek::PublicKey::from(&self.secret).to_bytes()
    }

    /// Agree on shared keys with the peer's public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if `peer` is not 32 bytes or
    /// is a low-order point.
    pub fn agree(&self, peer: &[u8], role: KxRole) -> Result<SharedKeys, CryptoError> {
        let peer: [u8; KX_PUBLIC_KEY_SIZE] =
            peer.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        let shared = self
            .secret
            .diffie_hellman(&x25519_dalek::PublicKey::from(peer));

        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }

        let own = self.public_key();
        let (client_pk, router_pk) = match role {
            KxRole::Client => (own, peer),
            KxRole::Router => (peer, own),
        };

        Ok(SharedKeys {
            shared: *shared.as_bytes(),
            client_pk,
            router_pk,
            role,
        })
    }
}

impl std::fmt::Debug for KxKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KxKeyPair")
            .field("public", &hex_prefix(&self.public_key()))
            .finish_non_exhaustive()
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// Result of a channel key agreement.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKeys {
    shared: [u8; 32],
    client_pk: [u8; KX_PUBLIC_KEY_SIZE],
    router_pk: [u8; KX_PUBLIC_KEY_SIZE],
    #[zeroize(skip)]
    role: KxRole,
}

impl SharedKeys {
    /// Keys for the virtual connection `conn_id`, oriented for this side.
    #[must_use]
    pub fn session_pair(&self, conn_id: u32) -> SessionPair {
        let c2r = self.derive(CLIENT_TO_ROUTER_CONTEXT, conn_id);
        let r2c = self.derive(ROUTER_TO_CLIENT_CONTEXT, conn_id);
        match self.role {
            KxRole::Client => SessionPair::new(c2r, r2c),
            KxRole::Router => SessionPair::new(r2c, c2r),
        }
    }

    fn derive(&self, context: &str, conn_id: u32) -> [u8; KEYBYTES] {
        let mut hasher = blake3::Hasher::new_derive_key(context);
        hasher.update(&self.shared);
        hasher.update(&self.client_pk);
        hasher.update(&self.router_pk);
        hasher.update(&conn_id.to_be_bytes());
        *hasher.finalize().as_bytes()
    }
}

impl std::fmt::Debug for SharedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKeys")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}
