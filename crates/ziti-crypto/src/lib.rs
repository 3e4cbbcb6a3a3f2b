//! # Ziti Crypto
//!
//! Cryptographic primitives protecting Ziti virtual connection payloads.
//!
//! Session keys come from X25519 agreement with the edge router, so the
//! protection covers the hop between the SDK and that router. The router
//! holds the same keys and can read the payloads.
//!
//! This crate provides:
//! - `secretstream_xchacha20poly1305` push/pull states, wire compatible with
//!   libsodium's `crypto_secretstream_xchacha20poly1305`
//! - The per-connection [`SecretStream`] (eager push state, lazy pull state)
//! - X25519 key agreement with edge routers
//! - Per-connection session key derivation
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | Stream Cipher | XChaCha20 (HChaCha20 subkey) | 256-bit key |
//! | MAC | Poly1305 | 128-bit |
//! | KDF | BLAKE3 `derive_key` | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod kx;
pub mod random;
pub mod secret_stream;

pub use error::CryptoError;
pub use kx::{KxKeyPair, KxRole, SharedKeys};
pub use secret_stream::{ABYTES, HBYTES, KEYBYTES, SecretStream, StreamState, Tag};

/// X25519 public key size
pub const KX_PUBLIC_KEY_SIZE: usize = 32;

/// Session keys for one virtual connection.
///
/// `tx` protects the local-to-peer direction, `rx` the peer-to-local one.
#[derive(Clone, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct SessionPair {
    tx: [u8; KEYBYTES],
    rx: [u8; KEYBYTES],
}

impl SessionPair {
    /// Build a pair from raw key bytes.
    #[must_use]
    pub fn new(tx: [u8; KEYBYTES], rx: [u8; KEYBYTES]) -> Self {
        Self { tx, rx }
    }

    /// Key for data this side sends.
    #[must_use]
    pub fn tx(&self) -> &[u8; KEYBYTES] {
        &self.tx
    }

    /// Key for data this side receives.
    #[must_use]
    pub fn rx(&self) -> &[u8; KEYBYTES] {
        &self.rx
    }

    /// The same keys seen from the other end of the connection.
    #[must_use]
    pub fn swapped(&self) -> Self {
        Self {
            tx: self.rx,
            rx: self.tx,
        }
    }
}

impl std::fmt::Debug for SessionPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPair").finish_non_exhaustive()
    }
}
