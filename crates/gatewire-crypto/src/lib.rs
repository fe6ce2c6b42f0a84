//! Gatewire cryptographic primitives.
//!
//! Three independent building blocks, each a set of pure functions with
//! explicit inputs:
//!
//! - [`credential`]: PBKDF2-based salted credential hashing with a
//!   versioned encoded form, for authenticating peers out of band.
//! - [`aead`]: authenticated payload encryption under a negotiated cipher
//!   suite. Nonces are generated per call and carried as a ciphertext
//!   prefix, so the packet pipeline treats the whole output as opaque
//!   bytes.
//! - [`compress`]: bounded DEFLATE compression for payloads past the
//!   transport thresholds.
//!
//! # Security
//!
//! - Credential verification compares digests in constant time; a
//!   mismatched credential and a mismatched length take the same path.
//! - Key material passed into the AEAD layer is copied into zeroizing
//!   buffers before use.
//! - Decompression output is capped by the caller-provided limit so a
//!   hostile peer cannot inflate a small datagram into unbounded memory.

#![forbid(unsafe_code)]

pub mod aead;
pub mod compress;
pub mod credential;

pub use aead::{AeadError, CipherSuite, open, seal};
pub use compress::{CompressError, compress, decompress};
pub use credential::{
    CredentialError, CredentialRecord, ENCODED_LEN, HASH_SIZE, ITERATIONS, SALT_SIZE, VERSION,
    hash_credential, verify_credential, verify_encoded,
};
