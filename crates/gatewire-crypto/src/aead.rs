//! Authenticated payload encryption.
//!
//! Both supported suites are ChaCha20-Poly1305 variants; the wider
//! XChaCha nonce is the default because packet keys are long-lived
//! (negotiated once per connection) and random nonces need the extra
//! margin. Output layout is `[nonce][ciphertext+tag]`, so the pipeline can
//! treat sealed payloads as opaque bytes.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce, XChaCha20Poly1305, XNonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use thiserror::Error;
use zeroize::Zeroizing;

/// Key size shared by both suites, in bytes.
pub const KEY_SIZE: usize = 32;

/// Poly1305 tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Errors from sealing or opening a payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AeadError {
    /// Key is not [`KEY_SIZE`] bytes.
    #[error("invalid key length: {0} (expected {KEY_SIZE})")]
    InvalidKeyLength(usize),

    /// Ciphertext is shorter than its nonce prefix plus tag.
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    /// The AEAD backend rejected the plaintext.
    #[error("encryption failed")]
    EncryptFailed,

    /// Authentication failed: wrong key or tampered ciphertext.
    #[error("decryption failed")]
    DecryptFailed,
}

/// Negotiated cipher suite for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CipherSuite {
    /// XChaCha20-Poly1305 with a 24-byte random nonce.
    #[default]
    XChaCha20Poly1305 = 0,
    /// ChaCha20-Poly1305 with a 12-byte random nonce.
    ChaCha20Poly1305 = 1,
}

impl CipherSuite {
    /// Nonce size for this suite, in bytes.
    #[must_use]
    pub const fn nonce_size(self) -> usize {
        match self {
            Self::XChaCha20Poly1305 => 24,
            Self::ChaCha20Poly1305 => 12,
        }
    }
}

/// Encrypt `plaintext`, producing `[nonce][ciphertext+tag]`.
///
/// A fresh random nonce is generated per call.
///
/// # Errors
///
/// - `AeadError::InvalidKeyLength` when `key` is not 32 bytes
/// - `AeadError::EncryptFailed` when the backend rejects the plaintext
pub fn seal(suite: CipherSuite, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, AeadError> {
    let key = checked_key(key)?;

    let mut out = Vec::with_capacity(suite.nonce_size() + plaintext.len() + TAG_SIZE);
    match suite {
        CipherSuite::XChaCha20Poly1305 => {
            let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
            let cipher = XChaCha20Poly1305::new((&*key).into());
            let ciphertext =
                cipher.encrypt(&nonce, plaintext).map_err(|_| AeadError::EncryptFailed)?;
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&ciphertext);
        },
        CipherSuite::ChaCha20Poly1305 => {
            let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
            let cipher = ChaCha20Poly1305::new((&*key).into());
            let ciphertext =
                cipher.encrypt(&nonce, plaintext).map_err(|_| AeadError::EncryptFailed)?;
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&ciphertext);
        },
    }
    Ok(out)
}

/// Decrypt `[nonce][ciphertext+tag]` produced by [`seal`].
///
/// # Errors
///
/// - `AeadError::InvalidKeyLength` when `key` is not 32 bytes
/// - `AeadError::CiphertextTooShort` when the input cannot hold a nonce
///   and tag
/// - `AeadError::DecryptFailed` on authentication failure
pub fn open(suite: CipherSuite, key: &[u8], sealed: &[u8]) -> Result<Vec<u8>, AeadError> {
    let key = checked_key(key)?;

    let nonce_size = suite.nonce_size();
    if sealed.len() < nonce_size + TAG_SIZE {
        return Err(AeadError::CiphertextTooShort(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(nonce_size);

    match suite {
        CipherSuite::XChaCha20Poly1305 => {
            let cipher = XChaCha20Poly1305::new((&*key).into());
            cipher
                .decrypt(XNonce::from_slice(nonce), ciphertext)
                .map_err(|_| AeadError::DecryptFailed)
        },
        CipherSuite::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new((&*key).into());
            cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| AeadError::DecryptFailed)
        },
    }
}

fn checked_key(key: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>, AeadError> {
    let bytes: [u8; KEY_SIZE] =
        key.try_into().map_err(|_| AeadError::InvalidKeyLength(key.len()))?;
    Ok(Zeroizing::new(bytes))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const KEY: [u8; KEY_SIZE] = [7u8; KEY_SIZE];

    #[test]
    fn seal_open_round_trip_both_suites() {
        for suite in [CipherSuite::XChaCha20Poly1305, CipherSuite::ChaCha20Poly1305] {
            let sealed = seal(suite, &KEY, b"secret payload").unwrap();
            assert_eq!(sealed.len(), suite.nonce_size() + 14 + TAG_SIZE);

            let opened = open(suite, &KEY, &sealed).unwrap();
            assert_eq!(opened, b"secret payload");
        }
    }

    #[test]
    fn open_rejects_wrong_key() {
        let sealed = seal(CipherSuite::XChaCha20Poly1305, &KEY, b"data").unwrap();
        let wrong = [8u8; KEY_SIZE];
        assert_eq!(
            open(CipherSuite::XChaCha20Poly1305, &wrong, &sealed),
            Err(AeadError::DecryptFailed)
        );
    }

    #[test]
    fn open_rejects_tampered_ciphertext() {
        let mut sealed = seal(CipherSuite::ChaCha20Poly1305, &KEY, b"data").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(open(CipherSuite::ChaCha20Poly1305, &KEY, &sealed), Err(AeadError::DecryptFailed));
    }

    #[test]
    fn short_inputs_are_rejected_structurally() {
        assert_eq!(
            open(CipherSuite::XChaCha20Poly1305, &KEY, &[0u8; 10]),
            Err(AeadError::CiphertextTooShort(10))
        );
        assert_eq!(seal(CipherSuite::XChaCha20Poly1305, &[1u8; 16], b""),
            Err(AeadError::InvalidKeyLength(16)));
    }

    proptest! {
        #[test]
        fn round_trip_is_identity(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
            let sealed = seal(CipherSuite::XChaCha20Poly1305, &KEY, &payload).unwrap();
            // Nonce is random, so sealing twice never yields the same bytes
            let sealed_again = seal(CipherSuite::XChaCha20Poly1305, &KEY, &payload).unwrap();
            prop_assert_ne!(&sealed, &sealed_again);

            prop_assert_eq!(open(CipherSuite::XChaCha20Poly1305, &KEY, &sealed).unwrap(), payload);
        }
    }
}
