//! PBKDF2-based credential hashing with a versioned encoded form.
//!
//! Credentials are hashed with PBKDF2-HMAC-SHA256 over a random 32-byte
//! salt. The encoded form is `base64([version:1][salt:32][hash:32])`,
//! 65 bytes before encoding and 88 Base64 characters after. Verification
//! recomputes the digest and compares in constant time; unknown versions
//! are rejected outright.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

/// PBKDF2 iteration count.
pub const ITERATIONS: u32 = 310_000;

/// Salt size in bytes.
pub const SALT_SIZE: usize = 32;

/// Derived key size in bytes.
pub const HASH_SIZE: usize = 32;

/// Current encoding version.
pub const VERSION: u8 = 2;

/// Length of the Base64 encoded form: 65 raw bytes round up to 88 chars.
pub const ENCODED_LEN: usize = 88;

const RAW_LEN: usize = 1 + SALT_SIZE + HASH_SIZE;

/// Errors from decoding or verifying an encoded credential.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Input is not valid Base64 or has the wrong decoded length.
    #[error("invalid credential encoding")]
    InvalidEncoding,

    /// Version byte is not one this build can verify.
    #[error("unsupported credential version: {0}")]
    UnsupportedVersion(u8),
}

/// A salt and derived hash pair.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    /// Random salt the hash was derived under.
    pub salt: [u8; SALT_SIZE],
    /// PBKDF2 output.
    pub hash: [u8; HASH_SIZE],
}

impl CredentialRecord {
    /// Encode as `base64([version][salt][hash])`.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut raw = [0u8; RAW_LEN];
        raw[0] = VERSION;
        raw[1..1 + SALT_SIZE].copy_from_slice(&self.salt);
        raw[1 + SALT_SIZE..].copy_from_slice(&self.hash);
        STANDARD.encode(raw)
    }

    /// Decode from the versioned Base64 form.
    ///
    /// # Errors
    ///
    /// - `CredentialError::InvalidEncoding` on malformed Base64 or wrong
    ///   length
    /// - `CredentialError::UnsupportedVersion` on any version byte other
    ///   than [`VERSION`]
    pub fn decode(encoded: &str) -> Result<Self, CredentialError> {
        let raw = STANDARD.decode(encoded).map_err(|_| CredentialError::InvalidEncoding)?;
        if raw.len() != RAW_LEN {
            return Err(CredentialError::InvalidEncoding);
        }
        if raw[0] != VERSION {
            return Err(CredentialError::UnsupportedVersion(raw[0]));
        }

        let mut salt = [0u8; SALT_SIZE];
        let mut hash = [0u8; HASH_SIZE];
        salt.copy_from_slice(&raw[1..1 + SALT_SIZE]);
        hash.copy_from_slice(&raw[1 + SALT_SIZE..]);
        Ok(Self { salt, hash })
    }
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print hash material
        f.debug_struct("CredentialRecord").finish_non_exhaustive()
    }
}

/// Hash a credential under a fresh random salt.
#[must_use]
pub fn hash_credential(credential: &[u8]) -> CredentialRecord {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    CredentialRecord { salt, hash: derive(credential, &salt) }
}

/// Verify a credential against a salt and expected hash.
///
/// Comparison is constant-time over the full digest.
#[must_use]
pub fn verify_credential(credential: &[u8], salt: &[u8; SALT_SIZE], hash: &[u8; HASH_SIZE]) -> bool {
    let computed = Zeroizing::new(derive(credential, salt));
    computed[..].ct_eq(&hash[..]).into()
}

/// Verify a credential against its encoded form.
///
/// # Errors
///
/// Propagates decoding failures; a well-formed encoding with a wrong
/// credential returns `Ok(false)`.
pub fn verify_encoded(credential: &[u8], encoded: &str) -> Result<bool, CredentialError> {
    let record = CredentialRecord::decode(encoded)?;
    Ok(verify_credential(credential, &record.salt, &record.hash))
}

fn derive(credential: &[u8], salt: &[u8]) -> [u8; HASH_SIZE] {
    let mut out = [0u8; HASH_SIZE];
    pbkdf2_hmac::<Sha256>(credential, salt, ITERATIONS, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // The full iteration count makes each hash slow; derive one record and
    // share it across assertions.
    fn record() -> (&'static [u8], CredentialRecord) {
        let credential = b"correct horse battery staple".as_slice();
        (credential, hash_credential(credential))
    }

    #[test]
    fn verify_accepts_matching_credential() {
        let (credential, record) = record();
        assert!(verify_credential(credential, &record.salt, &record.hash));
        assert!(!verify_credential(b"wrong credential", &record.salt, &record.hash));

        let encoded = record.encode();
        assert_eq!(encoded.len(), ENCODED_LEN);
        assert!(verify_encoded(credential, &encoded).unwrap());
        assert!(!verify_encoded(b"wrong credential", &encoded).unwrap());
    }

    #[test]
    fn salts_are_unique_per_hash() {
        let a = hash_credential(b"x");
        let b = hash_credential(b"x");
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn encode_decode_round_trip() {
        let (_, record) = record();
        let decoded = CredentialRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded.salt, record.salt);
        assert_eq!(decoded.hash, record.hash);
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let (_, record) = record();
        let mut raw = [0u8; 65];
        raw[0] = 3;
        raw[1..33].copy_from_slice(&record.salt);
        raw[33..].copy_from_slice(&record.hash);
        let encoded = STANDARD.encode(raw);

        assert_eq!(
            CredentialRecord::decode(&encoded),
            Err(CredentialError::UnsupportedVersion(3))
        );
    }

    #[test]
    fn decode_rejects_malformed_input() {
        assert_eq!(CredentialRecord::decode("not base64!!"), Err(CredentialError::InvalidEncoding));
        assert_eq!(
            CredentialRecord::decode(&STANDARD.encode([0u8; 10])),
            Err(CredentialError::InvalidEncoding)
        );
    }
}
