//! Hash algorithm domain type.
//!
//! Provides the `HashAlgorithm` enumeration stored with each OATH
//! credential, together with the HMAC key preparation the applet expects.

use crate::domain::constants::MIN_KEY_LENGTH;
use crate::infra::error::{OathError, OathResult};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

/// HMAC hash algorithms supported by the OATH applet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Low nibble used on the wire.
    #[must_use]
    pub fn value(self) -> u8 {
        match self {
            HashAlgorithm::Sha1 => 0x01,
            HashAlgorithm::Sha256 => 0x02,
            HashAlgorithm::Sha512 => 0x03,
        }
    }

    /// Decode the low nibble of a type/algorithm byte.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Protocol`] for unknown values.
    pub fn from_value(value: u8) -> OathResult<Self> {
        match value {
            0x01 => Ok(HashAlgorithm::Sha1),
            0x02 => Ok(HashAlgorithm::Sha256),
            0x03 => Ok(HashAlgorithm::Sha512),
            other => Err(OathError::Protocol(format!(
                "unknown hash algorithm 0x{other:02x}"
            ))),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// HMAC block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 | HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }

    /// Hash `data` with this algorithm.
    #[must_use]
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// Compute `HMAC(key, data)` with this algorithm.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::InvalidInput`] if the key is rejected by the MAC.
    pub fn hmac(&self, key: &[u8], data: &[u8]) -> OathResult<Vec<u8>> {
        match self {
            HashAlgorithm::Sha1 => mac::<Hmac<Sha1>>(key, data),
            HashAlgorithm::Sha256 => mac::<Hmac<Sha256>>(key, data),
            HashAlgorithm::Sha512 => mac::<Hmac<Sha512>>(key, data),
        }
    }

    /// Shape a credential key the way the applet stores it.
    ///
    /// Keys shorter than 14 bytes are zero padded to 14; keys longer than the
    /// block size are replaced by their digest. Anything else is unchanged.
    #[must_use]
    pub fn prepare_key(&self, key: &[u8]) -> Vec<u8> {
        if key.len() < MIN_KEY_LENGTH {
            let mut padded = key.to_vec();
            padded.resize(MIN_KEY_LENGTH, 0);
            padded
        } else if key.len() > self.block_size() {
            self.digest(key)
        } else {
            key.to_vec()
        }
    }
}

/// `HMAC-SHA1`, used by the lock-code challenge-response.
///
/// # Errors
///
/// See [`HashAlgorithm::hmac`].
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> OathResult<Vec<u8>> {
    HashAlgorithm::Sha1.hmac(key, data)
}

fn mac<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> OathResult<Vec<u8>> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|e| OathError::InvalidInput(format!("HMAC key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

impl FromStr for HashAlgorithm {
    type Err = OathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(OathError::InvalidInput(format!(
                "Unsupported hash algorithm: {other}"
            ))),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}
