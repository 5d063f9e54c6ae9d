//! Lock-code key derivation.

use crate::domain::constants::{LOCK_KEY_ITERATIONS, LOCK_KEY_LENGTH};
use sha1::Sha1;

/// Derive the applet access key from a user password.
///
/// `PBKDF2-HMAC-SHA1(password, salt = device id, 1000 rounds, 16 bytes)`.
/// An empty password yields an empty secret, meaning "no lock code".
#[must_use]
pub fn derive_lock_key(password: &str, device_id: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let mut key = vec![0u8; LOCK_KEY_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), device_id, LOCK_KEY_ITERATIONS, &mut key);
    key
}
