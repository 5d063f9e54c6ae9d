//! Cryptographic building blocks for OATH credentials.
//!
//! Provides:
//! - Hash algorithms, HMAC and the applet's key preparation rule
//! - RFC 4226 dynamic truncation into decimal (or Steam) codes
//! - PBKDF2 derivation of the applet lock code from a password

mod hash;
mod kdf;
mod otp;

pub use hash::{hmac_sha1, HashAlgorithm};
pub use kdf::derive_lock_key;
pub use otp::{
    code_from_digest, code_from_truncated, dynamic_truncate, format_code, steam_code,
};
