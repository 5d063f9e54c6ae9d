//! Pure protocol types and codecs.
//!
//! Nothing in here performs I/O; every module can be exercised with plain
//! byte buffers.

pub mod apdu;
pub mod constants;
pub mod credential_data;
pub mod crypto;
pub mod oath;
pub mod tlv;
