//! Adapter layer modules for talking to physical tokens.
//!
//! Provides:
//! - The [`Transport`] channel contract shared by every link
//! - USB CCID framing and a direct `rusb` backend
//! - NFC ISO-DEP wrapping for platform-supplied tags

pub mod ccid;
pub mod nfc;
pub mod transport;

pub use transport::{Transport, TransportKind};
