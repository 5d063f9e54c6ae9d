//! Service layer module root.
//! Contains the APDU exchange, the OATH applet session and the client built
//! on top of it.

pub mod apdu;
pub mod client;
pub mod oath;

pub use apdu::{ApduConnection, Logging};
pub use client::{device_id_string, Code, DeviceInfo, OathClient, StoredCredential};
pub use oath::{OathSession, SessionState};
