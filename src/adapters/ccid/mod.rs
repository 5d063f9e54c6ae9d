//! USB CCID (Chip Card Interface Device) transport.
//!
//! The CCID protocol uses USB bulk transfers:
//! - Bulk OUT endpoint: host sends commands (APDUs) to the card
//! - Bulk IN endpoint: card sends responses back to the host
//!
//! [`CcidFramer`] implements the message framing over any [`BulkPipe`];
//! [`CcidTransport`] binds it to a real device through `rusb`.

pub mod framing;

#[cfg(feature = "direct-usb")]
pub mod transport;

pub use framing::{BulkPipe, CcidFramer};

#[cfg(feature = "direct-usb")]
pub use transport::{CcidTransport, RusbPipe};
