//! NFC ISO-DEP transport.
//!
//! Tag discovery belongs to the platform; it hands over an [`IsoDepTag`]
//! and this module turns it into a [`Transport`]. The contactless stack does
//! its own framing, so every APDU is a single `transceive`.

use crate::adapters::transport::{Transport, TransportKind};
use crate::infra::error::{OathError, OathResult};
use std::time::Duration;

/// A discovered ISO 14443-4 tag, as exposed by the platform NFC stack.
pub trait IsoDepTag: Send {
    /// # Errors
    ///
    /// Returns [`OathError::Transport`] if the tag left the field.
    fn connect(&mut self) -> OathResult<()>;

    fn set_timeout(&mut self, timeout: Duration);

    /// # Errors
    ///
    /// Returns [`OathError::Transport`] on I/O failure or tag loss.
    fn transceive(&mut self, apdu: &[u8]) -> OathResult<Vec<u8>>;

    /// # Errors
    ///
    /// Returns [`OathError::Transport`] if the handle cannot be released.
    fn close(&mut self) -> OathResult<()>;
}

/// Transport over a connected ISO-DEP tag.
pub struct NfcTransport<T: IsoDepTag> {
    tag: T,
    closed: bool,
}

impl<T: IsoDepTag> NfcTransport<T> {
    /// Connect to `tag` and apply the I/O timeout.
    ///
    /// # Errors
    ///
    /// Returns the tag's connect failure.
    pub fn connect(mut tag: T, timeout: Duration) -> OathResult<Self> {
        tag.connect()?;
        tag.set_timeout(timeout);
        log::info!("Connected to NFC tag (timeout {}ms)", timeout.as_millis());
        Ok(Self { tag, closed: false })
    }
}

impl<T: IsoDepTag> Transport for NfcTransport<T> {
    fn transceive(&mut self, apdu: &[u8]) -> OathResult<Vec<u8>> {
        if self.closed {
            return Err(OathError::Transport("NFC tag is closed".to_string()));
        }
        log::trace!("NFC TX: {}", hex::encode(apdu));
        let response = self.tag.transceive(apdu)?;
        log::trace!("NFC RX: {}", hex::encode(&response));
        Ok(response)
    }

    fn close(&mut self) -> OathResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.tag.close()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Nfc
    }
}

impl<T: IsoDepTag> Drop for NfcTransport<T> {
    fn drop(&mut self) {
        if let Err(e) = Transport::close(self) {
            log::debug!("Failed to close NFC tag: {e}");
        }
    }
}
