//! Channel abstraction shared by the USB and NFC transports.

use crate::infra::error::OathResult;
use std::fmt;

/// Physical link a session runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Usb,
    Nfc,
}

impl TransportKind {
    /// USB tokens stay attached between operations; NFC taps do not.
    #[must_use]
    pub fn is_persistent(self) -> bool {
        matches!(self, TransportKind::Usb)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Usb => f.write_str("USB"),
            TransportKind::Nfc => f.write_str("NFC"),
        }
    }
}

/// A connected channel that exchanges raw APDU bytes with the token.
///
/// Implementations own the OS handle exclusively. After [`Transport::close`]
/// every call to [`Transport::transceive`] must fail with
/// [`crate::OathError::Transport`].
pub trait Transport: Send {
    /// Send one encoded command APDU and return the raw response including
    /// the trailing status word.
    ///
    /// # Errors
    ///
    /// Returns [`crate::OathError::Transport`] on any channel failure.
    fn transceive(&mut self, apdu: &[u8]) -> OathResult<Vec<u8>>;

    /// Release the channel. Calling this more than once is harmless.
    ///
    /// # Errors
    ///
    /// Returns [`crate::OathError::Transport`] if releasing the handle fails.
    fn close(&mut self) -> OathResult<()>;

    fn kind(&self) -> TransportKind;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transceive(&mut self, apdu: &[u8]) -> OathResult<Vec<u8>> {
        (**self).transceive(apdu)
    }

    fn close(&mut self) -> OathResult<()> {
        (**self).close()
    }

    fn kind(&self) -> TransportKind {
        (**self).kind()
    }
}
