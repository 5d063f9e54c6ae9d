//! Error types for OATH token operations.
//!
//! Every layer (TLV codec, transports, APDU layer, OATH engine, client)
//! reports through [`OathError`]. Application-level rejections keep the raw
//! status word so callers can branch on it.

use crate::domain::apdu::StatusWord;
use crate::domain::oath::Version;
use thiserror::Error;

/// Result type for OATH operations
pub type OathResult<T> = Result<T, OathError>;

/// Why an unlock attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockFailure {
    /// No secret is known for this device.
    SecretMissing,
    /// A secret was supplied but the token rejected it, or the token's
    /// answer to our challenge did not match.
    WrongSecret,
}

impl std::fmt::Display for UnlockFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnlockFailure::SecretMissing => write!(f, "password is missing"),
            UnlockFailure::WrongSecret => write!(f, "password is incorrect"),
        }
    }
}

/// Comprehensive error types for OATH operations
#[derive(Error, Debug, miette::Diagnostic)]
pub enum OathError {
    #[error("Malformed TLV: {0}")]
    MalformedTlv(String),

    #[error("TLV value too large: {0} bytes (maximum 65535)")]
    ValueTooLarge(usize),

    #[error("Transport error: {0}")]
    #[diagnostic(help("re-present the token and retry the operation"))]
    Transport(String),

    #[error("APDU error: SW={sw}")]
    Apdu { body: Vec<u8>, sw: StatusWord },

    #[error("OATH applet missing or wrong AID (SW={sw})")]
    AppletMissing { sw: StatusWord },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unlock failed: {0}")]
    Unlock(UnlockFailure),

    #[error("OATH applet is locked; unlock it first")]
    Locked,

    #[error("{feature} requires firmware {required} or later (device has {actual})")]
    UnsupportedFirmware {
        feature: &'static str,
        required: Version,
        actual: Version,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("A credential named '{0}' already exists")]
    DuplicateCredential(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl OathError {
    /// Status word carried by an application-level rejection, if any.
    #[must_use]
    pub fn status_word(&self) -> Option<StatusWord> {
        match self {
            OathError::Apdu { sw, .. } | OathError::AppletMissing { sw } => Some(*sw),
            _ => None,
        }
    }

    /// The token has no room left for another credential.
    #[must_use]
    pub fn is_storage_full(&self) -> bool {
        self.status_word() == Some(StatusWord::FILE_FULL)
    }

    /// The token refused because the session is not authenticated.
    #[must_use]
    pub fn is_auth_required(&self) -> bool {
        matches!(self, OathError::Locked) || self.status_word() == Some(StatusWord::AUTH_REQUIRED)
    }

    /// Transport failures are the only errors worth retrying after the
    /// token has been re-presented.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, OathError::Transport(_))
    }
}

impl From<std::io::Error> for OathError {
    fn from(error: std::io::Error) -> Self {
        OathError::Io(error.to_string())
    }
}

#[cfg(feature = "direct-usb")]
impl From<rusb::Error> for OathError {
    fn from(error: rusb::Error) -> Self {
        OathError::Transport(format!("USB: {error}"))
    }
}
