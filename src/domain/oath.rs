//! OATH applet data model.
//!
//! Strongly-typed views of what the applet stores and returns: credential
//! descriptions, device identity from SELECT, and calculation results.

use crate::domain::constants::{tag, MAX_NAME_LENGTH};
use crate::domain::crypto::{self, HashAlgorithm};
use crate::infra::error::{OathError, OathResult};
use std::fmt;
use std::str::FromStr;

/// OATH credential kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OathType {
    /// Counter based (RFC 4226).
    Hotp,
    /// Time based (RFC 6238).
    Totp,
}

impl OathType {
    /// High nibble used on the wire.
    #[must_use]
    pub fn value(self) -> u8 {
        match self {
            OathType::Hotp => 0x10,
            OathType::Totp => 0x20,
        }
    }

    /// Decode the high nibble of a type/algorithm byte.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Protocol`] for unknown values.
    pub fn from_value(value: u8) -> OathResult<Self> {
        match value {
            0x10 => Ok(OathType::Hotp),
            0x20 => Ok(OathType::Totp),
            other => Err(OathError::Protocol(format!(
                "unknown OATH type 0x{other:02x}"
            ))),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OathType::Hotp => "hotp",
            OathType::Totp => "totp",
        }
    }
}

impl FromStr for OathType {
    type Err = OathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hotp" => Ok(OathType::Hotp),
            "totp" => Ok(OathType::Totp),
            other => Err(OathError::InvalidInput(format!(
                "Invalid OATH type: {other}"
            ))),
        }
    }
}

impl fmt::Display for OathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

/// Pack type and algorithm into the applet's single byte.
#[must_use]
pub fn type_algorithm_byte(oath_type: OathType, algorithm: HashAlgorithm) -> u8 {
    oath_type.value() | algorithm.value()
}

/// Applet firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub micro: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8, micro: u8) -> Self {
        Self {
            major,
            minor,
            micro,
        }
    }

    /// Parse the three-byte VERSION value.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Protocol`] if fewer than three bytes are present.
    pub fn parse(bytes: &[u8]) -> OathResult<Self> {
        match bytes {
            [major, minor, micro, ..] => Ok(Self::new(*major, *minor, *micro)),
            _ => Err(OathError::Protocol(format!(
                "version needs 3 bytes, got {}",
                bytes.len()
            ))),
        }
    }

    #[must_use]
    pub fn at_least(&self, major: u8, minor: u8, micro: u8) -> bool {
        *self >= Self::new(major, minor, micro)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

/// What SELECT tells us about the applet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub version: Version,
    /// Per-device salt, also used to derive the lock key.
    pub device_id: Vec<u8>,
    /// Present when the applet requires VALIDATE before use.
    pub challenge: Option<Vec<u8>>,
}

impl DeviceIdentity {
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.challenge.is_some()
    }
}

/// A credential as stored on the token.
///
/// Only the name, type and algorithm can be read back through LIST; the
/// other fields describe what is written by PUT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub name: String,
    pub oath_type: OathType,
    pub hash_algorithm: HashAlgorithm,
    pub digits: u8,
    pub touch_required: bool,
    /// Initial moving factor; only meaningful for HOTP.
    pub counter: u32,
}

impl Credential {
    /// TOTP credential with the usual defaults (SHA-1, 6 digits, no touch).
    pub fn totp(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            oath_type: OathType::Totp,
            hash_algorithm: HashAlgorithm::Sha1,
            digits: 6,
            touch_required: false,
            counter: 0,
        }
    }

    /// HOTP credential starting at `counter`.
    pub fn hotp(name: impl Into<String>, counter: u32) -> Self {
        Self {
            oath_type: OathType::Hotp,
            counter,
            ..Self::totp(name)
        }
    }

    #[must_use]
    pub fn with_algorithm(mut self, hash_algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = hash_algorithm;
        self
    }

    #[must_use]
    pub fn with_digits(mut self, digits: u8) -> Self {
        self.digits = digits;
        self
    }

    #[must_use]
    pub fn with_touch(mut self, touch_required: bool) -> Self {
        self.touch_required = touch_required;
        self
    }

    /// Check what the applet would refuse anyway.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::InvalidInput`] for empty or over-long names and
    /// digit counts outside 6..=8.
    pub fn validate(&self) -> OathResult<()> {
        if self.name.is_empty() {
            return Err(OathError::InvalidInput(
                "Credential name must not be empty".to_string(),
            ));
        }
        if self.name.len() > MAX_NAME_LENGTH {
            return Err(OathError::InvalidInput(format!(
                "Credential name too long: {} bytes (maximum {MAX_NAME_LENGTH})",
                self.name.len()
            )));
        }
        if !(6..=8).contains(&self.digits) {
            return Err(OathError::InvalidInput(format!(
                "Digits must be between 6 and 8, got {}",
                self.digits
            )));
        }
        Ok(())
    }
}

/// One entry of a LIST response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedCredential {
    pub name: String,
    pub oath_type: OathType,
    pub hash_algorithm: HashAlgorithm,
}

impl ListedCredential {
    /// Decode a NAME_LIST value: type/algorithm byte followed by the name.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Protocol`] for empty values, unknown nibbles or
    /// names that are not UTF-8.
    pub fn parse(value: &[u8]) -> OathResult<Self> {
        let (&kind, name) = value
            .split_first()
            .ok_or_else(|| OathError::Protocol("empty credential list entry".to_string()))?;
        Ok(Self {
            name: decode_name(name)?,
            oath_type: OathType::from_value(kind & 0xF0)?,
            hash_algorithm: HashAlgorithm::from_value(kind & 0x0F)?,
        })
    }
}

/// Kind of record returned for a calculated credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    /// Full HMAC output.
    Full,
    /// Four byte truncated value.
    Truncated,
    /// HOTP credential, not calculated by CALCULATE ALL.
    Hotp,
    /// Needs a touch before it can be calculated.
    Touch,
}

impl ResponseKind {
    /// Map a response tag to its kind.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Protocol`] for tags that are not response records.
    pub fn from_tag(value: u8) -> OathResult<Self> {
        match value {
            tag::RESPONSE => Ok(ResponseKind::Full),
            tag::TRUNCATED_RESPONSE => Ok(ResponseKind::Truncated),
            tag::NO_RESPONSE => Ok(ResponseKind::Hotp),
            tag::TOUCH => Ok(ResponseKind::Touch),
            other => Err(OathError::Protocol(format!(
                "unexpected response tag 0x{other:02x}"
            ))),
        }
    }

    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            ResponseKind::Full => tag::RESPONSE,
            ResponseKind::Truncated => tag::TRUNCATED_RESPONSE,
            ResponseKind::Hotp => tag::NO_RESPONSE,
            ResponseKind::Touch => tag::TOUCH,
        }
    }
}

/// Result of CALCULATE / CALCULATE ALL for one credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculatedCode {
    pub name: String,
    pub kind: ResponseKind,
    pub digits: u8,
    /// Response bytes after the leading digits byte.
    pub raw_response: Vec<u8>,
}

impl CalculatedCode {
    /// Build from a response record: `digits || response`.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Protocol`] for unknown tags or empty values.
    pub fn from_record(name: String, record_tag: u8, value: &[u8]) -> OathResult<Self> {
        let kind = ResponseKind::from_tag(record_tag)?;
        let (&digits, response) = value.split_first().ok_or_else(|| {
            OathError::Protocol(format!("empty response record for '{name}'"))
        })?;
        Ok(Self {
            name,
            kind,
            digits,
            raw_response: response.to_vec(),
        })
    }

    /// Whether the applet actually computed something.
    #[must_use]
    pub fn has_value(&self) -> bool {
        matches!(self.kind, ResponseKind::Full | ResponseKind::Truncated)
            && !self.raw_response.is_empty()
    }

    /// Decimal code for this response, if one was computed.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Protocol`] if the response bytes are malformed.
    pub fn value(&self) -> OathResult<Option<String>> {
        if !self.has_value() {
            return Ok(None);
        }
        let code = match self.kind {
            ResponseKind::Truncated => crypto::code_from_truncated(&self.raw_response, self.digits)?,
            _ => crypto::code_from_digest(&self.raw_response, self.digits)?,
        };
        Ok(Some(code))
    }
}

/// Decode a credential name sent by the applet.
///
/// # Errors
///
/// Returns [`OathError::Protocol`] if the bytes are not UTF-8.
pub fn decode_name(bytes: &[u8]) -> OathResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| OathError::Protocol(format!("credential name is not UTF-8: {e}")))
}
