//! Credential naming conventions and `otpauth://` URI parsing.
//!
//! The applet only stores a flat name per credential. Issuer and TOTP
//! period are folded into it as `[period/][issuer:]name`, with the period
//! prefix only present when it differs from the default.

use crate::domain::constants::{DEFAULT_PERIOD, HIDDEN_PREFIX, MAX_NAME_LENGTH, STEAM_ISSUER};
use crate::domain::crypto::HashAlgorithm;
use crate::domain::oath::{Credential, OathType};
use crate::infra::error::{OathError, OathResult};
use std::fmt;

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Display components recovered from a stored credential name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialName {
    pub period: u32,
    pub issuer: Option<String>,
    pub name: String,
}

impl CredentialName {
    /// Split a stored name into period, issuer and account name.
    #[must_use]
    pub fn parse(key: &str) -> Self {
        let mut rest = key;
        let mut period = DEFAULT_PERIOD;
        if let Some((prefix, tail)) = rest.split_once('/') {
            if !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(value) = prefix.parse::<u32>() {
                    period = value;
                    rest = tail;
                }
            }
        }
        let (issuer, name) = match rest.split_once(':') {
            Some((issuer, name)) => (Some(issuer.to_string()), name.to_string()),
            None => (None, rest.to_string()),
        };
        Self {
            period,
            issuer,
            name,
        }
    }

    /// Build the name stored on the token.
    #[must_use]
    pub fn to_key(&self, oath_type: OathType) -> String {
        let mut key = String::new();
        if oath_type == OathType::Totp && self.period != DEFAULT_PERIOD {
            key.push_str(&format!("{}/", self.period));
        }
        if let Some(issuer) = &self.issuer {
            key.push_str(issuer);
            key.push(':');
        }
        key.push_str(&self.name);
        key
    }

    #[must_use]
    pub fn is_steam(&self) -> bool {
        self.issuer.as_deref() == Some(STEAM_ISSUER)
    }
}

impl fmt::Display for CredentialName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.issuer {
            Some(issuer) => write!(f, "{issuer} ({})", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Whether a stored name is meant to be kept out of listings.
#[must_use]
pub fn is_hidden(key: &str) -> bool {
    key.starts_with(HIDDEN_PREFIX)
}

/// Everything needed to program a new credential.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialData {
    pub secret: Vec<u8>,
    pub issuer: Option<String>,
    pub name: String,
    pub oath_type: OathType,
    pub algorithm: HashAlgorithm,
    pub digits: u8,
    pub period: u32,
    pub counter: u32,
    pub touch: bool,
}

impl fmt::Debug for CredentialData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialData")
            .field("secret", &format_args!("<{} bytes>", self.secret.len()))
            .field("issuer", &self.issuer)
            .field("name", &self.name)
            .field("oath_type", &self.oath_type)
            .field("algorithm", &self.algorithm)
            .field("digits", &self.digits)
            .field("period", &self.period)
            .field("counter", &self.counter)
            .field("touch", &self.touch)
            .finish()
    }
}

impl CredentialData {
    /// Credential data with default algorithm, digits and period.
    pub fn new(
        secret: Vec<u8>,
        issuer: Option<String>,
        name: impl Into<String>,
        oath_type: OathType,
    ) -> Self {
        Self {
            secret,
            issuer,
            name: name.into(),
            oath_type,
            algorithm: HashAlgorithm::Sha1,
            digits: 6,
            period: DEFAULT_PERIOD,
            counter: 0,
            touch: false,
        }
    }

    /// Parse an `otpauth://TYPE/[ISSUER:]NAME?secret=...` URI.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::InvalidInput`] for a wrong scheme, missing name,
    /// unknown type or algorithm, a secret that is not base32, digits
    /// outside 6..=8, or non-numeric period/counter values.
    pub fn from_uri(uri: &str) -> OathResult<Self> {
        let rest = uri
            .get(..10)
            .filter(|scheme| scheme.eq_ignore_ascii_case("otpauth://"))
            .map(|_| &uri[10..])
            .ok_or_else(|| invalid("Uri scheme must be otpauth://"))?;
        let rest = rest.split_once('#').map_or(rest, |(head, _)| head);
        let (location, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (host, path) = location.split_once('/').unwrap_or((location, ""));
        let params = parse_query(query)?;
        let param = |key: &str| -> Option<&str> {
            params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        let secret = decode_base32(param("secret").unwrap_or_default())?;

        let mut data = percent_decode(path)?;
        if data.is_empty() {
            return Err(invalid("Path must contain name"));
        }
        truncate_to_boundary(&mut data, MAX_NAME_LENGTH);

        let (issuer, name) = match data.split_once(':') {
            Some((issuer, name)) => (Some(issuer.to_string()), name.to_string()),
            None => (param("issuer").map(str::to_string), data.clone()),
        };

        let oath_type = host
            .parse::<OathType>()
            .map_err(|_| invalid("Invalid or missing OATH algorithm"))?;

        let algorithm = param("algorithm")
            .unwrap_or_default()
            .parse::<HashAlgorithm>()
            .map_err(|_| invalid("Invalid or missing HMAC algorithm"))?;

        let digits = match param("digits")
            .unwrap_or_default()
            .trim_start_matches(['+', '0'])
        {
            "" | "6" => 6,
            "7" => 7,
            "8" => 8,
            _ => return Err(invalid("Digits must be in range 6-8")),
        };

        let period = parse_number(param("period"), DEFAULT_PERIOD, "period")?;
        if period == 0 {
            return Err(invalid("Invalid value for period"));
        }
        let counter = parse_number(param("counter"), 0, "counter")?;

        Ok(Self {
            secret,
            issuer,
            name,
            oath_type,
            algorithm,
            digits,
            period,
            counter,
            touch: false,
        })
    }

    /// Name under which this credential is stored on the token.
    #[must_use]
    pub fn stored_name(&self) -> String {
        CredentialName {
            period: self.period,
            issuer: self.issuer.clone(),
            name: self.name.clone(),
        }
        .to_key(self.oath_type)
    }

    /// The PUT description of this credential.
    #[must_use]
    pub fn to_credential(&self) -> Credential {
        Credential {
            name: self.stored_name(),
            oath_type: self.oath_type,
            hash_algorithm: self.algorithm,
            digits: self.digits,
            touch_required: self.touch,
            counter: self.counter,
        }
    }

    /// Secret as unpadded base32.
    #[must_use]
    pub fn encoded_secret(&self) -> String {
        encode_base32(&self.secret)
    }
}

/// Decode RFC 4648 base32, case-insensitive, ignoring padding and spaces.
///
/// # Errors
///
/// Returns [`OathError::InvalidInput`] for characters outside the alphabet.
pub fn decode_base32(input: &str) -> OathResult<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for c in input.bytes() {
        if c == b'=' || c.is_ascii_whitespace() {
            continue;
        }
        let upper = c.to_ascii_uppercase();
        let value = BASE32_ALPHABET
            .iter()
            .position(|&a| a == upper)
            .ok_or_else(|| invalid("Secret must be base32 encoded"))?;
        buffer = (buffer << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Ok(out)
}

/// Encode as RFC 4648 base32 without padding.
#[must_use]
pub fn encode_base32(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1F) as usize] as char);
        }
        buffer &= (1 << bits) - 1;
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1F) as usize] as char);
    }
    out
}

fn parse_query(query: &str) -> OathResult<Vec<(String, String)>> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Ok((percent_decode(key)?, percent_decode(value)?))
        })
        .collect()
}

fn percent_decode(input: &str) -> OathResult<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input
                .get(i + 1..i + 3)
                .ok_or_else(|| invalid("Truncated percent escape in URI"))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| invalid("Invalid percent escape in URI"))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| invalid("URI component is not valid UTF-8"))
}

fn parse_number(value: Option<&str>, default: u32, field: &str) -> OathResult<u32> {
    match value {
        None | Some("") => Ok(default),
        Some(text) => text
            .parse()
            .map_err(|_| invalid(&format!("Invalid value for {field}"))),
    }
}

fn truncate_to_boundary(text: &mut String, max: usize) {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
}

fn invalid(message: &str) -> OathError {
    OathError::InvalidInput(message.to_string())
}
