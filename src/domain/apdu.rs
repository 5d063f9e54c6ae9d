//! APDU command and response types.
//!
//! Commands are encoded as short APDUs: `CLA INS P1 P2 Lc [data]`. The Lc
//! byte is always present (zero for an empty data field) and no Le is sent,
//! which is what the OATH applet expects over both CCID and ISO-DEP.

use crate::domain::constants::{CLA_DEFAULT, SHORT_APDU_MAX_DATA};
use crate::infra::error::{OathError, OathResult};
use std::fmt;

/// Two-byte status word trailing every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord(u16);

impl StatusWord {
    pub const SUCCESS: Self = Self(0x9000);
    pub const WRONG_DATA: Self = Self(0x6A80);
    pub const FILE_NOT_FOUND: Self = Self(0x6A82);
    pub const FILE_FULL: Self = Self(0x6A84);
    pub const AUTH_REQUIRED: Self = Self(0x6982);
    pub const DATA_INVALID: Self = Self(0x6984);

    /// SW1 announcing that more response data is waiting.
    pub const MORE_DATA_SW1: u8 = 0x61;

    #[must_use]
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self(((sw1 as u16) << 8) | sw2 as u16)
    }

    #[must_use]
    pub const fn from_u16(value: u16) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn sw1(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[must_use]
    pub const fn sw2(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// `61xx`: more data is available through a send-remaining command.
    #[must_use]
    pub fn has_more_data(self) -> bool {
        self.sw1() == Self::MORE_DATA_SW1
    }

    /// Human readable meaning of the well-known OATH status words.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::SUCCESS => "success",
            Self::WRONG_DATA => "wrong data",
            Self::FILE_NOT_FOUND => "no such credential",
            Self::FILE_FULL => "storage full",
            Self::AUTH_REQUIRED => "authentication required",
            Self::DATA_INVALID => "data invalid",
            sw if sw.has_more_data() => "more data available",
            _ => "unknown status",
        }
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// A command APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

impl Apdu {
    /// Command with the default class byte.
    pub fn new(ins: u8, p1: u8, p2: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            cla: CLA_DEFAULT,
            ins,
            p1,
            p2,
            data: data.into(),
        }
    }

    /// Replace the class byte.
    #[must_use]
    pub fn with_cla(mut self, cla: u8) -> Self {
        self.cla = cla;
        self
    }

    /// Serialize as a short APDU.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::InvalidInput`] if the data field does not fit a
    /// single frame; the APDU layer splits longer payloads before encoding.
    pub fn encode(&self) -> OathResult<Vec<u8>> {
        if self.data.len() > SHORT_APDU_MAX_DATA {
            return Err(OathError::InvalidInput(format!(
                "APDU data field of {} bytes exceeds a single frame",
                self.data.len()
            )));
        }
        let mut out = Vec::with_capacity(5 + self.data.len());
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2, self.data.len() as u8]);
        out.extend_from_slice(&self.data);
        Ok(out)
    }
}

/// A response APDU split into body and status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    body: Vec<u8>,
    sw: StatusWord,
}

impl ApduResponse {
    pub fn new(body: impl Into<Vec<u8>>, sw: StatusWord) -> Self {
        Self {
            body: body.into(),
            sw,
        }
    }

    /// Split raw response bytes into body and trailing status word.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Protocol`] if fewer than two bytes were received.
    pub fn parse(raw: &[u8]) -> OathResult<Self> {
        if raw.len() < 2 {
            return Err(OathError::Protocol(format!(
                "response too short: {} bytes",
                raw.len()
            )));
        }
        let (body, sw) = raw.split_at(raw.len() - 2);
        Ok(Self::new(body, StatusWord::new(sw[0], sw[1])))
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    #[must_use]
    pub fn sw(&self) -> StatusWord {
        self.sw
    }

    #[must_use]
    pub fn sw1(&self) -> u8 {
        self.sw.sw1()
    }

    #[must_use]
    pub fn sw2(&self) -> u8 {
        self.sw.sw2()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.sw.is_success()
    }

    /// Turn a non-success status into [`OathError::Apdu`].
    ///
    /// # Errors
    ///
    /// Returns the application error carrying body and status word.
    pub fn check(self) -> OathResult<Vec<u8>> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(OathError::Apdu {
                body: self.body,
                sw: self.sw,
            })
        }
    }
}
