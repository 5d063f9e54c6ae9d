//! APDU exchange over a [`Transport`].
//!
//! Handles the two multi-frame mechanisms of the OATH applet:
//! - command chaining: data longer than 255 bytes goes out in 255-byte
//!   frames with `CLA=0x10`, followed by the remainder with the real CLA
//! - response continuation: while the token answers `61xx`, a
//!   send-remaining command fetches the next part of the body

use crate::adapters::transport::{Transport, TransportKind};
use crate::domain::apdu::{Apdu, ApduResponse};
use crate::domain::constants::{ins, CLA_CHAINING, CLA_DEFAULT, SHORT_APDU_MAX_DATA};
use crate::infra::error::{OathError, OathResult};

/// Whether an APDU's data field may be written to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logging {
    Plain,
    /// Only the header and data length are logged.
    Redacted,
}

/// An APDU-level session on one transport.
pub struct ApduConnection {
    transport: Box<dyn Transport>,
    ins_send_remaining: u8,
    closed: bool,
}

impl ApduConnection {
    /// `ins_send_remaining` is the applet's instruction for fetching the rest
    /// of a `61xx` response.
    pub fn new(transport: Box<dyn Transport>, ins_send_remaining: u8) -> Self {
        Self {
            transport,
            ins_send_remaining,
            closed: false,
        }
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Select an applet by AID.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::AppletMissing`] if the token rejects the AID, or
    /// a transport error.
    pub fn select(&mut self, aid: &[u8]) -> OathResult<ApduResponse> {
        let command = Apdu::new(ins::SELECT, 0x04, 0x00, aid);
        let response = self.exchange(&command, Logging::Plain)?;
        if response.is_success() {
            Ok(response)
        } else {
            log::debug!("SELECT {} rejected with SW={}", hex::encode(aid), response.sw());
            Err(OathError::AppletMissing { sw: response.sw() })
        }
    }

    /// Send a command and return the complete response body.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Apdu`] with the body and status word when the
    /// token does not answer `9000`, or a transport error.
    pub fn send(&mut self, ins: u8, p1: u8, p2: u8, data: &[u8]) -> OathResult<Vec<u8>> {
        self.send_with(ins, p1, p2, data, Logging::Plain)
    }

    /// Like [`ApduConnection::send`], for commands carrying key material.
    ///
    /// # Errors
    ///
    /// See [`ApduConnection::send`].
    pub fn send_sensitive(&mut self, ins: u8, p1: u8, p2: u8, data: &[u8]) -> OathResult<Vec<u8>> {
        self.send_with(ins, p1, p2, data, Logging::Redacted)
    }

    /// Release the transport. Later calls fail with a transport error.
    ///
    /// # Errors
    ///
    /// Returns the transport's close failure.
    pub fn close(&mut self) -> OathResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.transport.close()
    }

    fn send_with(
        &mut self,
        ins: u8,
        p1: u8,
        p2: u8,
        data: &[u8],
        logging: Logging,
    ) -> OathResult<Vec<u8>> {
        let mut remaining = data;
        while remaining.len() > SHORT_APDU_MAX_DATA {
            let (chunk, rest) = remaining.split_at(SHORT_APDU_MAX_DATA);
            let frame = Apdu::new(ins, p1, p2, chunk).with_cla(CLA_CHAINING);
            let response = self.transmit(&frame, logging)?;
            if !response.is_success() {
                let sw = response.sw();
                log::debug!("Chained frame rejected with SW={sw}");
                return Err(OathError::Apdu {
                    body: response.into_body(),
                    sw,
                });
            }
            remaining = rest;
        }

        let last = Apdu::new(ins, p1, p2, remaining).with_cla(CLA_DEFAULT);
        self.exchange(&last, logging)?.check()
    }

    /// Send one frame and follow `61xx` continuations.
    fn exchange(&mut self, command: &Apdu, logging: Logging) -> OathResult<ApduResponse> {
        let mut response = self.transmit(command, logging)?;
        let mut body = Vec::new();
        while response.sw().has_more_data() {
            log::debug!(
                "More response data pending (SW={}), sending 0x{:02x}",
                response.sw(),
                self.ins_send_remaining
            );
            body.extend_from_slice(response.body());
            let more = Apdu::new(self.ins_send_remaining, 0, 0, Vec::new());
            response = self.transmit(&more, Logging::Plain)?;
        }
        body.extend_from_slice(response.body());
        Ok(ApduResponse::new(body, response.sw()))
    }

    fn transmit(&mut self, command: &Apdu, logging: Logging) -> OathResult<ApduResponse> {
        if self.closed {
            return Err(OathError::Transport("connection is closed".to_string()));
        }
        let encoded = command.encode()?;
        match logging {
            Logging::Plain => log::trace!("APDU >> {}", hex::encode(&encoded)),
            Logging::Redacted => log::trace!(
                "APDU >> {} <{} bytes redacted>",
                hex::encode(&encoded[..4]),
                command.data.len()
            ),
        }
        let raw = self.transport.transceive(&encoded)?;
        let response = ApduResponse::parse(&raw)?;
        match logging {
            Logging::Plain => log::trace!("APDU << {}", hex::encode(&raw)),
            Logging::Redacted => log::trace!(
                "APDU << <{} bytes redacted> {}",
                response.body().len(),
                response.sw()
            ),
        }
        Ok(response)
    }
}

impl Drop for ApduConnection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::debug!("Failed to close transport: {e}");
        }
    }
}
