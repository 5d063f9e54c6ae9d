//! OATH applet session.
//!
//! Expresses every applet operation as APDU exchanges over an
//! [`ApduConnection`]. The session caches the identity returned by SELECT;
//! while that identity carries a challenge the applet is locked and only
//! [`OathSession::unlock`], [`OathSession::reset`] and re-selecting are
//! permitted.

use crate::adapters::transport::{Transport, TransportKind};
use crate::domain::apdu::StatusWord;
use crate::domain::constants::{
    ins, tag, HOST_CHALLENGE_LENGTH, MAX_NAME_LENGTH, OATH_AID, PROPERTY_REQUIRE_TOUCH, RESET_P1,
    RESET_P2,
};
use crate::domain::crypto::{hmac_sha1, HashAlgorithm};
use crate::domain::oath::{
    decode_name, type_algorithm_byte, CalculatedCode, Credential, DeviceIdentity,
    ListedCredential, OathType, Version,
};
use crate::domain::tlv::{self, Tlv};
use crate::infra::error::{OathError, OathResult, UnlockFailure};
use crate::services::apdu::ApduConnection;
use rand::RngCore;
use subtle::ConstantTimeEq;

/// First firmware able to require touch per credential.
const TOUCH_FIRMWARE: Version = Version::new(4, 0, 0);

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The channel was closed; nothing more can be sent.
    Disconnected,
    /// Selected, but VALIDATE must succeed first.
    Locked,
    /// Selected and usable.
    Unlocked,
}

/// An open session with the OATH applet.
pub struct OathSession {
    connection: ApduConnection,
    identity: DeviceIdentity,
}

impl OathSession {
    /// Select the OATH applet over `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::AppletMissing`] if the applet is absent, a
    /// protocol error for an unparsable SELECT response, or a transport
    /// error. The transport is closed on failure.
    pub fn open(transport: Box<dyn Transport>) -> OathResult<Self> {
        Self::with_connection(ApduConnection::new(transport, ins::SEND_REMAINING))
    }

    /// Select the OATH applet over an existing APDU connection.
    ///
    /// # Errors
    ///
    /// See [`OathSession::open`].
    pub fn with_connection(mut connection: ApduConnection) -> OathResult<Self> {
        match select_applet(&mut connection) {
            Ok(identity) => Ok(Self {
                connection,
                identity,
            }),
            Err(e) => {
                if let Err(close_error) = connection.close() {
                    log::debug!("Failed to close transport after SELECT failure: {close_error}");
                }
                Err(e)
            }
        }
    }

    /// Select the applet again and refresh the cached identity.
    ///
    /// # Errors
    ///
    /// See [`OathSession::open`].
    pub fn select(&mut self) -> OathResult<&DeviceIdentity> {
        self.identity = select_applet(&mut self.connection)?;
        Ok(&self.identity)
    }

    #[must_use]
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.identity.version
    }

    #[must_use]
    pub fn device_id(&self) -> &[u8] {
        &self.identity.device_id
    }

    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.connection.kind()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.connection.is_closed() {
            SessionState::Disconnected
        } else if self.identity.is_locked() {
            SessionState::Locked
        } else {
            SessionState::Unlocked
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.identity.is_locked()
    }

    /// Mutual challenge-response authentication with the lock-code secret.
    ///
    /// Proves knowledge of `secret` to the applet and checks that the applet
    /// knows it too. Unlocking an unlocked session does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Unlock`] with [`UnlockFailure::SecretMissing`]
    /// for an empty secret and [`UnlockFailure::WrongSecret`] when either
    /// side's proof fails.
    pub fn unlock(&mut self, secret: &[u8]) -> OathResult<()> {
        let Some(challenge) = self.identity.challenge.clone() else {
            log::debug!("Unlock requested on an unlocked session");
            return Ok(());
        };
        if secret.is_empty() {
            return Err(OathError::Unlock(UnlockFailure::SecretMissing));
        }

        let response = hmac_sha1(secret, &challenge)?;
        let host_challenge = random_challenge();
        let expected = hmac_sha1(secret, &host_challenge)?;

        let data = tlv::encode_group(&[
            Tlv::new(tag::RESPONSE, response),
            Tlv::new(tag::CHALLENGE, host_challenge.to_vec()),
        ])?;
        let body = match self
            .connection
            .send_sensitive(ins::VALIDATE, 0, 0, &data)
        {
            Ok(body) => body,
            Err(OathError::Apdu { sw, .. })
                if sw == StatusWord::DATA_INVALID || sw == StatusWord::WRONG_DATA =>
            {
                log::warn!("Applet rejected unlock response (SW={sw})");
                return Err(OathError::Unlock(UnlockFailure::WrongSecret));
            }
            Err(e) => return Err(e),
        };

        let fields = tlv::group_to_map(tlv::decode_group(&body)?);
        let answer = fields
            .get(&tag::RESPONSE)
            .ok_or_else(|| OathError::Protocol("VALIDATE response lacks RESPONSE".to_string()))?;
        if !bool::from(expected.ct_eq(answer)) {
            log::warn!("Applet answered the host challenge incorrectly");
            return Err(OathError::Unlock(UnlockFailure::WrongSecret));
        }

        self.identity.challenge = None;
        log::info!("OATH applet unlocked");
        Ok(())
    }

    /// Protect the applet with `secret`. An empty secret removes protection.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Locked`] while locked, or the applet's rejection.
    pub fn set_lock_code(&mut self, secret: &[u8]) -> OathResult<()> {
        if secret.is_empty() {
            return self.unset_lock_code();
        }
        self.ensure_unlocked()?;

        let challenge = random_challenge();
        let response = hmac_sha1(secret, &challenge)?;
        let mut key = Vec::with_capacity(1 + secret.len());
        key.push(type_algorithm_byte(OathType::Totp, HashAlgorithm::Sha1));
        key.extend_from_slice(secret);

        let data = tlv::encode_group(&[
            Tlv::new(tag::KEY, key),
            Tlv::new(tag::CHALLENGE, challenge.to_vec()),
            Tlv::new(tag::RESPONSE, response),
        ])?;
        self.connection.send_sensitive(ins::SET_CODE, 0, 0, &data)?;
        log::info!("Lock code set");
        Ok(())
    }

    /// Remove lock-code protection.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Locked`] while locked, or the applet's rejection.
    pub fn unset_lock_code(&mut self) -> OathResult<()> {
        self.ensure_unlocked()?;
        let data = Tlv::empty(tag::KEY).encode()?;
        self.connection.send(ins::SET_CODE, 0, 0, &data)?;
        log::info!("Lock code removed");
        Ok(())
    }

    /// Store a credential with its raw HMAC key.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::InvalidInput`] for invalid names or digits,
    /// [`OathError::UnsupportedFirmware`] when touch is requested on firmware
    /// before 4.0.0, and [`OathError::Apdu`] (check
    /// [`OathError::is_storage_full`]) when the applet refuses.
    pub fn put_credential(&mut self, credential: &Credential, key: &[u8]) -> OathResult<()> {
        self.ensure_unlocked()?;
        credential.validate()?;
        if credential.touch_required && self.identity.version < TOUCH_FIRMWARE {
            return Err(OathError::UnsupportedFirmware {
                feature: "Require touch",
                required: TOUCH_FIRMWARE,
                actual: self.identity.version,
            });
        }

        let prepared = credential.hash_algorithm.prepare_key(key);
        let mut key_value = Vec::with_capacity(2 + prepared.len());
        key_value.push(type_algorithm_byte(
            credential.oath_type,
            credential.hash_algorithm,
        ));
        key_value.push(credential.digits);
        key_value.extend_from_slice(&prepared);

        let mut data = tlv::encode_group(&[
            Tlv::new(tag::NAME, credential.name.as_bytes()),
            Tlv::new(tag::KEY, key_value),
        ])?;
        if credential.touch_required {
            data.extend_from_slice(&[tag::PROPERTY, PROPERTY_REQUIRE_TOUCH]);
        }
        if credential.oath_type == OathType::Hotp && credential.counter > 0 {
            Tlv::new(tag::IMF, credential.counter.to_be_bytes()).encode_into(&mut data)?;
        }

        self.connection.send_sensitive(ins::PUT, 0, 0, &data)?;
        log::info!("Stored credential '{}'", credential.name);
        Ok(())
    }

    /// Remove a credential by name.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Apdu`] with `6A82` if no such credential exists.
    pub fn delete_credential(&mut self, name: &str) -> OathResult<()> {
        self.ensure_unlocked()?;
        check_name(name)?;
        let data = Tlv::new(tag::NAME, name.as_bytes()).encode()?;
        self.connection.send(ins::DELETE, 0, 0, &data)?;
        log::info!("Deleted credential '{name}'");
        Ok(())
    }

    /// Calculate one credential against `challenge`.
    ///
    /// With `truncate` the applet returns four truncated bytes, otherwise
    /// the full HMAC.
    ///
    /// # Errors
    ///
    /// Returns the applet's rejection or a protocol error for a malformed
    /// response.
    pub fn calculate(
        &mut self,
        name: &str,
        challenge: &[u8],
        truncate: bool,
    ) -> OathResult<CalculatedCode> {
        self.ensure_unlocked()?;
        check_name(name)?;
        let data = tlv::encode_group(&[
            Tlv::new(tag::NAME, name.as_bytes()),
            Tlv::new(tag::CHALLENGE, challenge),
        ])?;
        let body = self
            .connection
            .send(ins::CALCULATE, 0, u8::from(truncate), &data)?;
        let record = Tlv::decode(&body, 0)?;
        CalculatedCode::from_record(name.to_string(), record.tag(), record.value())
    }

    /// Calculate every credential against one challenge.
    ///
    /// HOTP and touch credentials come back without a value.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if NAME and response records do not pair up.
    pub fn calculate_all(&mut self, challenge: &[u8]) -> OathResult<Vec<CalculatedCode>> {
        self.ensure_unlocked()?;
        let data = Tlv::new(tag::CHALLENGE, challenge).encode()?;
        let body = self.connection.send(ins::CALCULATE_ALL, 0, 1, &data)?;
        let records = tlv::decode_group(&body)?;
        if records.len() % 2 != 0 {
            return Err(OathError::Protocol(format!(
                "CALCULATE ALL returned {} records; expected NAME/response pairs",
                records.len()
            )));
        }

        let codes = records
            .chunks_exact(2)
            .map(|pair| {
                let (name, response) = (&pair[0], &pair[1]);
                if name.tag() != tag::NAME {
                    return Err(OathError::Protocol(format!(
                        "expected NAME record, got tag 0x{:02x}",
                        name.tag()
                    )));
                }
                CalculatedCode::from_record(
                    decode_name(name.value())?,
                    response.tag(),
                    response.value(),
                )
            })
            .collect::<OathResult<Vec<_>>>()?;
        log::debug!("Calculated {} credentials", codes.len());
        Ok(codes)
    }

    /// Enumerate stored credentials.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for records other than NAME_LIST entries.
    pub fn list_credentials(&mut self) -> OathResult<Vec<ListedCredential>> {
        self.ensure_unlocked()?;
        let body = self.connection.send(ins::LIST, 0, 0, &[])?;
        tlv::decode_group(&body)?
            .into_iter()
            .map(|record| {
                if record.tag() != tag::NAME_LIST {
                    return Err(OathError::Protocol(format!(
                        "unexpected LIST record tag 0x{:02x}",
                        record.tag()
                    )));
                }
                ListedCredential::parse(record.value())
            })
            .collect()
    }

    /// Wipe all credentials and the lock code, then select again.
    ///
    /// # Errors
    ///
    /// Returns the applet's rejection or the re-select failure.
    pub fn reset(&mut self) -> OathResult<()> {
        self.connection.send(ins::RESET, RESET_P1, RESET_P2, &[])?;
        log::warn!("OATH applet reset; all credentials removed");
        self.select()?;
        Ok(())
    }

    /// Release the channel.
    ///
    /// # Errors
    ///
    /// Returns the transport's close failure.
    pub fn close(&mut self) -> OathResult<()> {
        self.connection.close()
    }

    fn ensure_unlocked(&self) -> OathResult<()> {
        match self.state() {
            SessionState::Unlocked => Ok(()),
            SessionState::Locked => Err(OathError::Locked),
            SessionState::Disconnected => {
                Err(OathError::Transport("session is closed".to_string()))
            }
        }
    }
}

fn select_applet(connection: &mut ApduConnection) -> OathResult<DeviceIdentity> {
    let response = connection.select(OATH_AID)?;
    let fields = tlv::group_to_map(tlv::decode_group(response.body())?);

    let version = fields
        .get(&tag::VERSION)
        .ok_or_else(|| OathError::Protocol("SELECT response lacks VERSION".to_string()))
        .and_then(|value| Version::parse(value))?;
    let device_id = fields
        .get(&tag::NAME)
        .cloned()
        .ok_or_else(|| OathError::Protocol("SELECT response lacks NAME".to_string()))?;
    let challenge = fields.get(&tag::CHALLENGE).cloned();

    log::info!(
        "Selected OATH applet {version} ({})",
        if challenge.is_some() { "locked" } else { "unlocked" }
    );
    Ok(DeviceIdentity {
        version,
        device_id,
        challenge,
    })
}

fn check_name(name: &str) -> OathResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(OathError::InvalidInput(format!(
            "Credential name must be 1 to {MAX_NAME_LENGTH} bytes, got {}",
            name.len()
        )));
    }
    Ok(())
}

fn random_challenge() -> [u8; HOST_CHALLENGE_LENGTH] {
    let mut challenge = [0u8; HOST_CHALLENGE_LENGTH];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}
