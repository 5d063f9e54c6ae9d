//! High-level OATH client.
//!
//! Adds the host-side conventions on top of [`OathSession`]: unlocking with
//! remembered secrets, issuer/period naming, validity windows for codes,
//! Steam formatting and password management.

use crate::adapters::transport::{Transport, TransportKind};
use crate::domain::constants::DEFAULT_PERIOD;
use crate::domain::credential_data::{is_hidden, CredentialData, CredentialName};
use crate::domain::crypto::{derive_lock_key, steam_code};
use crate::domain::oath::{OathType, ResponseKind, Version};
use crate::infra::error::{OathError, OathResult, UnlockFailure};
use crate::infra::secret_store::KeyManager;
use crate::services::oath::OathSession;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Stable textual id for a device: base64 of the first 16 bytes of
/// `SHA-256(device id)`, unpadded.
#[must_use]
pub fn device_id_string(device_id: &[u8]) -> String {
    let digest = Sha256::digest(device_id);
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(&digest[..16])
}

/// What the client knows about the connected token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub transport: TransportKind,
    pub persistent: bool,
    pub version: Version,
    pub has_password: bool,
}

/// A one-time code and the window in which it is valid, in Unix ms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    pub value: String,
    pub valid_from: u64,
    pub valid_until: u64,
}

impl Code {
    #[must_use]
    pub fn is_valid_at(&self, timestamp_ms: u64) -> bool {
        self.valid_from <= timestamp_ms && timestamp_ms < self.valid_until
    }
}

/// A credential on a specific device, identified by its stored name.
#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub device_id: String,
    /// Name as stored on the token.
    pub key: String,
    /// Unknown when learned from a response that does not reveal it.
    pub oath_type: Option<OathType>,
    pub touch: bool,
    pub issuer: Option<String>,
    pub name: String,
    pub period: u32,
}

impl StoredCredential {
    pub fn new(
        device_id: impl Into<String>,
        key: impl Into<String>,
        oath_type: Option<OathType>,
        touch: bool,
    ) -> Self {
        let key = key.into();
        let parsed = CredentialName::parse(&key);
        Self {
            device_id: device_id.into(),
            key,
            oath_type,
            touch,
            issuer: parsed.issuer,
            name: parsed.name,
            period: parsed.period,
        }
    }

    #[must_use]
    pub fn is_steam(&self) -> bool {
        self.issuer.as_deref() == Some(crate::domain::constants::STEAM_ISSUER)
    }
}

impl PartialEq for StoredCredential {
    fn eq(&self, other: &Self) -> bool {
        self.device_id == other.device_id && self.key == other.key
    }
}

impl Eq for StoredCredential {}

impl Hash for StoredCredential {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.device_id.hash(state);
        self.key.hash(state);
    }
}

impl fmt::Display for StoredCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.issuer {
            Some(issuer) => write!(f, "{issuer} ({})", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// OATH client bound to one connected token.
pub struct OathClient {
    session: OathSession,
    keys: KeyManager,
    info: DeviceInfo,
    default_period: u32,
    show_hidden: bool,
}

impl OathClient {
    /// Select the applet and unlock it with a remembered secret if needed.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Unlock`] with [`UnlockFailure::SecretMissing`]
    /// when the token is locked and no secret is stored, or
    /// [`UnlockFailure::WrongSecret`] when every stored secret is rejected.
    pub fn connect(transport: Box<dyn Transport>, keys: KeyManager) -> OathResult<Self> {
        Self::connect_with_password(transport, keys, None, false)
    }

    /// Like [`OathClient::connect`], trying `password` first when given.
    /// A password that unlocks the token is stored in `keys`, permanently
    /// if `remember` is set.
    ///
    /// # Errors
    ///
    /// See [`OathClient::connect`].
    pub fn connect_with_password(
        transport: Box<dyn Transport>,
        keys: KeyManager,
        password: Option<&str>,
        remember: bool,
    ) -> OathResult<Self> {
        let session = OathSession::open(transport)?;
        let transport_kind = session.transport_kind();
        let info = DeviceInfo {
            id: device_id_string(session.device_id()),
            transport: transport_kind,
            persistent: transport_kind.is_persistent(),
            version: session.version(),
            has_password: session.is_locked(),
        };
        log::debug!("Connected to device {} over {transport_kind}", info.id);

        let mut client = Self {
            session,
            keys,
            info,
            default_period: DEFAULT_PERIOD,
            show_hidden: false,
        };
        if client.session.is_locked() {
            client.unlock(password, remember)?;
        }
        Ok(client)
    }

    /// Period assumed for credentials calculated by [`OathClient::refresh_codes`].
    #[must_use]
    pub fn with_default_period(mut self, period: u32) -> Self {
        self.default_period = period.max(1);
        self
    }

    /// Include `_hidden:` credentials in listings.
    #[must_use]
    pub fn show_hidden(mut self, show: bool) -> Self {
        self.show_hidden = show;
        self
    }

    #[must_use]
    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    #[must_use]
    pub fn key_manager(&self) -> &KeyManager {
        &self.keys
    }

    fn unlock(&mut self, password: Option<&str>, remember: bool) -> OathResult<()> {
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            let secret = derive_lock_key(password, self.session.device_id());
            self.session.unlock(&secret)?;
            self.keys.add_key(&self.info.id, &secret, remember)?;
            return Ok(());
        }

        let candidates = self.keys.keys(&self.info.id)?;
        if candidates.is_empty() {
            return Err(OathError::Unlock(UnlockFailure::SecretMissing));
        }
        for (attempt, secret) in candidates.iter().enumerate() {
            if attempt > 0 {
                // A rejected VALIDATE invalidates the applet's challenge.
                self.session.select()?;
            }
            match self.session.unlock(secret) {
                Ok(()) => return Ok(()),
                Err(OathError::Unlock(UnlockFailure::WrongSecret)) => {
                    log::debug!("Stored secret {} of {} rejected", attempt + 1, candidates.len());
                }
                Err(e) => return Err(e),
            }
        }
        Err(OathError::Unlock(UnlockFailure::WrongSecret))
    }

    /// Change, set or remove the password.
    ///
    /// Returns `false` if the token is protected and `old_password` does not
    /// unlock it. An empty `new_password` removes protection.
    ///
    /// # Errors
    ///
    /// Returns transport, APDU or secret-store failures.
    pub fn set_password(
        &mut self,
        old_password: &str,
        new_password: &str,
        remember: bool,
    ) -> OathResult<bool> {
        self.session.select()?;
        if self.session.is_locked() {
            if old_password.is_empty() {
                return Ok(false);
            }
            let secret = derive_lock_key(old_password, self.session.device_id());
            match self.session.unlock(&secret) {
                Ok(()) => {}
                Err(OathError::Unlock(_)) => return Ok(false),
                Err(e) => return Err(e),
            }
        }

        if new_password.is_empty() {
            self.session.unset_lock_code()?;
            self.keys.clear_keys(&self.info.id)?;
            self.info.has_password = false;
        } else {
            let secret = derive_lock_key(new_password, self.session.device_id());
            self.session.set_lock_code(&secret)?;
            self.keys.add_key(&self.info.id, &secret, remember)?;
            self.info.has_password = true;
        }
        Ok(true)
    }

    /// Calculate one credential at `timestamp_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::InvalidInput`] for a credential of another device,
    /// or the session failure.
    pub fn calculate(&mut self, credential: &StoredCredential, timestamp_ms: u64) -> OathResult<Code> {
        self.ensure_ownership(credential)?;

        let period = u64::from(credential.period.max(1));
        let time_step = timestamp_ms / 1000 / period;
        let challenge = time_step.to_be_bytes();

        let value = if credential.is_steam() {
            let response = self.session.calculate(&credential.key, &challenge, false)?;
            steam_code(&response.raw_response)?
        } else {
            self.session
                .calculate(&credential.key, &challenge, true)?
                .value()?
                .ok_or_else(|| {
                    OathError::Protocol(format!("no code returned for '{}'", credential.key))
                })?
        };

        let (valid_from, valid_until) = match credential.oath_type {
            Some(OathType::Totp) => (
                time_step * 1000 * period,
                (time_step + 1) * 1000 * period,
            ),
            Some(OathType::Hotp) | None => (timestamp_ms, u64::MAX),
        };

        Ok(Code {
            value,
            valid_from,
            valid_until,
        })
    }

    /// Calculate everything the token will calculate without interaction.
    ///
    /// Credentials whose period differs from the default, and Steam
    /// credentials, are recalculated individually unless `existing` holds a
    /// code still valid at `timestamp_ms`. HOTP and touch credentials keep
    /// their `existing` code, if any.
    ///
    /// # Errors
    ///
    /// Returns the session failure.
    pub fn refresh_codes(
        &mut self,
        timestamp_ms: u64,
        existing: &HashMap<StoredCredential, Code>,
    ) -> OathResult<Vec<(StoredCredential, Option<Code>)>> {
        let period = u64::from(self.default_period);
        let time_step = timestamp_ms / 1000 / period;
        let challenge = time_step.to_be_bytes();

        let responses = self.session.calculate_all(&challenge)?;
        let mut codes = Vec::with_capacity(responses.len());
        for response in responses {
            if !self.show_hidden && is_hidden(&response.name) {
                continue;
            }
            let oath_type = if response.kind == ResponseKind::Hotp {
                OathType::Hotp
            } else {
                OathType::Totp
            };
            let credential = StoredCredential::new(
                self.info.id.clone(),
                response.name.clone(),
                Some(oath_type),
                response.kind == ResponseKind::Touch,
            );
            let previous = existing.get(&credential).cloned();

            let code = if !response.has_value() {
                previous
            } else if u64::from(credential.period) != period || credential.is_steam() {
                match previous {
                    Some(code) if code.valid_until > timestamp_ms => Some(code),
                    _ => Some(self.calculate(&credential, timestamp_ms)?),
                }
            } else {
                response.value()?.map(|value| Code {
                    value,
                    valid_from: time_step * period * 1000,
                    valid_until: (time_step + 1) * period * 1000,
                })
            };
            codes.push((credential, code));
        }
        Ok(codes)
    }

    /// Credentials stored on the token, with their types.
    ///
    /// # Errors
    ///
    /// Returns the session failure.
    pub fn credentials(&mut self) -> OathResult<Vec<StoredCredential>> {
        Ok(self
            .session
            .list_credentials()?
            .into_iter()
            .filter(|listed| self.show_hidden || !is_hidden(&listed.name))
            .map(|listed| {
                StoredCredential::new(self.info.id.clone(), listed.name, Some(listed.oath_type), false)
            })
            .collect())
    }

    /// Program a new credential.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::DuplicateCredential`] if the stored name is
    /// already taken, or the session failure.
    pub fn add_credential(&mut self, data: &CredentialData) -> OathResult<StoredCredential> {
        let credential = data.to_credential();
        if self
            .session
            .list_credentials()?
            .iter()
            .any(|listed| listed.name == credential.name)
        {
            return Err(OathError::DuplicateCredential(credential.name));
        }
        self.session.put_credential(&credential, &data.secret)?;
        Ok(StoredCredential::new(
            self.info.id.clone(),
            credential.name,
            Some(data.oath_type),
            data.touch,
        ))
    }

    /// # Errors
    ///
    /// Returns [`OathError::InvalidInput`] for a credential of another device,
    /// or the session failure.
    pub fn delete(&mut self, credential: &StoredCredential) -> OathResult<()> {
        self.ensure_ownership(credential)?;
        self.session.delete_credential(&credential.key)
    }

    /// Wipe the applet and forget its secrets.
    ///
    /// # Errors
    ///
    /// Returns the session or secret-store failure.
    pub fn reset(&mut self) -> OathResult<()> {
        self.session.reset()?;
        self.keys.clear_keys(&self.info.id)?;
        self.info.id = device_id_string(self.session.device_id());
        self.info.version = self.session.version();
        self.info.has_password = self.session.is_locked();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns the transport's close failure.
    pub fn close(&mut self) -> OathResult<()> {
        self.session.close()
    }

    fn ensure_ownership(&self, credential: &StoredCredential) -> OathResult<()> {
        if credential.device_id != self.info.id {
            return Err(OathError::InvalidInput(
                "Credential belongs to a different device".to_string(),
            ));
        }
        Ok(())
    }
}
