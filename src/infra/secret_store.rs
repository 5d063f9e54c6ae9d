//! Storage for derived lock-code secrets.
//!
//! Secrets are keyed by the device id string (see
//! [`crate::services::client::device_id_string`]). [`KeyManager`] combines a
//! permanent store with a session-only one and decides where a new secret
//! goes based on whether the user asked to remember it.

use crate::infra::error::{OathError, OathResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persistence seam for lock-code secrets and device display names.
pub trait SecretStore: Send {
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn get(&self, device_id: &str) -> OathResult<Option<Vec<u8>>>;

    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn set(&mut self, device_id: &str, secret: &[u8]) -> OathResult<()>;

    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn clear(&mut self, device_id: &str) -> OathResult<()>;

    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn clear_all(&mut self) -> OathResult<()>;

    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn display_name(&self, device_id: &str) -> OathResult<Option<String>>;

    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn set_display_name(&mut self, device_id: &str, name: &str) -> OathResult<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct DeviceEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
}

impl DeviceEntry {
    fn is_empty(&self) -> bool {
        self.secret.is_none() && self.display_name.is_none()
    }
}

/// Secrets held only for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: BTreeMap<String, Vec<u8>>,
    names: BTreeMap<String, String>,
}

impl MemorySecretStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, device_id: &str) -> OathResult<Option<Vec<u8>>> {
        Ok(self.secrets.get(device_id).cloned())
    }

    fn set(&mut self, device_id: &str, secret: &[u8]) -> OathResult<()> {
        self.secrets.insert(device_id.to_string(), secret.to_vec());
        Ok(())
    }

    fn clear(&mut self, device_id: &str) -> OathResult<()> {
        self.secrets.remove(device_id);
        Ok(())
    }

    fn clear_all(&mut self) -> OathResult<()> {
        self.secrets.clear();
        Ok(())
    }

    fn display_name(&self, device_id: &str) -> OathResult<Option<String>> {
        Ok(self.names.get(device_id).cloned())
    }

    fn set_display_name(&mut self, device_id: &str, name: &str) -> OathResult<()> {
        self.names.insert(device_id.to_string(), name.to_string());
        Ok(())
    }
}

/// Secrets persisted in a TOML file, hex encoded, one table per device.
#[derive(Debug)]
pub struct FileSecretStore {
    path: PathBuf,
    devices: BTreeMap<String, DeviceEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SecretFile {
    #[serde(default)]
    devices: BTreeMap<String, DeviceEntry>,
}

impl FileSecretStore {
    /// Open the store at `path`; a missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Configuration`] if the file exists but cannot
    /// be read or parsed.
    pub fn open<P: AsRef<Path>>(path: P) -> OathResult<Self> {
        let path = path.as_ref().to_path_buf();
        let devices = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| {
                OathError::Configuration(format!(
                    "Failed to read secret store {}: {e}",
                    path.display()
                ))
            })?;
            let file: SecretFile = toml::from_str(&content).map_err(|e| {
                OathError::Configuration(format!("Failed to parse secret store: {e}"))
            })?;
            file.devices
        } else {
            BTreeMap::new()
        };
        log::debug!(
            "Opened secret store {} ({} devices)",
            path.display(),
            devices.len()
        );
        Ok(Self { path, devices })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> OathResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = SecretFile {
            devices: self.devices.clone(),
        };
        let content = toml::to_string_pretty(&file)
            .map_err(|e| OathError::Configuration(format!("Failed to serialize secrets: {e}")))?;
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut out = options.open(&self.path)?;

        // `mode` only applies when the file is created.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            out.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        out.write_all(content.as_bytes())?;
        Ok(())
    }

    fn update<F: FnOnce(&mut DeviceEntry)>(&mut self, device_id: &str, change: F) -> OathResult<()> {
        let entry = self.devices.entry(device_id.to_string()).or_default();
        change(entry);
        if entry.is_empty() {
            self.devices.remove(device_id);
        }
        self.persist()
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, device_id: &str) -> OathResult<Option<Vec<u8>>> {
        self.devices
            .get(device_id)
            .and_then(|entry| entry.secret.as_deref())
            .map(|encoded| {
                hex::decode(encoded).map_err(|e| {
                    OathError::Configuration(format!("Stored secret is not valid hex: {e}"))
                })
            })
            .transpose()
    }

    fn set(&mut self, device_id: &str, secret: &[u8]) -> OathResult<()> {
        let encoded = hex::encode(secret);
        self.update(device_id, |entry| entry.secret = Some(encoded))
    }

    fn clear(&mut self, device_id: &str) -> OathResult<()> {
        if !self.devices.contains_key(device_id) {
            return Ok(());
        }
        self.update(device_id, |entry| entry.secret = None)
    }

    fn clear_all(&mut self) -> OathResult<()> {
        for entry in self.devices.values_mut() {
            entry.secret = None;
        }
        self.devices.retain(|_, entry| !entry.is_empty());
        self.persist()
    }

    fn display_name(&self, device_id: &str) -> OathResult<Option<String>> {
        Ok(self
            .devices
            .get(device_id)
            .and_then(|entry| entry.display_name.clone()))
    }

    fn set_display_name(&mut self, device_id: &str, name: &str) -> OathResult<()> {
        let name = name.to_string();
        self.update(device_id, |entry| entry.display_name = Some(name))
    }
}

/// Chooses between a permanent and a session-only store.
pub struct KeyManager {
    permanent: Box<dyn SecretStore>,
    memory: Box<dyn SecretStore>,
}

impl KeyManager {
    pub fn new(permanent: Box<dyn SecretStore>, memory: Box<dyn SecretStore>) -> Self {
        Self { permanent, memory }
    }

    /// Key manager that forgets everything on exit.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(
            Box::new(MemorySecretStore::new()),
            Box::new(MemorySecretStore::new()),
        )
    }

    /// Candidate secrets for a device, remembered ones first.
    ///
    /// # Errors
    ///
    /// Returns store read failures.
    pub fn keys(&self, device_id: &str) -> OathResult<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        if let Some(secret) = self.permanent.get(device_id)? {
            keys.push(secret);
        }
        if let Some(secret) = self.memory.get(device_id)? {
            if !keys.contains(&secret) {
                keys.push(secret);
            }
        }
        Ok(keys)
    }

    /// Store a secret, dropping it from the other store.
    ///
    /// # Errors
    ///
    /// Returns store write failures.
    pub fn add_key(&mut self, device_id: &str, secret: &[u8], remember: bool) -> OathResult<()> {
        if remember {
            self.memory.clear(device_id)?;
            self.permanent.set(device_id, secret)
        } else {
            self.permanent.clear(device_id)?;
            self.memory.set(device_id, secret)
        }
    }

    /// # Errors
    ///
    /// Returns store write failures.
    pub fn clear_keys(&mut self, device_id: &str) -> OathResult<()> {
        self.memory.clear(device_id)?;
        self.permanent.clear(device_id)
    }

    /// # Errors
    ///
    /// Returns store write failures.
    pub fn clear_all(&mut self) -> OathResult<()> {
        self.memory.clear_all()?;
        self.permanent.clear_all()
    }

    /// # Errors
    ///
    /// Returns store read failures.
    pub fn display_name(&self, device_id: &str) -> OathResult<Option<String>> {
        self.permanent.display_name(device_id)
    }

    /// # Errors
    ///
    /// Returns store write failures.
    pub fn set_display_name(&mut self, device_id: &str, name: &str) -> OathResult<()> {
        self.permanent.set_display_name(device_id, name)
    }
}
