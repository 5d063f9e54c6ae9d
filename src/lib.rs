//! YubiKey OATH Library
//!
//! Host-side implementation of the YubiKey OATH applet protocol: TLV and
//! APDU codecs, USB CCID and NFC transports, the applet session itself and
//! a client that adds password handling and credential naming conventions.
//!
//! ```no_run
//! # #[cfg(feature = "direct-usb")]
//! # fn main() -> yubikey_oath::OathResult<()> {
//! use yubikey_oath::adapters::ccid::CcidTransport;
//! use yubikey_oath::{KeyManager, OathClient, OathConfiguration};
//!
//! let transport = CcidTransport::open(&OathConfiguration::default())?;
//! let mut client = OathClient::connect(Box::new(transport), KeyManager::in_memory())?;
//! for credential in client.credentials()? {
//!     println!("{credential}");
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "direct-usb"))]
//! # fn main() {}
//! ```

pub mod adapters;
pub mod domain;
pub mod infra;
pub mod services;

pub use adapters::{Transport, TransportKind};
pub use domain::credential_data::{CredentialData, CredentialName};
pub use domain::crypto::HashAlgorithm;
pub use domain::oath::{CalculatedCode, Credential, DeviceIdentity, OathType, Version};
pub use infra::config::{ConfigManager, OathConfiguration};
pub use infra::error::{OathError, OathResult, UnlockFailure};
pub use infra::secret_store::{FileSecretStore, KeyManager, MemorySecretStore, SecretStore};
pub use services::{Code, DeviceInfo, OathClient, OathSession, SessionState, StoredCredential};
