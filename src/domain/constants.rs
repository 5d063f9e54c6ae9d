//! Centralized constants for the OATH applet wire format and CCID framing.
//! Keep this intentionally small; only broadly reused literals should live here.

// === OATH Applet ===

/// OATH applet identifier.
pub const OATH_AID: &[u8] = &[0xA0, 0x00, 0x00, 0x05, 0x27, 0x21, 0x01, 0x01];

/// OATH instruction codes.
pub mod ins {
    /// SELECT application (ISO 7816).
    pub const SELECT: u8 = 0xA4;
    /// Store a credential.
    pub const PUT: u8 = 0x01;
    /// Remove a credential.
    pub const DELETE: u8 = 0x02;
    /// Set or clear the access code.
    pub const SET_CODE: u8 = 0x03;
    /// Wipe the applet.
    pub const RESET: u8 = 0x04;
    /// Enumerate credentials.
    pub const LIST: u8 = 0xA1;
    /// Compute one credential.
    pub const CALCULATE: u8 = 0xA2;
    /// Mutual challenge-response unlock.
    pub const VALIDATE: u8 = 0xA3;
    /// Compute every credential that does not need touch or a counter.
    pub const CALCULATE_ALL: u8 = 0xA4;
    /// Fetch the next chunk of a long response.
    pub const SEND_REMAINING: u8 = 0xA5;
}

/// OATH TLV tags.
pub mod tag {
    pub const NAME: u8 = 0x71;
    pub const NAME_LIST: u8 = 0x72;
    pub const KEY: u8 = 0x73;
    pub const CHALLENGE: u8 = 0x74;
    /// Also the tag of a full (non-truncated) HMAC response.
    pub const RESPONSE: u8 = 0x75;
    pub const TRUNCATED_RESPONSE: u8 = 0x76;
    /// HOTP credential, not calculated by CALCULATE ALL.
    pub const NO_RESPONSE: u8 = 0x77;
    pub const PROPERTY: u8 = 0x78;
    pub const VERSION: u8 = 0x79;
    pub const IMF: u8 = 0x7A;
    /// Touch is required before this credential can be calculated.
    pub const TOUCH: u8 = 0x7C;
}

/// Credential property flag: the token must be touched to calculate.
pub const PROPERTY_REQUIRE_TOUCH: u8 = 0x02;

/// RESET P1/P2 guard values.
pub const RESET_P1: u8 = 0xDE;
pub const RESET_P2: u8 = 0xAD;

/// Minimum HMAC key length accepted by the applet; shorter keys are zero padded.
pub const MIN_KEY_LENGTH: usize = 14;

/// Longest credential name the applet stores, in bytes.
pub const MAX_NAME_LENGTH: usize = 64;

/// Length of the host challenge sent during VALIDATE.
pub const HOST_CHALLENGE_LENGTH: usize = 8;

// === APDU ===

/// Class byte for a plain command.
pub const CLA_DEFAULT: u8 = 0x00;

/// Class byte flagging that more chained command frames follow.
pub const CLA_CHAINING: u8 = 0x10;

/// Largest data field of a short APDU.
pub const SHORT_APDU_MAX_DATA: usize = 0xFF;

// === Lock Code Derivation ===

/// PBKDF2 iteration count for lock-code derivation.
pub const LOCK_KEY_ITERATIONS: u32 = 1000;

/// Derived lock-code length (128 bits).
pub const LOCK_KEY_LENGTH: usize = 16;

// === Time Based Credentials ===

/// Default TOTP period in seconds.
pub const DEFAULT_PERIOD: u32 = 30;

/// Credentials whose name starts with this prefix are hidden from listings.
pub const HIDDEN_PREFIX: &str = "_hidden:";

/// Issuer whose codes use the Steam alphabet.
pub const STEAM_ISSUER: &str = "Steam";

/// Alphabet for Steam Guard codes.
pub const STEAM_CHARS: &[u8] = b"23456789BCDFGHJKMNPQRTVWXY";

// === CCID ===

/// CCID message header length.
pub const CCID_HEADER_SIZE: usize = 10;

/// `YubiKey` exposes a single slot.
pub const CCID_SLOT: u8 = 0;

/// CCID message types.
pub mod ccid_message {
    /// PC to Reader: Transfer block (send APDU).
    pub const PC_TO_RDR_XFR_BLOCK: u8 = 0x6F;
    /// PC to Reader: ICC power on.
    pub const PC_TO_RDR_ICC_POWER_ON: u8 = 0x62;
    /// PC to Reader: ICC power off.
    pub const PC_TO_RDR_ICC_POWER_OFF: u8 = 0x63;
    /// Reader to PC: Data block (APDU response or ATR).
    pub const RDR_TO_PC_DATA_BLOCK: u8 = 0x80;
    /// Reader to PC: Slot status.
    pub const RDR_TO_PC_SLOT_STATUS: u8 = 0x81;
}

/// Mask over `bStatus` selecting the command status bits.
pub const CCID_COMMAND_STATUS_MASK: u8 = 0xC0;

/// Command status value meaning the command failed; `bError` says why.
pub const CCID_STATUS_FAILED: u8 = 0x40;

/// Command status value meaning the card requests more time.
pub const CCID_STATUS_TIME_EXTENSION: u8 = 0x80;

/// Default number of mismatched response packets tolerated before failing.
pub const CCID_DEFAULT_READ_RETRIES: usize = 5;

/// Default limit on how long a card may keep requesting time extensions.
pub const CCID_DEFAULT_TIME_EXTENSION_MS: u64 = 30_000;

/// USB interface class for smart card readers.
pub const USB_CLASS_SMART_CARD: u8 = 0x0B;

/// `YubiKey` USB Vendor ID.
pub const YUBIKEY_VID: u16 = 0x1050;
