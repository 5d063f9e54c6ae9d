//! One-time code derivation (RFC 4226 dynamic truncation).

use crate::domain::constants::STEAM_CHARS;
use crate::infra::error::{OathError, OathResult};

/// Extract the 31-bit dynamic binary code from a full HMAC digest.
///
/// The low nibble of the last byte selects the offset of four bytes whose
/// top bit is masked off.
///
/// # Errors
///
/// Returns [`OathError::Protocol`] if the digest is too short for the
/// selected offset.
pub fn dynamic_truncate(digest: &[u8]) -> OathResult<u32> {
    let last = digest
        .last()
        .ok_or_else(|| OathError::Protocol("empty HMAC digest".to_string()))?;
    let offset = (last & 0x0F) as usize;
    let window = digest.get(offset..offset + 4).ok_or_else(|| {
        OathError::Protocol(format!(
            "HMAC digest of {} bytes too short for offset {offset}",
            digest.len()
        ))
    })?;
    Ok(truncated_value(window))
}

/// Render a full HMAC digest as a decimal code of `digits` digits.
///
/// # Errors
///
/// See [`dynamic_truncate`] and [`format_code`].
pub fn code_from_digest(digest: &[u8], digits: u8) -> OathResult<String> {
    format_code(dynamic_truncate(digest)?, digits)
}

/// Render the four bytes of an applet TRUNCATED response as a code.
///
/// # Errors
///
/// Returns [`OathError::Protocol`] unless exactly four response bytes are
/// supplied, and see [`format_code`].
pub fn code_from_truncated(response: &[u8], digits: u8) -> OathResult<String> {
    if response.len() != 4 {
        return Err(OathError::Protocol(format!(
            "truncated response must be 4 bytes, got {}",
            response.len()
        )));
    }
    format_code(truncated_value(response), digits)
}

/// Reduce a 31-bit value modulo `10^digits`, zero padded.
///
/// # Errors
///
/// Returns [`OathError::InvalidInput`] for digit counts outside 1..=10.
pub fn format_code(value: u32, digits: u8) -> OathResult<String> {
    if !(1..=10).contains(&digits) {
        return Err(OathError::InvalidInput(format!(
            "cannot render a {digits}-digit code"
        )));
    }
    let modulus = 10u64.pow(u32::from(digits));
    let code = u64::from(value) % modulus;
    Ok(format!("{code:0width$}", width = digits as usize))
}

/// Render a full digest as a five character Steam Guard code.
///
/// # Errors
///
/// See [`dynamic_truncate`].
pub fn steam_code(digest: &[u8]) -> OathResult<String> {
    let mut value = dynamic_truncate(digest)? as usize;
    let mut code = String::with_capacity(5);
    for _ in 0..5 {
        code.push(STEAM_CHARS[value % STEAM_CHARS.len()] as char);
        value /= STEAM_CHARS.len();
    }
    Ok(code)
}

fn truncated_value(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0] & 0x7F, bytes[1], bytes[2], bytes[3]])
}
