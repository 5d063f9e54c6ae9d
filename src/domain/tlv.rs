//! Tag-Length-Value codec used by the OATH applet.
//!
//! Tags are a single byte. Lengths use the short form below `0x80`, or a
//! `0x81`/`0x82` prefix followed by one or two big-endian length bytes.
//!
//! ```text
//! 71 03 66 6f 6f          NAME "foo"
//! 75 81 80 <128 bytes>    RESPONSE, one length byte
//! 73 82 01 00 <256 bytes> KEY, two length bytes
//! ```

use crate::infra::error::{OathError, OathResult};
use std::collections::BTreeMap;

/// Long-form marker: one length byte follows.
const LENGTH_ONE_BYTE: u8 = 0x81;
/// Long-form marker: two length bytes follow.
const LENGTH_TWO_BYTES: u8 = 0x82;

/// A single tag-length-value record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    tag: u8,
    value: Vec<u8>,
}

impl Tlv {
    /// Create a record from a tag and value.
    pub fn new(tag: u8, value: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }

    /// Create a record with an empty value.
    #[must_use]
    pub fn empty(tag: u8) -> Self {
        Self::new(tag, Vec::new())
    }

    #[must_use]
    pub fn tag(&self) -> u8 {
        self.tag
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Consume the record, keeping only its value.
    #[must_use]
    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    /// Decode the record starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::MalformedTlv`] if the buffer ends before the
    /// header or value is complete, or the length form is unsupported.
    pub fn decode(buf: &[u8], offset: usize) -> OathResult<Self> {
        Self::decode_at(buf, offset).map(|(tlv, _)| tlv)
    }

    /// Decode the record starting at `offset`, also returning the offset
    /// just past its value.
    ///
    /// # Errors
    ///
    /// See [`Tlv::decode`].
    pub fn decode_at(buf: &[u8], offset: usize) -> OathResult<(Self, usize)> {
        let tag = *buf
            .get(offset)
            .ok_or_else(|| OathError::MalformedTlv(format!("missing tag at offset {offset}")))?;
        let (length, header_len) = parse_length(buf, offset + 1)?;

        let value_start = offset + 1 + header_len;
        let end = value_start
            .checked_add(length)
            .ok_or_else(|| OathError::MalformedTlv("length overflow".to_string()))?;
        if end > buf.len() {
            return Err(OathError::MalformedTlv(format!(
                "tag 0x{tag:02x} declares {length} bytes but only {} remain",
                buf.len().saturating_sub(value_start)
            )));
        }

        Ok((Self::new(tag, &buf[value_start..end]), end))
    }

    /// Encode this record.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::ValueTooLarge`] for values longer than 65535 bytes.
    pub fn encode(&self) -> OathResult<Vec<u8>> {
        encode(self.tag, &self.value)
    }

    /// Append this record's encoding to `out`.
    ///
    /// # Errors
    ///
    /// See [`Tlv::encode`].
    pub fn encode_into(&self, out: &mut Vec<u8>) -> OathResult<()> {
        out.push(self.tag);
        out.extend(length_bytes(self.value.len())?);
        out.extend_from_slice(&self.value);
        Ok(())
    }
}

/// Encode a single record.
///
/// # Errors
///
/// Returns [`OathError::ValueTooLarge`] for values longer than 65535 bytes.
pub fn encode(tag: u8, value: &[u8]) -> OathResult<Vec<u8>> {
    let mut out = Vec::with_capacity(value.len() + 4);
    out.push(tag);
    out.extend(length_bytes(value.len())?);
    out.extend_from_slice(value);
    Ok(out)
}

/// Decode a contiguous run of records covering the whole buffer.
///
/// # Errors
///
/// Returns [`OathError::MalformedTlv`] if any record overruns the buffer.
pub fn decode_group(buf: &[u8]) -> OathResult<Vec<Tlv>> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let (tlv, end) = Tlv::decode_at(buf, offset)?;
        records.push(tlv);
        offset = end;
    }
    Ok(records)
}

/// Encode records back to back.
///
/// # Errors
///
/// Returns [`OathError::ValueTooLarge`] if any value is too long.
pub fn encode_group<'a>(records: impl IntoIterator<Item = &'a Tlv>) -> OathResult<Vec<u8>> {
    let mut out = Vec::new();
    for tlv in records {
        tlv.encode_into(&mut out)?;
    }
    Ok(out)
}

/// Project a group onto a tag-ordered map.
///
/// A later record with the same tag replaces an earlier one. OATH responses
/// never repeat a tag in the groups read this way, so a duplicate is logged
/// as a device anomaly.
#[must_use]
pub fn group_to_map(records: Vec<Tlv>) -> BTreeMap<u8, Vec<u8>> {
    let mut map = BTreeMap::new();
    for tlv in records {
        if let Some(previous) = map.insert(tlv.tag, tlv.value) {
            log::warn!(
                "Duplicate TLV tag 0x{:02x} in response group; replacing {} byte value",
                tlv.tag,
                previous.len()
            );
        }
    }
    map
}

/// Encode a value length.
fn length_bytes(len: usize) -> OathResult<Vec<u8>> {
    if len < 0x80 {
        Ok(vec![len as u8])
    } else if len < 0xFF {
        Ok(vec![LENGTH_ONE_BYTE, len as u8])
    } else if len <= 0xFFFF {
        Ok(vec![LENGTH_TWO_BYTES, (len >> 8) as u8, (len & 0xFF) as u8])
    } else {
        Err(OathError::ValueTooLarge(len))
    }
}

/// Parse a length field at `pos`, returning `(length, bytes consumed)`.
fn parse_length(buf: &[u8], pos: usize) -> OathResult<(usize, usize)> {
    let first = *buf
        .get(pos)
        .ok_or_else(|| OathError::MalformedTlv(format!("missing length at offset {pos}")))?;

    if first < 0x80 {
        return Ok((first as usize, 1));
    }

    let count = match first {
        LENGTH_ONE_BYTE => 1,
        LENGTH_TWO_BYTES => 2,
        _ => {
            return Err(OathError::MalformedTlv(format!(
                "unsupported length encoding 0x{first:02x}"
            )))
        }
    };

    let bytes = buf
        .get(pos + 1..pos + 1 + count)
        .ok_or_else(|| OathError::MalformedTlv("truncated length encoding".to_string()))?;
    let length = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Ok((length, 1 + count))
}
