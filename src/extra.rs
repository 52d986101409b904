use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;

use crate::error::DecodeError;

/// A varint never needs more than 10 bytes to hold a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Decode a varint starting at `pos`. Returns the value and the position
/// just past it.
pub fn read_varint(buf: &[u8], pos: usize) -> Result<(u64, usize), DecodeError> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let Some(&byte) = buf.get(pos + i) else {
            break;
        };
        // The tenth byte only has room for bit 63.
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            break;
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, pos + i + 1));
        }
    }
    Err(DecodeError::MalformedVarint { offset: pos })
}

/// Append the varint encoding of `value` to `out`.
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    Fixed32,
    /// Deprecated group markers (3, 4) and the reserved values 6 and 7.
    Unknown(u8),
}

impl WireType {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Varint,
            1 => Self::Fixed64,
            2 => Self::LengthDelimited,
            5 => Self::Fixed32,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FieldValue {
    Varint(u64),
    Fixed64(u64),
    Fixed32(u32),
    Bytes(Vec<u8>),
    /// Bytes following a tag whose wire type could not be interpreted.
    Unparsed(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub number: u32,
    pub wire_type: WireType,
    pub value: FieldValue,
}

impl Field {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.value {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self.value {
            FieldValue::Varint(v) | FieldValue::Fixed64(v) => Some(v),
            FieldValue::Fixed32(v) => Some(u64::from(v)),
            _ => None,
        }
    }

    /// Value as text: numbers in decimal, byte payloads in base64.
    pub fn opaque_text(&self) -> String {
        match &self.value {
            FieldValue::Varint(v) | FieldValue::Fixed64(v) => v.to_string(),
            FieldValue::Fixed32(v) => v.to_string(),
            FieldValue::Bytes(b) | FieldValue::Unparsed(b) => BASE64.encode(b),
        }
    }

    /// Decode a length-delimited value as a nested message.
    pub fn submessage(&self) -> Option<Vec<Field>> {
        self.as_bytes().and_then(|b| decode_fields(b).ok())
    }
}

/// Split a blob into its top-level fields.
///
/// Unknown wire types do not fail the decode. Group markers carry no payload
/// and are recorded as empty [`FieldValue::Unparsed`] values; for wire types 6
/// and 7 the length cannot be known, so the remainder of the blob is kept as
/// one unparsed value and decoding stops there.
pub fn decode_fields(buf: &[u8]) -> Result<Vec<Field>, DecodeError> {
    let mut fields = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        let tag_offset = pos;
        let (tag, next) = read_varint(buf, pos)?;
        pos = next;

        let number = u32::try_from(tag >> 3).map_err(|_| DecodeError::MalformedBinaryField {
            offset: tag_offset,
            reason: "field number out of range",
        })?;
        if number == 0 {
            return Err(DecodeError::MalformedBinaryField {
                offset: tag_offset,
                reason: "field number 0",
            });
        }
        let wire_type = WireType::from_bits((tag & 0x7) as u8);

        let value = match wire_type {
            WireType::Varint => {
                let (v, next) = read_varint(buf, pos)?;
                pos = next;
                FieldValue::Varint(v)
            }
            WireType::Fixed64 => {
                let bytes = take(buf, pos, 8, "truncated fixed64")?;
                pos += 8;
                FieldValue::Fixed64(u64::from_le_bytes(bytes.try_into().unwrap_or([0; 8])))
            }
            WireType::Fixed32 => {
                let bytes = take(buf, pos, 4, "truncated fixed32")?;
                pos += 4;
                FieldValue::Fixed32(u32::from_le_bytes(bytes.try_into().unwrap_or([0; 4])))
            }
            WireType::LengthDelimited => {
                let (len, next) = read_varint(buf, pos)?;
                let len = usize::try_from(len).map_err(|_| DecodeError::MalformedBinaryField {
                    offset: pos,
                    reason: "length out of range",
                })?;
                let bytes = take(buf, next, len, "length frame exceeds blob")?;
                pos = next + len;
                FieldValue::Bytes(bytes.to_vec())
            }
            WireType::Unknown(3 | 4) => FieldValue::Unparsed(Vec::new()),
            WireType::Unknown(_) => {
                let rest = buf[pos..].to_vec();
                pos = buf.len();
                FieldValue::Unparsed(rest)
            }
        };

        fields.push(Field {
            number,
            wire_type,
            value,
        });
    }

    Ok(fields)
}

fn take<'a>(
    buf: &'a [u8],
    pos: usize,
    len: usize,
    reason: &'static str,
) -> Result<&'a [u8], DecodeError> {
    pos.checked_add(len)
        .and_then(|end| buf.get(pos..end))
        .ok_or(DecodeError::MalformedBinaryField {
            offset: pos,
            reason,
        })
}

/// What a known field number means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    /// Canonical id of the member who actually sent a group message.
    RealSender,
    /// Path to a thumbnail image.
    Thumbnail,
    /// Path to the primary media file (image, voice clip, video).
    Media,
}

/// Where the role keys are found inside the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Role keys are top-level field numbers.
    Flat,
    /// Top-level `entry_field` repeats `{key_field: varint, value_field: bytes}`.
    Keyed {
        entry_field: u32,
        key_field: u32,
        value_field: u32,
    },
}

/// Versioned table mapping field numbers to roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldConvention {
    pub name: &'static str,
    pub layout: Layout,
    pub roles: Vec<(u32, FieldRole)>,
}

impl Default for FieldConvention {
    fn default() -> Self {
        Self::flat()
    }
}

impl FieldConvention {
    fn standard_roles() -> Vec<(u32, FieldRole)> {
        vec![
            (1, FieldRole::RealSender),
            (3, FieldRole::Thumbnail),
            (4, FieldRole::Media),
        ]
    }

    pub fn flat() -> Self {
        Self {
            name: "flat",
            layout: Layout::Flat,
            roles: Self::standard_roles(),
        }
    }

    pub fn keyed() -> Self {
        Self {
            name: "keyed",
            layout: Layout::Keyed {
                entry_field: 3,
                key_field: 1,
                value_field: 2,
            },
            roles: Self::standard_roles(),
        }
    }

    /// Add or replace the role of `key`.
    pub fn with_role(mut self, key: u32, role: FieldRole) -> Self {
        self.roles.retain(|(k, _)| *k != key);
        self.roles.push((key, role));
        self
    }

    pub fn role_of(&self, key: u32) -> Option<FieldRole> {
        self.roles
            .iter()
            .find_map(|&(k, role)| (k == key).then_some(role))
    }

    /// Decode `blob` and interpret it through this table.
    ///
    /// An absent or empty blob is a normal, empty result.
    pub fn decode(&self, blob: Option<&[u8]>) -> Result<DecodedBinaryField, DecodeError> {
        let mut decoded = DecodedBinaryField::default();
        let Some(blob) = blob.filter(|b| !b.is_empty()) else {
            return Ok(decoded);
        };

        for field in decode_fields(blob)? {
            match self.layout {
                Layout::Flat => {
                    let text = field.as_str().map(str::to_owned);
                    match (self.role_of(field.number), text) {
                        (Some(role), Some(value)) => decoded.assign(field.number, role, value),
                        _ => decoded.unknown.push(field),
                    }
                }
                Layout::Keyed {
                    entry_field,
                    key_field,
                    value_field,
                } => {
                    let entry = (field.number == entry_field)
                        .then(|| field.submessage())
                        .flatten()
                        .and_then(|sub| keyed_entry(&sub, key_field, value_field));
                    match entry {
                        Some((key, value)) => match self.role_of(key) {
                            Some(role) => decoded.assign(key, role, value),
                            None => decoded.unknown.push(field),
                        },
                        None => decoded.unknown.push(field),
                    }
                }
            }
        }

        Ok(decoded)
    }
}

fn keyed_entry(sub: &[Field], key_field: u32, value_field: u32) -> Option<(u32, String)> {
    let key = sub
        .iter()
        .find(|f| f.number == key_field)
        .and_then(Field::as_u64)
        .and_then(|k| u32::try_from(k).ok())?;
    let value = sub
        .iter()
        .find(|f| f.number == value_field)
        .and_then(|f| f.as_bytes())
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();
    Some((key, value))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaRef {
    /// Field number (or entry key) the path came from.
    pub key: u32,
    pub thumbnail: bool,
    pub path: String,
}

/// Interpreted contents of a metadata blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecodedBinaryField {
    pub real_sender: Option<String>,
    pub media_paths: Vec<MediaRef>,
    /// Fields without a known role, kept verbatim.
    pub unknown: Vec<Field>,
}

impl DecodedBinaryField {
    fn assign(&mut self, key: u32, role: FieldRole, value: String) {
        match role {
            FieldRole::RealSender => {
                let value = value.trim();
                if !value.is_empty() && self.real_sender.is_none() {
                    self.real_sender = Some(value.to_owned());
                }
            }
            FieldRole::Thumbnail | FieldRole::Media => {
                if let Some(path) = normalize_media_path(&value) {
                    self.media_paths.push(MediaRef {
                        key,
                        thumbnail: role == FieldRole::Thumbnail,
                        path,
                    });
                }
            }
        }
    }

    pub fn media(&self) -> Option<&str> {
        self.media_paths
            .iter()
            .find(|m| !m.thumbnail)
            .map(|m| m.path.as_str())
    }

    pub fn thumbnail(&self) -> Option<&str> {
        self.media_paths
            .iter()
            .find(|m| m.thumbnail)
            .map(|m| m.path.as_str())
    }
}

/// Use forward slashes and drop the leading account directory.
pub fn normalize_media_path(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let path = raw.replace('\\', "/");
    match path.split_once('/') {
        Some((_, rest)) if !rest.is_empty() => Some(rest.to_string()),
        _ => Some(path),
    }
}
