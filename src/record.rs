use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::ValueRef;
use serde::Serialize;

use crate::content::{self, CardExtract, MessageKind};
use crate::directory::{Directory, DisplayIdentity};
use crate::error::DecodeError;
use crate::extra::{Field, FieldConvention, MediaRef};

/// Conversation ids with this suffix are group chats.
pub const GROUP_SUFFIX: &str = "@chatroom";
/// Sender id used for rows written by the account owner.
pub const SELF_SENDER: &str = "self";

pub fn is_group(conversation_id: &str) -> bool {
    conversation_id.ends_with(GROUP_SUFFIX)
}

/// `CreateTime` as SQLite compares and sorts it. Odd rows store REAL or TEXT
/// times, so the paging key must be this expression and not the raw column.
pub const CREATE_TIME_KEY: &str = "CAST(CreateTime AS INTEGER)";

/// Column list matching [`RawRecord::from_row`].
pub const RECORD_COLUMNS: &str = "rowid, MsgSvrID, Sequence, CAST(CreateTime AS INTEGER), \
     StrTalker, IsSender, Type, SubType, StrContent, CompressContent, BytesExtra";

/// One row of the `MSG` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub row_offset: i64,
    pub server_id: i64,
    pub sequence: i64,
    pub timestamp: i64,
    pub conversation_id: String,
    pub is_self: bool,
    pub msg_type: i64,
    pub sub_type: i64,
    pub text: Option<String>,
    pub compressed: Option<Vec<u8>>,
    pub extra: Option<Vec<u8>>,
}

impl RawRecord {
    /// Read a row selected with [`RECORD_COLUMNS`].
    ///
    /// Column types are not trusted: a TEXT blob or a NULL integer never
    /// fails the row.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            row_offset: int_column(row, 0)?,
            server_id: int_column(row, 1)?,
            sequence: int_column(row, 2)?,
            timestamp: int_column(row, 3)?,
            conversation_id: text_column(row, 4)?.unwrap_or_default(),
            is_self: int_column(row, 5)? != 0,
            msg_type: int_column(row, 6)?,
            sub_type: int_column(row, 7)?,
            text: text_column(row, 8)?,
            compressed: blob_column(row, 9)?,
            extra: blob_column(row, 10)?,
        })
    }
}

fn int_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<i64> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Integer(v) => v,
        ValueRef::Real(v) => v as i64,
        ValueRef::Text(t) => std::str::from_utf8(t)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0),
        ValueRef::Null | ValueRef::Blob(_) => 0,
    })
}

fn text_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Text(b) | ValueRef::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
        ValueRef::Integer(v) => Some(v.to_string()),
        ValueRef::Real(v) => Some(v.to_string()),
        ValueRef::Null => None,
    })
}

fn blob_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Vec<u8>>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Blob(b) | ValueRef::Text(b) => Some(b.to_vec()),
        _ => None,
    })
}

/// Canonical, display-annotated message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub timestamp: i64,
    pub server_id: i64,
    pub sequence: i64,
    pub conversation: DisplayIdentity,
    pub sender: DisplayIdentity,
    pub is_self: bool,
    pub is_group: bool,
    pub msg_type: i64,
    pub sub_type: i64,
    pub kind: MessageKind,
    pub text: String,
    pub raw_text: String,
    pub card: Option<CardExtract>,
    pub media_paths: Vec<MediaRef>,
    /// Blob fields with no known role, kept as decoded.
    pub unknown_fields: Vec<Field>,
    pub metadata: BTreeMap<String, String>,
}

impl Message {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }
}

/// What went wrong while normalizing one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordIssues {
    pub malformed_field: Option<DecodeError>,
    pub decompression_failed: bool,
}

/// A decoded record waiting for display names.
#[derive(Debug, Clone)]
pub struct NormalizedRecord {
    pub timestamp: i64,
    pub server_id: i64,
    pub sequence: i64,
    pub conversation_id: String,
    pub sender_id: String,
    pub is_self: bool,
    pub is_group: bool,
    pub msg_type: i64,
    pub sub_type: i64,
    pub kind: MessageKind,
    pub text: String,
    pub raw_text: String,
    pub card: Option<CardExtract>,
    pub media_paths: Vec<MediaRef>,
    pub unknown_fields: Vec<Field>,
    pub metadata: BTreeMap<String, String>,
    pub issues: RecordIssues,
}

/// Decode the metadata blob and the content of one row.
///
/// Never fails: a bad blob leaves the media fields empty and a bad
/// compressed payload falls back to the text column, both noted in
/// `issues` and in the metadata bag.
pub fn normalize(raw: RawRecord, convention: &FieldConvention) -> NormalizedRecord {
    let mut issues = RecordIssues::default();
    let mut metadata = BTreeMap::new();

    let decoded = match convention.decode(raw.extra.as_deref()) {
        Ok(decoded) => decoded,
        Err(err) => {
            metadata.insert("binary_field_error".to_string(), err.to_string());
            issues.malformed_field = Some(err);
            Default::default()
        }
    };

    let kind = MessageKind::from_code(raw.msg_type);
    let resolved = content::resolve_content(kind, raw.text.as_deref(), raw.compressed.as_deref());
    if resolved.decompression_failed {
        issues.decompression_failed = true;
        metadata.insert("decompression_failed".to_string(), "true".to_string());
    }
    if let Some(card) = &resolved.card {
        let fields = [
            ("title", &card.title),
            ("description", &card.summary),
            ("url", &card.link),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                metadata.insert(key.to_string(), value.clone());
            }
        }
    }

    let media_keys: &[(&str, bool)] = match kind {
        MessageKind::Image => &[("image_path", false), ("thumb_path", true)],
        MessageKind::Voice => &[("voice_path", false)],
        MessageKind::Video => &[("video_path", false)],
        _ => &[],
    };
    for &(key, thumbnail) in media_keys {
        let path = if thumbnail {
            decoded.thumbnail()
        } else {
            decoded.media()
        };
        if let Some(path) = path {
            metadata.insert(key.to_string(), path.to_string());
        }
    }

    for field in &decoded.unknown {
        metadata
            .entry(format!("field_{}", field.number))
            .and_modify(|v: &mut String| {
                v.push(',');
                v.push_str(&field.opaque_text());
            })
            .or_insert_with(|| field.opaque_text());
    }

    let is_group = is_group(&raw.conversation_id);
    let sender_id = match (is_group, decoded.real_sender) {
        (true, Some(member)) => member,
        (_, None) | (false, _) if raw.is_self => SELF_SENDER.to_string(),
        _ => raw.conversation_id.clone(),
    };

    NormalizedRecord {
        timestamp: raw.timestamp,
        server_id: raw.server_id,
        sequence: raw.sequence,
        conversation_id: raw.conversation_id,
        sender_id,
        is_self: raw.is_self,
        is_group,
        msg_type: raw.msg_type,
        sub_type: raw.sub_type,
        kind,
        text: resolved.text.trim().to_string(),
        raw_text: resolved.raw,
        card: resolved.card,
        media_paths: decoded.media_paths,
        unknown_fields: decoded.unknown,
        metadata,
        issues,
    }
}

impl NormalizedRecord {
    /// Attach display names and produce the final message.
    pub fn annotate(self, directory: &Directory, self_display: &str) -> Message {
        let conversation = directory.resolve(&self.conversation_id, None);
        let sender = if self.sender_id == SELF_SENDER {
            DisplayIdentity::new(SELF_SENDER, self_display)
        } else if self.sender_id == self.conversation_id {
            conversation.clone()
        } else {
            let group = self.is_group.then_some(self.conversation_id.as_str());
            directory.resolve(&self.sender_id, group)
        };

        Message {
            timestamp: self.timestamp,
            server_id: self.server_id,
            sequence: self.sequence,
            conversation,
            sender,
            is_self: self.is_self,
            is_group: self.is_group,
            msg_type: self.msg_type,
            sub_type: self.sub_type,
            kind: self.kind,
            text: self.text,
            raw_text: self.raw_text,
            card: self.card,
            media_paths: self.media_paths,
            unknown_fields: self.unknown_fields,
            metadata: self.metadata,
        }
    }
}
