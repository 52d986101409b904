//! # wechat-chat-export
//!
//! Reads chat history out of decrypted WeChat message databases and turns it
//! into normalized, time-ordered records.
//!
//! ## What it does
//!
//! WeChat spreads each conversation over many `MSG<n>.db` shards. Rows carry a
//! `BytesExtra` blob (protobuf-style tagged fields, no schema) holding the real
//! sender of group messages and media paths, and link/card messages keep an
//! LZ4-compressed XML document in `CompressContent`. This crate:
//!
//! 1. finds the shards ([`shards`]),
//! 2. decodes the tagged blob ([`extra`]) and the content ([`content`]),
//! 3. normalizes each row ([`record`]),
//! 4. picks display names from remarks, aliases, nicknames and in-group
//!    nicknames ([`directory`]),
//! 5. merges all shards into one ordered stream per conversation ([`engine`]).
//!
//! Every database is opened **read-only**. A broken row or a broken shard is
//! counted and skipped; it never ends the export.
//!
//! ## Usage
//!
//! ```no_run
//! use wechat_chat_export::{Engine, EngineOptions, TimeRange};
//!
//! # fn main() -> Result<(), wechat_chat_export::EngineError> {
//! let engine = Engine::open("/path/to/decrypted", EngineOptions::default())?;
//! let id = engine.resolve_conversation_query("Family")?.pop_first().unwrap_or_default();
//! let mut stream = engine.stream_messages(&id, TimeRange::default(), Some(100))?;
//! for message in stream.by_ref() {
//!     let message = message?;
//!     println!("{} {}: {}", message.timestamp, message.sender, message.text);
//! }
//! eprintln!("{:?}", stream.report());
//! # Ok(())
//! # }
//! ```
//!
//! ## Compatibility
//!
//! Tracks the undocumented pre-4.0 desktop schema (`MSG` / `Name2ID` tables,
//! `FTSContact.db`). The newer 4.x layout is not supported.

pub mod content;
pub mod directory;
pub mod engine;
pub mod error;
pub mod export;
pub mod extra;
pub mod merge;
pub mod record;
pub mod shards;
pub mod utils;

pub use directory::{Directory, DisplayIdentity};
pub use engine::{CancelToken, Engine, EngineOptions, MessageStream, StreamReport, TimeRange};
pub use error::{DecodeError, EngineError, Result};
pub use extra::{DecodedBinaryField, FieldConvention};
pub use record::{Message, RawRecord};
