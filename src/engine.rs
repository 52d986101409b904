use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::{Connection, params};
use serde::Serialize;

use crate::directory::Directory;
use crate::error::{EngineError, Result};
use crate::extra::FieldConvention;
use crate::merge::KWayMerge;
use crate::record::{self, CREATE_TIME_KEY, Message, RECORD_COLUMNS, RawRecord};
use crate::shards;
use crate::utils::open_db;

const DEFAULT_PAGE_SIZE: usize = 512;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub convention: FieldConvention,
    /// Display name for messages sent by the account owner.
    pub self_display: String,
    /// Rows fetched per shard query.
    pub page_size: usize,
    /// Contact database to use instead of the one found under the root.
    pub contact_db: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            convention: FieldConvention::default(),
            self_display: "Me".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            contact_db: None,
        }
    }
}

/// Half-open `[start, end)` range of epoch seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl TimeRange {
    pub fn new(start: Option<i64>, end: Option<i64>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: i64) -> bool {
        self.start.is_none_or(|s| ts >= s) && self.end.is_none_or(|e| ts < e)
    }
}

/// Cooperative cancellation flag shared between a stream and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Counters for everything a stream degraded or skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamReport {
    pub rows_read: usize,
    pub yielded: usize,
    pub malformed_fields: usize,
    pub decompression_failures: usize,
    pub duplicates_skipped: usize,
    pub unreadable_shards: Vec<ShardFailure>,
    pub cancelled: bool,
}

impl StreamReport {
    pub fn is_clean(&self) -> bool {
        self.malformed_fields == 0
            && self.decompression_failures == 0
            && self.unreadable_shards.is_empty()
            && !self.cancelled
    }

    fn shard_failed(&mut self, path: &Path, err: &EngineError) {
        tracing::warn!(shard = %path.display(), error = %err, "skipping unreadable shard");
        self.unreadable_shards.push(ShardFailure {
            path: path.to_path_buf(),
            reason: err.to_string(),
        });
    }
}

pub struct Engine {
    root: PathBuf,
    shards: Vec<PathBuf>,
    directory: Directory,
    conversations: BTreeSet<String>,
    options: EngineOptions,
    open_report: StreamReport,
}

impl Engine {
    /// Open a decrypted data directory.
    ///
    /// Only a missing root is fatal; unreadable shards are skipped and
    /// recorded in [`Engine::open_report`].
    pub fn open(root: impl AsRef<Path>, options: EngineOptions) -> Result<Self> {
        let root = root.as_ref();
        let contact_db = options
            .contact_db
            .clone()
            .or_else(|| shards::locate_contact_db(root));
        let directory = Directory::load(contact_db.as_deref());
        Self::with_directory(root, directory, options)
    }

    /// Open with a directory that was built elsewhere.
    pub fn with_directory(
        root: impl AsRef<Path>,
        directory: Directory,
        options: EngineOptions,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let shards = shards::locate_shards(&root)?;

        let mut open_report = StreamReport::default();
        let mut conversations = BTreeSet::new();
        for path in &shards {
            match list_shard_conversations(path) {
                Ok(ids) => conversations.extend(ids),
                Err(err) => open_report.shard_failed(path, &err),
            }
        }

        Ok(Self {
            root,
            shards,
            directory,
            conversations,
            options,
            open_report,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shards(&self) -> &[PathBuf] {
        &self.shards
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Shards that could not be read while listing conversations.
    pub fn open_report(&self) -> &StreamReport {
        &self.open_report
    }

    pub fn list_conversations(&self) -> &BTreeSet<String> {
        &self.conversations
    }

    /// Resolve a free-text query (id, name, or fragment) to one conversation.
    ///
    /// Returns a single-element set; several matches are an
    /// [`EngineError::AmbiguousConversationQuery`].
    pub fn resolve_conversation_query(&self, text: &str) -> Result<BTreeSet<String>> {
        let matches = self.directory.match_query(text, &self.conversations);
        match matches.len() {
            0 => Err(EngineError::ConversationNotFound(text.trim().to_string())),
            1 => Ok(matches),
            _ => Err(EngineError::AmbiguousConversationQuery {
                query: text.trim().to_string(),
                candidates: matches.into_iter().collect(),
            }),
        }
    }

    /// Resolve several queries; fails on the first one that does not resolve.
    pub fn resolve_conversation_queries<S: AsRef<str>>(
        &self,
        queries: &[S],
    ) -> Result<BTreeSet<String>> {
        let mut resolved = BTreeSet::new();
        for query in queries {
            resolved.extend(self.resolve_conversation_query(query.as_ref())?);
        }
        Ok(resolved)
    }

    /// Stream one conversation's messages across every shard, oldest first.
    ///
    /// `limit` caps the merged output, not each shard.
    pub fn stream_messages(
        &self,
        conversation_id: &str,
        range: TimeRange,
        limit: Option<usize>,
    ) -> Result<MessageStream<'_>> {
        if !self.conversations.contains(conversation_id) {
            return Err(EngineError::ConversationNotFound(
                conversation_id.to_string(),
            ));
        }
        Ok(MessageStream {
            engine: self,
            conversation_id: conversation_id.to_string(),
            range,
            limit,
            cancel: CancelToken::new(),
            state: StreamState::Pending,
            seen_server_ids: HashSet::new(),
            report: StreamReport::default(),
        })
    }
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
}

fn list_shard_conversations(path: &Path) -> Result<Vec<String>> {
    let wrap = |source| EngineError::ShardUnreadable {
        path: path.to_path_buf(),
        source,
    };
    let conn = open_db(path).map_err(wrap)?;

    let mut ids = Vec::new();
    let mut found_table = false;
    for table in ["Name2ID", "Name2ID_v1"] {
        if !table_exists(&conn, table).map_err(wrap)? {
            continue;
        }
        found_table = true;
        let mut stmt = conn
            .prepare(&format!("SELECT UsrName FROM {table} WHERE UsrName != ''"))
            .map_err(wrap)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, Option<String>>(0))
            .map_err(wrap)?;
        for id in rows {
            ids.extend(id.map_err(wrap)?);
        }
    }

    if !found_table {
        let mut stmt = conn
            .prepare("SELECT DISTINCT StrTalker FROM MSG WHERE StrTalker IS NOT NULL")
            .map_err(wrap)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(wrap)?;
        for id in rows {
            ids.push(id.map_err(wrap)?);
        }
    }

    Ok(ids)
}

// ── Shard cursors ─────────────────────────────────────────────────────────────

/// Pages through one shard's rows for a conversation in
/// `(CreateTime, rowid)` order.
pub struct ShardCursor {
    index: usize,
    path: PathBuf,
    conn: Connection,
    conversation_id: String,
    range: TimeRange,
    page_size: usize,
    buffer: VecDeque<RawRecord>,
    last_key: (i64, i64),
    exhausted: bool,
    failure: Option<EngineError>,
}

impl ShardCursor {
    pub fn open(
        index: usize,
        path: &Path,
        conversation_id: &str,
        range: TimeRange,
        page_size: usize,
    ) -> Result<Self> {
        let conn = open_db(path).map_err(|source| EngineError::ShardUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cursor = Self {
            index,
            path: path.to_path_buf(),
            conn,
            conversation_id: conversation_id.to_string(),
            range,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            last_key: (i64::MIN, i64::MIN),
            exhausted: false,
            failure: None,
        };
        // The first page surfaces a missing table or a non-database file.
        cursor.fetch_page().map_err(|source| EngineError::ShardUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(cursor)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Error that ended this cursor early, if any.
    pub fn take_failure(&mut self) -> Option<EngineError> {
        self.failure.take()
    }

    fn fetch_page(&mut self) -> rusqlite::Result<()> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM MSG
             WHERE StrTalker = ?1
               AND {key} >= ?2 AND {key} < ?3
               AND ({key} > ?4 OR ({key} = ?4 AND rowid > ?5))
             ORDER BY {key} ASC, rowid ASC
             LIMIT ?6",
            key = CREATE_TIME_KEY
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![
                self.conversation_id,
                self.range.start.unwrap_or(i64::MIN),
                self.range.end.unwrap_or(i64::MAX),
                self.last_key.0,
                self.last_key.1,
                self.page_size as i64,
            ],
            RawRecord::from_row,
        )?;

        let mut fetched = 0;
        for row in rows {
            let record = row?;
            self.last_key = (record.timestamp, record.row_offset);
            self.buffer.push_back(record);
            fetched += 1;
        }
        if fetched < self.page_size {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl Iterator for ShardCursor {
    type Item = RawRecord;

    fn next(&mut self) -> Option<RawRecord> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(source) = self.fetch_page() {
                self.exhausted = true;
                self.failure = Some(EngineError::ShardUnreadable {
                    path: self.path.clone(),
                    source,
                });
            }
        }
        self.buffer.pop_front()
    }
}

// ── Merged stream ─────────────────────────────────────────────────────────────

type RecordMerge = KWayMerge<ShardCursor, i64, fn(&RawRecord) -> i64>;

fn record_timestamp(record: &RawRecord) -> i64 {
    record.timestamp
}

enum StreamState {
    Pending,
    Merging(RecordMerge),
    Done,
}

/// Lazy, forward-only stream of one conversation's messages.
///
/// Items are `Err` only for cancellation, after which the stream ends. Every
/// other failure is counted in [`MessageStream::report`].
pub struct MessageStream<'a> {
    engine: &'a Engine,
    conversation_id: String,
    range: TimeRange,
    limit: Option<usize>,
    cancel: CancelToken,
    state: StreamState,
    seen_server_ids: HashSet<i64>,
    report: StreamReport,
}

impl MessageStream<'_> {
    pub fn with_cancellation(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn report(&self) -> &StreamReport {
        &self.report
    }

    pub fn into_report(self) -> StreamReport {
        self.report
    }

    fn page_size(&self) -> usize {
        let page = self.engine.options.page_size;
        self.limit.map_or(page, |limit| page.min(limit))
    }

    /// Open a cursor per shard. `None` if cancelled part-way.
    fn open_cursors(&mut self) -> Option<Vec<ShardCursor>> {
        let page_size = self.page_size();
        let mut cursors = Vec::new();
        for (index, path) in self.engine.shards.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return None;
            }
            match ShardCursor::open(index, path, &self.conversation_id, self.range, page_size) {
                Ok(cursor) => cursors.push(cursor),
                Err(err) => self.report.shard_failed(path, &err),
            }
        }
        Some(cursors)
    }

    fn collect_cursor_failures(&mut self, merge: &mut RecordMerge) {
        for cursor in merge.sources_mut() {
            if let Some(err) = cursor.take_failure() {
                self.report.shard_failed(&cursor.path, &err);
            }
        }
    }

    fn cancelled(&mut self) -> Option<Result<Message>> {
        self.state = StreamState::Done;
        self.report.cancelled = true;
        Some(Err(EngineError::Cancelled))
    }
}

impl Iterator for MessageStream<'_> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if matches!(self.state, StreamState::Done) {
                return None;
            }
            if self.cancel.is_cancelled() {
                return self.cancelled();
            }
            if self.limit.is_some_and(|limit| self.report.yielded >= limit) {
                self.state = StreamState::Done;
                return None;
            }

            let mut merge = match std::mem::replace(&mut self.state, StreamState::Done) {
                StreamState::Pending => match self.open_cursors() {
                    Some(cursors) => {
                        KWayMerge::new(cursors, record_timestamp as fn(&RawRecord) -> i64)
                    }
                    None => return self.cancelled(),
                },
                StreamState::Merging(merge) => merge,
                StreamState::Done => return None,
            };

            let next = merge.next();
            self.collect_cursor_failures(&mut merge);
            let Some(raw) = next else {
                return None;
            };
            self.state = StreamState::Merging(merge);
            self.report.rows_read += 1;

            if raw.server_id != 0 && !self.seen_server_ids.insert(raw.server_id) {
                self.report.duplicates_skipped += 1;
                continue;
            }

            let normalized = record::normalize(raw, &self.engine.options.convention);
            if let Some(err) = &normalized.issues.malformed_field {
                self.report.malformed_fields += 1;
                tracing::debug!(
                    conversation = %self.conversation_id,
                    server_id = normalized.server_id,
                    error = %err,
                    "binary field skipped"
                );
            }
            if normalized.issues.decompression_failed {
                self.report.decompression_failures += 1;
                tracing::debug!(
                    conversation = %self.conversation_id,
                    server_id = normalized.server_id,
                    "compressed content unreadable"
                );
            }

            let message =
                normalized.annotate(&self.engine.directory, &self.engine.options.self_display);
            self.report.yielded += 1;
            return Some(Ok(message));
        }
    }
}
