//! Shared fixtures: real SQLite shards written into a temp directory.

#![allow(dead_code)]

use rusqlite::types::Value;
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// One MSG row. Fields default to a plain incoming text message.
#[derive(Clone, Debug)]
pub struct Row {
    pub server_id: i64,
    pub time: i64,
    /// Stored instead of `time` when set; some rows carry REAL times.
    pub real_time: Option<f64>,
    pub talker: String,
    pub is_sender: bool,
    pub msg_type: i64,
    pub text: Option<String>,
    pub compressed: Option<Vec<u8>>,
    pub extra: Option<Vec<u8>>,
}

impl Row {
    pub fn text(talker: &str, server_id: i64, time: i64, text: &str) -> Self {
        Self {
            server_id,
            time,
            real_time: None,
            talker: talker.to_string(),
            is_sender: false,
            msg_type: 1,
            text: Some(text.to_string()),
            compressed: None,
            extra: None,
        }
    }

    pub fn from_member(mut self, member: &str) -> Self {
        self.extra = Some(flat_sender_blob(member));
        self
    }

    pub fn with_extra(mut self, blob: Vec<u8>) -> Self {
        self.extra = Some(blob);
        self
    }

    pub fn at_real_time(mut self, time: f64) -> Self {
        self.real_time = Some(time);
        self
    }

    /// Link card (type 49) with the given `CompressContent` bytes.
    pub fn card(mut self, compressed: Vec<u8>) -> Self {
        self.msg_type = 49;
        self.compressed = Some(compressed);
        self
    }

    pub fn sent(mut self) -> Self {
        self.is_sender = true;
        self
    }
}

/// BytesExtra with top-level field 1 holding the real sender.
pub fn flat_sender_blob(member: &str) -> Vec<u8> {
    let mut blob = vec![0x0a, member.len() as u8];
    blob.extend_from_slice(member.as_bytes());
    blob
}

/// Length frame claims more bytes than the blob has.
pub fn truncated_blob() -> Vec<u8> {
    vec![0x0a, 0x20, b'w', b'x']
}

pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `MSG<n>.db` under `<root>/Msg` with a Name2ID table.
    pub fn shard(&self, n: u32, rows: &[Row]) -> PathBuf {
        let dir = self.root().join("Msg");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("MSG{n}.db"));
        write_shard(&path, rows, true);
        path
    }

    /// Shard without Name2ID; conversations come from StrTalker.
    pub fn bare_shard(&self, n: u32, rows: &[Row]) -> PathBuf {
        let path = self.root().join(format!("MSG{n}.db"));
        write_shard(&path, rows, false);
        path
    }

    /// A shard-named file that is not a database.
    pub fn garbage_shard(&self, n: u32) -> PathBuf {
        let path = self.root().join(format!("MSG{n}.db"));
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();
        path
    }

    /// `FTSContact.db` with personal names `(id, alias, nickname, remark)`
    /// and group members `(group, member, group_remark, nickname, alias)`.
    pub fn contacts(
        &self,
        people: &[(&str, &str, &str, &str)],
        members: &[(&str, &str, &str, &str, &str)],
    ) -> PathBuf {
        let path = self.root().join("FTSContact.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE NameToId (userName TEXT);
             CREATE TABLE FTSContact15_content (docid INTEGER, c0alias TEXT, c1nickname TEXT, c2remark TEXT);
             CREATE TABLE FTSContact15_MetaData (docid INTEGER, entityId INTEGER);
             CREATE TABLE FTSChatroom15_content (docid INTEGER, c0groupRemark TEXT, c1nickname TEXT, c2alias TEXT);
             CREATE TABLE FTSChatroom15_MetaData (docid INTEGER, groupTalkerId INTEGER, talkerId INTEGER);",
        )
        .unwrap();

        let id_of = |name: &str| -> i64 {
            if let Ok(id) = conn.query_row(
                "SELECT rowid FROM NameToId WHERE userName = ?1",
                [name],
                |r| r.get(0),
            ) {
                return id;
            }
            conn.execute("INSERT INTO NameToId (userName) VALUES (?1)", [name])
                .unwrap();
            conn.last_insert_rowid()
        };

        for (docid, (id, alias, nickname, remark)) in people.iter().enumerate() {
            let entity = id_of(id);
            conn.execute(
                "INSERT INTO FTSContact15_content VALUES (?1, ?2, ?3, ?4)",
                params![docid as i64, alias, nickname, remark],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO FTSContact15_MetaData VALUES (?1, ?2)",
                params![docid as i64, entity],
            )
            .unwrap();
        }
        for (docid, (group, member, group_remark, nickname, alias)) in members.iter().enumerate() {
            let (g, m) = (id_of(group), id_of(member));
            conn.execute(
                "INSERT INTO FTSChatroom15_content VALUES (?1, ?2, ?3, ?4)",
                params![docid as i64, group_remark, nickname, alias],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO FTSChatroom15_MetaData VALUES (?1, ?2, ?3)",
                params![docid as i64, g, m],
            )
            .unwrap();
        }
        path
    }
}

fn write_shard(path: &Path, rows: &[Row], name_table: bool) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE MSG (
            localId INTEGER PRIMARY KEY AUTOINCREMENT,
            MsgSvrID INTEGER, Sequence INTEGER, CreateTime INTEGER, StrTalker TEXT,
            IsSender INTEGER, Type INTEGER, SubType INTEGER, StrContent TEXT,
            CompressContent BLOB, BytesExtra BLOB
        );",
    )
    .unwrap();
    if name_table {
        conn.execute_batch("CREATE TABLE Name2ID (UsrName TEXT);")
            .unwrap();
    }

    let mut talkers: Vec<&str> = Vec::new();
    for row in rows {
        conn.execute(
            "INSERT INTO MSG (MsgSvrID, Sequence, CreateTime, StrTalker, IsSender, Type, SubType,
                              StrContent, CompressContent, BytesExtra)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9)",
            params![
                row.server_id,
                row.time * 1000,
                row.real_time.map_or(Value::Integer(row.time), Value::Real),
                row.talker,
                row.is_sender as i64,
                row.msg_type,
                row.text,
                row.compressed,
                row.extra,
            ],
        )
        .unwrap();
        if !talkers.contains(&row.talker.as_str()) {
            talkers.push(&row.talker);
        }
    }
    if name_table {
        for talker in talkers {
            conn.execute("INSERT INTO Name2ID (UsrName) VALUES (?1)", [talker])
                .unwrap();
        }
    }
}
