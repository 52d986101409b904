use chrono::{Local, NaiveDate, NaiveDateTime, TimeZone};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::extra::FieldConvention;

/// Configuration required to run the export process.
/// This decouples the logic from how the arguments were parsed (CLI/Config file).
#[derive(Clone)]
pub struct ExportConfig {
    pub target_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Conversation queries; `None` exports every conversation.
    pub talkers: Option<Vec<String>>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: Option<usize>,
    pub workers: usize,
    pub timeout: Option<Duration>,
    pub convention: FieldConvention,
    pub self_display: String,
    pub contact_db: Option<PathBuf>,
    pub verbose: bool,
    pub quiet: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessResult {
    Exported,
    /// The conversation had no messages in range; nothing was written.
    Empty,
}

/// Open a database read-only. Every stream opens its own handle.
pub fn open_db(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.execute_batch("PRAGMA cache_size = -16384;")?;
    Ok(conn)
}

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse a local date or date-time into epoch seconds.
pub fn parse_local_timestamp(value: &str) -> Option<i64> {
    let value = value.trim();
    let naive = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .or_else(|| {
            DATE_TIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_all_documented_formats() {
        let day = parse_local_timestamp("2025-01-01").unwrap();
        assert_eq!(parse_local_timestamp("2025-01-01T00:00"), Some(day));
        assert_eq!(parse_local_timestamp("2025-01-01 00:00"), Some(day));
        assert_eq!(parse_local_timestamp("2025-01-01 00:00:30"), Some(day + 30));
        assert_eq!(parse_local_timestamp(" 2025-01-01T01:00:00 "), Some(day + 3600));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_local_timestamp("yesterday"), None);
        assert_eq!(parse_local_timestamp("2025-13-01"), None);
    }
}
