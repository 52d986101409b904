use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// Subdirectory that holds the message shards in a decrypted data directory.
pub const MSG_DIR_NAME: &str = "Msg";
/// Nested folder holding the "multi" shards.
pub const MULTI_DIR_NAME: &str = "Multi";

/// Returns `true` for file names of the form `MSG<digits>.db`.
pub fn is_shard_name(name: &str) -> bool {
    name.strip_prefix("MSG")
        .and_then(|rest| rest.strip_suffix(".db"))
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// Find every message shard under `root`.
///
/// Searches `root` and `root/Msg`, plus the `Multi` folder inside each. A
/// missing subdirectory is simply an empty branch. Paths are canonicalized so
/// symlinks and overlapping roots collapse to one entry, and the result is
/// sorted lexicographically.
pub fn locate_shards(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(EngineError::RootNotFound(root.to_path_buf()));
    }

    let mut search_roots = vec![root.to_path_buf()];
    let msg_dir = root.join(MSG_DIR_NAME);
    if msg_dir.is_dir() {
        search_roots.push(msg_dir);
    }

    let mut found = BTreeSet::new();
    for dir in &search_roots {
        collect_shards(dir, &mut found);
        collect_shards(&dir.join(MULTI_DIR_NAME), &mut found);
    }

    tracing::info!(root = %root.display(), count = found.len(), "located message shards");
    Ok(found.into_iter().collect())
}

fn collect_shards(dir: &Path, found: &mut BTreeSet<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !is_shard_name(&name.to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let path = fs::canonicalize(&path).unwrap_or(path);
        found.insert(path);
    }
}

/// Locate the auxiliary contact database (`FTSContact.db`), if any.
pub fn locate_contact_db(root: &Path) -> Option<PathBuf> {
    [
        root.join("FTSContact.db"),
        root.join(MSG_DIR_NAME).join("FTSContact.db"),
    ]
    .into_iter()
    .find(|p| p.is_file())
}
