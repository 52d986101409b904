use chrono::Local;
use crossbeam_channel::{RecvTimeoutError, SendTimeoutError, bounded};
use eyre::{Context, Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;

use crate::engine::{CancelToken, Engine, EngineOptions, StreamReport, TimeRange};
use crate::error::EngineError;
use crate::record::Message;
use crate::utils::{ExportConfig, ProcessResult};

pub const EXPORT_HEADER: [&str; 10] = [
    "timestamp",
    "talker_display",
    "talker_id",
    "sender_display",
    "sender_id",
    "message_type",
    "message_subtype",
    "content",
    "raw_content",
    "extras",
];

/// Totals over every exported conversation.
#[derive(Debug, Default)]
pub struct ExportSummary {
    pub exported: Vec<(String, PathBuf)>,
    pub empty: usize,
    pub failed: usize,
    pub malformed_fields: usize,
    pub decompression_failures: usize,
    pub unreadable_shards: usize,
    pub cancelled: bool,
}

impl ExportSummary {
    fn absorb(&mut self, report: &StreamReport) {
        self.malformed_fields += report.malformed_fields;
        self.decompression_failures += report.decompression_failures;
        self.unreadable_shards = self.unreadable_shards.max(report.unreadable_shards.len());
        self.cancelled |= report.cancelled;
    }
}

pub fn execute(config: ExportConfig) -> Result<ExportSummary> {
    let options = EngineOptions {
        convention: config.convention.clone(),
        self_display: config.self_display.clone(),
        contact_db: config.contact_db.clone(),
        ..Default::default()
    };
    let engine = Engine::open(&config.data_dir, options).wrap_err_with(|| {
        format!(
            "Failed to open data directory: {}",
            config.data_dir.display()
        )
    })?;

    if engine.shards().is_empty() {
        return Err(eyre!(
            "No MSG*.db files found under {}",
            config.data_dir.display()
        ));
    }

    let conversations: Vec<String> = match &config.talkers {
        Some(queries) => engine
            .resolve_conversation_queries(queries)
            .wrap_err("Failed to resolve --talkers")?
            .into_iter()
            .collect(),
        None => engine.list_conversations().iter().cloned().collect(),
    };

    fs::create_dir_all(&config.target_dir).wrap_err_with(|| {
        format!(
            "Failed to create target directory: {}",
            config.target_dir.display()
        )
    })?;

    run_pool(&engine, &conversations, &config)
}

// ── Worker pool ───────────────────────────────────────────────────────────────

fn make_bar(total: u64, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}",
    ) {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar
}

fn run_pool(
    engine: &Engine,
    conversations: &[String],
    config: &ExportConfig,
) -> Result<ExportSummary> {
    let (tx, rx) = bounded::<String>(64);
    let (done_tx, done_rx) = bounded::<()>(0);
    let cancel = CancelToken::new();
    let summary = Mutex::new(ExportSummary::default());
    let count_failed = AtomicUsize::new(0);
    let range = TimeRange::new(config.start, config.end);
    let pb = make_bar(conversations.len() as u64, config.quiet);
    let n_workers = if config.workers > 0 {
        config.workers
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    };

    std::thread::scope(|s| {
        if let Some(timeout) = config.timeout {
            let (cancel, done_rx) = (cancel.clone(), done_rx.clone());
            s.spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(timeout) {
                    tracing::warn!(?timeout, "export timed out, cancelling");
                    cancel.cancel();
                }
            });
        }

        let mut workers = Vec::with_capacity(n_workers);
        for _ in 0..n_workers {
            let rx = rx.clone();
            let (cancel, summary, count_failed, pb) = (&cancel, &summary, &count_failed, &pb);

            workers.push(s.spawn(move || {
                while let Ok(id) = rx.recv() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let outcome = export_conversation(engine, &id, range, config, cancel);
                    let mut summary = match summary.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    match outcome {
                        Ok((ProcessResult::Exported, report, Some(path))) => {
                            summary.absorb(&report);
                            if config.verbose {
                                pb.println(format!("Exported: {}", path.display()));
                            }
                            summary.exported.push((id, path));
                        }
                        Ok((_, report, _)) => {
                            summary.absorb(&report);
                            summary.empty += 1;
                        }
                        Err(e) => {
                            summary.cancelled |= e
                                .downcast_ref::<EngineError>()
                                .is_some_and(|e| matches!(e, EngineError::Cancelled));
                            count_failed.fetch_add(1, Ordering::Relaxed);
                            pb.println(format!("Error [{}]: {:#}", id, e));
                        }
                    }
                    pb.inc(1);
                }
            }));
        }

        drop(rx);

        'outer: for id in conversations {
            let mut pending = id.clone();
            loop {
                if cancel.is_cancelled() {
                    break 'outer;
                }
                match tx.send_timeout(pending, Duration::from_millis(50)) {
                    Ok(()) => break,
                    Err(SendTimeoutError::Disconnected(_)) => break 'outer,
                    Err(SendTimeoutError::Timeout(r)) => {
                        pending = r;
                    }
                }
            }
        }

        drop(tx);
        for worker in workers {
            let _ = worker.join();
        }
        drop(done_tx);
    });

    pb.finish_and_clear();

    let mut summary = summary
        .into_inner()
        .map_err(|_| eyre!("Export worker panicked"))?;
    summary.failed = count_failed.load(Ordering::Relaxed);
    summary.cancelled |= cancel.is_cancelled();
    summary.exported.sort();
    Ok(summary)
}

// ── Per-conversation CSV ──────────────────────────────────────────────────────

/// Stream one conversation into a CSV.
///
/// Rows go to a temporary file next to the target, which is only persisted
/// once the stream finished; a cancelled stream leaves nothing behind.
pub fn export_conversation(
    engine: &Engine,
    conversation_id: &str,
    range: TimeRange,
    config: &ExportConfig,
    cancel: &CancelToken,
) -> Result<(ProcessResult, StreamReport, Option<PathBuf>)> {
    let talker = engine.directory().resolve(conversation_id, None);
    let mut stream = engine
        .stream_messages(conversation_id, range, config.limit)?
        .with_cancellation(cancel.clone());

    let tmp = NamedTempFile::new_in(&config.target_dir)
        .wrap_err("Failed to create temporary file")?;
    let mut writer = csv::Writer::from_writer(tmp);
    writer
        .write_record(EXPORT_HEADER)
        .wrap_err("Failed to write CSV header")?;

    let mut written = 0usize;
    for message in stream.by_ref() {
        let message = message?;
        writer
            .write_record(csv_row(&message))
            .wrap_err("Failed to write CSV row")?;
        written += 1;
    }
    let report = stream.into_report();

    if written == 0 {
        return Ok((ProcessResult::Empty, report, None));
    }

    let mut tmp = writer
        .into_inner()
        .map_err(|e| eyre!("Failed to flush CSV: {}", e.error()))?;
    tmp.flush().wrap_err("Failed to flush CSV")?;

    let path = config
        .target_dir
        .join(csv_file_name(conversation_id, &talker.display));
    tmp.persist(&path)
        .wrap_err_with(|| format!("Failed to write: {}", path.display()))?;

    Ok((ProcessResult::Exported, report, Some(path)))
}

fn csv_row(message: &Message) -> [String; 10] {
    let timestamp = message
        .created_at()
        .map(|dt| {
            dt.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| message.timestamp.to_string());

    [
        timestamp,
        message.conversation.label(),
        message.conversation.id.clone(),
        message.sender.label(),
        message.sender.id.clone(),
        message.msg_type.to_string(),
        message.sub_type.to_string(),
        message.text.clone(),
        message.raw_text.clone(),
        extras_json(message),
    ]
}

/// Metadata bag plus media paths as one JSON object, empty when there is none.
fn extras_json(message: &Message) -> String {
    let mut extras: Map<String, Value> = message
        .metadata
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    if !message.media_paths.is_empty() {
        let paths = message
            .media_paths
            .iter()
            .map(|m| Value::String(m.path.clone()))
            .collect();
        extras.insert("media_paths".to_string(), Value::Array(paths));
    }
    if extras.is_empty() {
        String::new()
    } else {
        Value::Object(extras).to_string()
    }
}

/// `<slug>__<hash>.csv`; the hash keeps ids with the same display name apart.
pub fn csv_file_name(conversation_id: &str, display: &str) -> String {
    let base = if display.trim().is_empty() {
        conversation_id
    } else {
        display
    };
    let raw_slug = slug::slugify(base);
    let slug = raw_slug[..raw_slug.len().min(60)].trim_end_matches('-');
    let slug = if slug.is_empty() { "conversation" } else { slug };
    let digest = format!("{:x}", Sha256::digest(conversation_id.as_bytes()));
    format!("{}__{}.csv", slug, &digest[..6])
}

pub fn print_summary(summary: &ExportSummary, target_dir: &Path) {
    let mut line = format!(
        "Done. {} exported, {} empty to {}.",
        summary.exported.len(),
        summary.empty,
        target_dir.display()
    );
    if summary.failed > 0 {
        line.push_str(&format!(" Completed with {} error(s).", summary.failed));
    }
    if summary.malformed_fields + summary.decompression_failures > 0 {
        line.push_str(&format!(
            " Degraded records: {} malformed metadata, {} undecompressable.",
            summary.malformed_fields, summary.decompression_failures
        ));
    }
    if summary.unreadable_shards > 0 {
        line.push_str(&format!(" {} shard(s) unreadable.", summary.unreadable_shards));
    }
    if summary.cancelled {
        line.push_str(" Cancelled before completion.");
    }
    eprintln!("{}", line);
}
