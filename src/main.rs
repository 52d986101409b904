use clap::{Parser, ValueEnum};
use eyre::{Context, Result, eyre};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use wechat_chat_export::engine::{Engine, EngineOptions};
use wechat_chat_export::export;
use wechat_chat_export::extra::FieldConvention;
use wechat_chat_export::utils::{self, ExportConfig};

/// Export decrypted WeChat chat history to CSV files, one per conversation.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory to write CSV files to.
    /// Defaults to ./wechat-chat-export if not set in config.
    #[arg(value_name = "TARGET_DIR")]
    target_dir: Option<PathBuf>,

    /// Directory holding the decrypted MSG*.db shards.
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/wechat-chat-export/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Comma-separated conversations to export (ids, names or fragments).
    #[arg(long, value_name = "QUERIES", value_delimiter = ',')]
    talkers: Option<Vec<String>>,

    /// Only messages at or after this local time (YYYY-MM-DD[ HH:MM[:SS]]).
    #[arg(long, value_name = "DATE")]
    start: Option<String>,

    /// Only messages before this local time.
    #[arg(long, value_name = "DATE")]
    end: Option<String>,

    /// Maximum messages per conversation.
    #[arg(long, value_name = "N")]
    limit: Option<usize>,

    /// Worker threads. Defaults to the number of CPUs.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Cancel the export after this many seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Layout of the BytesExtra metadata blob.
    #[arg(long, value_enum)]
    layout: Option<LayoutArg>,

    /// List conversations and exit.
    #[arg(long)]
    list: bool,

    /// Print each file written and enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress standard output (progress bars).
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
enum LayoutArg {
    #[default]
    Flat,
    Keyed,
}

impl LayoutArg {
    fn convention(self) -> FieldConvention {
        match self {
            LayoutArg::Flat => FieldConvention::flat(),
            LayoutArg::Keyed => FieldConvention::keyed(),
        }
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    target_dir: Option<PathBuf>,
    workers: Option<usize>,
    layout: Option<LayoutArg>,
    self_display: Option<String>,
    contact_db: Option<PathBuf>,
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("wechat-chat-export/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn parse_date(flag: &str, value: Option<&str>) -> Result<Option<i64>> {
    value
        .map(|v| {
            utils::parse_local_timestamp(v).ok_or_else(|| {
                eyre!(
                    "Invalid {} date: {:?} (expected YYYY-MM-DD[ HH:MM[:SS]])",
                    flag,
                    v
                )
            })
        })
        .transpose()
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn list_conversations(config: &ExportConfig) -> Result<()> {
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
    for id in engine.list_conversations() {
        println!("{}", engine.directory().resolve(id, None).label());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    // 2. Resolve paths (CLI > Config > Default)
    let target_dir = cli
        .target_dir
        .or(file_cfg.target_dir)
        .unwrap_or_else(|| PathBuf::from("wechat-chat-export"));

    let data_dir = cli.data_dir.or(file_cfg.data_dir).ok_or_else(|| {
        eyre!("No data directory given.\nUse --data-dir, or set data_dir in config.toml.")
    })?;

    if !data_dir.is_dir() {
        return Err(eyre!(
            "Data directory not found at: {}\nUse --data-dir to specify the path manually.",
            data_dir.display()
        ));
    }

    // 3. Time range
    let start = parse_date("--start", cli.start.as_deref())?;
    let end = parse_date("--end", cli.end.as_deref())?;
    if let (Some(s), Some(e)) = (start, end)
        && s >= e
    {
        return Err(eyre!("--start must be before --end"));
    }

    // 4. Build the Export Config
    let layout = cli.layout.or(file_cfg.layout).unwrap_or_default();
    let config = ExportConfig {
        target_dir,
        data_dir,
        talkers: cli.talkers,
        start,
        end,
        limit: cli.limit,
        workers: cli.workers.or(file_cfg.workers).unwrap_or(0),
        timeout: cli.timeout.map(Duration::from_secs),
        convention: layout.convention(),
        self_display: file_cfg.self_display.unwrap_or_else(|| "Me".to_string()),
        contact_db: file_cfg.contact_db,
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    if cli.list {
        return list_conversations(&config);
    }

    // 5. Run the Business Logic
    let target_dir = config.target_dir.clone();
    let summary = export::execute(config)?;
    if !cli.quiet {
        export::print_summary(&summary, &target_dir);
    }
    if summary.cancelled {
        return Err(eyre!("Export cancelled before completion"));
    }
    Ok(())
}
