//! shardrop: share a file through object storage as encrypted shards
//!
//! Commands:
//!   put <file>          - shard, encrypt and upload a file; prints a retrieval code
//!   get <code>          - download, verify and decrypt a file by its code
//!   sweep               - delete expired uploads and their shards
//!   status              - storage reachability and live upload count
//!   config show         - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use opendal::Operator;
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use shardrop_core::config::ShardropConfig;
use shardrop_core::ShardropError;
use shardrop_storage::{RetryPolicy, ShardTransport, StorageCredentials};
use shardrop_transfer::{
    now_secs, sweep_expired, JsonManifestStore, ManifestStore, ProgressFn, TransferEngine,
    TransferSettings,
};

type Engine = TransferEngine<Operator, JsonManifestStore>;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "shardrop",
    version,
    about = "Password-protected file drops over object storage",
    long_about = "shardrop: split a file into encrypted shards, upload them, and hand out a six-digit retrieval code"
)]
struct Cli {
    /// Path to shardrop.toml configuration file
    #[arg(long, short = 'c', env = "SHARDROP_CONFIG", default_value = "/etc/shardrop/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a file and print its retrieval code
    ///
    /// The password is read from SHARDROP_PASSWORD, or prompted for twice.
    /// Storage credentials come from AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY.
    Put {
        /// Local file to share
        file: PathBuf,
        /// Name recorded for the recipient (default: the file's own name)
        #[arg(long)]
        name: Option<String>,
        /// MIME type (default: guessed from the extension)
        #[arg(long)]
        mime: Option<String>,
        /// Shards in flight (overrides transfer.concurrency)
        #[arg(long, short = 'j')]
        concurrency: Option<usize>,
    },

    /// Download a file by its retrieval code
    Get {
        /// Six-digit retrieval code
        code: String,
        /// Destination file or directory (default: current dir + original name)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        /// Shards in flight (overrides transfer.concurrency)
        #[arg(long, short = 'j')]
        concurrency: Option<usize>,
    },

    /// Delete expired uploads and their shards
    Sweep {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show storage and manifest store status
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            if let Some(hint) = transfer_error(&e).and_then(hint_for) {
                eprintln!("  {hint}");
            }
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Put {
            file,
            name,
            mime,
            concurrency,
        } => {
            override_concurrency(&mut config, concurrency);
            cmd_put(&config, &file, name.as_deref(), mime.as_deref()).await
        }
        Commands::Get {
            code,
            out,
            concurrency,
        } => {
            override_concurrency(&mut config, concurrency);
            cmd_get(&config, &code, out.as_deref()).await
        }
        Commands::Sweep { json } => cmd_sweep(&config, json).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

/// Log to stderr at `warn` unless SHARDROP_LOG says otherwise.
fn init_logging() {
    let filter = EnvFilter::try_from_env("SHARDROP_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

// ── Config loading ────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<ShardropConfig> {
    let config = if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?
    } else {
        ShardropConfig::default()
    };
    config.validate()?;
    Ok(config)
}

fn override_concurrency(config: &mut ShardropConfig, concurrency: Option<usize>) {
    if let Some(n) = concurrency {
        config.transfer.concurrency = n;
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

// ── Engine from environment credentials ───────────────────────────────────────

fn build_operator_from_env(config: &ShardropConfig) -> Result<Operator> {
    let mut storage = config.storage.clone();
    storage.root = expand_tilde(&storage.root);
    let credentials = StorageCredentials::from_env();
    if storage.backend == "s3" && credentials.is_none() {
        anyhow::bail!(
            "S3 credentials not set\n\
             Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.\n\
             Example:\n\
             \texport AWS_ACCESS_KEY_ID=your-key\n\
             \texport AWS_SECRET_ACCESS_KEY=your-secret"
        );
    }
    shardrop_storage::build_from_core_config(&storage, credentials.as_ref())
        .context("building storage operator")
}

async fn build_engine(config: &ShardropConfig) -> Result<Engine> {
    let op = build_operator_from_env(config)?;
    let transport = ShardTransport::new(
        op,
        &config.storage.folder,
        RetryPolicy::from_config(&config.transfer),
    );
    let manifest_path = expand_tilde(&config.manifest.path);
    let store = JsonManifestStore::open(&manifest_path)
        .await
        .with_context(|| format!("opening manifest store: {}", manifest_path.display()))?;
    Ok(TransferEngine::new(
        transport,
        store,
        TransferSettings::from_config(config),
    ))
}

// ── Password input ────────────────────────────────────────────────────────────

fn read_password(confirm: bool) -> Result<SecretString> {
    if let Ok(pw) = std::env::var("SHARDROP_PASSWORD") {
        return Ok(SecretString::from(pw));
    }
    let first = Zeroizing::new(rpassword::prompt_password("Password: ").context("reading password")?);
    if confirm {
        let second = Zeroizing::new(
            rpassword::prompt_password("Confirm password: ").context("reading password")?,
        );
        if *first != *second {
            anyhow::bail!("passwords do not match");
        }
    }
    Ok(SecretString::from(first.to_string()))
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn progress_callback(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Box::new(move |done, total, msg| {
        pb.set_length(total);
        pb.set_position(done);
        pb.set_message(msg.to_string());
    })
}

// ── `shardrop put` ────────────────────────────────────────────────────────────

async fn cmd_put(
    config: &ShardropConfig,
    file: &Path,
    name: Option<&str>,
    mime: Option<&str>,
) -> Result<()> {
    let engine = build_engine(config).await?;
    let password = read_password(true)?;

    let pb = make_progress_bar("put");
    let progress = progress_callback(&pb);
    let result = engine
        .upload_file(file, name, mime, &password, Some(&progress))
        .await;
    let receipt = match result {
        Ok(r) => {
            pb.finish_with_message("done");
            r
        }
        Err(e) => {
            pb.abandon_with_message("failed");
            return Err(e).with_context(|| format!("uploading {}", file.display()));
        }
    };

    let ttl = receipt.expires_at.saturating_sub(now_secs());
    println!("  code:    {}", receipt.code);
    println!("  shards:  {}", receipt.shards);
    println!("  bytes:   {}", fmt_bytes(receipt.bytes));
    println!("  hash:    {}", &receipt.content_hash[..16.min(receipt.content_hash.len())]);
    println!("  expires: in {}", fmt_duration(ttl));
    Ok(())
}

// ── `shardrop get` ────────────────────────────────────────────────────────────

async fn cmd_get(config: &ShardropConfig, code: &str, out: Option<&Path>) -> Result<()> {
    let engine = build_engine(config).await?;
    let password = read_password(false)?;

    let pb = make_progress_bar("get");
    let progress = progress_callback(&pb);
    let result = match out {
        Some(path) if !path.is_dir() => engine
            .retrieve_to_path(code, &password, path, Some(&progress))
            .await
            .map(|meta| (path.to_path_buf(), meta)),
        Some(dir) => {
            engine
                .retrieve_to_dir(code, &password, dir, Some(&progress))
                .await
        }
        None => {
            let cwd = std::env::current_dir().context("resolving current directory")?;
            engine
                .retrieve_to_dir(code, &password, &cwd, Some(&progress))
                .await
        }
    };

    let (path, meta) = match result {
        Ok(r) => {
            pb.finish_with_message("done");
            r
        }
        Err(e) => {
            pb.abandon_with_message("failed");
            return Err(e).with_context(|| format!("retrieving {code}"));
        }
    };

    println!("  file:    {}", path.display());
    println!("  name:    {}", meta.original_name);
    println!("  type:    {}", meta.mime_type);
    println!("  shards:  {}", meta.shards);
    println!("  bytes:   {}", fmt_bytes(meta.bytes));
    Ok(())
}

// ── `shardrop sweep` ──────────────────────────────────────────────────────────

async fn cmd_sweep(config: &ShardropConfig, json: bool) -> Result<()> {
    let engine = build_engine(config).await?;
    let report = sweep_expired(engine.transport(), engine.store(), now_secs()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("  expired:        {}", report.expired);
    println!("  removed:        {}", report.removed);
    println!("  shards deleted: {}", report.shards_deleted);
    if report.failed > 0 {
        println!("  failed:         {} (retried on the next sweep)", report.failed);
    }
    Ok(())
}

// ── `shardrop status` ─────────────────────────────────────────────────────────

async fn cmd_status(config: &ShardropConfig) -> Result<()> {
    let engine = build_engine(config).await?;

    println!("shardrop v{}", env!("CARGO_PKG_VERSION"));
    match config.storage.backend.as_str() {
        "s3" => println!(
            "  storage:   s3 {}/{} (folder: {})",
            config.storage.endpoint, config.storage.bucket, config.storage.folder
        ),
        other => println!(
            "  storage:   {other} {} (folder: {})",
            config.storage.root.display(),
            config.storage.folder
        ),
    }
    match shardrop_storage::check_health(engine.transport().store()).await {
        Ok(()) => println!("  reachable: yes"),
        Err(e) => println!("  reachable: no ({e})"),
    }
    println!("  manifests: {}", engine.store().path().display());
    println!("  uploads:   {}", engine.store().count().await?);
    println!(
        "  shard:     {} x{} in flight, ttl {}",
        fmt_bytes(config.transfer.shard_size),
        config.effective_concurrency(),
        fmt_duration(config.transfer.ttl_secs)
    );
    Ok(())
}

// ── `shardrop config show` ────────────────────────────────────────────────────

fn cmd_config_show(config: &ShardropConfig, path: &Path) -> Result<()> {
    println!("# Configuration from: {}", path.display());
    if !path.exists() {
        println!("# (file not found, showing defaults)");
    }
    println!("{}", toml::to_string_pretty(config).context("serializing config")?);
    Ok(())
}

// ── Error reporting ───────────────────────────────────────────────────────────

fn transfer_error(err: &anyhow::Error) -> Option<&ShardropError> {
    err.chain().find_map(|e| e.downcast_ref::<ShardropError>())
}

fn hint_for(err: &ShardropError) -> Option<&'static str> {
    match err {
        ShardropError::NotFound => Some("no file is shared under that code; it may have expired"),
        ShardropError::Auth => Some("the password does not match this code"),
        ShardropError::Integrity { .. } => {
            Some("stored data failed verification; the shards are corrupted or were tampered with")
        }
        ShardropError::Transport { .. } => Some("object storage is unreachable; try again later"),
        _ => None,
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match transfer_error(err) {
        Some(ShardropError::NotFound) => 2,
        Some(ShardropError::Auth) => 3,
        Some(ShardropError::Integrity { .. }) => 4,
        Some(ShardropError::Transport { .. }) => 5,
        Some(ShardropError::Validation(_)) => 64,
        _ => 1,
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn fmt_duration(secs: u64) -> String {
    match secs {
        s if s >= 86_400 && s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s >= 3600 => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
        s if s >= 60 => format!("{}m{:02}s", s / 60, s % 60),
        s => format!("{s}s"),
    }
}
