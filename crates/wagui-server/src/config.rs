use clap::Parser;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3099;
pub const DEFAULT_DB_PATH: &str = "./data/wagui.db";
pub const DEFAULT_LINT_CMD: &str = "pnpm lint";
pub const DEFAULT_TEST_CMD: &str = "pnpm test";
const LOG_FILE_NAME: &str = "wagui-server.log";

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub transcript_root: PathBuf,
    pub poll_interval: Duration,
    pub lint_cmd: String,
    pub test_cmd: String,
    pub debug: bool,
    pub log_dir: String,
}

impl Config {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Parser, Debug)]
#[command(name = "wagui-server")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub host: String,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long, default_value = "")]
    pub db_path: String,
    #[arg(long, default_value = "")]
    pub transcript_root: String,
    #[arg(long, default_value_t = 500)]
    pub poll_interval_ms: u64,
    #[arg(long, default_value = "")]
    pub lint_cmd: String,
    #[arg(long, default_value = "")]
    pub test_cmd: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

pub fn load_config() -> Config {
    config_from_args(Args::parse())
}

pub fn config_from_args(args: Args) -> Config {
    Config {
        host: resolve_value(&args.host, "HOST", DEFAULT_HOST),
        port: resolve_port(args.port),
        db_path: resolve_value(&args.db_path, "DB_PATH", DEFAULT_DB_PATH),
        transcript_root: resolve_transcript_root(&args.transcript_root),
        poll_interval: Duration::from_millis(args.poll_interval_ms.max(1)),
        lint_cmd: resolve_value(&args.lint_cmd, "WAGUI_LINT_CMD", DEFAULT_LINT_CMD),
        test_cmd: resolve_value(&args.test_cmd, "WAGUI_TEST_CMD", DEFAULT_TEST_CMD),
        debug: args.debug || env_true("WAGUI_DEBUG"),
        log_dir: resolve_value(&args.log_dir, "WAGUI_LOG_DIR", ""),
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => is_truthy(&value),
        Err(_) => false,
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Flag wins, then the environment, then the default.
fn pick(flag: &str, env: Option<String>, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    env.unwrap_or_else(|| default.to_string())
}

fn resolve_value(flag: &str, env_key: &str, default: &str) -> String {
    pick(flag, env_value(env_key), default)
}

fn resolve_port(flag: Option<u16>) -> u16 {
    if let Some(port) = flag {
        return port;
    }
    env_value("PORT")
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

fn resolve_transcript_root(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Some(root) = env_value("WAGUI_TRANSCRIPT_ROOT") {
        return PathBuf::from(root);
    }
    wag_transcript::default_projects_root().unwrap_or_else(|| PathBuf::from(".claude/projects"))
}

/// Holds the log file open for the life of the process.
pub struct LogGuard {
    _file: Option<Arc<File>>,
}

fn log_level(config: &Config) -> String {
    if config.debug {
        return "debug".to_string();
    }
    env_value("WAGUI_LOG_LEVEL").unwrap_or_else(|| "info".to_string())
}

/// `RUST_LOG` wins over the configured level. Lines go to stdout and, when a
/// log directory is set, are appended to `wagui-server.log` there as well.
pub fn init_logging(config: &Config) -> Option<LogGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level(config)));
    let file = open_log_file(&config.log_dir).unwrap_or_else(|err| {
        eprintln!("log_file_error: {err}");
        None
    });
    let writer = match file.clone() {
        Some(file) => BoxMakeWriter::new(io::stdout.and(file)),
        None => BoxMakeWriter::new(io::stdout),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init()
        .ok()?;
    Some(LogGuard { _file: file })
}

fn open_log_file(log_dir: &str) -> io::Result<Option<Arc<File>>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = Path::new(log_dir);
    std::fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))?;
    Ok(Some(Arc::new(file)))
}
