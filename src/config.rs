//! 命令行参数、配置文件读取与默认策略值。

use clap::Parser;
use shadow_rs::formatcp;
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_USERNAME: &str = "User";
pub const DEFAULT_UPLOAD_DIR: &str = "filedrop-uploads";
pub const DEFAULT_CONFIG_FILE: &str = ".filetransferconfig.txt";
pub const STATE_DIR: &str = ".filedrop";
pub const BLOCKLIST_FILE: &str = "blocked_ips.txt";
pub const SECRET_CODE_FIELD: &str = "secret_code";
pub const FILE_FIELD: &str = "file";
pub const RANDOM_PORT_RANGE: (u16, u16) = (8000, 9999);
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;
pub const DEFAULT_FAILED_ATTEMPT_WINDOW_SECS: u64 = 10 * 60;
pub const DEFAULT_MAX_UPLOADS_PER_WINDOW: usize = 3;
pub const DEFAULT_UPLOAD_WINDOW_SECS: u64 = 60;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 0;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "file-drop", version = VERSION_INFO, about = "LAN file drop server")]
pub struct Args {
    #[arg(short = 'u', long, env = "FILEDROP_USERNAME", help = "Name shown on the upload page")]
    pub username: Option<String>,
    #[arg(
        short = 'd',
        long,
        env = "FILEDROP_UPLOAD_DIR",
        help = "Directory receiving uploaded files"
    )]
    pub upload_dir: Option<PathBuf>,
    #[arg(
        short = 'c',
        long,
        env = "FILEDROP_CONFIG",
        help = "key=value config file written by the setup wizard"
    )]
    pub config: Option<PathBuf>,
    #[arg(
        short = 'b',
        long,
        env = "FILEDROP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub bind: String,
    #[arg(
        short = 'p',
        long,
        env = "FILEDROP_PORT",
        default_value_t = 0,
        help = "HTTP port (0 picks a random port in 8000-9999)"
    )]
    pub port: u16,
    #[arg(long, env = "FILEDROP_BLOCKLIST", help = "Block list file path")]
    pub blocklist: Option<PathBuf>,
    #[arg(
        long,
        env = "FILEDROP_MAX_FAILED_ATTEMPTS",
        default_value_t = DEFAULT_MAX_FAILED_ATTEMPTS,
        help = "Wrong codes before an address is blocked (0 to disable)"
    )]
    pub max_failed_attempts: u32,
    #[arg(
        long,
        env = "FILEDROP_FAILED_ATTEMPT_WINDOW_SECS",
        default_value_t = DEFAULT_FAILED_ATTEMPT_WINDOW_SECS,
        help = "Failed attempt tracking window in seconds"
    )]
    pub failed_attempt_window_secs: u64,
    #[arg(
        long,
        env = "FILEDROP_MAX_UPLOADS_PER_WINDOW",
        default_value_t = DEFAULT_MAX_UPLOADS_PER_WINDOW,
        help = "Uploads allowed per address per window (0 to disable)"
    )]
    pub max_uploads_per_window: usize,
    #[arg(
        long,
        env = "FILEDROP_UPLOAD_WINDOW_SECS",
        default_value_t = DEFAULT_UPLOAD_WINDOW_SECS,
        help = "Upload rate window in seconds"
    )]
    pub upload_window_secs: u64,
    #[arg(
        long,
        env = "FILEDROP_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max request body size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
}

/// 合并命令行、配置文件与默认值后的运行参数。
#[derive(Debug, Clone)]
pub struct Settings {
    pub username: String,
    pub upload_dir: PathBuf,
    pub blocklist_path: PathBuf,
}

impl Settings {
    /// 按 CLI/环境变量 > 配置文件 > 默认值 的优先级解析。
    pub fn resolve(args: &Args) -> io::Result<Self> {
        let file_values = match args.config.as_deref() {
            Some(path) => read_config_file(path)?,
            None => match default_config_path() {
                Some(path) => read_config_file(&path).or_else(|err| match err.kind() {
                    ErrorKind::NotFound => Ok(HashMap::new()),
                    _ => Err(err),
                })?,
                None => HashMap::new(),
            },
        };
        Ok(Self::merge(args, &file_values))
    }

    fn merge(args: &Args, file_values: &HashMap<String, String>) -> Self {
        let username = args
            .username
            .clone()
            .or_else(|| file_values.get("username").cloned())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USERNAME.to_string());
        let upload_dir = args
            .upload_dir
            .clone()
            .or_else(|| file_values.get("upload_dir").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR));
        let blocklist_path = args
            .blocklist
            .clone()
            .unwrap_or_else(|| upload_dir.join(STATE_DIR).join(BLOCKLIST_FILE));
        Self {
            username,
            upload_dir,
            blocklist_path,
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(DEFAULT_CONFIG_FILE))
}

fn read_config_file(path: &Path) -> io::Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_config(&content))
}

/// 解析 `key=value` 形式的配置文本，忽略不含 `=` 的行。
pub fn parse_config(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}
