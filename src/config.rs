use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5001";
const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
const DEFAULT_YTDLP_PROGRAM: &str = "yt-dlp";
const DEFAULT_TOOL_TIMEOUT_SECONDS: u64 = 180;

/// Process-wide settings, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Root directory holding per-request job directories.
    pub download_dir: PathBuf,
    /// yt-dlp binary; a bare name is looked up on PATH.
    pub ytdlp_program: PathBuf,
    /// Deadline for each yt-dlp invocation.
    pub tool_timeout: Duration,
    /// Cookie-file content for videos behind a login, if configured.
    pub cookie: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: resolve_bind_addr(env_var("APP_ADDR"), env_var("PORT")),
            download_dir: env_var("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR)),
            ytdlp_program: env_var("YTDLP_PROGRAM")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_PROGRAM)),
            tool_timeout: resolve_tool_timeout(env_var("YTDLP_TIMEOUT_SECONDS")),
            cookie: env_var("FACEBOOK_COOKIE"),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

/// `APP_ADDR` wins outright; `PORT` alone binds all interfaces the way
/// container platforms expect; otherwise stay on loopback.
fn resolve_bind_addr(addr: Option<String>, port: Option<String>) -> String {
    if let Some(addr) = addr {
        return addr;
    }
    if let Some(port) = port.and_then(|value| value.trim().parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }
    DEFAULT_BIND_ADDR.to_string()
}

fn resolve_tool_timeout(value: Option<String>) -> Duration {
    let seconds = value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|seconds| *seconds > 0)
        .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECONDS);
    Duration::from_secs(seconds)
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
