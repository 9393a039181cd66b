use directories::ProjectDirs;
use std::{path::PathBuf, time::Duration};

pub const ORGANIZATION: &str = "";

pub const APPLICATION: &str = "tunneld";

pub const CONFIG_FILE: &str = "Server.toml";

fn project_dirs() -> Result<ProjectDirs, anyhow::Error> {
    ProjectDirs::from("", ORGANIZATION, APPLICATION)
        .ok_or_else(|| anyhow::anyhow!("Could not open user's home directory"))
}

pub fn config_path() -> Result<PathBuf, anyhow::Error> {
    Ok(project_dirs()?.config_dir().join(CONFIG_FILE))
}

/// Length of time one request/response exchange may take. Reused streams get
/// a fresh window per exchange.
pub const fn request_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Ceiling on the length declared by a frame prefix. Frames above this are
/// rejected without being read.
pub const fn max_message_length() -> usize {
    1024 * 64
}

/// Ceiling on the size of an HTTP request head on the chunked transport.
pub const fn max_request_head_length() -> usize {
    1024 * 8
}

/// Consecutive accept failures a listener tolerates before the host stops
/// itself.
pub const fn accept_error_budget() -> u32 {
    200
}

/// Number of TCP datagram channels a single session may hold open.
pub const fn max_datagram_channel_count() -> u32 {
    8
}

pub const fn port() -> u16 {
    443
}
