//! Agent configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/innoad/agent.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `server.url`
//!
//! Everything else has a default suited to a Raspberry Pi display node.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/innoad/agent.toml";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level agent configuration. Built once at startup, never mutated.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub schema_version: u32,
    /// Optional human-readable name for this screen (e.g. "Lobby").
    pub display_name: Option<String>,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub connection: ConnectionConfig,
    pub heartbeat: HeartbeatConfig,
    pub download: DownloadConfig,
    pub playback: PlaybackConfig,
    pub players: PlayersConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Controller endpoint, always `ws://` or `wss://` after loading.
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub content_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub max_message_bytes: usize,
    pub outbound_queue: usize,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub stop_grace: Duration,
    /// On-screen time for images whose descriptor carries no duration.
    pub default_image_secs: u64,
}

/// Player command lines. The playback target is appended as the last
/// argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayersConfig {
    pub image: Vec<String>,
    pub video: Vec<String>,
    pub video_fallback: Vec<String>,
    pub browser: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Network interface whose MAC becomes the hardware id.
    pub interface: String,
    pub backlight_path: PathBuf,
    /// `<n>%` is appended.
    pub volume_command: Vec<String>,
    pub reboot_command: Vec<String>,
    /// Empty means software updates are not configured on this node.
    pub update_command: Vec<String>,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_owned()).collect()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
            max_message_bytes: 1024 * 1024,
            outbound_queue: 32,
            max_reconnect_attempts: 10,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_millis(2000),
            default_image_secs: 30,
        }
    }
}

impl Default for PlayersConfig {
    fn default() -> Self {
        Self {
            image: argv(&[
                "feh",
                "--fullscreen",
                "--hide-pointer",
                "--auto-zoom",
                "--borderless",
            ]),
            video: argv(&[
                "omxplayer",
                "--no-osd",
                "--no-keys",
                "--aspect-mode",
                "fill",
                "--blank",
            ]),
            video_fallback: argv(&[
                "vlc",
                "--intf",
                "dummy",
                "--fullscreen",
                "--no-video-title-show",
            ]),
            browser: argv(&[
                "chromium-browser",
                "--start-fullscreen",
                "--kiosk",
                "--incognito",
                "--noerrdialogs",
                "--disable-translate",
                "--no-first-run",
                "--disable-infobars",
                "--disable-features=TranslateUI",
                "--disable-session-crashed-bubble",
            ]),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_owned(),
            backlight_path: PathBuf::from("/sys/class/backlight/rpi_backlight/brightness"),
            volume_command: argv(&["amixer", "set", "Master"]),
            reboot_command: argv(&["sudo", "reboot"]),
            update_command: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Defaults for every optional section, pointed at `server_url` and
    /// storing content under `content_dir`.
    pub fn new(server_url: impl Into<String>, content_dir: impl Into<PathBuf>) -> Self {
        Self {
            schema_version: 1,
            display_name: None,
            server: ServerConfig {
                url: normalize_server_url(&server_url.into()),
            },
            storage: StorageConfig {
                content_dir: content_dir.into(),
            },
            connection: ConnectionConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            download: DownloadConfig::default(),
            playback: PlaybackConfig::default(),
            players: PlayersConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    display_name: Option<String>,
    server: Option<RawServerConfig>,
    storage: Option<RawStorageConfig>,
    connection: Option<RawConnectionConfig>,
    heartbeat: Option<RawHeartbeatConfig>,
    download: Option<RawDownloadConfig>,
    playback: Option<RawPlaybackConfig>,
    players: Option<RawPlayersConfig>,
    device: Option<RawDeviceConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStorageConfig {
    content_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConnectionConfig {
    ping_interval_secs: Option<u64>,
    ping_timeout_secs: Option<u64>,
    max_message_bytes: Option<usize>,
    outbound_queue: Option<usize>,
    max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawHeartbeatConfig {
    interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawDownloadConfig {
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPlaybackConfig {
    stop_grace_ms: Option<u64>,
    default_image_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPlayersConfig {
    image: Option<Vec<String>>,
    video: Option<Vec<String>>,
    video_fallback: Option<Vec<String>>,
    browser: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawDeviceConfig {
    interface: Option<String>,
    backlight_path: Option<String>,
    volume_command: Option<Vec<String>>,
    reboot_command: Option<Vec<String>>,
    update_command: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<AgentConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<AgentConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let raw_server = raw
        .server
        .ok_or_else(|| ConfigError::MissingField("server".to_owned()))?;
    let url = raw_server
        .url
        .ok_or_else(|| ConfigError::MissingField("server.url".to_owned()))?;
    if url.trim().is_empty() {
        return Err(ConfigError::InvalidValue(
            "server.url must not be empty".to_owned(),
        ));
    }

    let mut config = AgentConfig::new(url.trim(), "/opt/innoad/content");
    config.display_name = raw.display_name;

    if let Some(s) = raw.storage {
        if let Some(dir) = s.content_dir {
            config.storage.content_dir = PathBuf::from(dir);
        }
    }

    if let Some(c) = raw.connection {
        let conn = &mut config.connection;
        if let Some(v) = c.ping_interval_secs {
            conn.ping_interval = Duration::from_secs(positive("connection.ping_interval_secs", v)?);
        }
        if let Some(v) = c.ping_timeout_secs {
            conn.ping_timeout = Duration::from_secs(positive("connection.ping_timeout_secs", v)?);
        }
        if let Some(v) = c.max_message_bytes {
            conn.max_message_bytes = positive("connection.max_message_bytes", v as u64)? as usize;
        }
        if let Some(v) = c.outbound_queue {
            conn.outbound_queue = positive("connection.outbound_queue", v as u64)? as usize;
        }
        if let Some(v) = c.max_reconnect_attempts {
            conn.max_reconnect_attempts =
                positive("connection.max_reconnect_attempts", u64::from(v))? as u32;
        }
    }

    if let Some(h) = raw.heartbeat {
        if let Some(v) = h.interval_secs {
            config.heartbeat.interval = Duration::from_secs(positive("heartbeat.interval_secs", v)?);
        }
    }

    if let Some(d) = raw.download {
        if let Some(v) = d.timeout_secs {
            config.download.timeout = Duration::from_secs(positive("download.timeout_secs", v)?);
        }
    }

    if let Some(p) = raw.playback {
        if let Some(v) = p.stop_grace_ms {
            config.playback.stop_grace = Duration::from_millis(v);
        }
        if let Some(v) = p.default_image_secs {
            config.playback.default_image_secs = v;
        }
    }

    if let Some(p) = raw.players {
        let players = &mut config.players;
        override_command("players.image", &mut players.image, p.image)?;
        override_command("players.video", &mut players.video, p.video)?;
        override_command(
            "players.video_fallback",
            &mut players.video_fallback,
            p.video_fallback,
        )?;
        override_command("players.browser", &mut players.browser, p.browser)?;
    }

    if let Some(d) = raw.device {
        let device = &mut config.device;
        if let Some(iface) = d.interface {
            device.interface = iface;
        }
        if let Some(path) = d.backlight_path {
            device.backlight_path = PathBuf::from(path);
        }
        override_command(
            "device.volume_command",
            &mut device.volume_command,
            d.volume_command,
        )?;
        override_command(
            "device.reboot_command",
            &mut device.reboot_command,
            d.reboot_command,
        )?;
        // May legitimately be empty.
        if let Some(cmd) = d.update_command {
            device.update_command = cmd;
        }
    }

    Ok(config)
}

/// Rewrite an `http(s)://` controller address to the matching WebSocket
/// scheme; anything else is returned unchanged.
pub fn normalize_server_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_owned()
    }
}

fn positive(field: &str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue(format!("{field} must be > 0")));
    }
    Ok(value)
}

fn override_command(
    field: &str,
    slot: &mut Vec<String>,
    value: Option<Vec<String>>,
) -> Result<(), ConfigError> {
    if let Some(cmd) = value {
        if cmd.is_empty() {
            return Err(ConfigError::InvalidValue(format!(
                "{field} must name a program"
            )));
        }
        *slot = cmd;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_urls_become_websocket_urls() {
        assert_eq!(
            normalize_server_url("http://ctl:8086/websocket/raspberry"),
            "ws://ctl:8086/websocket/raspberry"
        );
        assert_eq!(normalize_server_url("https://ctl/ws"), "wss://ctl/ws");
        assert_eq!(normalize_server_url("ws://ctl/ws"), "ws://ctl/ws");
    }

    #[test]
    fn minimal_config_takes_defaults() {
        let cfg = load_config_from_str(
            r#"
schema_version = 1
[server]
url = "http://ctl:8086/websocket/raspberry"
"#,
        )
        .unwrap();
        assert_eq!(cfg.server.url, "ws://ctl:8086/websocket/raspberry");
        assert_eq!(cfg.storage.content_dir, PathBuf::from("/opt/innoad/content"));
        assert_eq!(cfg.connection.ping_interval, Duration::from_secs(20));
        assert_eq!(cfg.connection.max_message_bytes, 1_048_576);
        assert_eq!(cfg.heartbeat.interval, Duration::from_secs(30));
        assert_eq!(cfg.playback.stop_grace, Duration::from_millis(2000));
        assert_eq!(cfg.players, PlayersConfig::default());
        assert!(cfg.device.update_command.is_empty());
    }
}
