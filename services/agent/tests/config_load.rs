/// Integration tests for agent config loading.
///
/// Tests required fields, overrides of every optional section, and
/// rejection of values the agent cannot run with.
use agent::config::{ConfigError, load_config_from_path, load_config_from_str};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Required fields
// ---------------------------------------------------------------------------

#[test]
fn full_config_file_loads_every_section() {
    let mut f = tempfile::NamedTempFile::new().expect("create temp file");
    write!(
        f,
        r#"
schema_version = 1
display_name = "Lobby screen"

[server]
url = "https://controller.example.com/websocket/raspberry"

[storage]
content_dir = "/var/lib/innoad/content"

[connection]
ping_interval_secs = 5
ping_timeout_secs = 3
max_message_bytes = 65536
outbound_queue = 8
max_reconnect_attempts = 4

[heartbeat]
interval_secs = 10

[download]
timeout_secs = 60

[playback]
stop_grace_ms = 500
default_image_secs = 12

[players]
image = ["fbi", "-a"]
browser = ["firefox", "--kiosk"]

[device]
interface = "wlan0"
backlight_path = "/tmp/backlight"
volume_command = ["pactl", "set-sink-volume", "@DEFAULT_SINK@"]
update_command = ["/usr/local/bin/update-agent"]
"#
    )
    .expect("write config");

    let cfg = load_config_from_path(f.path()).expect("should load");
    assert_eq!(cfg.display_name.as_deref(), Some("Lobby screen"));
    assert_eq!(
        cfg.server.url,
        "wss://controller.example.com/websocket/raspberry"
    );
    assert_eq!(
        cfg.storage.content_dir,
        PathBuf::from("/var/lib/innoad/content")
    );
    assert_eq!(cfg.connection.ping_interval, Duration::from_secs(5));
    assert_eq!(cfg.connection.ping_timeout, Duration::from_secs(3));
    assert_eq!(cfg.connection.max_message_bytes, 65536);
    assert_eq!(cfg.connection.outbound_queue, 8);
    assert_eq!(cfg.connection.max_reconnect_attempts, 4);
    assert_eq!(cfg.heartbeat.interval, Duration::from_secs(10));
    assert_eq!(cfg.download.timeout, Duration::from_secs(60));
    assert_eq!(cfg.playback.stop_grace, Duration::from_millis(500));
    assert_eq!(cfg.playback.default_image_secs, 12);
    assert_eq!(cfg.players.image, vec!["fbi", "-a"]);
    assert_eq!(cfg.players.browser, vec!["firefox", "--kiosk"]);
    // Untouched player keeps its default.
    assert_eq!(cfg.players.video[0], "omxplayer");
    assert_eq!(cfg.device.interface, "wlan0");
    assert_eq!(cfg.device.backlight_path, PathBuf::from("/tmp/backlight"));
    assert_eq!(cfg.device.volume_command[0], "pactl");
    assert_eq!(cfg.device.reboot_command, vec!["sudo", "reboot"]);
    assert_eq!(cfg.device.update_command, vec!["/usr/local/bin/update-agent"]);
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = load_config_from_path(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)), "got {err:?}");
}

#[test]
fn missing_schema_version_fails() {
    let err = load_config_from_str(
        r#"
[server]
url = "ws://controller:8086/ws"
"#,
    )
    .unwrap_err();
    assert!(
        matches!(err, ConfigError::MissingField(ref f) if f == "schema_version"),
        "got {err:?}"
    );
}

#[test]
fn unknown_schema_version_fails() {
    let err = load_config_from_str(
        r#"
schema_version = 2

[server]
url = "ws://controller:8086/ws"
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue(_)), "got {err:?}");
}

#[test]
fn missing_server_url_fails() {
    let err = load_config_from_str("schema_version = 1\n[server]\n").unwrap_err();
    assert!(
        matches!(err, ConfigError::MissingField(ref f) if f == "server.url"),
        "got {err:?}"
    );
}

#[test]
fn blank_server_url_fails() {
    let err = load_config_from_str("schema_version = 1\n[server]\nurl = \"  \"\n").unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue(_)), "got {err:?}");
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn zero_intervals_are_rejected() {
    for (section, key) in [
        ("connection", "ping_interval_secs"),
        ("connection", "ping_timeout_secs"),
        ("connection", "outbound_queue"),
        ("connection", "max_message_bytes"),
        ("heartbeat", "interval_secs"),
        ("download", "timeout_secs"),
    ] {
        let toml = format!(
            "schema_version = 1\n[server]\nurl = \"ws://c/ws\"\n[{section}]\n{key} = 0\n"
        );
        let err = load_config_from_str(&toml).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue(ref m) if m.contains(key)),
            "{section}.{key}: got {err:?}"
        );
    }
}

#[test]
fn empty_player_command_is_rejected() {
    let err = load_config_from_str(
        r#"
schema_version = 1

[server]
url = "ws://c/ws"

[players]
video = []
"#,
    )
    .unwrap_err();
    assert!(
        matches!(err, ConfigError::InvalidValue(ref m) if m.contains("players.video")),
        "got {err:?}"
    );
}

#[test]
fn empty_update_command_means_not_configured() {
    let cfg = load_config_from_str(
        r#"
schema_version = 1

[server]
url = "ws://c/ws"

[device]
update_command = []
"#,
    )
    .expect("should load");
    assert!(cfg.device.update_command.is_empty());
}

#[test]
fn malformed_toml_is_a_parse_error() {
    let err = load_config_from_str("schema_version = \n").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)), "got {err:?}");
}
