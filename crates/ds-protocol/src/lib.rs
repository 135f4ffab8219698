// ds-protocol: Controller <-> display agent wire types.
//
// Inbound frames name their command in a `comando` field; outbound frames name
// their kind in a `tipo` field. JSON field names follow the controller's
// vocabulary, Rust names are English with explicit serde renames.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Command names
// ---------------------------------------------------------------------------

/// Frozen `comando` values understood by the agent.
pub mod command_names {
    pub const PLAY: &str = "REPRODUCIR_CONTENIDO";
    pub const STOP: &str = "DETENER_REPRODUCCION";
    pub const APPLY_CONFIG: &str = "ACTUALIZAR_CONFIGURACION";
    pub const REBOOT: &str = "REINICIAR_DISPOSITIVO";
    pub const UPDATE_SOFTWARE: &str = "ACTUALIZAR_SOFTWARE";
    pub const GET_STATE: &str = "OBTENER_ESTADO";

    /// Name reported for frames that carry no `comando` at all.
    pub const UNKNOWN: &str = "UNKNOWN";
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

/// What kind of playable content a descriptor points at.
///
/// Decoded leniently: the controller sends either a category (`imagen`,
/// `video`, `web`, `html`) or a bare file format (`png`, `mp4`, ...). Anything
/// unrecognised is kept verbatim in `Unknown` so it can be reported back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ContentKind {
    Image,
    Video,
    WebPage,
    InlineHtml,
    Unknown(String),
}

impl ContentKind {
    pub fn from_wire(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "imagen" | "image" | "jpg" | "jpeg" | "png" => ContentKind::Image,
            "video" | "mp4" | "avi" | "mov" => ContentKind::Video,
            "web" => ContentKind::WebPage,
            "html" => ContentKind::InlineHtml,
            _ => ContentKind::Unknown(s.to_owned()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            ContentKind::Image => "imagen",
            ContentKind::Video => "video",
            ContentKind::WebPage => "web",
            ContentKind::InlineHtml => "html",
            ContentKind::Unknown(s) => s,
        }
    }
}

impl Default for ContentKind {
    fn default() -> Self {
        ContentKind::Unknown(String::new())
    }
}

impl From<String> for ContentKind {
    fn from(s: String) -> Self {
        ContentKind::from_wire(&s)
    }
}

impl From<ContentKind> for String {
    fn from(kind: ContentKind) -> Self {
        kind.as_wire().to_owned()
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// One piece of content the controller wants shown.
///
/// Received fresh with every play command; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    /// Globally unique content identifier. Numeric ids are accepted and
    /// normalised to their decimal string.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "tipo", default)]
    pub kind: ContentKind,
    /// Source locator. For inline HTML this may carry the payload itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Expected hex digest of the content bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Requested on-screen time; meaningful for images only.
    #[serde(rename = "duracion", default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    #[serde(
        rename = "contenido_html",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub inline_html: Option<String>,
}

impl ContentDescriptor {
    pub fn new(id: impl Into<String>, kind: ContentKind) -> Self {
        ContentDescriptor {
            id: id.into(),
            kind,
            url: None,
            checksum: None,
            duration_secs: None,
            inline_html: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_duration(mut self, secs: u64) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    pub fn with_inline_html(mut self, html: impl Into<String>) -> Self {
        self.inline_html = Some(html.into());
        self
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Device settings
// ---------------------------------------------------------------------------

/// Device-level settings carried in `configuracion`.
///
/// Kept as the raw JSON object so that one malformed value never prevents the
/// other settings from being applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceSettings(Map<String, Value>);

impl DeviceSettings {
    pub const VOLUME: &'static str = "volumen";
    pub const BRIGHTNESS: &'static str = "brillo";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_owned(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Read a 0-100 percentage setting.
    ///
    /// `None` when the key is absent; `Some(Err(..))` when present but not a
    /// number in range.
    pub fn percent(&self, key: &str) -> Option<Result<u8, String>> {
        let value = self.0.get(key)?;
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok(),
            _ => None,
        };
        Some(match parsed {
            Some(v) if (0.0..=100.0).contains(&v) => Ok(v.round() as u8),
            _ => Err(format!("{key} must be a number between 0 and 100, got {value}")),
        })
    }
}

// ---------------------------------------------------------------------------
// Inbound commands
// ---------------------------------------------------------------------------

/// A decoded controller command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Play {
        content: ContentDescriptor,
        settings: DeviceSettings,
    },
    Stop,
    ApplyConfig(DeviceSettings),
    Reboot,
    UpdateSoftware,
    GetState,
}

/// Why an inbound frame could not become a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Mensaje invalido: {0}")]
    Malformed(String),
    #[error("Comando no soportado: {0}")]
    Unsupported(String),
}

#[derive(Deserialize)]
struct PlayFields {
    contenido: ContentDescriptor,
    #[serde(default)]
    configuracion: Option<DeviceSettings>,
}

#[derive(Deserialize)]
struct ConfigFields {
    #[serde(default)]
    configuracion: Option<DeviceSettings>,
}

impl Command {
    /// Decode a raw text frame.
    ///
    /// The command name is resolved before any payload is parsed, so an
    /// unsupported command is always reported as such even when the rest of
    /// the frame would not parse.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        if !value.is_object() {
            return Err(DecodeError::Malformed("frame is not a JSON object".to_owned()));
        }
        let name = value
            .get("comando")
            .and_then(Value::as_str)
            .unwrap_or(command_names::UNKNOWN)
            .to_owned();

        match name.as_str() {
            command_names::PLAY => {
                let fields: PlayFields = serde_json::from_value(value)
                    .map_err(|e| DecodeError::Malformed(format!("{name}: {e}")))?;
                Ok(Command::Play {
                    content: fields.contenido,
                    settings: fields.configuracion.unwrap_or_default(),
                })
            }
            command_names::STOP => Ok(Command::Stop),
            command_names::APPLY_CONFIG => {
                let fields: ConfigFields = serde_json::from_value(value)
                    .map_err(|e| DecodeError::Malformed(format!("{name}: {e}")))?;
                Ok(Command::ApplyConfig(fields.configuracion.unwrap_or_default()))
            }
            command_names::REBOOT => Ok(Command::Reboot),
            command_names::UPDATE_SOFTWARE => Ok(Command::UpdateSoftware),
            command_names::GET_STATE => Ok(Command::GetState),
            _ => Err(DecodeError::Unsupported(name)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Play { .. } => command_names::PLAY,
            Command::Stop => command_names::STOP,
            Command::ApplyConfig(_) => command_names::APPLY_CONFIG,
            Command::Reboot => command_names::REBOOT,
            Command::UpdateSoftware => command_names::UPDATE_SOFTWARE,
            Command::GetState => command_names::GET_STATE,
        }
    }

    /// Encode as the controller would send it.
    pub fn to_frame(&self) -> String {
        let mut obj = Map::new();
        obj.insert("comando".to_owned(), Value::from(self.name()));
        match self {
            Command::Play { content, settings } => {
                obj.insert(
                    "contenido".to_owned(),
                    serde_json::to_value(content).unwrap_or(Value::Null),
                );
                if !settings.is_empty() {
                    obj.insert(
                        "configuracion".to_owned(),
                        serde_json::to_value(settings).unwrap_or(Value::Null),
                    );
                }
            }
            Command::ApplyConfig(settings) => {
                obj.insert(
                    "configuracion".to_owned(),
                    serde_json::to_value(settings).unwrap_or(Value::Null),
                );
            }
            Command::Stop | Command::Reboot | Command::UpdateSoftware | Command::GetState => {}
        }
        Value::Object(obj).to_string()
    }
}

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

/// ISO-8601 UTC timestamp with millisecond precision, as stamped on every
/// outbound frame.
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Status word reported in every heartbeat.
pub const STATUS_CONNECTED: &str = "CONECTADO";

/// System metrics sampled for a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub cpu_usage: f64,
    #[serde(rename = "memoria_total")]
    pub memory_total: u64,
    #[serde(rename = "memoria_usada")]
    pub memory_used: u64,
    #[serde(rename = "memoria_porcentaje")]
    pub memory_percent: f64,
    #[serde(rename = "disco_total")]
    pub disk_total: u64,
    #[serde(rename = "disco_usado")]
    pub disk_used: u64,
    #[serde(rename = "disco_porcentaje")]
    pub disk_percent: f64,
    /// Absent on platforms without a sensor; serialized as `null`.
    #[serde(rename = "temperatura_cpu")]
    pub cpu_temperature: Option<f64>,
}

/// Heartbeat projection of the playback session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSummary {
    #[serde(rename = "activa")]
    pub active: bool,
    #[serde(rename = "contenido_id")]
    pub content_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub timestamp: String,
    pub mac_address: String,
    pub device_id: String,
    pub ip_address: String,
    #[serde(rename = "version_software")]
    pub software_version: String,
    #[serde(rename = "estado")]
    pub status: String,
    #[serde(rename = "metricas")]
    pub metrics: DeviceMetrics,
    #[serde(rename = "reproduccion")]
    pub playback: PlaybackSummary,
}

/// Playback notification states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaybackStatus {
    #[serde(rename = "REPRODUCIENDO")]
    Playing,
    #[serde(rename = "DETENIDO")]
    Stopped,
    #[serde(rename = "COMPLETADO")]
    Completed,
    #[serde(rename = "ERROR")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackStateReport {
    pub timestamp: String,
    #[serde(rename = "estado")]
    pub status: PlaybackStatus,
    #[serde(rename = "contenido_id")]
    pub content_id: Option<String>,
}

/// Error response. `comando` and `contenido_id` give the controller enough
/// context to diagnose the failure remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub timestamp: String,
    #[serde(rename = "mensaje")]
    pub message: String,
    #[serde(rename = "comando", default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(
        rename = "contenido_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub content_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadCompleteReport {
    pub timestamp: String,
    #[serde(rename = "contenido_id")]
    pub content_id: String,
    #[serde(rename = "tamano_archivo")]
    pub file_size: u64,
}

/// Lifecycle phase of the single playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    #[serde(rename = "INACTIVO")]
    Idle,
    #[serde(rename = "INICIANDO")]
    Starting,
    #[serde(rename = "REPRODUCIENDO")]
    Playing,
    #[serde(rename = "DETENIENDO")]
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackDetail {
    #[serde(rename = "estado")]
    pub state: SessionState,
    #[serde(rename = "activa")]
    pub active: bool,
    #[serde(rename = "contenido_id")]
    pub content_id: Option<String>,
    #[serde(rename = "tipo")]
    pub kind: Option<ContentKind>,
    #[serde(rename = "iniciado_en")]
    pub started_at: Option<String>,
}

/// Full state reply to `OBTENER_ESTADO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshotReport {
    pub timestamp: String,
    pub device_id: String,
    pub display_name: Option<String>,
    #[serde(rename = "version_software")]
    pub software_version: String,
    #[serde(rename = "reproduccion")]
    pub playback: PlaybackDetail,
    #[serde(rename = "contenido_en_cache")]
    pub cached_content: Vec<String>,
}

/// Every frame the agent sends, tagged by `tipo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tipo")]
pub enum AgentMessage {
    #[serde(rename = "HEARTBEAT")]
    Heartbeat(HeartbeatReport),
    #[serde(rename = "ESTADO_REPRODUCCION")]
    PlaybackState(PlaybackStateReport),
    #[serde(rename = "ERROR")]
    Error(ErrorReport),
    #[serde(rename = "DESCARGA_COMPLETADA")]
    DownloadComplete(DownloadCompleteReport),
    #[serde(rename = "ESTADO_COMPLETO")]
    StateSnapshot(StateSnapshotReport),
}

impl AgentMessage {
    pub fn playback(status: PlaybackStatus, content_id: Option<String>) -> Self {
        AgentMessage::PlaybackState(PlaybackStateReport {
            timestamp: timestamp_now(),
            status,
            content_id,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        AgentMessage::Error(ErrorReport {
            timestamp: timestamp_now(),
            message: message.into(),
            command: None,
            content_id: None,
        })
    }

    pub fn download_complete(content_id: impl Into<String>, file_size: u64) -> Self {
        AgentMessage::DownloadComplete(DownloadCompleteReport {
            timestamp: timestamp_now(),
            content_id: content_id.into(),
            file_size,
        })
    }

    /// The `tipo` tag this message serializes with.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentMessage::Heartbeat(_) => "HEARTBEAT",
            AgentMessage::PlaybackState(_) => "ESTADO_REPRODUCCION",
            AgentMessage::Error(_) => "ERROR",
            AgentMessage::DownloadComplete(_) => "DESCARGA_COMPLETADA",
            AgentMessage::StateSnapshot(_) => "ESTADO_COMPLETO",
        }
    }
}
