//! Playback: one external player process at a time.

pub mod driver;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use chrono::{DateTime, Utc};
use ds_protocol::{ContentKind, PlaybackDetail, PlaybackSummary, SessionState};

pub use driver::{Drivers, PlaybackDriver, PlayerExit, PlayerHandle, ProcessDriver};
pub use supervisor::Supervisor;

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("unsupported content type: {0}")]
    UnsupportedKind(String),
    #[error("failed to launch {player}: {reason}")]
    Launch { player: String, reason: String },
    #[error("player I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("playback supervisor failed: {0}")]
    Supervisor(String),
}

/// Read-only view of the playback session, published whole on every
/// transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    pub state: SessionState,
    pub content_id: Option<String>,
    pub kind: Option<ContentKind>,
    pub started_at: Option<DateTime<Utc>>,
    /// Incremented for every session started.
    pub generation: u64,
}

impl PlaybackSnapshot {
    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Starting | SessionState::Playing)
    }

    pub fn summary(&self) -> PlaybackSummary {
        let active = self.is_active();
        PlaybackSummary {
            active,
            content_id: if active { self.content_id.clone() } else { None },
        }
    }

    pub fn detail(&self) -> PlaybackDetail {
        PlaybackDetail {
            state: self.state,
            active: self.is_active(),
            content_id: self.content_id.clone(),
            kind: self.kind.clone(),
            started_at: self
                .started_at
                .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        }
    }

    pub(crate) fn idle(generation: u64) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }
}
