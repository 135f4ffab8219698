//! Notifications raised by the content store and playback supervisor.
//!
//! Published on a broadcast channel; while a controller link is up a relay
//! task forwards each one as an outbound frame. Events raised while
//! disconnected are dropped.

use ds_protocol::{AgentMessage, PlaybackStatus};
use tokio::sync::broadcast;

pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Playback {
        status: PlaybackStatus,
        content_id: Option<String>,
    },
    DownloadComplete {
        content_id: String,
        size: u64,
    },
}

impl AgentEvent {
    pub fn to_message(&self) -> AgentMessage {
        match self {
            AgentEvent::Playback { status, content_id } => {
                AgentMessage::playback(*status, content_id.clone())
            }
            AgentEvent::DownloadComplete { content_id, size } => {
                AgentMessage::download_complete(content_id.clone(), *size)
            }
        }
    }
}

pub fn channel() -> broadcast::Sender<AgentEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}
