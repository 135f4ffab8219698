//! The playback supervisor.
//!
//! Owns the single playback session. A new session is only started once the
//! previous player has been terminated and reaped. Every mutating operation
//! runs on its own task, so a caller that gives up waiting never leaves a
//! session half-stopped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ds_protocol::{ContentDescriptor, ContentKind, PlaybackStatus, SessionState};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::driver::{Drivers, PlayerExit, PlayerHandle};
use super::{PlaybackError, PlaybackSnapshot};
use crate::config::PlaybackConfig;
use crate::content_store::PlayTarget;
use crate::events::AgentEvent;

/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    drivers: Drivers,
    config: PlaybackConfig,
    events: broadcast::Sender<AgentEvent>,
    state: Arc<watch::Sender<PlaybackSnapshot>>,
    session: Mutex<Option<Session>>,
}

struct Session {
    content_id: String,
    generation: u64,
    cancel: CancellationToken,
    monitor: JoinHandle<Ended>,
}

/// Why a session's monitor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    Stopped,
    Completed,
    Failed(Option<i32>),
}

impl Supervisor {
    pub fn new(
        drivers: Drivers,
        config: PlaybackConfig,
        events: broadcast::Sender<AgentEvent>,
    ) -> Self {
        let (state, _) = watch::channel(PlaybackSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                drivers,
                config,
                events,
                state: Arc::new(state),
                session: Mutex::new(None),
            }),
        }
    }

    /// Stop whatever is playing, then start `content` on `target`.
    ///
    /// On failure the session is left stopped.
    pub async fn play(
        &self,
        content: ContentDescriptor,
        target: PlayTarget,
    ) -> Result<(), PlaybackError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.play(content, target).await })
            .await
            .map_err(|e| PlaybackError::Supervisor(e.to_string()))?
    }

    /// Stop the live session, if any. Returns the id of the content that
    /// was stopped; `None` when nothing was playing.
    pub async fn stop(&self) -> Result<Option<String>, PlaybackError> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut session = inner.session.lock().await;
            inner.stop_locked(&mut session).await
        })
        .await
        .map_err(|e| PlaybackError::Supervisor(e.to_string()))
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.inner.state.subscribe()
    }
}

impl Inner {
    async fn play(
        &self,
        content: ContentDescriptor,
        target: PlayTarget,
    ) -> Result<(), PlaybackError> {
        let mut session = self.session.lock().await;
        self.stop_locked(&mut session).await;

        let driver = self.drivers.for_kind(&content.kind)?.clone();
        let content_id = content.id.clone();
        let generation = self.state.borrow().generation + 1;
        self.state.send_replace(PlaybackSnapshot {
            state: SessionState::Starting,
            content_id: Some(content_id.clone()),
            kind: Some(content.kind.clone()),
            started_at: None,
            generation,
        });

        let handle = match driver.start(&target) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(content_id = %content_id, driver = driver.name(), error = %e, "player failed to launch");
                self.state.send_replace(PlaybackSnapshot::idle(generation));
                emit(&self.events, PlaybackStatus::Error, &content_id);
                return Err(e);
            }
        };

        self.state.send_replace(PlaybackSnapshot {
            state: SessionState::Playing,
            content_id: Some(content_id.clone()),
            kind: Some(content.kind.clone()),
            started_at: Some(Utc::now()),
            generation,
        });
        let deadline = self.display_time(&content);
        info!(
            content_id = %content_id,
            kind = %content.kind,
            driver = driver.name(),
            duration_secs = deadline.map(|d| d.as_secs()),
            "playback started"
        );
        emit(&self.events, PlaybackStatus::Playing, &content_id);

        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            handle,
            deadline,
            cancel.clone(),
            self.config.stop_grace,
            MonitorCtx {
                state: self.state.clone(),
                events: self.events.clone(),
                generation,
                content_id: content_id.clone(),
            },
        ));
        *session = Some(Session {
            content_id,
            generation,
            cancel,
            monitor,
        });
        Ok(())
    }

    /// Tear down the current session with the session lock held.
    async fn stop_locked(&self, session: &mut Option<Session>) -> Option<String> {
        let current = session.take()?;
        self.state.send_if_modified(|s| {
            if s.generation == current.generation && s.is_active() {
                s.state = SessionState::Stopping;
                true
            } else {
                false
            }
        });
        current.cancel.cancel();
        let ended = current.monitor.await.unwrap_or(Ended::Stopped);
        self.state.send_if_modified(|s| {
            if s.generation == current.generation && s.state != SessionState::Idle {
                *s = PlaybackSnapshot::idle(current.generation);
                true
            } else {
                false
            }
        });

        if ended != Ended::Stopped {
            // Finished on its own first and has already been reported.
            debug!(content_id = %current.content_id, ?ended, "session had already ended");
            return None;
        }
        info!(content_id = %current.content_id, "playback stopped");
        emit(&self.events, PlaybackStatus::Stopped, &current.content_id);
        Some(current.content_id)
    }

    /// How long an image stays up; `None` plays until stopped.
    fn display_time(&self, content: &ContentDescriptor) -> Option<Duration> {
        if content.kind != ContentKind::Image {
            return None;
        }
        match content.duration_secs.unwrap_or(self.config.default_image_secs) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

struct MonitorCtx {
    state: Arc<watch::Sender<PlaybackSnapshot>>,
    events: broadcast::Sender<AgentEvent>,
    generation: u64,
    content_id: String,
}

enum Wake {
    Cancelled,
    Exited(PlayerExit),
    Elapsed,
}

/// Watch one session until it is stopped, its display time runs out or the
/// player exits.
async fn monitor(
    mut handle: Box<dyn PlayerHandle>,
    deadline: Option<Duration>,
    cancel: CancellationToken,
    grace: Duration,
    ctx: MonitorCtx,
) -> Ended {
    let timer = async {
        match deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    let wake = tokio::select! {
        biased;
        _ = cancel.cancelled() => Wake::Cancelled,
        exit = handle.wait() => Wake::Exited(exit),
        _ = timer => Wake::Elapsed,
    };

    let ended = match wake {
        Wake::Cancelled => {
            handle.stop(grace).await;
            return Ended::Stopped;
        }
        Wake::Elapsed => {
            debug!(content_id = %ctx.content_id, "display time elapsed");
            handle.stop(grace).await;
            Ended::Completed
        }
        Wake::Exited(PlayerExit::Success) => Ended::Completed,
        Wake::Exited(PlayerExit::Failure { code }) => Ended::Failed(code),
    };

    ctx.state.send_if_modified(|s| {
        if s.generation == ctx.generation {
            *s = PlaybackSnapshot::idle(ctx.generation);
            true
        } else {
            false
        }
    });

    let status = match ended {
        Ended::Failed(code) => {
            warn!(content_id = %ctx.content_id, exit_code = ?code, "player exited with an error");
            PlaybackStatus::Error
        }
        _ => {
            info!(content_id = %ctx.content_id, "playback completed");
            PlaybackStatus::Completed
        }
    };
    emit(&ctx.events, status, &ctx.content_id);
    ended
}

fn emit(events: &broadcast::Sender<AgentEvent>, status: PlaybackStatus, content_id: &str) {
    let _ = events.send(AgentEvent::Playback {
        status,
        content_id: Some(content_id.to_owned()),
    });
}
