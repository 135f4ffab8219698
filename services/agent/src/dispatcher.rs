//! Command dispatch.
//!
//! One worker per controller link decodes frames and executes commands one
//! at a time in arrival order. The only overlap allowed is preemption: while
//! a Play is still resolving its content, a newer Play or Stop cancels it.
//! Everything that arrived meanwhile, the canceller included, then runs in
//! the order received.
//!
//! Every failure local to a command becomes an `ERROR` frame carrying the
//! command name and content id; nothing here ends the link.

use std::collections::VecDeque;
use std::sync::Arc;

use ds_protocol::{
    AgentMessage, Command, ContentDescriptor, ContentKind, DecodeError, DeviceSettings,
    ErrorReport, StateSnapshotReport, timestamp_now,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::content_store::{ContentStore, FetchError, PlayTarget};
use crate::device::{DeviceControl, DeviceError, apply_settings};
use crate::identity::DeviceIdentity;
use crate::playback::{PlaybackError, Supervisor};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub struct Dispatcher {
    store: Arc<ContentStore>,
    supervisor: Supervisor,
    device: Arc<dyn DeviceControl>,
    identity: DeviceIdentity,
}

/// Frames not yet handled: commands set aside during a preemptible Play,
/// then the link's inbound channel.
struct Inbox {
    frames: mpsc::Receiver<String>,
    pending: VecDeque<Command>,
    closed: bool,
}

enum Next {
    Command(Command),
    Invalid(DecodeError),
    Closed,
}

impl Inbox {
    fn new(frames: mpsc::Receiver<String>) -> Self {
        Self {
            frames,
            pending: VecDeque::new(),
            closed: false,
        }
    }

    async fn next(&mut self) -> Next {
        if let Some(command) = self.pending.pop_front() {
            return Next::Command(command);
        }
        if self.closed {
            return Next::Closed;
        }
        match self.frames.recv().await {
            Some(text) => match Command::decode(&text) {
                Ok(command) => Next::Command(command),
                Err(e) => Next::Invalid(e),
            },
            None => {
                self.closed = true;
                Next::Closed
            }
        }
    }
}

/// How a Play's content resolution ended.
enum Resolution<T> {
    Done(T),
    Preempted,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ContentStore>,
        supervisor: Supervisor,
        device: Arc<dyn DeviceControl>,
        identity: DeviceIdentity,
    ) -> Self {
        Self {
            store,
            supervisor,
            device,
            identity,
        }
    }

    /// Process frames until the inbound channel closes and every queued
    /// command has run.
    pub async fn run(&self, frames: mpsc::Receiver<String>, outbound: mpsc::Sender<AgentMessage>) {
        let mut inbox = Inbox::new(frames);
        loop {
            let command = match inbox.next().await {
                Next::Command(command) => command,
                Next::Invalid(e) => {
                    report_decode_error(&outbound, e).await;
                    continue;
                }
                Next::Closed => {
                    debug!("inbound closed, dispatcher stopping");
                    return;
                }
            };

            let name = command.name();
            let content_id = match &command {
                Command::Play { content, .. } => Some(content.id.clone()),
                _ => None,
            };
            debug!(command = name, content_id = ?content_id, "handling command");

            if let Err(e) = self.execute(command, &mut inbox, &outbound).await {
                warn!(command = name, content_id = ?content_id, error = %e, "command failed");
                send(
                    &outbound,
                    AgentMessage::Error(ErrorReport {
                        timestamp: timestamp_now(),
                        message: e.to_string(),
                        command: Some(name.to_owned()),
                        content_id,
                    }),
                )
                .await;
            }
        }
    }

    async fn execute(
        &self,
        command: Command,
        inbox: &mut Inbox,
        outbound: &mpsc::Sender<AgentMessage>,
    ) -> Result<(), CommandError> {
        match command {
            Command::Play { content, settings } => {
                self.play(content, settings, inbox, outbound).await
            }
            Command::Stop => {
                // DETENIDO, when anything was playing, is raised by the
                // supervisor itself.
                self.supervisor.stop().await?;
                Ok(())
            }
            Command::ApplyConfig(settings) => {
                self.apply(&settings).await;
                Ok(())
            }
            Command::Reboot => {
                self.supervisor.stop().await?;
                info!("reboot requested");
                self.device.reboot().await?;
                Ok(())
            }
            Command::UpdateSoftware => {
                info!("software update requested");
                self.device.update_software().await?;
                Ok(())
            }
            Command::GetState => {
                send(outbound, self.state_snapshot()).await;
                Ok(())
            }
        }
    }

    async fn play(
        &self,
        content: ContentDescriptor,
        settings: DeviceSettings,
        inbox: &mut Inbox,
        outbound: &mpsc::Sender<AgentMessage>,
    ) -> Result<(), CommandError> {
        self.supervisor.stop().await?;

        if let ContentKind::Unknown(kind) = &content.kind {
            return Err(PlaybackError::UnsupportedKind(kind.clone()).into());
        }

        let target = match self.prepare_preemptible(&content, inbox, outbound).await {
            Resolution::Done(target) => target?,
            Resolution::Preempted => {
                info!(content_id = %content.id, "play superseded before content was ready");
                return Ok(());
            }
        };

        if !settings.is_empty() {
            self.apply(&settings).await;
        }

        self.supervisor.play(content, target).await?;
        Ok(())
    }

    /// Resolve content while still listening for frames. Commands arriving
    /// meanwhile are queued in arrival order; a Play or Stop among them also
    /// drops the resolution.
    async fn prepare_preemptible(
        &self,
        content: &ContentDescriptor,
        inbox: &mut Inbox,
        outbound: &mpsc::Sender<AgentMessage>,
    ) -> Resolution<Result<PlayTarget, FetchError>> {
        let prepare = self.store.prepare(content);
        tokio::pin!(prepare);

        loop {
            tokio::select! {
                biased;
                result = &mut prepare => return Resolution::Done(result),
                frame = inbox.frames.recv(), if !inbox.closed => {
                    let Some(text) = frame else {
                        inbox.closed = true;
                        continue;
                    };
                    match Command::decode(&text) {
                        Ok(command @ (Command::Play { .. } | Command::Stop)) => {
                            debug!(command = command.name(), "preempting in-flight play");
                            inbox.pending.push_back(command);
                            return Resolution::Preempted;
                        }
                        Ok(command) => inbox.pending.push_back(command),
                        Err(e) => report_decode_error(outbound, e).await,
                    }
                }
            }
        }
    }

    async fn apply(&self, settings: &DeviceSettings) {
        let failed = apply_settings(self.device.as_ref(), settings).await;
        if !failed.is_empty() {
            debug!(failed = ?failed, "some settings were not applied");
        }
    }

    fn state_snapshot(&self) -> AgentMessage {
        AgentMessage::StateSnapshot(StateSnapshotReport {
            timestamp: timestamp_now(),
            device_id: self.identity.device_id.clone(),
            display_name: self.identity.display_name.clone(),
            software_version: self.identity.software_version.clone(),
            playback: self.supervisor.snapshot().detail(),
            cached_content: self.store.cached_ids(),
        })
    }
}

async fn report_decode_error(outbound: &mpsc::Sender<AgentMessage>, error: DecodeError) {
    let command = match &error {
        DecodeError::Unsupported(name) => Some(name.clone()),
        DecodeError::Malformed(_) => None,
    };
    warn!(command = ?command, error = %error, "dropping inbound frame");
    send(
        outbound,
        AgentMessage::Error(ErrorReport {
            timestamp: timestamp_now(),
            message: CommandError::from(error).to_string(),
            command,
            content_id: None,
        }),
    )
    .await;
}

async fn send(outbound: &mpsc::Sender<AgentMessage>, message: AgentMessage) {
    let kind = message.kind();
    if outbound.send(message).await.is_err() {
        debug!(kind, "link gone, reply dropped");
    }
}
