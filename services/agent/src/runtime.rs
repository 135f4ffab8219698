//! The device agent: wires the components together and owns the reconnect
//! loop.
//!
//! Per live connection four tasks run: link I/O, the command dispatcher, the
//! heartbeat reporter and the event relay. When the link ends the other three
//! are torn down; playback keeps running across reconnects.

use std::path::PathBuf;
use std::sync::Arc;

use ds_protocol::AgentMessage;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::connection::{
    self, Backoff, ConnectionState, KeepAlive, LinkError, MAX_BACKOFF, WsStream,
};
use crate::content_store::{ContentStore, FetchError};
use crate::device::DeviceControl;
use crate::dispatcher::Dispatcher;
use crate::events::{self, AgentEvent};
use crate::heartbeat::HeartbeatReporter;
use crate::identity::DeviceIdentity;
use crate::metrics::MetricsSampler;
use crate::playback::{Drivers, Supervisor};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("content directory {path} is not usable: {source}")]
    ContentDir {
        path: PathBuf,
        #[source]
        source: FetchError,
    },
}

pub struct Agent {
    config: AgentConfig,
    identity: DeviceIdentity,
    supervisor: Supervisor,
    dispatcher: Arc<Dispatcher>,
    sampler: Arc<dyn MetricsSampler>,
    events: broadcast::Sender<AgentEvent>,
    state: watch::Sender<ConnectionState>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        identity: DeviceIdentity,
        drivers: Drivers,
        device: Arc<dyn DeviceControl>,
        sampler: Arc<dyn MetricsSampler>,
    ) -> Result<Self, AgentError> {
        let events = events::channel();
        let store = ContentStore::new(
            &config.storage.content_dir,
            config.download.timeout,
            events.clone(),
        )
        .map_err(|source| AgentError::ContentDir {
            path: config.storage.content_dir.clone(),
            source,
        })?;
        let supervisor = Supervisor::new(drivers, config.playback.clone(), events.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(store),
            supervisor.clone(),
            device,
            identity.clone(),
        ));
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            config,
            identity,
            supervisor,
            dispatcher,
            sampler,
            events,
            state,
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Keep a controller link up until `shutdown` flips to `true`, then stop
    /// playback and return.
    ///
    /// Reconnect attempts back off per [`Backoff`]. Once the configured
    /// ceiling is reached the condition is logged and attempts continue at
    /// the capped delay.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let url = self.config.server.url.clone();
        let mut backoff = Backoff::new(self.config.connection.max_reconnect_attempts);
        let mut exhausted_reported = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.state.send_replace(ConnectionState::Connecting);
            info!(url = %url, attempt = backoff.failures() + 1, "connecting to controller");
            let connected = tokio::select! {
                result = connection::connect(
                    &url,
                    &self.identity,
                    self.config.connection.max_message_bytes,
                ) => result,
                _ = stopped(&mut shutdown) => break,
            };

            match connected {
                Ok(ws) => {
                    backoff.reset();
                    exhausted_reported = false;
                    self.state.send_replace(ConnectionState::Connected);
                    info!(device_id = %self.identity.device_id, "connected to controller");

                    match self.serve(ws, shutdown.clone()).await {
                        Ok(()) if *shutdown.borrow() => break,
                        Ok(()) => warn!("controller link ended"),
                        Err(e) => warn!(error = %e, "controller link lost"),
                    }
                }
                Err(e) => warn!(error = %e, "connect failed"),
            }
            self.state.send_replace(ConnectionState::Disconnected);

            let delay = match backoff.record_failure() {
                Ok(delay) => delay,
                Err(exhausted) => {
                    if !exhausted_reported {
                        error!(
                            attempts = exhausted.attempts,
                            "{exhausted}; retrying every {}s",
                            MAX_BACKOFF.as_secs()
                        );
                        exhausted_reported = true;
                    }
                    MAX_BACKOFF
                }
            };
            info!(delay_secs = delay.as_secs(), "waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut shutdown) => break,
            }
        }

        self.state.send_replace(ConnectionState::Closing);
        info!("shutting down");
        if let Err(e) = self.supervisor.stop().await {
            warn!(error = %e, "failed to stop playback during shutdown");
        }
        self.state.send_replace(ConnectionState::Disconnected);
        info!("agent stopped");
    }

    /// Run one live connection to completion.
    async fn serve(&self, ws: WsStream, shutdown: watch::Receiver<bool>) -> Result<(), LinkError> {
        let depth = self.config.connection.outbound_queue;
        let (outbound_tx, outbound_rx) = mpsc::channel(depth);
        let (inbound_tx, inbound_rx) = mpsc::channel(depth);

        let dispatcher = {
            let dispatcher = self.dispatcher.clone();
            let outbound = outbound_tx.clone();
            tokio::spawn(async move { dispatcher.run(inbound_rx, outbound).await })
        };
        let heartbeat = tokio::spawn(
            HeartbeatReporter::new(
                self.identity.clone(),
                self.sampler.clone(),
                self.supervisor.subscribe(),
                self.config.heartbeat.interval,
            )
            .run(outbound_tx.clone()),
        );
        let relay = tokio::spawn(relay_events(self.events.subscribe(), outbound_tx));

        let keepalive = KeepAlive {
            interval: self.config.connection.ping_interval,
            timeout: self.config.connection.ping_timeout,
        };
        let result =
            connection::run_link(ws, outbound_rx, inbound_tx, keepalive, shutdown).await;

        for task in [dispatcher, heartbeat, relay] {
            task.abort();
            let _ = task.await;
        }
        result
    }
}

/// Forward notifications to the controller for as long as the link lasts.
async fn relay_events(
    mut events: broadcast::Receiver<AgentEvent>,
    outbound: mpsc::Sender<AgentMessage>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if outbound.send(event.to_message()).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event relay fell behind, notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Resolves once shutdown is requested or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::FixedMetrics;
    use crate::playback::testing::{FakeBehavior, FakeDeviceControl, FakeDriver};
    use ds_test_utils::MockController;
    use std::time::Duration;

    fn agent(url: &str, dir: &std::path::Path) -> Agent {
        Agent::new(
            AgentConfig::new(url, dir),
            DeviceIdentity::from_mac("AA:BB:CC:00:00:42", None),
            Drivers::uniform(Arc::new(FakeDriver::new(FakeBehavior::RunUntilStopped))),
            Arc::new(FakeDeviceControl::new()),
            Arc::new(FixedMetrics::zeroed()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn connects_sends_heartbeat_and_shuts_down() {
        let mut controller = MockController::start().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(&controller.url(), dir.path());
        let mut state = agent.connection_state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(agent.run(shutdown_rx));

        let hb = controller
            .recv_matching(Duration::from_secs(5), |m| {
                matches!(m, AgentMessage::Heartbeat(_))
            })
            .await
            .expect("heartbeat after connect");
        assert_eq!(hb.connection, 0);
        assert_eq!(controller.header(0, "device_id").as_deref(), Some("AABBCC000042"));
        assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("agent stops on shutdown")
            .unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_interrupts_reconnect_wait() {
        // Nothing listens here, so every attempt fails.
        let dir = tempfile::tempdir().unwrap();
        let agent = agent("ws://127.0.0.1:1/ws", dir.path());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(agent.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("backoff sleep is cancellable")
            .unwrap();
    }

    #[test]
    fn unusable_content_dir_is_reported() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = Agent::new(
            AgentConfig::new("ws://127.0.0.1:1/ws", file.path().join("content")),
            DeviceIdentity::from_mac("AA:BB:CC:00:00:42", None),
            Drivers::uniform(Arc::new(FakeDriver::new(FakeBehavior::RunUntilStopped))),
            Arc::new(FakeDeviceControl::new()),
            Arc::new(FixedMetrics::zeroed()),
        );
        assert!(matches!(result, Err(AgentError::ContentDir { .. })));
    }
}
