// display-fleet: end-to-end harness.
//
// Runs a complete device agent, with scripted players and device control,
// against an in-process mock controller and content server.

use std::sync::Arc;

use agent::Agent;
use agent::config::AgentConfig;
use agent::connection::ConnectionState;
use agent::identity::DeviceIdentity;
use agent::metrics::FixedMetrics;
use agent::playback::testing::{FakeBehavior, FakeDeviceControl, FakeDriver};
use agent::playback::{Drivers, Supervisor};
use ds_test_utils::{ContentServer, MockController};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const NODE_MAC: &str = "B8:27:EB:00:00:01";

/// One display node wired to its own controller and content server.
pub struct Node {
    pub controller: MockController,
    pub content: ContentServer,
    pub driver: FakeDriver,
    pub device: FakeDeviceControl,
    supervisor: Supervisor,
    connection: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    _content_dir: tempfile::TempDir,
}

impl Node {
    /// Start a node with default config adjusted by `configure`.
    pub async fn start(
        configure: impl FnOnce(&mut AgentConfig),
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let controller = MockController::start().await?;
        let content = ContentServer::start().await?;
        let content_dir = tempfile::tempdir()?;

        let mut config = AgentConfig::new(controller.url(), content_dir.path());
        configure(&mut config);

        let driver = FakeDriver::new(FakeBehavior::RunUntilStopped);
        let device = FakeDeviceControl::new();
        let agent = Agent::new(
            config,
            DeviceIdentity::from_mac(NODE_MAC, Some("e2e".to_owned())),
            Drivers::uniform(Arc::new(driver.clone())),
            Arc::new(device.clone()),
            Arc::new(FixedMetrics::zeroed()),
        )?;
        let supervisor = agent.supervisor().clone();
        let connection = agent.connection_state();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(agent.run(shutdown_rx));

        Ok(Self {
            controller,
            content,
            driver,
            device,
            supervisor,
            connection,
            shutdown,
            task,
            _content_dir: content_dir,
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Wait until the agent reports `state`.
    pub async fn wait_for_state(&mut self, state: ConnectionState) {
        let _ = self.connection.wait_for(|s| *s == state).await;
    }

    /// Request shutdown and wait for the agent to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
