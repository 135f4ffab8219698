//! Periodic health report.
//!
//! Runs for the lifetime of one controller link. A tick whose send cannot be
//! queued is logged and skipped; it never delays the next tick or any
//! command handling.

use std::sync::Arc;
use std::time::Duration;

use ds_protocol::{AgentMessage, HeartbeatReport, STATUS_CONNECTED, timestamp_now};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::identity::{DeviceIdentity, detect_local_ip};
use crate::metrics::MetricsSampler;
use crate::playback::PlaybackSnapshot;

pub struct HeartbeatReporter {
    identity: DeviceIdentity,
    sampler: Arc<dyn MetricsSampler>,
    playback: watch::Receiver<PlaybackSnapshot>,
    interval: Duration,
}

impl HeartbeatReporter {
    pub fn new(
        identity: DeviceIdentity,
        sampler: Arc<dyn MetricsSampler>,
        playback: watch::Receiver<PlaybackSnapshot>,
        interval: Duration,
    ) -> Self {
        Self {
            identity,
            sampler,
            playback,
            interval,
        }
    }

    /// Assemble one heartbeat from fresh samples. Metrics and the local
    /// address both touch the OS, so they are gathered off the async workers.
    pub async fn sample(&self) -> Option<AgentMessage> {
        let sampler = self.sampler.clone();
        let gathered = tokio::task::spawn_blocking(move || (sampler.sample(), detect_local_ip()));
        let (metrics, ip_address) = match gathered.await {
            Ok(sampled) => sampled,
            Err(e) => {
                warn!(error = %e, "metrics sampling failed");
                return None;
            }
        };
        let playback = self.playback.borrow().summary();
        Some(AgentMessage::Heartbeat(HeartbeatReport {
            timestamp: timestamp_now(),
            mac_address: self.identity.mac_address.clone(),
            device_id: self.identity.device_id.clone(),
            ip_address,
            software_version: self.identity.software_version.clone(),
            status: STATUS_CONNECTED.to_owned(),
            metrics,
            playback,
        }))
    }

    /// Send a heartbeat immediately, then every interval, until the outbound
    /// queue is closed.
    pub async fn run(self, outbound: mpsc::Sender<AgentMessage>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(message) = self.sample().await else {
                continue;
            };
            match outbound.try_send(message) {
                Ok(()) => debug!("heartbeat queued"),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("outbound queue full, skipping heartbeat");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("link closed, heartbeat stopping");
                    return;
                }
            }
        }
    }
}
