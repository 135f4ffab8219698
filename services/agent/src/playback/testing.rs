//! Scriptable in-memory collaborators for tests.
//!
//! `FakeDriver` stands in for a player binary and records the order in which
//! players start and stop; `FakeDeviceControl` records device actions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;

use super::PlaybackError;
use super::driver::{PlaybackDriver, PlayerExit, PlayerHandle};
use crate::content_store::PlayTarget;
use crate::device::{DeviceControl, DeviceError};

/// What a fake player does once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBehavior {
    /// Runs until stopped.
    RunUntilStopped,
    /// Exits by itself after the delay with the given code.
    ExitAfter(Duration, i32),
    /// Fails to launch.
    FailLaunch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerCall {
    Started(String),
    Stopped(String),
}

#[derive(Clone)]
pub struct FakeDriver {
    behavior: Arc<Mutex<FakeBehavior>>,
    calls: Arc<Mutex<Vec<PlayerCall>>>,
}

impl FakeDriver {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Behaviour for players started from now on.
    pub fn set_behavior(&self, behavior: FakeBehavior) {
        if let Ok(mut b) = self.behavior.lock() {
            *b = behavior;
        }
    }

    pub fn calls(&self) -> Vec<PlayerCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Targets of players that were started.
    pub fn started(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PlayerCall::Started(t) => Some(t),
                PlayerCall::Stopped(_) => None,
            })
            .collect()
    }

    /// Number of players currently running (started and not yet stopped or
    /// exited).
    pub fn running(&self) -> usize {
        let calls = self.calls();
        let started = calls
            .iter()
            .filter(|c| matches!(c, PlayerCall::Started(_)))
            .count();
        started - (calls.len() - started)
    }

    fn record(&self, call: PlayerCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl PlaybackDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    fn start(&self, target: &PlayTarget) -> Result<Box<dyn PlayerHandle>, PlaybackError> {
        let behavior = self
            .behavior
            .lock()
            .map(|b| *b)
            .unwrap_or(FakeBehavior::RunUntilStopped);
        if behavior == FakeBehavior::FailLaunch {
            return Err(PlaybackError::Launch {
                player: "fake".to_owned(),
                reason: "scripted launch failure".to_owned(),
            });
        }
        let target = target.as_arg();
        self.record(PlayerCall::Started(target.clone()));
        Ok(Box::new(FakeHandle {
            driver: self.clone(),
            target,
            behavior,
            done: false,
        }))
    }
}

struct FakeHandle {
    driver: FakeDriver,
    target: String,
    behavior: FakeBehavior,
    done: bool,
}

impl FakeHandle {
    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.driver
                .record(PlayerCall::Stopped(std::mem::take(&mut self.target)));
        }
    }
}

impl PlayerHandle for FakeHandle {
    fn wait(&mut self) -> BoxFuture<'_, PlayerExit> {
        Box::pin(async move {
            match self.behavior {
                FakeBehavior::ExitAfter(delay, code) => {
                    tokio::time::sleep(delay).await;
                    self.finish();
                    if code == 0 {
                        PlayerExit::Success
                    } else {
                        PlayerExit::Failure { code: Some(code) }
                    }
                }
                _ => std::future::pending().await,
            }
        })
    }

    fn stop(&mut self, _grace: Duration) -> BoxFuture<'_, PlayerExit> {
        Box::pin(async move {
            self.finish();
            PlayerExit::Failure { code: None }
        })
    }
}

// ---------------------------------------------------------------------------
// Device control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Volume(u8),
    Brightness(u8),
    Reboot,
    UpdateSoftware,
}

#[derive(Clone, Default)]
pub struct FakeDeviceControl {
    calls: Arc<Mutex<Vec<DeviceCall>>>,
    /// When set, software updates fail as not configured.
    update_unconfigured: bool,
    /// When set, brightness is reported as unavailable.
    no_backlight: bool,
}

impl FakeDeviceControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_update(mut self) -> Self {
        self.update_unconfigured = true;
        self
    }

    pub fn without_backlight(mut self) -> Self {
        self.no_backlight = true;
        self
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: DeviceCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl DeviceControl for FakeDeviceControl {
    fn set_volume(&self, percent: u8) -> BoxFuture<'_, Result<(), DeviceError>> {
        Box::pin(async move {
            self.record(DeviceCall::Volume(percent));
            Ok(())
        })
    }

    fn set_brightness(&self, percent: u8) -> BoxFuture<'_, Result<(), DeviceError>> {
        Box::pin(async move {
            if self.no_backlight {
                return Err(DeviceError::Unavailable("backlight".to_owned()));
            }
            self.record(DeviceCall::Brightness(percent));
            Ok(())
        })
    }

    fn reboot(&self) -> BoxFuture<'_, Result<(), DeviceError>> {
        Box::pin(async move {
            self.record(DeviceCall::Reboot);
            Ok(())
        })
    }

    fn update_software(&self) -> BoxFuture<'_, Result<(), DeviceError>> {
        Box::pin(async move {
            if self.update_unconfigured {
                return Err(DeviceError::NotConfigured("software update".to_owned()));
            }
            self.record(DeviceCall::UpdateSoftware);
            Ok(())
        })
    }
}
