//! Device-level collaborators: output volume, backlight, reboot and software
//! update.

use std::path::PathBuf;

use ds_protocol::DeviceSettings;
use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("{0} is not available on this device")]
    Unavailable(String),
    #[error("{0} is not configured")]
    NotConfigured(String),
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
    #[error("`{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait DeviceControl: Send + Sync {
    fn set_volume(&self, percent: u8) -> BoxFuture<'_, Result<(), DeviceError>>;

    fn set_brightness(&self, percent: u8) -> BoxFuture<'_, Result<(), DeviceError>>;

    fn reboot(&self) -> BoxFuture<'_, Result<(), DeviceError>>;

    /// Hand off to the external update procedure.
    fn update_software(&self) -> BoxFuture<'_, Result<(), DeviceError>>;
}

/// Apply each recognised setting independently. A failing setting is logged
/// and never prevents the others from being applied.
///
/// Returns the keys that failed.
pub async fn apply_settings(device: &dyn DeviceControl, settings: &DeviceSettings) -> Vec<String> {
    let mut failed = Vec::new();
    for key in settings.keys() {
        let result = match key {
            DeviceSettings::VOLUME | DeviceSettings::BRIGHTNESS => {
                match settings.percent(key) {
                    Some(Ok(percent)) if key == DeviceSettings::VOLUME => {
                        device.set_volume(percent).await
                    }
                    Some(Ok(percent)) => device.set_brightness(percent).await,
                    Some(Err(reason)) => Err(DeviceError::InvalidSetting(reason)),
                    None => continue,
                }
            }
            other => {
                debug!(setting = other, "ignoring unknown setting");
                continue;
            }
        };
        match result {
            Ok(()) => info!(setting = key, "setting applied"),
            Err(DeviceError::Unavailable(what)) => {
                debug!(setting = key, what, "setting not supported here");
                failed.push(key.to_owned());
            }
            Err(e) => {
                warn!(setting = key, error = %e, "failed to apply setting");
                failed.push(key.to_owned());
            }
        }
    }
    failed
}

/// Backlight level for a 0-100 brightness percentage.
pub fn backlight_level(percent: u8) -> u8 {
    ((f64::from(percent.min(100)) * 255.0 / 100.0).round()) as u8
}

// ---------------------------------------------------------------------------
// System implementation
// ---------------------------------------------------------------------------

/// Runs the configured commands and writes the sysfs backlight.
pub struct SystemDeviceControl {
    backlight_path: PathBuf,
    volume_command: Vec<String>,
    reboot_command: Vec<String>,
    update_command: Vec<String>,
}

impl SystemDeviceControl {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            backlight_path: config.backlight_path.clone(),
            volume_command: config.volume_command.clone(),
            reboot_command: config.reboot_command.clone(),
            update_command: config.update_command.clone(),
        }
    }
}

async fn run_command(
    what: &str,
    command: &[String],
    extra: Option<String>,
) -> Result<(), DeviceError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| DeviceError::NotConfigured(what.to_owned()))?;
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    if let Some(extra) = extra {
        cmd.arg(extra);
    }
    let output = cmd.output().await.map_err(|e| DeviceError::CommandFailed {
        command: command.join(" "),
        reason: e.to_string(),
    })?;
    if !output.status.success() {
        return Err(DeviceError::CommandFailed {
            command: command.join(" "),
            reason: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

/// Start `command` without waiting for it. Only a failure to launch is an
/// error; the exit status is logged when the process ends.
fn spawn_command(what: &str, command: &[String]) -> Result<(), DeviceError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| DeviceError::NotConfigured(what.to_owned()))?;
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .spawn()
        .map_err(|e| DeviceError::CommandFailed {
            command: command.join(" "),
            reason: e.to_string(),
        })?;

    let what = what.to_owned();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => info!(what = %what, "finished"),
            Ok(status) => warn!(what = %what, %status, "exited with failure"),
            Err(e) => warn!(what = %what, error = %e, "could not be reaped"),
        }
    });
    Ok(())
}

impl DeviceControl for SystemDeviceControl {
    fn set_volume(&self, percent: u8) -> BoxFuture<'_, Result<(), DeviceError>> {
        Box::pin(async move {
            run_command("volume control", &self.volume_command, Some(format!("{percent}%"))).await
        })
    }

    fn set_brightness(&self, percent: u8) -> BoxFuture<'_, Result<(), DeviceError>> {
        Box::pin(async move {
            if !tokio::fs::try_exists(&self.backlight_path)
                .await
                .unwrap_or(false)
            {
                return Err(DeviceError::Unavailable(format!(
                    "backlight {}",
                    self.backlight_path.display()
                )));
            }
            tokio::fs::write(&self.backlight_path, backlight_level(percent).to_string()).await?;
            Ok(())
        })
    }

    fn reboot(&self) -> BoxFuture<'_, Result<(), DeviceError>> {
        Box::pin(async move {
            info!("rebooting device");
            run_command("reboot", &self.reboot_command, None).await
        })
    }

    fn update_software(&self) -> BoxFuture<'_, Result<(), DeviceError>> {
        Box::pin(async move {
            info!("starting software update");
            spawn_command("software update", &self.update_command)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlight_scales_percent_to_byte() {
        assert_eq!(backlight_level(0), 0);
        assert_eq!(backlight_level(50), 128);
        assert_eq!(backlight_level(100), 255);
    }

    fn system(dir: &std::path::Path) -> SystemDeviceControl {
        SystemDeviceControl {
            backlight_path: dir.join("brightness"),
            volume_command: vec!["true".to_owned()],
            reboot_command: vec!["false".to_owned()],
            update_command: Vec::new(),
        }
    }

    #[tokio::test]
    async fn brightness_writes_backlight_file_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let device = system(dir.path());
        assert!(matches!(
            device.set_brightness(40).await,
            Err(DeviceError::Unavailable(_))
        ));

        std::fs::write(dir.path().join("brightness"), "0").unwrap();
        device.set_brightness(40).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("brightness")).unwrap(),
            "102"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_failures_and_missing_commands_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let device = system(dir.path());
        device.set_volume(30).await.unwrap();
        assert!(matches!(
            device.reboot().await,
            Err(DeviceError::CommandFailed { .. })
        ));
        let err = device.update_software().await.unwrap_err();
        assert_eq!(err.to_string(), "software update is not configured");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn update_returns_once_launched() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = system(dir.path());
        device.update_command = vec!["sh".to_owned(), "-c".to_owned(), "sleep 5".to_owned()];

        let started = std::time::Instant::now();
        device.update_software().await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(2));

        device.update_command = vec!["definitely-not-an-updater".to_owned()];
        assert!(matches!(
            device.update_software().await,
            Err(DeviceError::CommandFailed { .. })
        ));
    }
}
