//! Player drivers: how a content kind becomes an external process.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use ds_protocol::ContentKind;
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use super::PlaybackError;
use crate::config::PlayersConfig;
use crate::content_store::PlayTarget;

/// How a player process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerExit {
    Success,
    /// Nonzero exit; `None` when killed by a signal.
    Failure { code: Option<i32> },
}

impl PlayerExit {
    fn from_status(status: std::process::ExitStatus) -> Self {
        if status.success() {
            PlayerExit::Success
        } else {
            PlayerExit::Failure {
                code: status.code(),
            }
        }
    }
}

/// Launches a player for one target.
pub trait PlaybackDriver: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self, target: &PlayTarget) -> Result<Box<dyn PlayerHandle>, PlaybackError>;
}

/// A running player.
pub trait PlayerHandle: Send {
    /// Resolves when the player exits on its own. Must be cancel-safe: the
    /// supervisor drops this future when a stop is requested.
    fn wait(&mut self) -> BoxFuture<'_, PlayerExit>;

    /// Ask the player to exit, forcing it after `grace`, and reap it.
    fn stop(&mut self, grace: Duration) -> BoxFuture<'_, PlayerExit>;
}

// ---------------------------------------------------------------------------
// Driver table
// ---------------------------------------------------------------------------

/// One driver per playable kind.
#[derive(Clone)]
pub struct Drivers {
    pub image: Arc<dyn PlaybackDriver>,
    pub video: Arc<dyn PlaybackDriver>,
    pub browser: Arc<dyn PlaybackDriver>,
    pub inline_html: Arc<dyn PlaybackDriver>,
}

impl Drivers {
    /// Process-spawning drivers built from the configured player commands.
    pub fn system(players: &PlayersConfig) -> Self {
        Self {
            image: Arc::new(ProcessDriver::new("image", players.image.clone())),
            video: Arc::new(
                ProcessDriver::new("video", players.video.clone())
                    .with_fallback(players.video_fallback.clone()),
            ),
            browser: Arc::new(ProcessDriver::new("browser", players.browser.clone())),
            inline_html: Arc::new(
                ProcessDriver::new("inline-html", players.browser.clone()).with_file_urls(),
            ),
        }
    }

    /// The same driver for every kind.
    pub fn uniform(driver: Arc<dyn PlaybackDriver>) -> Self {
        Self {
            image: driver.clone(),
            video: driver.clone(),
            browser: driver.clone(),
            inline_html: driver,
        }
    }

    pub fn for_kind(&self, kind: &ContentKind) -> Result<&Arc<dyn PlaybackDriver>, PlaybackError> {
        match kind {
            ContentKind::Image => Ok(&self.image),
            ContentKind::Video => Ok(&self.video),
            ContentKind::WebPage => Ok(&self.browser),
            ContentKind::InlineHtml => Ok(&self.inline_html),
            ContentKind::Unknown(raw) => Err(PlaybackError::UnsupportedKind(raw.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Process driver
// ---------------------------------------------------------------------------

/// Runs `command... <target>` as a child process.
pub struct ProcessDriver {
    name: String,
    command: Vec<String>,
    /// Tried once when the primary program is not installed.
    fallback: Option<Vec<String>>,
    /// Hand local files to the player as `file://` URLs.
    file_urls: bool,
}

impl ProcessDriver {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            fallback: None,
            file_urls: false,
        }
    }

    pub fn with_fallback(mut self, command: Vec<String>) -> Self {
        if !command.is_empty() {
            self.fallback = Some(command);
        }
        self
    }

    pub fn with_file_urls(mut self) -> Self {
        self.file_urls = true;
        self
    }

    fn target_arg(&self, target: &PlayTarget) -> String {
        match target {
            PlayTarget::File(path) if self.file_urls => format!("file://{}", path.display()),
            other => other.as_arg(),
        }
    }

    fn spawn(command: &[String], arg: &str) -> std::io::Result<tokio::process::Child> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "empty command"))?;
        tokio::process::Command::new(program)
            .args(args)
            .arg(arg)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

impl PlaybackDriver for ProcessDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, target: &PlayTarget) -> Result<Box<dyn PlayerHandle>, PlaybackError> {
        let arg = self.target_arg(target);
        let launch_error = |command: &[String], e: std::io::Error| PlaybackError::Launch {
            player: command.first().cloned().unwrap_or_default(),
            reason: e.to_string(),
        };

        let child = match Self::spawn(&self.command, &arg) {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.fallback.is_some() => {
                let fallback = self.fallback.as_deref().unwrap_or_default();
                warn!(driver = %self.name, error = %e, "primary player unavailable, trying fallback");
                Self::spawn(fallback, &arg).map_err(|e| launch_error(fallback, e))?
            }
            Err(e) => return Err(launch_error(&self.command, e)),
        };
        debug!(driver = %self.name, pid = ?child.id(), target = %arg, "player started");
        Ok(Box::new(ProcessHandle { child }))
    }
}

struct ProcessHandle {
    child: tokio::process::Child,
}

impl ProcessHandle {
    fn exit_of(result: std::io::Result<std::process::ExitStatus>) -> PlayerExit {
        match result {
            Ok(status) => PlayerExit::from_status(status),
            Err(e) => {
                warn!(error = %e, "failed to reap player");
                PlayerExit::Failure { code: None }
            }
        }
    }

    fn terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: plain signal delivery to a child we spawned and have
            // not reaped yet.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            return;
        }
        let _ = self.child.start_kill();
    }
}

impl PlayerHandle for ProcessHandle {
    fn wait(&mut self) -> BoxFuture<'_, PlayerExit> {
        Box::pin(async move { Self::exit_of(self.child.wait().await) })
    }

    fn stop(&mut self, grace: Duration) -> BoxFuture<'_, PlayerExit> {
        Box::pin(async move {
            if let Ok(Some(status)) = self.child.try_wait() {
                return PlayerExit::from_status(status);
            }
            self.terminate();
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(result) => Self::exit_of(result),
                Err(_) => {
                    warn!(pid = ?self.child.id(), "player ignored SIGTERM, killing");
                    if let Err(e) = self.child.kill().await {
                        warn!(error = %e, "failed to kill player");
                    }
                    Self::exit_of(self.child.wait().await)
                }
            }
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> Vec<String> {
        vec![
            "sh".to_owned(),
            "-c".to_owned(),
            script.to_owned(),
            "player".to_owned(),
        ]
    }

    #[tokio::test]
    async fn exit_codes_map_to_outcomes() {
        let target = PlayTarget::Url("http://example.com".to_owned());
        let ok = ProcessDriver::new("ok", sh("exit 0"));
        let mut handle = ok.start(&target).unwrap();
        assert_eq!(handle.wait().await, PlayerExit::Success);

        let bad = ProcessDriver::new("bad", sh("exit 3"));
        let mut handle = bad.start(&target).unwrap();
        assert_eq!(handle.wait().await, PlayerExit::Failure { code: Some(3) });
    }

    #[tokio::test]
    async fn stop_escalates_to_kill_after_grace() {
        let stubborn = ProcessDriver::new("stubborn", sh("trap '' TERM; sleep 30"));
        let mut handle = stubborn
            .start(&PlayTarget::File(PathBuf::from("/tmp/x")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let exit = handle.stop(Duration::from_millis(200)).await;
        assert!(matches!(exit, PlayerExit::Failure { code: None }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_player_falls_back_once() {
        let driver = ProcessDriver::new("video", vec!["definitely-not-a-player-binary".to_owned()])
            .with_fallback(sh("exit 0"));
        let mut handle = driver
            .start(&PlayTarget::File(PathBuf::from("/tmp/v.mp4")))
            .unwrap();
        assert_eq!(handle.wait().await, PlayerExit::Success);

        let lonely = ProcessDriver::new("image", vec!["definitely-not-a-player-binary".to_owned()]);
        let err = lonely
            .start(&PlayTarget::File(PathBuf::from("/tmp/i.jpg")))
            .err()
            .unwrap();
        assert!(matches!(err, PlaybackError::Launch { .. }));
    }

    #[test]
    fn inline_html_targets_become_file_urls() {
        let driver = ProcessDriver::new("inline-html", vec!["browser".to_owned()]).with_file_urls();
        assert_eq!(
            driver.target_arg(&PlayTarget::File(PathBuf::from("/opt/c/inline_1.html"))),
            "file:///opt/c/inline_1.html"
        );
        let plain = ProcessDriver::new("browser", vec!["browser".to_owned()]);
        assert_eq!(
            plain.target_arg(&PlayTarget::Url("https://x".to_owned())),
            "https://x"
        );
    }

    #[test]
    fn unknown_kind_has_no_driver() {
        let drivers = Drivers::system(&PlayersConfig::default());
        assert!(drivers.for_kind(&ContentKind::Video).is_ok());
        assert!(matches!(
            drivers.for_kind(&ContentKind::Unknown("holo".into())),
            Err(PlaybackError::UnsupportedKind(k)) if k == "holo"
        ));
    }
}
