use std::{process::Command, sync::Arc};

use naragaiden_core::{STATUS_LAUNCH_PROMPT, STATUS_READY, TapAction};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{clock::Clock, refresh::WidgetEvent, store::SnapshotStore};

pub const COMPANION_APP_ID: &str = "com.naraorganics.nara";

/// Where to send the user, in the order tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTargets {
    pub app_uri: String,
    pub store_uri: String,
    pub web_url: String,
}

impl LaunchTargets {
    pub fn for_app(app_id: &str) -> Self {
        Self {
            app_uri: format!("android-app://{app_id}"),
            store_uri: format!("market://details?id={app_id}"),
            web_url: format!("https://play.google.com/store/apps/details?id={app_id}"),
        }
    }

    fn in_order(&self) -> [&str; 3] {
        [&self.app_uri, &self.store_uri, &self.web_url]
    }
}

impl Default for LaunchTargets {
    fn default() -> Self {
        Self::for_app(COMPANION_APP_ID)
    }
}

pub trait UrlOpener: Send + Sync {
    fn open(&self, uri: &str) -> Result<(), String>;
}

impl<T: UrlOpener + ?Sized> UrlOpener for Arc<T> {
    fn open(&self, uri: &str) -> Result<(), String> {
        (**self).open(uri)
    }
}

/// Hands URLs to the desktop's default handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemOpener;

impl UrlOpener for SystemOpener {
    fn open(&self, uri: &str) -> Result<(), String> {
        let mut command = if cfg!(target_os = "windows") {
            let mut command = Command::new("cmd");
            command.args(["/C", "start", ""]);
            command
        } else if cfg!(target_os = "macos") {
            Command::new("open")
        } else {
            Command::new("xdg-open")
        };

        let status = command
            .arg(uri)
            .status()
            .map_err(|err| format!("failed to run opener: {err}"))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("opener exited with {status}"))
        }
    }
}

pub trait AppLauncher: Send + Sync {
    /// Best effort; `false` when every target failed.
    fn launch(&self, targets: &LaunchTargets) -> bool;
}

/// Tries the app, then its store page, then the web listing.
#[derive(Debug, Clone, Default)]
pub struct FallbackLauncher<O> {
    opener: O,
}

impl<O: UrlOpener> FallbackLauncher<O> {
    pub fn new(opener: O) -> Self {
        Self { opener }
    }
}

impl<O: UrlOpener> AppLauncher for FallbackLauncher<O> {
    fn launch(&self, targets: &LaunchTargets) -> bool {
        for uri in targets.in_order() {
            match self.opener.open(uri) {
                Ok(()) => {
                    info!(uri, "companion app launched");
                    return true;
                }
                Err(err) => debug!(uri, "launch target failed: {}", err),
            }
        }
        warn!("no launch target could be opened");
        false
    }
}

/// Two-tap confirmation before leaving for the companion app.
pub struct LaunchArmer {
    store: Arc<SnapshotStore>,
    clock: Arc<dyn Clock>,
    launcher: Arc<dyn AppLauncher>,
    targets: LaunchTargets,
    events: mpsc::UnboundedSender<WidgetEvent>,
}

impl LaunchArmer {
    pub fn new(
        store: Arc<SnapshotStore>,
        clock: Arc<dyn Clock>,
        launcher: Arc<dyn AppLauncher>,
        targets: LaunchTargets,
        events: mpsc::UnboundedSender<WidgetEvent>,
    ) -> Self {
        Self {
            store,
            clock,
            launcher,
            targets,
            events,
        }
    }

    /// Advances the arming state for a tap at `now_ms` without launching anything.
    pub fn handle_tap(&self, now_ms: i64) -> TapAction {
        let action = match self.store.register_tap(now_ms) {
            Ok(action) => action,
            Err(err) => {
                warn!("failed to record launch tap: {}", err);
                TapAction::ShowPrompt
            }
        };
        debug!(?action, now_ms, "launch tap");
        action
    }

    pub fn is_armed(&self, now_ms: i64) -> bool {
        self.store.check_armed(now_ms)
    }

    /// A full tap: prompts on the first, launches on a confirming second.
    pub fn tap(&self) -> TapAction {
        let action = self.handle_tap(self.clock.now_ms());
        match action {
            TapAction::ShowPrompt => self.publish(STATUS_LAUNCH_PROMPT),
            TapAction::Launch => {
                self.publish(STATUS_READY);
                self.launcher.launch(&self.targets);
            }
        }
        action
    }

    fn publish(&self, status: &str) {
        if self.events.send(WidgetEvent::Prompt(status.to_owned())).is_err() {
            debug!("renderer gone, dropping prompt");
        }
    }
}
