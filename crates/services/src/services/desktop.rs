//! Desktop (OS-level) notification side effect.

use notify_rust::Notification as DesktopNotification;
use tracing::{debug, warn};

/// Shows a notification outside the application. Best-effort: implementations
/// log and swallow their own failures.
pub trait DesktopNotifier: Send + Sync {
    fn show(&self, title: &str, body: Option<&str>);
}

/// Uses the platform notification center via `notify-rust`
pub struct SystemNotifier {
    app_name: String,
    enabled: bool,
}

impl SystemNotifier {
    pub fn new(app_name: impl Into<String>, enabled: bool) -> Self {
        Self {
            app_name: app_name.into(),
            enabled,
        }
    }
}

impl DesktopNotifier for SystemNotifier {
    fn show(&self, title: &str, body: Option<&str>) {
        if !self.enabled {
            debug!("Desktop notifications disabled, skipping");
            return;
        }

        let mut notification = DesktopNotification::new();
        notification
            .appname(&self.app_name)
            .summary(title)
            .body(body.unwrap_or_default());

        let show = move || {
            if let Err(e) = notification.show() {
                warn!(error = %e, "Failed to show desktop notification");
            }
        };
        // Showing can block on the session bus.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(show);
            }
            Err(_) => show(),
        }
    }
}

/// Drops every notification
pub struct NoopNotifier;

impl DesktopNotifier for NoopNotifier {
    fn show(&self, _title: &str, _body: Option<&str>) {}
}
