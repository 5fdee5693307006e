// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Notification sink adapter trait, fan-out, and the name registry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from notify operations
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("unknown notifier: {0}")]
    UnknownNotifier(String),
}

/// Adapter for sending a terminal-status notification
#[async_trait]
pub trait Notify: Send + Sync + 'static {
    /// Registry name of this sink
    fn name(&self) -> &str;

    /// Send a notification with a title and message body
    async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError>;
}

/// All configured sinks, fanned out together.
pub struct NotifierSet {
    notifiers: Vec<Box<dyn Notify>>,
}

impl std::fmt::Debug for NotifierSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierSet")
            .field("notifiers", &self.notifiers.len())
            .finish()
    }
}

impl NotifierSet {
    pub fn new(notifiers: Vec<Box<dyn Notify>>) -> Self {
        Self { notifiers }
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Send to every sink; a failing sink is logged and skipped so one dead
    /// channel never blocks the rest. Returns how many sends succeeded.
    pub async fn notify_all(&self, title: &str, message: &str) -> usize {
        let mut sent = 0;
        for notifier in &self.notifiers {
            match notifier.notify(title, message).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(notifier = notifier.name(), error = %e, "notification failed");
                }
            }
        }
        sent
    }
}

/// Desktop notification sink using notify-rust.
///
/// On macOS, `notify-rust` goes through `mac-notification-sys`, whose first
/// notification looks up a bundle identifier with an AppleScript that blocks
/// forever in daemon processes lacking Automation permissions. Pre-setting
/// the identifier at construction time bypasses the lookup.
#[derive(Clone, Copy, Debug, Default)]
pub struct DesktopNotifier;

impl DesktopNotifier {
    pub fn new() -> Self {
        #[cfg(target_os = "macos")]
        {
            let _ = mac_notification_sys::set_application("com.apple.Terminal");
        }
        Self
    }
}

#[async_trait]
impl Notify for DesktopNotifier {
    fn name(&self) -> &str {
        "desktop"
    }

    async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError> {
        let title = title.to_string();
        let message = message.to_string();
        // Notification::show() is synchronous on some platforms; run it on
        // the bounded blocking pool so the reconciliation loop never stalls.
        tokio::task::spawn_blocking(move || {
            match notify_rust::Notification::new().summary(&title).body(&message).show() {
                Ok(_) => tracing::info!(%title, "desktop notification sent"),
                Err(e) => tracing::warn!(%title, error = %e, "desktop notification failed"),
            }
        });
        Ok(())
    }
}

/// Build the configured notification sinks by registry name.
pub fn build_notifiers(
    configured: &BTreeMap<String, toml::Value>,
) -> Result<NotifierSet, NotifyError> {
    let mut notifiers: Vec<Box<dyn Notify>> = Vec::new();
    for name in configured.keys() {
        match name.as_str() {
            "desktop" => notifiers.push(Box::new(DesktopNotifier::new())),
            other => return Err(NotifyError::UnknownNotifier(other.to_string())),
        }
    }
    Ok(NotifierSet::new(notifiers))
}

#[cfg(any(test, feature = "test-support"))]
mod fake {
    use super::{Notify, NotifyError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Recorded notification
    #[derive(Debug, Clone)]
    pub struct NotifyCall {
        pub title: String,
        pub message: String,
    }

    struct FakeNotifierState {
        calls: Vec<NotifyCall>,
        fail: bool,
    }

    /// Fake notification sink for testing; clones share the call log.
    #[derive(Clone)]
    pub struct FakeNotifier {
        inner: Arc<Mutex<FakeNotifierState>>,
    }

    impl Default for FakeNotifier {
        fn default() -> Self {
            Self { inner: Arc::new(Mutex::new(FakeNotifierState { calls: Vec::new(), fail: false })) }
        }
    }

    impl FakeNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        /// Get all recorded notifications
        pub fn calls(&self) -> Vec<NotifyCall> {
            self.inner.lock().calls.clone()
        }

        /// Make every subsequent send fail.
        pub fn set_failing(&self, fail: bool) {
            self.inner.lock().fail = fail;
        }
    }

    #[async_trait]
    impl Notify for FakeNotifier {
        fn name(&self) -> &str {
            "fake"
        }

        async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError> {
            let mut state = self.inner.lock();
            if state.fail {
                return Err(NotifyError::SendFailed("fake notifier failing".to_string()));
            }
            state.calls.push(NotifyCall {
                title: title.to_string(),
                message: message.to_string(),
            });
            Ok(())
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeNotifier, NotifyCall};

#[cfg(test)]
#[path = "notify_tests.rs"]
mod tests;
