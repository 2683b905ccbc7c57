//! Best-effort notifications (courier alerts)
//!
//! Failures are reported as [`NotifyOutcome::Failed`] and never abort the
//! operation that triggered them.

use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Delivered,
    Failed(String),
}

/// 通知发送器
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &str, text: &str) -> NotifyOutcome;
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipient: &str, text: &str) -> NotifyOutcome {
        tracing::info!(recipient = %recipient, text = %text, "Notification");
        NotifyOutcome::Delivered
    }
}

/// Keeps every message in memory; can be switched to failing
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
    failing: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, recipient: &str, text: &str) -> NotifyOutcome {
        if *self.failing.lock() {
            return NotifyOutcome::Failed("recipient unreachable".to_string());
        }
        self.sent
            .lock()
            .push((recipient.to_string(), text.to_string()));
        NotifyOutcome::Delivered
    }
}
