use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::cases::state::Case;
use crate::config::NotificationConfig;
use crate::rules::Severity;

/// Desktop notification sender with cooldown to prevent spam.
pub struct Notifier {
    enabled: bool,
    min_severity: Severity,
    cooldown: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl Notifier {
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            enabled: config.enabled,
            min_severity: config.min_severity,
            cooldown: Duration::from_secs(config.cooldown_seconds),
            last_sent: Mutex::new(None),
        }
    }

    /// Announce a newly opened case. Returns true if a notification was sent.
    pub fn notify_case_opened(&self, case: &Case) -> bool {
        if !self.should_send(case.severity()) {
            return false;
        }
        let title = format!("TxSentinel: {} case opened", case.severity());
        let body = format!("{} | {}", short_id(case.id()), case.summary());
        self.send_notification(title, body);
        true
    }

    /// Announce a case that has run past its SLA deadline.
    pub fn notify_sla_breach(&self, case: &Case) -> bool {
        if !self.should_send(case.severity()) {
            return false;
        }
        let title = format!("TxSentinel: SLA breached ({})", case.severity());
        let owner = case.assigned_to().unwrap_or("unassigned");
        let body = format!(
            "{} | {} | due {}",
            short_id(case.id()),
            owner,
            case.sla_due_at().format("%Y-%m-%d %H:%M UTC")
        );
        self.send_notification(title, body);
        true
    }

    fn should_send(&self, severity: Severity) -> bool {
        self.enabled && severity >= self.min_severity && self.check_cooldown()
    }

    /// Check and update cooldown. Returns true if enough time has passed.
    fn check_cooldown(&self) -> bool {
        let mut last = self.last_sent.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if let Some(prev) = *last {
            if now.duration_since(prev) < self.cooldown {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    /// Fire-and-forget: send the actual desktop notification.
    fn send_notification(&self, title: String, body: String) {
        // Background thread so the screening path never waits on the desktop.
        std::thread::spawn(move || {
            if let Err(e) = notify_rust::Notification::new()
                .summary(&title)
                .body(&body)
                .show()
            {
                tracing::debug!("Desktop notification failed: {e}");
            }
        });
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
