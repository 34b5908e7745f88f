//! Operator alerts. Delivery (mail, chat, paging) lives outside this crate;
//! sinks hand alerts over to it.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub instance_id: String,
    pub title: String,
    pub detail: String,
}

pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

/// Writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Critical => error!(
                instance_id = %alert.instance_id,
                detail = %alert.detail,
                "ALERT: {}",
                alert.title
            ),
            AlertSeverity::Warning => warn!(
                instance_id = %alert.instance_id,
                detail = %alert.detail,
                "ALERT: {}",
                alert.title
            ),
        }
    }
}

/// Keeps alerts in memory; used by tests and the local development mode.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn count_for(&self, instance_id: &str) -> usize {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.instance_id == instance_id)
            .count()
    }
}

impl AlertSink for MemoryAlertSink {
    fn raise(&self, alert: Alert) {
        LogAlertSink.raise(alert.clone());
        self.alerts.lock().push(alert);
    }
}
