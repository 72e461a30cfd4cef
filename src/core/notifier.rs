//! Terminal-state notifications.
//!
//! `publish` never blocks the caller: each subscriber gets its own
//! background task that retries with bounded backoff until it succeeds or
//! runs out of attempts. A failing subscriber is logged and otherwise
//! ignored; it cannot affect the run that produced the event.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, warn};

use super::pipeline::RetryPolicy;
use crate::adapters::{CommandRunner, CommandSink, NotificationSink, TracingSink, WebhookSink};
use crate::domain::NotificationEvent;
use crate::error::PipelineError;

/// Delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Attempts per subscriber, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: RetryPolicy,
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: RetryPolicy::default(),
        }
    }
}

/// Subscribers plus delivery settings, as written in config or a pipeline file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// URLs that receive the event as a JSON POST
    #[serde(default)]
    pub webhooks: Vec<String>,

    /// Shell commands that receive the event as JSON on stdin
    #[serde(default)]
    pub commands: Vec<String>,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,

    /// Also log every event through tracing
    #[serde(default = "default_log")]
    pub log: bool,

    #[serde(flatten)]
    pub delivery: NotifierConfig,
}

fn default_command_timeout() -> u64 {
    30
}

fn default_log() -> bool {
    true
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            webhooks: Vec::new(),
            commands: Vec::new(),
            command_timeout_seconds: default_command_timeout(),
            log: default_log(),
            delivery: NotifierConfig::default(),
        }
    }
}

impl NotificationSettings {
    /// Build a notifier with one sink per configured subscriber
    pub fn build(&self, runner: Arc<dyn CommandRunner>) -> Notifier {
        let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
        if self.log {
            sinks.push(Arc::new(TracingSink));
        }
        for url in &self.webhooks {
            sinks.push(Arc::new(WebhookSink::new(url)));
        }
        for command in &self.commands {
            sinks.push(Arc::new(CommandSink::new(
                runner.clone(),
                command,
                Duration::from_secs(self.command_timeout_seconds),
            )));
        }
        Notifier::new(sinks, self.delivery.clone())
    }
}

/// Result of delivering one event to one subscriber
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub sink: String,
    pub attempts: u32,
    pub error: Option<PipelineError>,
}

impl DeliveryReport {
    pub fn delivered(&self) -> bool {
        self.error.is_none()
    }
}

/// Finished reports kept for the next `flush`; older ones are dropped
pub const MAX_FINISHED_REPORTS: usize = 256;

#[derive(Default)]
struct Deliveries {
    running: JoinSet<DeliveryReport>,
    finished: VecDeque<DeliveryReport>,
}

impl Deliveries {
    fn keep(&mut self, result: Result<DeliveryReport, JoinError>) {
        match result {
            Ok(report) => {
                if self.finished.len() == MAX_FINISHED_REPORTS {
                    self.finished.pop_front();
                }
                self.finished.push_back(report);
            }
            Err(e) => error!(error = %e, "Notification task panicked"),
        }
    }

    /// Move completed tasks out of the join set
    fn reap(&mut self) {
        while let Some(result) = self.running.try_join_next() {
            self.keep(result);
        }
    }
}

/// Dropping the notifier aborts deliveries that are still running;
/// call `flush` first to let them finish.
pub struct Notifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
    config: NotifierConfig,
    deliveries: Mutex<Deliveries>,
}

impl Notifier {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>, config: NotifierConfig) -> Self {
        Self {
            sinks,
            config,
            deliveries: Mutex::new(Deliveries::default()),
        }
    }

    fn deliveries(&self) -> std::sync::MutexGuard<'_, Deliveries> {
        self.deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliveries still running
    pub fn in_flight(&self) -> usize {
        let mut deliveries = self.deliveries();
        deliveries.reap();
        deliveries.running.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.len()
    }

    /// Hand an event to every subscriber. Returns immediately.
    pub fn publish(&self, event: NotificationEvent) {
        let event = Arc::new(event);
        let mut deliveries = self.deliveries();
        deliveries.reap();

        for sink in &self.sinks {
            let sink = sink.clone();
            let event = event.clone();
            let config = self.config.clone();
            deliveries
                .running
                .spawn(async move { deliver(sink, event, config).await });
        }
    }

    /// Wait for every outstanding delivery and take the reports collected
    /// since the last flush
    pub async fn flush(&self) -> Vec<DeliveryReport> {
        let mut taken = std::mem::take(&mut *self.deliveries());

        while let Some(result) = taken.running.join_next().await {
            taken.keep(result);
        }
        taken.finished.into()
    }
}

async fn deliver(
    sink: Arc<dyn NotificationSink>,
    event: Arc<NotificationEvent>,
    config: NotifierConfig,
) -> DeliveryReport {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match sink.deliver(&event).await {
            Ok(()) => {
                debug!(sink = sink.name(), run_id = %event.run_id, attempt, "Notification delivered");
                return DeliveryReport {
                    sink: sink.name().to_string(),
                    attempts: attempt,
                    error: None,
                };
            }
            Err(e) if attempt < max_attempts => {
                let delay = config.backoff.delay_for_attempt(attempt);
                warn!(
                    sink = sink.name(),
                    run_id = %event.run_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Notification delivery failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                let failure = PipelineError::NotificationDeliveryFailure {
                    sink: sink.name().to_string(),
                    attempts: attempt,
                    reason: e.to_string(),
                };
                error!(run_id = %event.run_id, error = %failure, "Giving up on notification");
                return DeliveryReport {
                    sink: sink.name().to_string(),
                    attempts: attempt,
                    error: Some(failure),
                };
            }
        }
    }
}
