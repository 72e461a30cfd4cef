//! Health verification for rollouts.
//!
//! Polling runs as a background task that probes every host once per round
//! and reports over a channel. [`HealthChecker::verify`] consumes those
//! reports and suspends (without blocking the runtime) until it has seen
//! `healthy_threshold` consecutive healthy rounds, sees an unhealthy round,
//! or a timeout, deadline or cancellation fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pipeline::VerifyConfig;
use crate::adapters::{HealthProbe, HealthStatus};
use crate::error::PipelineError;

/// Outcome of probing every host once
#[derive(Debug, Clone)]
pub struct PollRound {
    pub round: u32,
    /// First unhealthy host and why, if any
    pub failure: Option<(String, String)>,
}

impl PollRound {
    pub fn is_healthy(&self) -> bool {
        self.failure.is_none()
    }
}

/// How a verification ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Enough consecutive healthy rounds
    Passed { rounds: u32 },

    /// A host was unhealthy
    Unhealthy {
        host: String,
        reason: String,
        healthy_streak: u32,
    },

    /// The verification timeout expired first
    TimedOut { healthy_streak: u32 },

    /// The overall deploy deadline expired first
    DeadlineExceeded,

    Cancelled,
}

impl Verification {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed { .. })
    }
}

pub struct HealthChecker {
    probe: Arc<dyn HealthProbe>,
    config: VerifyConfig,
}

impl HealthChecker {
    pub fn new(probe: Arc<dyn HealthProbe>, config: VerifyConfig) -> Self {
        Self { probe, config }
    }

    /// Start polling `hosts` in the background. Polling stops when the
    /// receiver is dropped.
    pub fn spawn_polling(&self, hosts: Vec<String>) -> (mpsc::Receiver<PollRound>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1);
        let probe = self.probe.clone();
        let interval = self.config.poll_interval();

        let handle = tokio::spawn(async move {
            let mut round = 0u32;
            loop {
                round += 1;
                let failure = probe_all(&probe, &hosts).await;
                if tx.send(PollRound { round, failure }).await.is_err() {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        });

        (rx, handle)
    }

    /// Verify `hosts`, requiring `healthy_threshold` consecutive healthy rounds.
    ///
    /// A health failure observed in the same interval as the deadline wins,
    /// so the reported reason is the failing host.
    pub async fn verify(
        &self,
        hosts: Vec<String>,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Verification {
        let threshold = self.config.healthy_threshold.max(1);
        let (mut rx, poller) = self.spawn_polling(hosts);

        let timeout = tokio::time::sleep(self.config.timeout());
        tokio::pin!(timeout);
        let deadline_sleep = tokio::time::sleep_until(
            deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(365 * 24 * 3600)),
        );
        tokio::pin!(deadline_sleep);

        let mut streak = 0u32;
        let outcome = loop {
            tokio::select! {
                biased;

                report = rx.recv() => match report {
                    Some(report) if report.is_healthy() => {
                        streak += 1;
                        debug!(round = report.round, streak, threshold, "Healthy poll");
                        if streak >= threshold {
                            break Verification::Passed { rounds: report.round };
                        }
                    }
                    Some(report) => {
                        let (host, reason) = report.failure.unwrap_or_default();
                        warn!(round = report.round, %host, %reason, "Unhealthy poll");
                        break Verification::Unhealthy { host, reason, healthy_streak: streak };
                    }
                    None => {
                        break Verification::Unhealthy {
                            host: String::new(),
                            reason: "health poller stopped".to_string(),
                            healthy_streak: streak,
                        };
                    }
                },
                _ = cancel.cancelled() => break Verification::Cancelled,
                _ = &mut timeout => break Verification::TimedOut { healthy_streak: streak },
                _ = &mut deadline_sleep => break Verification::DeadlineExceeded,
            }
        };

        drop(rx);
        poller.abort();
        outcome
    }

    /// Translate a failed verification into the error that triggers rollback
    pub fn failure_error(&self, outcome: &Verification, target: &str, deadline_seconds: u64) -> Option<PipelineError> {
        match outcome {
            Verification::Passed { .. } => None,
            Verification::Unhealthy { host, reason, .. } => Some(PipelineError::HealthCheckFailed {
                host: host.clone(),
                reason: reason.clone(),
            }),
            Verification::TimedOut { healthy_streak } => Some(PipelineError::HealthCheckTimeout {
                timeout_ms: self.config.timeout_ms,
                healthy_streak: *healthy_streak,
            }),
            Verification::DeadlineExceeded => Some(PipelineError::DeployTimeout {
                target: target.to_string(),
                timeout_seconds: deadline_seconds,
            }),
            Verification::Cancelled => Some(PipelineError::Cancelled),
        }
    }
}

/// Probe all hosts concurrently; returns the first failure by host order
async fn probe_all(probe: &Arc<dyn HealthProbe>, hosts: &[String]) -> Option<(String, String)> {
    let mut set = JoinSet::new();
    for (idx, host) in hosts.iter().enumerate() {
        let probe = probe.clone();
        let host = host.clone();
        set.spawn(async move {
            let status = match probe.probe(&host).await {
                Ok(status) => status,
                Err(e) => HealthStatus::Unhealthy {
                    reason: e.to_string(),
                },
            };
            (idx, host, status)
        });
    }

    let mut failures = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, host, HealthStatus::Unhealthy { reason })) => failures.push((idx, host, reason)),
            Ok(_) => {}
            Err(e) => failures.push((usize::MAX, String::new(), format!("probe task failed: {}", e))),
        }
    }

    failures.sort_by_key(|(idx, _, _)| *idx);
    failures.into_iter().next().map(|(_, host, reason)| (host, reason))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;

    /// Answers from a script, then healthy forever
    struct ScriptedProbe {
        script: Mutex<VecDeque<bool>>,
    }

    impl ScriptedProbe {
        fn new(script: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn probe(&self, _host: &str) -> Result<HealthStatus> {
            let healthy = self.script.lock().unwrap().pop_front().unwrap_or(true);
            Ok(if healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy {
                    reason: "503".to_string(),
                }
            })
        }
    }

    fn config(threshold: u32) -> VerifyConfig {
        VerifyConfig {
            healthy_threshold: threshold,
            poll_interval_ms: 5,
            timeout_ms: 2_000,
        }
    }

    #[tokio::test]
    async fn test_passes_after_threshold() {
        let checker = HealthChecker::new(ScriptedProbe::new(&[]), config(3));
        let outcome = checker
            .verify(vec!["a".to_string()], None, &CancellationToken::new())
            .await;

        assert_eq!(outcome, Verification::Passed { rounds: 3 });
    }

    #[tokio::test]
    async fn test_failure_after_n_minus_one_successes_does_not_pass() {
        let checker = HealthChecker::new(ScriptedProbe::new(&[true, true, false]), config(3));
        let outcome = checker
            .verify(vec!["a".to_string()], None, &CancellationToken::new())
            .await;

        assert!(!outcome.passed());
        assert!(matches!(outcome, Verification::Unhealthy { healthy_streak: 2, .. }));
    }

    #[tokio::test]
    async fn test_times_out() {
        struct Stuck;

        #[async_trait]
        impl HealthProbe for Stuck {
            fn name(&self) -> &str {
                "stuck"
            }

            async fn probe(&self, _host: &str) -> Result<HealthStatus> {
                std::future::pending().await
            }
        }

        let checker = HealthChecker::new(
            Arc::new(Stuck),
            VerifyConfig {
                healthy_threshold: 1,
                poll_interval_ms: 5,
                timeout_ms: 50,
            },
        );
        let outcome = checker
            .verify(vec!["a".to_string()], None, &CancellationToken::new())
            .await;

        assert_eq!(outcome, Verification::TimedOut { healthy_streak: 0 });
        assert!(matches!(
            checker.failure_error(&outcome, "prod", 60),
            Some(PipelineError::HealthCheckTimeout { timeout_ms: 50, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled() {
        let checker = HealthChecker::new(ScriptedProbe::new(&[]), config(1_000));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = checker.verify(vec!["a".to_string()], None, &cancel).await;
        // A healthy report may already be queued, but the threshold is far away
        assert_eq!(outcome, Verification::Cancelled);
    }
}
