//! Health checker: drives a [`RetryState`] against a [`PingTarget`].
//!
//! Attempts for one backend are strictly sequential; different backends are
//! checked concurrently on a `JoinSet`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use gantry_types::errors::TransportFailure;
use gantry_types::traits::PingTarget;

use super::schedule::{RetryPhase, RetrySchedule, RetryState};
use super::summary::HealthReport;

/// Outcome of one ping attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingResult {
    /// 1-based attempt number.
    pub attempt: u32,
    pub timeout: Duration,
    /// Pause spent before this attempt was sent.
    pub delay: Duration,
    /// Time from sending the ping to its outcome.
    pub elapsed: Duration,
    pub success: bool,
    pub failure: Option<TransportFailure>,
}

/// Final verdict for one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Succeeded,
    /// Every attempt failed; `reason` is the last classified failure.
    Failed { reason: TransportFailure },
    /// The backend is not checkable (e.g. no HTTP endpoint).
    Skipped { reason: String },
}

/// Health of one backend, with every attempt made.
#[derive(Debug, Clone)]
pub struct BackendHealth {
    pub backend: String,
    pub outcome: HealthOutcome,
    pub attempts: Vec<PingResult>,
}

impl BackendHealth {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn is_checked(&self) -> bool {
        !matches!(self.outcome, HealthOutcome::Skipped { .. })
    }

    /// Sum of attempt durations and the pauses between them, as measured.
    pub fn total_elapsed(&self) -> Duration {
        self.attempts.iter().map(|a| a.delay + a.elapsed).sum()
    }
}

/// Runs the retry schedule against ping targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthChecker {
    schedule: RetrySchedule,
}

impl HealthChecker {
    pub fn new(schedule: RetrySchedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &RetrySchedule {
        &self.schedule
    }

    /// Check one target until it answers or the schedule is exhausted.
    pub async fn check_target(&self, target: &dyn PingTarget) -> BackendHealth {
        let backend = target.name().to_string();
        if let Some(reason) = target.skip_reason() {
            tracing::info!(backend = %backend, reason = %reason, "health check skipped");
            return BackendHealth {
                backend,
                outcome: HealthOutcome::Skipped { reason },
                attempts: Vec::new(),
            };
        }

        let mut state = RetryState::new(self.schedule);
        let mut attempts = Vec::new();

        while let Some(planned) = state.next_attempt() {
            let paused = Instant::now();
            if !planned.delay.is_zero() {
                tracing::debug!(
                    backend = %backend,
                    delay_secs = planned.delay.as_secs_f64(),
                    "waiting before retry"
                );
                tokio::time::sleep(planned.delay).await;
            }

            tracing::debug!(
                backend = %backend,
                attempt = planned.number,
                timeout_secs = planned.timeout.as_secs_f64(),
                "sending ping"
            );
            let started = Instant::now();
            let delay = started - paused;
            let result = ping_once(target, planned.timeout).await;
            let elapsed = started.elapsed();

            match result {
                Ok(()) => {
                    tracing::info!(backend = %backend, attempt = planned.number, "ping succeeded");
                    state.record_success();
                    attempts.push(PingResult {
                        attempt: planned.number,
                        timeout: planned.timeout,
                        delay,
                        elapsed,
                        success: true,
                        failure: None,
                    });
                }
                Err(failure) => {
                    tracing::warn!(
                        backend = %backend,
                        attempt = planned.number,
                        error = %failure,
                        "ping failed"
                    );
                    state.record_failure(failure.clone());
                    attempts.push(PingResult {
                        attempt: planned.number,
                        timeout: planned.timeout,
                        delay,
                        elapsed,
                        success: false,
                        failure: Some(failure),
                    });
                }
            }
        }

        let outcome = match state.phase() {
            RetryPhase::Succeeded => HealthOutcome::Succeeded,
            _ => HealthOutcome::Failed {
                reason: state
                    .last_failure()
                    .cloned()
                    .unwrap_or(TransportFailure::Closed),
            },
        };
        BackendHealth {
            backend,
            outcome,
            attempts,
        }
    }

    /// Check every target concurrently. Results keep the input order.
    pub async fn check_all(&self, targets: Vec<Arc<dyn PingTarget>>) -> HealthReport {
        let mut tasks = JoinSet::new();
        for (position, target) in targets.iter().enumerate() {
            let checker = *self;
            let target = target.clone();
            tasks.spawn(async move { (position, checker.check_target(target.as_ref()).await) });
        }

        let mut slots: Vec<Option<BackendHealth>> = vec![None; targets.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, health)) => slots[position] = Some(health),
                Err(e) => tracing::error!(error = %e, "health check task panicked"),
            }
        }

        let results = slots
            .into_iter()
            .zip(targets.iter())
            .map(|(slot, target)| {
                slot.unwrap_or_else(|| BackendHealth {
                    backend: target.name().to_string(),
                    outcome: HealthOutcome::Failed {
                        reason: TransportFailure::Io("health check task aborted".to_string()),
                    },
                    attempts: Vec::new(),
                })
            })
            .collect();
        HealthReport::new(results)
    }
}

/// One ping, bounded by `timeout` whether or not the target honors it.
///
/// A response carrying a JSON-RPC `error` is a protocol failure.
async fn ping_once(target: &dyn PingTarget, timeout: Duration) -> Result<(), TransportFailure> {
    let response = match tokio::time::timeout(timeout, target.ping(timeout)).await {
        Ok(result) => result?,
        Err(_) => return Err(TransportFailure::Timeout),
    };
    match response.error {
        None => Ok(()),
        Some(error) => Err(TransportFailure::Protocol(format!(
            "ping returned error {}: {}",
            error.code, error.message
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gantry_types::model::{JsonRpcError, JsonRpcMessage};
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers each attempt from a script; attempts past the end repeat the last entry.
    struct ScriptedTarget {
        name: String,
        script: Vec<Step>,
        calls: Mutex<Vec<Duration>>,
    }

    #[derive(Clone)]
    enum Step {
        Ok,
        AppError,
        Fail(TransportFailure),
        /// Never answers; the checker's own deadline must fire.
        Hang,
    }

    impl ScriptedTarget {
        fn new(name: &str, script: Vec<Step>) -> Self {
            Self {
                name: name.to_string(),
                script,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn timeouts_seen(&self) -> Vec<Duration> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PingTarget for ScriptedTarget {
        fn name(&self) -> &str {
            &self.name
        }

        async fn ping(&self, timeout: Duration) -> Result<JsonRpcMessage, TransportFailure> {
            let index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(timeout);
                calls.len() - 1
            };
            let step = self.script[index.min(self.script.len() - 1)].clone();
            match step {
                Step::Ok => Ok(JsonRpcMessage::response(Some(json!(1)), json!({}))),
                Step::AppError => Ok(JsonRpcMessage::error_response(
                    Some(json!(1)),
                    JsonRpcError::new(-32601, "Method not found"),
                )),
                Step::Fail(failure) => Err(failure),
                Step::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    struct SkippedTarget;

    #[async_trait]
    impl PingTarget for SkippedTarget {
        fn name(&self) -> &str {
            "search"
        }

        fn skip_reason(&self) -> Option<String> {
            Some("no HTTP endpoint".to_string())
        }

        async fn ping(&self, _timeout: Duration) -> Result<JsonRpcMessage, TransportFailure> {
            panic!("skipped targets are never pinged");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success() {
        let target = ScriptedTarget::new("github", vec![Step::Ok]);
        let health = HealthChecker::default().check_target(&target).await;

        assert_eq!(health.outcome, HealthOutcome::Succeeded);
        assert_eq!(health.attempt_count(), 1);
        assert_eq!(target.timeouts_seen(), vec![Duration::from_secs(10)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_use_escalating_timeouts_and_delays() {
        let target = ScriptedTarget::new(
            "flaky",
            vec![
                Step::Fail(TransportFailure::Http { status: 500 }),
                Step::Fail(TransportFailure::Http { status: 500 }),
                Step::Ok,
            ],
        );
        let started = Instant::now();
        let health = HealthChecker::default().check_target(&target).await;

        assert_eq!(health.outcome, HealthOutcome::Succeeded);
        assert_eq!(health.attempt_count(), 3);
        assert_eq!(
            target.timeouts_seen(),
            vec![
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(30)
            ]
        );
        // Only the 2s and 4s pauses pass on the virtual clock.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert_eq!(health.total_elapsed(), Duration::from_secs(6));
        let delays: Vec<u64> = health.attempts.iter().map(|a| a.delay.as_secs()).collect();
        assert_eq!(delays, vec![0, 2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_target_times_out_each_attempt() {
        let target = ScriptedTarget::new("down", vec![Step::Hang]);
        let started = Instant::now();
        let health = HealthChecker::default().check_target(&target).await;

        assert_eq!(
            health.outcome,
            HealthOutcome::Failed {
                reason: TransportFailure::Timeout
            }
        );
        assert_eq!(health.attempt_count(), 3);
        let elapsed: Vec<u64> = health.attempts.iter().map(|a| a.elapsed.as_secs()).collect();
        assert_eq!(elapsed, vec![10, 20, 30]);
        assert_eq!(started.elapsed(), Duration::from_secs(66));
        assert_eq!(health.total_elapsed(), Duration::from_secs(66));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_response_counts_as_failure() {
        let target = ScriptedTarget::new("strict", vec![Step::AppError]);
        let health = HealthChecker::default().check_target(&target).await;

        match &health.outcome {
            HealthOutcome::Failed {
                reason: TransportFailure::Protocol(message),
            } => assert!(message.contains("Method not found"), "{message}"),
            other => panic!("expected protocol failure, got {other:?}"),
        }
        assert!(health.attempts.iter().all(|a| !a.success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_failure_is_reported() {
        let target = ScriptedTarget::new(
            "mixed",
            vec![
                Step::Fail(TransportFailure::Timeout),
                Step::Fail(TransportFailure::Http { status: 502 }),
                Step::Fail(TransportFailure::ConnectionRefused),
            ],
        );
        let health = HealthChecker::default().check_target(&target).await;
        assert_eq!(
            health.outcome,
            HealthOutcome::Failed {
                reason: TransportFailure::ConnectionRefused
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_target_is_never_pinged() {
        let health = HealthChecker::default().check_target(&SkippedTarget).await;
        assert!(!health.is_checked());
        assert!(health.attempts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_all_runs_backends_concurrently_in_order() {
        let targets: Vec<Arc<dyn PingTarget>> = vec![
            Arc::new(ScriptedTarget::new("down", vec![Step::Hang])),
            Arc::new(ScriptedTarget::new("github", vec![Step::Ok])),
            Arc::new(SkippedTarget),
        ];
        let started = Instant::now();
        let report = HealthChecker::default().check_all(targets).await;

        let names: Vec<&str> = report.results().iter().map(|r| r.backend.as_str()).collect();
        assert_eq!(names, vec!["down", "github", "search"]);
        // Bounded by the slowest backend, not the sum.
        assert_eq!(started.elapsed(), Duration::from_secs(66));
    }
}
