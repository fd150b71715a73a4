//! Aggregate health report: counts, verdict, exit code and the printed summary.

use std::fmt::Write as _;

use gantry_types::errors::TransportFailure;

use super::checker::{BackendHealth, HealthOutcome};

/// Per-outcome totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthCounts {
    pub checked: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Overall result of a health check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing to check: no backends, or only skipped ones. Informational.
    NoneApplicable,
    AllHealthy,
    /// Some checked backends failed and some succeeded.
    PartialFailure,
    /// Backends were checked and none succeeded.
    AllFailed,
}

impl Verdict {
    pub fn exit_code(self) -> i32 {
        match self {
            Verdict::NoneApplicable | Verdict::AllHealthy => 0,
            Verdict::PartialFailure | Verdict::AllFailed => 1,
        }
    }
}

/// The results of checking a set of backends.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    results: Vec<BackendHealth>,
}

impl HealthReport {
    pub fn new(results: Vec<BackendHealth>) -> Self {
        Self { results }
    }

    pub fn results(&self) -> &[BackendHealth] {
        &self.results
    }

    pub fn get(&self, backend: &str) -> Option<&BackendHealth> {
        self.results.iter().find(|r| r.backend == backend)
    }

    pub fn counts(&self) -> HealthCounts {
        let mut counts = HealthCounts::default();
        for result in &self.results {
            match result.outcome {
                HealthOutcome::Succeeded => {
                    counts.checked += 1;
                    counts.succeeded += 1;
                }
                HealthOutcome::Failed { .. } => {
                    counts.checked += 1;
                    counts.failed += 1;
                }
                HealthOutcome::Skipped { .. } => counts.skipped += 1,
            }
        }
        counts
    }

    pub fn verdict(&self) -> Verdict {
        let counts = self.counts();
        if counts.checked == 0 {
            Verdict::NoneApplicable
        } else if counts.failed == 0 {
            Verdict::AllHealthy
        } else if counts.succeeded == 0 {
            Verdict::AllFailed
        } else {
            Verdict::PartialFailure
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.verdict().exit_code()
    }

    pub fn is_healthy(&self) -> bool {
        self.exit_code() == 0
    }

    /// Human-readable per-backend lines followed by the summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for result in &self.results {
            match &result.outcome {
                HealthOutcome::Succeeded => {
                    let _ = writeln!(
                        out,
                        "✓ {}: healthy on attempt {}",
                        result.backend,
                        result.attempt_count()
                    );
                }
                HealthOutcome::Failed { reason } => {
                    let _ = writeln!(
                        out,
                        "✗ {}: failed after {} attempt(s): {reason}",
                        result.backend,
                        result.attempt_count()
                    );
                    for cause in suggested_causes(reason) {
                        let _ = writeln!(out, "    - {cause}");
                    }
                }
                HealthOutcome::Skipped { reason } => {
                    let _ = writeln!(out, "- {}: skipped ({reason})", result.backend);
                }
            }
        }

        let counts = self.counts();
        let _ = writeln!(out);
        match self.verdict() {
            Verdict::NoneApplicable if self.results.is_empty() => {
                let _ = writeln!(out, "No backends configured; nothing to check.");
            }
            Verdict::NoneApplicable => {
                let _ = writeln!(
                    out,
                    "No HTTP-reachable backends to check ({} skipped).",
                    counts.skipped
                );
            }
            Verdict::AllHealthy => {
                let _ = writeln!(
                    out,
                    "All {} checked backend(s) healthy ({} skipped).",
                    counts.checked, counts.skipped
                );
            }
            Verdict::PartialFailure => {
                let _ = writeln!(
                    out,
                    "Partial failure: {} succeeded, {} failed, {} skipped.",
                    counts.succeeded, counts.failed, counts.skipped
                );
            }
            Verdict::AllFailed => {
                let _ = writeln!(
                    out,
                    "All {} checked backend(s) failed ({} skipped).",
                    counts.checked, counts.skipped
                );
            }
        }
        let _ = writeln!(
            out,
            "checked={} succeeded={} failed={} skipped={}",
            counts.checked, counts.succeeded, counts.failed, counts.skipped
        );
        out
    }
}

/// Likely causes to print next to a failed backend.
pub fn suggested_causes(failure: &TransportFailure) -> &'static [&'static str] {
    match failure {
        TransportFailure::ConnectionRefused => &[
            "the gateway or backend is not listening on the configured port",
            "the backend process exited during startup",
        ],
        TransportFailure::Timeout => &[
            "the backend is still starting (some take close to a minute)",
            "a firewall is silently dropping the connection",
        ],
        TransportFailure::DnsFailure => &["the hostname in the backend url does not resolve"],
        TransportFailure::BackendCrashed => &["the backend process exited; check its stderr in the gateway log"],
        TransportFailure::Protocol(_) => &[
            "the endpoint is not an MCP server",
            "the server does not implement the ping method",
        ],
        TransportFailure::Http { status: 401 | 403 } => &[
            "the API key or backend credentials were rejected",
        ],
        TransportFailure::Http { status: 404 } => &["the url path is wrong or the backend name is unknown to the gateway"],
        TransportFailure::Http { .. } => &["the backend returned a server error; check its logs"],
        TransportFailure::Closed => &["the backend is not started"],
        TransportFailure::Io(_) => &["a local I/O error interrupted the request"],
    }
}
