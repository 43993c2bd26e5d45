//! Verdict classification for finished sandbox executions
//!
//! The classifier is a pure function of the captured artifacts and the
//! policy signals gathered before and after execution. Identical inputs
//! always produce the same verdict.

use std::fmt::{self, Write as _};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::sandbox::ExecutionArtifacts;
use crate::sandbox::ExecutionOutcome;
use crate::sandbox::policy::PolicySignal;

#[derive(Serialize, Deserialize, sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    Safe,
    Unsafe,
    #[default]
    Unknown,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "Safe",
            Self::Unsafe => "Unsafe",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Safe" => Ok(Self::Safe),
            "Unsafe" => Ok(Self::Unsafe),
            "Unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown verdict {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    pub reason: String,
}

/// Assigns a verdict to a finished execution
///
/// * `signals` - every policy signal seen for this submission, static and runtime.
/// * `inconclusive` - verdict used for timed out or crashed executions; only
///   `Unknown` and `Unsafe` are meaningful here.
pub fn classify(
    artifacts: &ExecutionArtifacts,
    signals: &[PolicySignal],
    inconclusive: Verdict,
) -> Classification {
    // Violations win over everything, including a clean exit.
    if let Some(first) = signals.first() {
        let reason = if signals.len() == 1 {
            format!("policy violation: {}", first.kind)
        } else {
            format!(
                "policy violation: {} (+{} more)",
                first.kind,
                signals.len() - 1
            )
        };
        return Classification {
            verdict: Verdict::Unsafe,
            reason,
        };
    }

    match &artifacts.outcome {
        ExecutionOutcome::Completed { exit_code: 0 } => Classification {
            verdict: Verdict::Safe,
            reason: "clean exit without policy violations".to_string(),
        },
        ExecutionOutcome::Completed { exit_code } => Classification {
            verdict: Verdict::Unknown,
            reason: format!("non-zero exit code {exit_code} without policy violations"),
        },
        ExecutionOutcome::TimedOut { .. } => Classification {
            verdict: harden(inconclusive),
            reason: "execution timed out".to_string(),
        },
        ExecutionOutcome::Crashed { reason } => Classification {
            verdict: harden(inconclusive),
            reason: format!("execution crashed: {reason}"),
        },
    }
}

/// An inconclusive execution is never Safe.
fn harden(inconclusive: Verdict) -> Verdict {
    match inconclusive {
        Verdict::Unsafe => Verdict::Unsafe,
        Verdict::Safe | Verdict::Unknown => Verdict::Unknown,
    }
}

/// Renders the human-readable runtime log stored with a run
pub fn render_runtime_log(
    artifacts: &ExecutionArtifacts,
    signals: &[PolicySignal],
    classification: &Classification,
) -> String {
    let mut log = String::new();

    let _ = writeln!(log, "outcome: {}", artifacts.outcome);
    let _ = writeln!(
        log,
        "verdict: {} ({})",
        classification.verdict, classification.reason
    );
    let _ = writeln!(log, "wall time: {} ms", artifacts.wall_time.as_millis());
    if let Some(memory) = artifacts.memory_kb {
        let _ = writeln!(log, "memory: {memory} KiB");
    }
    if signals.is_empty() {
        let _ = writeln!(log, "policy: none");
    } else {
        for signal in signals {
            let _ = writeln!(log, "policy: {signal}");
        }
    }
    let _ = writeln!(log, "--- stdout ---");
    push_stream(&mut log, &artifacts.stdout);
    let _ = writeln!(log, "--- stderr ---");
    push_stream(&mut log, &artifacts.stderr);

    log
}

fn push_stream(log: &mut String, content: &str) {
    log.push_str(content);
    if !content.is_empty() && !content.ends_with('\n') {
        log.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::MicroSecond;
    use crate::sandbox::policy::{SignalSource, ViolationKind};

    fn artifacts(outcome: ExecutionOutcome) -> ExecutionArtifacts {
        ExecutionArtifacts {
            outcome,
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            wall_time: Duration::from_millis(12),
            memory_kb: None,
            signal: None,
        }
    }

    fn network_signal() -> PolicySignal {
        PolicySignal {
            kind: ViolationKind::NetworkEgress,
            source: SignalSource::Static,
            evidence: "curl".to_string(),
        }
    }

    #[test]
    fn clean_exit_is_safe() {
        let result = classify(
            &artifacts(ExecutionOutcome::Completed { exit_code: 0 }),
            &[],
            Verdict::Unknown,
        );
        assert_eq!(result.verdict, Verdict::Safe);
    }

    #[test]
    fn violation_overrides_clean_exit() {
        let result = classify(
            &artifacts(ExecutionOutcome::Completed { exit_code: 0 }),
            &[network_signal()],
            Verdict::Unknown,
        );
        assert_eq!(result.verdict, Verdict::Unsafe);
        assert!(result.reason.contains("NetworkEgress"));
    }

    #[test]
    fn violation_overrides_non_zero_exit() {
        let result = classify(
            &artifacts(ExecutionOutcome::Completed { exit_code: 7 }),
            &[network_signal(), network_signal()],
            Verdict::Unknown,
        );
        assert_eq!(result.verdict, Verdict::Unsafe);
        assert!(result.reason.contains("+1 more"));
    }

    #[test]
    fn non_zero_exit_is_unknown_even_when_hardened() {
        let result = classify(
            &artifacts(ExecutionOutcome::Completed { exit_code: 1 }),
            &[],
            Verdict::Unsafe,
        );
        assert_eq!(result.verdict, Verdict::Unknown);
    }

    #[test]
    fn timeout_follows_inconclusive_policy() {
        let timed_out = artifacts(ExecutionOutcome::TimedOut {
            limit: MicroSecond(1_000_000),
        });
        assert_eq!(
            classify(&timed_out, &[], Verdict::Unknown).verdict,
            Verdict::Unknown
        );
        assert_eq!(
            classify(&timed_out, &[], Verdict::Unsafe).verdict,
            Verdict::Unsafe
        );
        // Misconfiguration must not turn a timeout into Safe.
        assert_eq!(
            classify(&timed_out, &[], Verdict::Safe).verdict,
            Verdict::Unknown
        );
    }

    #[test]
    fn crash_is_never_safe() {
        let crashed = artifacts(ExecutionOutcome::Crashed {
            reason: "killed by signal 11".to_string(),
        });
        let result = classify(&crashed, &[], Verdict::Safe);
        assert_eq!(result.verdict, Verdict::Unknown);
        assert!(result.reason.contains("signal 11"));
    }

    #[test]
    fn classification_is_deterministic() {
        let a = artifacts(ExecutionOutcome::Completed { exit_code: 3 });
        let signals = [network_signal()];
        assert_eq!(
            classify(&a, &signals, Verdict::Unknown),
            classify(&a, &signals, Verdict::Unknown)
        );
    }

    #[test]
    fn log_contains_timeout_indicator() {
        let timed_out = artifacts(ExecutionOutcome::TimedOut {
            limit: MicroSecond(500_000),
        });
        let classification = classify(&timed_out, &[], Verdict::Unknown);
        let log = render_runtime_log(&timed_out, &[], &classification);
        assert!(log.starts_with("outcome: TimedOut"));
        assert!(log.contains("500 ms"));
        assert!(log.contains("policy: none"));
        assert!(log.contains("--- stdout ---\nok\n--- stderr ---\n"));
    }

    #[test]
    fn log_lists_every_signal() {
        let a = artifacts(ExecutionOutcome::Completed { exit_code: 0 });
        let signals = [network_signal()];
        let classification = classify(&a, &signals, Verdict::Unknown);
        let log = render_runtime_log(&a, &signals, &classification);
        assert!(log.contains("policy: NetworkEgress [static]: curl"));
        assert!(log.contains("verdict: Unsafe"));
    }

    #[test]
    fn verdict_string_round_trip() {
        for v in [Verdict::Safe, Verdict::Unsafe, Verdict::Unknown] {
            assert_eq!(v.as_str().parse::<Verdict>().unwrap(), v);
        }
        assert!("safe".parse::<Verdict>().is_err());
    }
}
