mod confine;
mod isolate_runner;
pub mod policy;
mod runner;
mod simple_runner;

// Re-export the trait and common types
pub use confine::confinement_available;
pub use isolate_runner::IsolateRunner;
pub use runner::SandboxRunner;
pub use simple_runner::SimpleRunner;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::config::{MicroSecond, RunnerKind, SandboxConfig, Second};

/// Lifecycle of one sandbox execution
///
/// `Pending -> Running -> {Completed, TimedOut, Crashed}`. The three last
/// states are terminal; only terminal runs are ever committed to the store.
#[derive(Serialize, Deserialize, sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Completed,
    TimedOut,
    Crashed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Crashed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::TimedOut)
                | (Self::Running, Self::Crashed)
        )
    }

    /// Moves to `next`, failing on an illegal transition
    pub fn advance(self, next: RunState) -> Result<RunState> {
        if !self.can_transition_to(next) {
            bail!("illegal run state transition {self:?} -> {next:?}");
        }
        Ok(next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::TimedOut => "TimedOut",
            Self::Crashed => "Crashed",
        }
    }
}

/// How an execution ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed { exit_code: i32 },
    TimedOut { limit: MicroSecond },
    Crashed { reason: String },
}

impl ExecutionOutcome {
    pub fn state(&self) -> RunState {
        match self {
            Self::Completed { .. } => RunState::Completed,
            Self::TimedOut { .. } => RunState::TimedOut,
            Self::Crashed { .. } => RunState::Crashed,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Completed { exit_code } => Some(*exit_code),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { exit_code } => write!(f, "Completed (exit code {exit_code})"),
            Self::TimedOut { limit } => write!(
                f,
                "TimedOut (wall clock limit {} ms exceeded)",
                limit.0 / 1000
            ),
            Self::Crashed { reason } => write!(f, "Crashed ({reason})"),
        }
    }
}

/// Everything captured from one execution, even an abnormal one
#[derive(Debug, Clone)]
pub struct ExecutionArtifacts {
    pub outcome: ExecutionOutcome,
    pub stdout: String,
    pub stderr: String,
    pub wall_time: Duration,
    /// Peak memory, when the runner can measure it
    pub memory_kb: Option<u64>,
    /// Terminating signal, if the process was killed by one
    pub signal: Option<i32>,
}

/// Creates a sandbox runner according to the configured runner kind
///
/// With `auto`, an `IsolateRunner` is used when the `isolate` binary is on
/// `PATH`; otherwise falls back to a `SimpleRunner`, which offers resource
/// limits and a timeout but no namespace isolation.
pub fn create_sandbox_runner(id: u8, config: &SandboxConfig) -> Result<Box<dyn SandboxRunner>> {
    let use_isolate = match config.runner {
        RunnerKind::Isolate => true,
        RunnerKind::Simple => false,
        RunnerKind::Auto => isolate_available(),
    };

    if use_isolate {
        log::info!("Creating IsolateRunner {id} (full isolation mode)");
        let runner = IsolateRunner::build(id, config.clone())?;
        Ok(Box::new(runner))
    } else {
        log::info!("Creating SimpleRunner {id} (namespace confinement, no cgroups)");
        let runner = SimpleRunner::build(id, config.clone())?;
        Ok(Box::new(runner))
    }
}

fn isolate_available() -> bool {
    std::process::Command::new("which")
        .arg("isolate")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Applies `%INPUT%` style substitutions to every argument of a command template
pub(crate) fn apply_template(cmd_template: &[String], mapping: &HashMap<&str, &str>) -> Vec<String> {
    cmd_template
        .iter()
        .map(|s| {
            let mut t = s.clone();
            for (k, v) in mapping.iter() {
                t = t.replace(k, v);
            }
            t
        })
        .collect()
}

/// Decodes captured output, keeping at most `limit` bytes
pub(crate) fn truncate_output(bytes: &[u8], limit: usize) -> String {
    if bytes.len() <= limit {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut text = String::from_utf8_lossy(&bytes[..limit]).into_owned();
    text.push_str(&format!("\n[output truncated after {limit} bytes]\n"));
    text
}

/// Normalizes the snippet text written into the sandbox
pub(crate) fn snippet_file_content(snippet: &str) -> String {
    if snippet.ends_with('\n') {
        snippet.to_string()
    } else {
        format!("{snippet}\n")
    }
}

pub(crate) fn limit_in_seconds(limit: MicroSecond) -> f64 {
    Second::from(limit).0
}
