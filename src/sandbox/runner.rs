use anyhow::Result;

use crate::config::{OneLanguageConfig, SandboxConfig};

use super::ExecutionArtifacts;

/// Trait for different sandbox execution implementations
///
/// This trait abstracts running one untrusted snippet under resource limits,
/// from full isolation with `isolate` down to a namespaced child process with
/// rlimits and a timeout.
pub trait SandboxRunner: Send + Sync {
    /// Creates a new sandbox runner instance with the given ID
    fn build(id: u8, config: SandboxConfig) -> Result<Self>
    where
        Self: Sized;

    /// Executes a snippet once and captures what happened
    ///
    /// Abnormal terminations (timeout, signal, OOM) are reported through
    /// `ExecutionOutcome`, never as `Err`. An `Err` means the sandbox itself
    /// could not be set up or spawned.
    fn execute(&self, snippet: &str, language: &OneLanguageConfig) -> Result<ExecutionArtifacts>;

    /// Whether process count and memory are capped per box by cgroups
    ///
    /// Snippets flagged by the static scan only run on runners that do.
    fn enforces_cgroup_limits(&self) -> bool;
}
