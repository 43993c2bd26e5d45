use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout_at;

use crate::config::{OneLanguageConfig, SandboxConfig};

use super::confine::{Confinement, SetupReport, confinement_available};
use super::{
    ExecutionArtifacts, ExecutionOutcome, SandboxRunner, apply_template, limit_in_seconds,
    snippet_file_content, truncate_output,
};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const FILE_SIZE_LIMIT: u64 = 16 * 1024 * 1024; // bytes

/// A runner that executes snippets as plain child processes
///
/// SimpleRunner gives every execution a fresh scratch directory, an empty
/// environment, rlimits (address space, CPU, file size) and one wall-clock
/// deadline covering both the process and its output. Where the host allows
/// unprivileged user namespaces, each snippet is confined (see `confine`): no
/// network, a read-only view of the system directories, and its scratch
/// directory at `/box`. It has no cgroup limits, so statically flagged
/// snippets are never handed to it.
///
/// Without confinement `build` fails unless `allow_unconfined` is set.
pub struct SimpleRunner {
    /// Unique identifier for this instance
    id: u8,
    /// Parent of the per-execution scratch directories
    work_dir: PathBuf,
    /// Whether snippets run inside namespaces
    confined: bool,
    config: SandboxConfig,
}

/// Limits applied in the child between fork and exec
#[derive(Debug, Clone, Copy)]
struct ChildLimits {
    address_space: u64,
    cpu_seconds: u64,
    file_size: u64,
}

impl SandboxRunner for SimpleRunner {
    fn build(id: u8, config: SandboxConfig) -> Result<Self> {
        let confined = confinement_available();
        if !confined && !config.allow_unconfined {
            bail!(
                "SimpleRunner {id}: namespace confinement is unavailable on this host; \
                 install isolate or set sandbox.allow_unconfined"
            );
        }

        let work_dir = Self::create_work_directory(id)?;
        if confined {
            fs::create_dir_all(work_dir.join("root"))?;
        } else {
            log::warn!(
                "SimpleRunner {id} runs snippets UNCONFINED on the host network and filesystem - use only in trusted environments"
            );
        }

        log::info!("SimpleRunner {id} initialized successfully (confined: {confined})");

        Ok(Self {
            id,
            work_dir,
            confined,
            config,
        })
    }

    fn execute(&self, snippet: &str, language: &OneLanguageConfig) -> Result<ExecutionArtifacts> {
        if language.command.is_empty() {
            bail!("Empty command for language {}", language.name);
        }

        let scratch = self.create_scratch_dir()?;
        fs::write(
            scratch.join(&language.file_name),
            snippet_file_content(snippet),
        )?;

        let mut mapping = HashMap::<&str, &str>::new();
        mapping.insert("%INPUT%", &language.file_name);
        let command = apply_template(&language.command, &mapping);

        let result = tokio::runtime::Handle::current()
            .block_on(async { self.execute_async(&command, &scratch).await });

        if let Err(e) = fs::remove_dir_all(&scratch) {
            log::warn!(
                "SimpleRunner {} failed to remove scratch {}: {e}",
                self.id,
                scratch.display()
            );
        }

        result
    }

    fn enforces_cgroup_limits(&self) -> bool {
        false
    }
}

impl SimpleRunner {
    /// Creates a working directory for this runner instance
    fn create_work_directory(id: u8) -> Result<PathBuf> {
        let work_dir = std::env::temp_dir()
            .join("guardian-simple")
            .join(format!("{}-{id}", std::process::id()));
        fs::create_dir_all(&work_dir)?;
        Ok(work_dir)
    }

    /// Creates an empty scratch directory for one execution
    fn create_scratch_dir(&self) -> Result<PathBuf> {
        let scratch = self.work_dir.join(crate::create_id());
        fs::create_dir_all(&scratch)?;
        Ok(scratch)
    }

    fn child_limits(&self) -> ChildLimits {
        ChildLimits {
            address_space: self.config.memory_limit.0 * 1024,
            // CPU limit is a backstop; the wall clock normally fires first.
            cpu_seconds: limit_in_seconds(self.config.time_limit).ceil() as u64 + 1,
            file_size: FILE_SIZE_LIMIT,
        }
    }

    /// Spawns the snippet, enforces the wall-clock limit and collects output
    async fn execute_async(&self, command: &[String], scratch: &Path) -> Result<ExecutionArtifacts> {
        let mut cmd = tokio::process::Command::new(&command[0]);
        cmd.args(&command[1..])
            .current_dir(scratch)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let limits = self.child_limits();
        let mut report = None;
        if self.confined {
            cmd.env("HOME", "/box").env("TMPDIR", "/tmp");
            let confinement = Confinement::prepare(&self.work_dir.join("root"), scratch, &command[0])?;
            let setup = SetupReport::new()?;
            let report_fd = setup.write_fd();
            report = Some(setup);
            // SAFETY: the closure only performs async-signal-safe calls on
            // data prepared before the fork.
            unsafe {
                cmd.pre_exec(move || {
                    apply_child_limits(&limits)?;
                    confinement.enter(report_fd)
                });
            }
        } else {
            cmd.env("HOME", scratch).env("TMPDIR", scratch);
            // SAFETY: `apply_child_limits` only calls async-signal-safe libc functions.
            unsafe {
                cmd.pre_exec(move || apply_child_limits(&limits));
            }
        }

        let start_time = Instant::now();
        let deadline = tokio::time::Instant::now() + Duration::from(self.config.time_limit);
        let spawned = cmd.spawn();
        if let Some(report) = report.as_mut() {
            report.close_write();
        }
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                if let Some(report) = report {
                    report.check()?;
                }
                bail!("Failed to spawn {}: {e}", command[0]);
            }
        };
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("Spawned child has no pid"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout unavailable"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr unavailable"))?;

        let limit = self.config.output_limit;
        let mut stdout_bytes = Vec::new();
        let mut stderr_bytes = Vec::new();

        // One deadline covers the exit and the end of both streams: a
        // descendant holding a pipe open keeps the run going until it fires.
        let collected = timeout_at(deadline, async {
            let wait = async {
                let status = child.wait().await;
                kill_process_group(pid);
                status
            };
            tokio::join!(
                wait,
                read_limited(&mut stdout, &mut stdout_bytes, limit),
                read_limited(&mut stderr, &mut stderr_bytes, limit)
            )
        })
        .await;
        let elapsed_time = start_time.elapsed();

        let (outcome, signal) = match collected {
            Err(_) => {
                kill_process_group(pid);
                let _ = child.kill().await;
                (
                    ExecutionOutcome::TimedOut {
                        limit: self.config.time_limit,
                    },
                    None,
                )
            }
            Ok((status, stdout_read, stderr_read)) => {
                stdout_read?;
                stderr_read?;
                match status {
                    Ok(status) => (self.outcome_from_status(status), status.signal()),
                    Err(e) => (
                        ExecutionOutcome::Crashed {
                            reason: format!("failed to wait for process: {e}"),
                        },
                        None,
                    ),
                }
            }
        };

        if let Some(report) = report {
            report.check()?;
        }

        log::debug!(
            "SimpleRunner {} finished in {} ms: {outcome}",
            self.id,
            elapsed_time.as_millis()
        );

        Ok(ExecutionArtifacts {
            outcome,
            stdout: truncate_output(&stdout_bytes, limit),
            stderr: truncate_output(&stderr_bytes, limit),
            wall_time: elapsed_time,
            memory_kb: None,
            signal,
        })
    }

    fn outcome_from_status(&self, status: ExitStatus) -> ExecutionOutcome {
        if let Some(code) = status.code() {
            return ExecutionOutcome::Completed { exit_code: code };
        }
        match status.signal() {
            Some(libc::SIGXCPU) => ExecutionOutcome::TimedOut {
                limit: self.config.time_limit,
            },
            Some(sig) => ExecutionOutcome::Crashed {
                reason: format!("killed by signal {sig}"),
            },
            None => ExecutionOutcome::Crashed {
                reason: "terminated without exit code".to_string(),
            },
        }
    }
}

fn apply_child_limits(limits: &ChildLimits) -> io::Result<()> {
    let set = |resource, value: u64| -> io::Result<()> {
        let rl = libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };
        if unsafe { libc::setrlimit(resource, &rl) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    };

    // New process group so the whole tree can be killed at once.
    if unsafe { libc::setpgid(0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    set(libc::RLIMIT_AS, limits.address_space)?;
    set(libc::RLIMIT_CPU, limits.cpu_seconds)?;
    set(libc::RLIMIT_FSIZE, limits.file_size)?;
    set(libc::RLIMIT_CORE, 0)?;
    Ok(())
}

fn kill_process_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
}

/// Drains a stream into `buffer`, keeping at most `limit + 1` bytes
///
/// Bytes read before a timeout stay in `buffer`.
async fn read_limited<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut Vec<u8>,
    limit: usize,
) -> io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        let room = (limit + 1).saturating_sub(buffer.len());
        buffer.extend_from_slice(&chunk[..read.min(room)]);
    }
}
