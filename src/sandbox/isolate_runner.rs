use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};

use crate::config::{MicroSecond, OneLanguageConfig, SandboxConfig};

use super::{
    ExecutionArtifacts, ExecutionOutcome, SandboxRunner, apply_template, limit_in_seconds,
    snippet_file_content, truncate_output,
};

// Sandbox configuration constants
const RUNTIME_PROCESSES: u32 = 16;
const RUNTIME_OPEN_FILES: u32 = 64;
const RUNTIME_FILE_SIZE: u32 = 16384; // KB
const SANDBOX_PATH: &str = "PATH=/usr/local/bin:/usr/bin:/bin";

const STDOUT_NAME: &str = "stdout.txt";
const STDERR_NAME: &str = "stderr.txt";

// Sandbox cache directory permissions
const CACHE_DIR_PERMISSIONS: u32 = 0o700;

/// A sandbox for executing snippets with `isolate`
///
/// Every execution runs in a freshly reinitialized box with its own mount,
/// PID and network namespaces and a cgroup memory limit. The network
/// namespace is never shared, so snippets have no route to the outside.
pub struct IsolateRunner {
    /// Unique identifier for this sandbox instance
    id: u8,
    /// Path to the sandbox's working directory (inside isolate)
    box_dir: PathBuf,
    /// Holds meta files, which must live outside the box
    cache_dir: PathBuf,
    config: SandboxConfig,
}

/// Fields of an isolate meta file that matter for classification
#[derive(Debug, Default, PartialEq)]
struct MetaInfo {
    status: Option<String>,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
    oom_killed: bool,
    memory_kb: Option<u64>,
    wall_time: Option<f64>,
    message: Option<String>,
}

impl SandboxRunner for IsolateRunner {
    fn build(id: u8, config: SandboxConfig) -> Result<Self> {
        let cache_dir = Self::setup_cache_directory(id)?;
        let box_dir = Self::initialize_isolate_sandbox(id)?;

        log::info!("IsolateRunner {id} initialized successfully");
        Ok(Self {
            id,
            box_dir,
            cache_dir,
            config,
        })
    }

    fn execute(&self, snippet: &str, language: &OneLanguageConfig) -> Result<ExecutionArtifacts> {
        if language.command.is_empty() {
            bail!("Empty command for language {}", language.name);
        }
        self.reinit()?;

        fs::write(
            self.box_dir.join(&language.file_name),
            snippet_file_content(snippet),
        )?;

        let mut mapping = HashMap::<&str, &str>::new();
        mapping.insert("%INPUT%", &language.file_name);
        let command = apply_template(&language.command, &mapping);

        let meta_path = self.cache_dir.join(format!("{}.meta", crate::create_id()));
        let start_time = Instant::now();
        self.run_isolated(&command, &meta_path)?;
        let elapsed_time = start_time.elapsed();

        let meta_content = fs::read_to_string(&meta_path)
            .map_err(|e| anyhow!("Failed to read meta file {}: {e}", meta_path.display()))?;
        let _ = fs::remove_file(&meta_path);
        let meta = parse_meta(&meta_content);

        let (outcome, signal) = outcome_from_meta(&meta, self.config.time_limit)?;
        let limit = self.config.output_limit;
        let stdout = read_output(&self.box_dir.join(STDOUT_NAME));
        let stderr = read_output(&self.box_dir.join(STDERR_NAME));

        log::debug!(
            "IsolateRunner {} finished in {} ms: {outcome}",
            self.id,
            elapsed_time.as_millis()
        );

        Ok(ExecutionArtifacts {
            outcome,
            stdout: truncate_output(&stdout, limit),
            stderr: truncate_output(&stderr, limit),
            wall_time: meta
                .wall_time
                .map(Duration::from_secs_f64)
                .unwrap_or(elapsed_time),
            memory_kb: meta.memory_kb,
            signal,
        })
    }

    fn enforces_cgroup_limits(&self) -> bool {
        true
    }
}

impl IsolateRunner {
    /// Sets up the cache directory for the sandbox
    fn setup_cache_directory(id: u8) -> Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "guardian")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;

        let cache_base_dir = proj_dirs.cache_dir();
        fs::create_dir_all(cache_base_dir)?;
        fs::set_permissions(
            cache_base_dir,
            fs::Permissions::from_mode(CACHE_DIR_PERMISSIONS),
        )?;

        let cache_dir = cache_base_dir.join(id.to_string());
        fs::create_dir_all(&cache_dir)?;

        Ok(cache_dir)
    }

    /// Initializes the isolate sandbox and returns the box directory
    fn initialize_isolate_sandbox(id: u8) -> Result<PathBuf> {
        let output = isolate_init(id)?;

        let root_dir_absolute = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root_dir_absolute.is_empty() {
            bail!(
                "isolate --init produced empty stdout; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(PathBuf::from(root_dir_absolute).join("box"))
    }

    /// Wipes the box so no file survives from a previous execution
    fn reinit(&self) -> Result<()> {
        let _ = Command::new("isolate")
            .args(["-b", &self.id.to_string(), "--cg", "--cleanup"])
            .output();
        isolate_init(self.id)?;
        log::debug!("IsolateRunner {} reinitialized", self.id);
        Ok(())
    }

    fn run_isolated(&self, command: &[String], meta_path: &Path) -> Result<()> {
        let sandbox_id = self.id.to_string();
        let seconds = limit_in_seconds(self.config.time_limit);
        let wall_time_arg = format!("--wall-time={seconds:.3}");
        let cpu_time_arg = format!("--time={seconds:.3}");
        let memory_arg = format!("--cg-mem={}", self.config.memory_limit.0);
        let processes_arg = format!("--processes={RUNTIME_PROCESSES}");
        let open_files_arg = format!("--open-files={RUNTIME_OPEN_FILES}");
        let fsize_arg = format!("--fsize={RUNTIME_FILE_SIZE}");
        let meta_arg = meta_path.to_string_lossy();

        let output = Command::new("isolate")
            .args([
                "-b",
                &sandbox_id,
                "--cg",
                "--run",
                &wall_time_arg,
                &cpu_time_arg,
                &memory_arg,
                &processes_arg,
                &open_files_arg,
                &fsize_arg,
                "-E",
                SANDBOX_PATH,
                "-E",
                "HOME=/box",
                "-M",
                &meta_arg,
                "-o",
                STDOUT_NAME,
                "-r",
                STDERR_NAME,
                "--silent",
                "--",
            ])
            .args(command)
            .output()
            .map_err(|e| anyhow!("Failed to spawn isolate --run: {e}"))?;

        // Non-zero exit is expected whenever the snippet fails; the meta file
        // carries the details. Only a missing meta file is fatal.
        if !meta_path.exists() {
            bail!(
                "isolate --run wrote no meta file; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}

impl Drop for IsolateRunner {
    fn drop(&mut self) {
        let out = Command::new("isolate")
            .arg("-b")
            .arg(self.id.to_string())
            .arg("--cg")
            .arg("--cleanup")
            .output();

        if out.is_ok_and(|c| c.status.success()) {
            log::info!("IsolateRunner {} cleaned up", self.id);
        } else {
            log::error!("IsolateRunner {} failed to clean up", self.id);
        }
    }
}

fn isolate_init(id: u8) -> Result<std::process::Output> {
    let output = Command::new("isolate")
        .arg("-b")
        .arg(id.to_string())
        .arg("--cg")
        .arg("--init")
        .output()
        .map_err(|e| anyhow!("Failed to spawn isolate --init: {e}"))?;

    if !output.status.success() {
        bail!(
            "isolate --init exited with non-zero status; stderr={}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(output)
}

/// Reads a captured stream, treating an unreadable file as empty output
fn read_output(path: &Path) -> Vec<u8> {
    fs::read(path).unwrap_or_else(|e| {
        log::warn!("Failed to read sandbox output {}: {e}", path.display());
        Vec::new()
    })
}

fn parse_meta(meta_content: &str) -> MetaInfo {
    let mut meta = MetaInfo::default();
    for line in meta_content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            match key {
                "status" => meta.status = Some(value.to_string()),
                "exitcode" => meta.exit_code = value.parse().ok(),
                "exitsig" => meta.exit_signal = value.parse().ok(),
                "cg-oom-killed" => meta.oom_killed = value == "1",
                "cg-mem" => meta.memory_kb = value.parse().ok(),
                "time-wall" => meta.wall_time = value.parse().ok(),
                "message" => meta.message = Some(value.to_string()),
                _ => {}
            }
        }
    }
    meta
}

/// Maps isolate's verdict onto an outcome and terminating signal
///
/// `XX` is isolate's own internal error and is reported as a fault of the
/// sandbox, not of the snippet.
fn outcome_from_meta(
    meta: &MetaInfo,
    limit: MicroSecond,
) -> Result<(ExecutionOutcome, Option<i32>)> {
    if meta.oom_killed {
        return Ok((
            ExecutionOutcome::Crashed {
                reason: "memory limit exceeded".to_string(),
            },
            meta.exit_signal,
        ));
    }

    match meta.status.as_deref() {
        Some("TO") => Ok((ExecutionOutcome::TimedOut { limit }, None)),
        Some("SG") => {
            let reason = match meta.exit_signal {
                Some(sig) => format!("killed by signal {sig}"),
                None => meta
                    .message
                    .clone()
                    .unwrap_or_else(|| "killed by signal".to_string()),
            };
            Ok((ExecutionOutcome::Crashed { reason }, meta.exit_signal))
        }
        Some("XX") => bail!(
            "isolate internal error: {}",
            meta.message.as_deref().unwrap_or("no message")
        ),
        _ => Ok((
            ExecutionOutcome::Completed {
                exit_code: meta.exit_code.unwrap_or(0),
            },
            None,
        )),
    }
}
