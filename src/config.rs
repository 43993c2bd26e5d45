use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::verdict::Verdict;

#[derive(Parser)]
#[command(name = "guardian", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Number of sandbox workers
    #[arg(long = "workers", short = 'w', default_value_t = 2)]
    pub workers: u8,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader)?;
        config.check()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    pub languages: LanguageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    /// Cross-field checks serde cannot express
    pub fn check(&self) -> std::io::Result<()> {
        let invalid = |msg: String| std::io::Error::new(std::io::ErrorKind::InvalidData, msg);

        if self.find_language(&self.sandbox.default_language).is_none() {
            return Err(invalid(format!(
                "default language {} is not configured",
                self.sandbox.default_language
            )));
        }
        if let Some(l) = self.languages.iter().find(|l| l.command.is_empty()) {
            return Err(invalid(format!("language {} has an empty command", l.name)));
        }
        if self.sandbox.max_snippet_bytes == 0 || self.sandbox.time_limit.0 == 0 {
            return Err(invalid("sandbox limits must be positive".to_string()));
        }
        if self.sandbox.inconclusive_verdict == Verdict::Safe {
            return Err(invalid(
                "inconclusive_verdict must be Unknown or Unsafe".to_string(),
            ));
        }
        if !(4..=31).contains(&self.auth.bcrypt_cost) {
            return Err(invalid("bcrypt_cost must be between 4 and 31".to_string()));
        }
        Ok(())
    }

    pub fn find_language(&self, name: &str) -> Option<&OneLanguageConfig> {
        self.languages.iter().find(|l| l.name == name)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    #[default]
    Auto,
    Isolate,
    Simple,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    pub runner: RunnerKind,
    pub max_snippet_bytes: usize,
    pub time_limit: MicroSecond,
    pub memory_limit: KiloByte,
    pub output_limit: usize,
    pub inconclusive_verdict: Verdict,
    pub default_language: String,
    /// Lets SimpleRunner run snippets without namespaces when the host
    /// cannot create them
    pub allow_unconfined: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runner: RunnerKind::Auto,
            max_snippet_bytes: 16384,
            time_limit: MicroSecond(5_000_000),
            memory_limit: KiloByte(262_144),
            output_limit: 65536,
            inconclusive_verdict: Verdict::Unknown,
            default_language: "shell".to_string(),
            allow_unconfined: false,
        }
    }
}

pub type LanguageConfig = Vec<OneLanguageConfig>;

#[derive(Deserialize, Debug, Clone)]
pub struct OneLanguageConfig {
    pub name: String,
    pub file_name: String,
    pub command: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub token_ttl_minutes: i64,
    pub bcrypt_cost: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_minutes: 24 * 60,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MicroSecond(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Second(pub f64);

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KiloByte(pub u64);

impl From<MicroSecond> for Second {
    fn from(value: MicroSecond) -> Self {
        Second(value.0 as f64 / 1_000_000.0)
    }
}

impl From<MicroSecond> for Duration {
    fn from(value: MicroSecond) -> Self {
        Duration::from_micros(value.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let file = std::fs::File::open("data/example.json").unwrap();
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader).unwrap();
        assert_eq!(config.server.bind_address, Some("127.0.0.1".to_string()));
        assert_eq!(config.sandbox.time_limit, MicroSecond(5_000_000));
        assert_eq!(config.sandbox.inconclusive_verdict, Verdict::Unknown);
        assert!(config.find_language("shell").is_some());
        config.check().unwrap();
    }

    #[test]
    fn test_sandbox_defaults_apply() {
        let config: Config = serde_json::from_str(
            r#"{
                "server": {},
                "languages": [{"name": "shell", "file_name": "snippet.sh", "command": ["/bin/sh", "%INPUT%"]}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.sandbox.runner, RunnerKind::Auto);
        assert_eq!(config.sandbox.max_snippet_bytes, 16384);
        assert_eq!(config.auth.token_ttl_minutes, 1440);
        assert_eq!(config.auth.bcrypt_cost, 12);
        assert!(!config.sandbox.allow_unconfined);
        config.check().unwrap();
    }

    #[test]
    fn test_safe_is_not_an_inconclusive_policy() {
        let config: Config = serde_json::from_str(
            r#"{
                "server": {},
                "sandbox": {"inconclusive_verdict": "Safe"},
                "languages": [{"name": "shell", "file_name": "snippet.sh", "command": ["/bin/sh", "%INPUT%"]}]
            }"#,
        )
        .unwrap();
        assert!(config.check().is_err());
    }

    #[test]
    fn test_bcrypt_cost_out_of_range_rejected() {
        let config: Config = serde_json::from_str(
            r#"{
                "server": {},
                "languages": [{"name": "shell", "file_name": "snippet.sh", "command": ["/bin/sh", "%INPUT%"]}],
                "auth": {"bcrypt_cost": 2}
            }"#,
        )
        .unwrap();
        assert!(config.check().is_err());
    }

    #[test]
    fn test_missing_default_language_rejected() {
        let config: Config = serde_json::from_str(
            r#"{
                "server": {},
                "sandbox": {"default_language": "ruby"},
                "languages": [{"name": "shell", "file_name": "snippet.sh", "command": ["/bin/sh", "%INPUT%"]}]
            }"#,
        )
        .unwrap();
        assert!(config.check().is_err());
    }

    #[test]
    fn test_time_unit_conversion() {
        assert_eq!(Second::from(MicroSecond(1_500_000)), Second(1.5));
        assert_eq!(Duration::from(MicroSecond(2_000)), Duration::from_millis(2));
    }
}
