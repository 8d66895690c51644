//! Configuration file management for loopwork.
//!
//! Config is project-local: `<root>/.loopwork/config.toml`, resolved
//! alongside the rest of the engine's on-disk state. Resolution chain for
//! any given knob: CLI flag > config file > built-in default. Parsing this
//! file (and the CLI flags) is the one job left entirely to this crate --
//! `loopwork-core` only ever sees the already-resolved `EngineConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use loopwork_core::config::{CheckpointConfig, CircuitBreakerConfig, EngineConfig, RetryPolicy};
use loopwork_subprocess::SubprocessConfig;

/// The on-disk shape of `.loopwork/config.toml`. Every field is optional so
/// an operator can override just the knobs they care about; anything absent
/// falls back to the matching `EngineConfig`/`RetryPolicy`/... default.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub circuit_breaker: CircuitSection,
    #[serde(default)]
    pub agent: AgentSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EngineSection {
    pub workers: Option<usize>,
    pub task_timeout_secs: Option<u64>,
    pub task_delay_secs: Option<u64>,
    pub checkpoint_interval_secs: Option<u64>,
    pub orphan_scan_interval_secs: Option<u64>,
    pub cleanup_grace_period_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RetrySection {
    pub quarantine_threshold: Option<u32>,
    pub max_retries_per_task: Option<u32>,
    pub budget_limit: Option<usize>,
    pub budget_window_secs: Option<u64>,
    pub backoff_base_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub backoff_max_secs: Option<u64>,
    pub jitter: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CircuitSection {
    pub trip_threshold: Option<u32>,
    pub cooldown_secs: Option<u64>,
    pub max_healing_attempts: Option<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentSection {
    pub command: Option<String>,
    #[serde(default)]
    pub base_args: Vec<String>,
    #[serde(default)]
    pub preflight_args: Vec<String>,
    pub preflight_timeout_secs: Option<u64>,
}

/// Path to the config file under `root`'s state directory.
pub fn config_path(state_dir: &Path) -> PathBuf {
    state_dir.join("config.toml")
}

/// Load `.loopwork/config.toml`, tolerating a missing file by returning the
/// section-wise empty default (every knob then falls back further down the
/// resolution chain).
pub fn load_config(state_dir: &Path) -> Result<ConfigFile> {
    let path = config_path(state_dir);
    match std::fs::read_to_string(&path) {
        Ok(contents) => toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file at {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read config file at {}", path.display())),
    }
}

/// CLI-flag overrides layered on top of the config file. `None` means "not
/// passed on the command line, fall through to the file/default".
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub workers: Option<usize>,
    pub feature: Option<String>,
    pub namespace: Option<String>,
    pub task_timeout_secs: Option<u64>,
    pub agent_command: Option<String>,
    pub agent_args: Vec<String>,
}

/// Resolve CLI flags + config file + defaults into the structs
/// `loopwork-core`/`loopwork-subprocess` actually consume.
pub fn resolve(
    root: &Path,
    state_dir: PathBuf,
    output_dir: PathBuf,
    file: &ConfigFile,
    cli: &CliOverrides,
) -> (EngineConfig, SubprocessConfig) {
    let defaults = EngineConfig::default();
    let retry_defaults = RetryPolicy::default();
    let circuit_defaults = CircuitBreakerConfig::default();
    let checkpoint_defaults = CheckpointConfig::default();

    let engine = EngineConfig {
        worker_count: cli.workers.or(file.engine.workers).unwrap_or(defaults.worker_count),
        feature: cli.feature.clone(),
        task_timeout: cli
            .task_timeout_secs
            .or(file.engine.task_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.task_timeout),
        task_delay: file
            .engine
            .task_delay_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.task_delay),
        state_dir,
        output_dir,
        retry: RetryPolicy {
            quarantine_threshold: file.retry.quarantine_threshold.unwrap_or(retry_defaults.quarantine_threshold),
            max_retries_per_task: file.retry.max_retries_per_task.unwrap_or(retry_defaults.max_retries_per_task),
            budget_window: file
                .retry
                .budget_window_secs
                .map(Duration::from_secs)
                .unwrap_or(retry_defaults.budget_window),
            budget_limit: file.retry.budget_limit.unwrap_or(retry_defaults.budget_limit),
            backoff_base: file
                .retry
                .backoff_base_secs
                .map(Duration::from_secs)
                .unwrap_or(retry_defaults.backoff_base),
            backoff_multiplier: file.retry.backoff_multiplier.unwrap_or(retry_defaults.backoff_multiplier),
            backoff_max: file
                .retry
                .backoff_max_secs
                .map(Duration::from_secs)
                .unwrap_or(retry_defaults.backoff_max),
            jitter: file.retry.jitter.unwrap_or(retry_defaults.jitter),
        },
        circuit_breaker: CircuitBreakerConfig {
            trip_threshold: file.circuit_breaker.trip_threshold.unwrap_or(circuit_defaults.trip_threshold),
            cooldown: file
                .circuit_breaker
                .cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(circuit_defaults.cooldown),
            max_healing_attempts: file
                .circuit_breaker
                .max_healing_attempts
                .unwrap_or(circuit_defaults.max_healing_attempts),
        },
        checkpoint: CheckpointConfig {
            namespace: cli.namespace.clone().unwrap_or(checkpoint_defaults.namespace),
            interval: file
                .engine
                .checkpoint_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(checkpoint_defaults.interval),
            orphan_scan_interval: file
                .engine
                .orphan_scan_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(checkpoint_defaults.orphan_scan_interval),
            cleanup_grace_period: file
                .engine
                .cleanup_grace_period_secs
                .map(Duration::from_secs)
                .unwrap_or(checkpoint_defaults.cleanup_grace_period),
        },
        parallel_failure_mode: defaults.parallel_failure_mode,
    };

    let subprocess_defaults = SubprocessConfig::default();
    let agent_args = if cli.agent_args.is_empty() {
        file.agent.base_args.clone()
    } else {
        cli.agent_args.clone()
    };
    let subprocess = SubprocessConfig {
        command: cli
            .agent_command
            .clone()
            .or(file.agent.command.clone())
            .unwrap_or(subprocess_defaults.command),
        base_args: agent_args,
        preflight_args: if file.agent.preflight_args.is_empty() {
            subprocess_defaults.preflight_args
        } else {
            file.agent.preflight_args.clone()
        },
        preflight_timeout: file
            .agent
            .preflight_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(subprocess_defaults.preflight_timeout),
        termination_grace_period: engine.checkpoint.cleanup_grace_period,
    };

    let _ = root;
    (engine, subprocess)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = load_config(dir.path()).unwrap();
        let (engine, subprocess) = resolve(
            dir.path(),
            dir.path().join(".loopwork"),
            dir.path().join(".loopwork/output"),
            &file,
            &CliOverrides::default(),
        );
        assert_eq!(engine.worker_count, EngineConfig::default().worker_count);
        assert_eq!(subprocess.command, SubprocessConfig::default().command);
    }

    #[test]
    fn cli_flag_overrides_config_file_value() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(
            config_path(dir.path()),
            "[engine]\nworkers = 8\n",
        )
        .unwrap();
        let file = load_config(dir.path()).unwrap();
        assert_eq!(file.engine.workers, Some(8));

        let overrides = CliOverrides {
            workers: Some(2),
            ..Default::default()
        };
        let (engine, _) = resolve(
            dir.path(),
            dir.path().join(".loopwork"),
            dir.path().join(".loopwork/output"),
            &file,
            &overrides,
        );
        assert_eq!(engine.worker_count, 2);
    }

    #[test]
    fn config_file_value_used_when_no_cli_flag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            config_path(dir.path()),
            "[retry]\nquarantine_threshold = 7\n",
        )
        .unwrap();
        let file = load_config(dir.path()).unwrap();
        let (engine, _) = resolve(
            dir.path(),
            dir.path().join(".loopwork"),
            dir.path().join(".loopwork/output"),
            &file,
            &CliOverrides::default(),
        );
        assert_eq!(engine.retry.quarantine_threshold, 7);
    }
}
