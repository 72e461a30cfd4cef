//! Configuration for conveyor paths, rollout defaults and notification defaults.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CONVEYOR_HOME)
//! 2. Config file (.conveyor/config.yaml)
//! 3. Defaults (~/.conveyor)
//!
//! Config file discovery:
//! - Searches current directory and parents for .conveyor/config.yaml
//! - `paths.home` is relative to the .conveyor/ directory, other paths to
//!   the project root (the directory holding .conveyor/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{NotificationSettings, RolloutDefaults};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Batch size, traffic steps and verification for deploy stages that omit them
    #[serde(default)]
    pub rollout: Option<RolloutDefaults>,
    /// Default subscribers for every pipeline
    #[serde(default)]
    pub notifications: Option<NotificationSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .conveyor/)
    pub home: Option<String>,
    /// Where `conveyor run <name>` looks for pipeline files (relative to project root)
    pub pipelines: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state root
    pub home: PathBuf,
    /// One directory per run: events.jsonl plus stage logs
    pub runs_dir: PathBuf,
    /// One JSON record per deployment target
    pub targets_dir: PathBuf,
    /// Content-addressed stage outputs
    pub artifacts_dir: PathBuf,
    /// Per-run working directories for stage commands
    pub workspaces_dir: PathBuf,
    /// Pipeline definitions
    pub pipelines_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub rollout: RolloutDefaults,
    pub notifications: NotificationSettings,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".conveyor").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Combine a parsed config file, the environment and defaults
fn resolve(config: Option<(&Path, ConfigFile)>, env_home: Option<PathBuf>, default_home: PathBuf) -> ResolvedConfig {
    let (config_file, file) = match config {
        Some((path, file)) => (Some(path.to_path_buf()), file),
        None => (None, ConfigFile::default()),
    };

    // .conveyor/ and the project root holding it
    let conveyor_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));
    let project_root = conveyor_dir.parent().unwrap_or(Path::new("."));

    let home = match (env_home, &file.paths.home) {
        (Some(env_home), _) => env_home,
        (None, Some(home)) if config_file.is_some() => resolve_path(conveyor_dir, home),
        _ => default_home,
    };

    let pipelines_dir = match (&file.paths.pipelines, &config_file) {
        (Some(dir), Some(_)) => resolve_path(project_root, dir),
        (None, Some(_)) => project_root.join("pipelines"),
        _ => PathBuf::from("pipelines"),
    };

    ResolvedConfig {
        runs_dir: home.join("runs"),
        targets_dir: home.join("targets"),
        artifacts_dir: home.join("artifacts"),
        workspaces_dir: home.join("workspaces"),
        home,
        pipelines_dir,
        config_file,
        rollout: file.rollout.unwrap_or_default(),
        notifications: file.notifications.unwrap_or_default(),
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".conveyor");
    let env_home = std::env::var("CONVEYOR_HOME").ok().map(PathBuf::from);

    let resolved = match find_config_file() {
        Some(path) => {
            let file = load_config_file(&path)?;
            resolve(Some((&path, file)), env_home, default_home)
        }
        None => resolve(None, env_home, default_home),
    };
    resolved.rollout.validate().context("Invalid rollout defaults")?;
    Ok(resolved)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, None, PathBuf::from("/home/ops/.conveyor"));

        assert_eq!(config.home, PathBuf::from("/home/ops/.conveyor"));
        assert_eq!(config.runs_dir, PathBuf::from("/home/ops/.conveyor/runs"));
        assert_eq!(config.targets_dir, PathBuf::from("/home/ops/.conveyor/targets"));
        assert_eq!(config.pipelines_dir, PathBuf::from("pipelines"));
        assert!(config.config_file.is_none());
        assert_eq!(config.notifications.delivery.max_attempts, 5);
        assert_eq!(config.rollout, RolloutDefaults::default());
    }

    #[test]
    fn test_env_home_wins() {
        let config = resolve(
            None,
            Some(PathBuf::from("/srv/conveyor")),
            PathBuf::from("/home/ops/.conveyor"),
        );
        assert_eq!(config.artifacts_dir, PathBuf::from("/srv/conveyor/artifacts"));
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let conveyor_dir = temp.path().join(".conveyor");
        std::fs::create_dir_all(&conveyor_dir).unwrap();

        let config_path = conveyor_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
  pipelines: deploy/pipelines
rollout:
  batch_size: 3
  verify:
    healthy_threshold: 4
notifications:
  webhooks: [https://hooks.example.com/conveyor]
  max_attempts: 8
  backoff:
    initial_delay_ms: 500
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.version.as_deref(), Some("1.0"));
        assert_eq!(parsed.paths.home.as_deref(), Some("./state"));

        let config = resolve(Some((&config_path, parsed)), None, PathBuf::from("/unused"));
        assert_eq!(config.home, conveyor_dir.join("./state"));
        assert_eq!(config.runs_dir, conveyor_dir.join("./state").join("runs"));
        assert_eq!(config.pipelines_dir, temp.path().join("deploy/pipelines"));
        assert_eq!(config.rollout.batch_size, 3);
        assert_eq!(config.rollout.verify.healthy_threshold, 4);
        assert_eq!(config.rollout.verify.poll_interval_ms, 5_000);
        assert_eq!(config.rollout.traffic.step_percent, 25);
        assert_eq!(config.notifications.webhooks.len(), 1);
        assert_eq!(config.notifications.delivery.max_attempts, 8);
        assert_eq!(config.notifications.delivery.backoff.initial_delay_ms, 500);
        assert_eq!(config.config_file.as_deref(), Some(config_path.as_path()));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
