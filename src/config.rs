//! Configuration for cadence paths.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variable (CADENCE_HOME)
//! 2. Config file (.cadence/config.yaml)
//! 3. Defaults (~/.cadence)
//!
//! Config file discovery:
//! - Searches current directory and parents for .cadence/config.yaml
//! - Paths in the config file are relative to the .cadence/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const HOME_ENV: &str = "CADENCE_HOME";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to the .cadence/ directory)
    pub home: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state: journals, checkpoints and sink outputs
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".cadence").join("config.yaml");
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

/// Resolve a path that may be relative to the config file's directory
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

/// Pick the home directory from env override, config file and default
fn resolve_home(
    env_home: Option<String>,
    config: Option<(&Path, &ConfigFile)>,
    default_home: PathBuf,
) -> PathBuf {
    if let Some(home) = env_home {
        return PathBuf::from(home);
    }

    match config {
        Some((config_path, file)) => match file.paths.home {
            Some(ref home) => {
                let cadence_dir = config_path.parent().unwrap_or(Path::new("."));
                resolve_path(cadence_dir, home)
            }
            None => default_home,
        },
        None => default_home,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".cadence");

    let config_file = find_config_file();
    let parsed = match config_file {
        Some(ref path) => Some(load_config_file(path)?),
        None => None,
    };

    let home = resolve_home(
        std::env::var(HOME_ENV).ok(),
        config_file.as_deref().zip(parsed.as_ref()),
        default_home,
    );

    Ok(ResolvedConfig { home, config_file })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

// ============================================================================
// Convenience functions
// ============================================================================

/// Get the cadence home directory (engine state).
pub fn cadence_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($CADENCE_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("runs"))
}

/// Directory holding everything one cycle writes: `runs/<suite>/<cycle>`
pub fn cycle_dir(suite: &str, cycle: &str) -> Result<PathBuf> {
    Ok(runs_dir()?.join(suite).join(cycle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let cadence_dir = temp.path().join(".cadence");
        std::fs::create_dir_all(&cadence_dir).unwrap();

        let config_path = cadence_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home, Some("./state".to_string()));

        let home = resolve_home(None, Some((&config_path, &config)), PathBuf::from("/default"));
        assert_eq!(home, cadence_dir.join("./state"));
    }

    #[test]
    fn test_home_precedence() {
        let file = ConfigFile {
            version: "1.0".into(),
            paths: PathsConfig {
                home: Some("/from/file".into()),
            },
        };
        let path = PathBuf::from("/project/.cadence/config.yaml");

        assert_eq!(
            resolve_home(Some("/from/env".into()), Some((&path, &file)), PathBuf::from("/d")),
            PathBuf::from("/from/env")
        );
        assert_eq!(
            resolve_home(None, Some((&path, &file)), PathBuf::from("/d")),
            PathBuf::from("/from/file")
        );
        assert_eq!(resolve_home(None, None, PathBuf::from("/d")), PathBuf::from("/d"));
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
