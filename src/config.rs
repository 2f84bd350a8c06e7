//! Configuration pieces shared by the housekeeping tool and the sitter.
//!
//! Each tool owns one TOML file under `~/.dbkeeper/` (or a path given on the
//! command line). The sections here appear in both files; tool-specific
//! sections live next to the tool.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// How to reach the database and the shell.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Key in the secure user store holding host, port and credentials.
    #[serde(default = "default_user_key")]
    pub user_key: String,

    /// Path or name of the SQL command-line client.
    #[serde(default = "default_sql_client")]
    pub sql_client: String,

    /// Shell used for OS commands.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Encrypt the SQL connection and trust the server certificate.
    #[serde(default)]
    pub ssl: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            user_key: default_user_key(),
            sql_client: default_sql_client(),
            shell: default_shell(),
            ssl: false,
        }
    }
}

impl ConnectionConfig {
    /// Reject empty keys and shells outside the supported set.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.user_key.trim().is_empty() {
            return Err("user_key must not be empty".to_owned());
        }
        let shell_name = Path::new(&self.shell)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if !SUPPORTED_SHELLS.contains(&shell_name) {
            return Err(format!(
                "shell '{}' is not supported, use one of {SUPPORTED_SHELLS:?}",
                self.shell
            ));
        }
        Ok(())
    }
}

/// Shells the OS commands are written for.
pub const SUPPORTED_SHELLS: &[&str] = &["sh", "bash", "csh", "tcsh", "ksh", "zsh"];

fn default_user_key() -> String {
    "SYSTEMKEY".to_owned()
}
fn default_sql_client() -> String {
    "hdbsql".to_owned()
}
fn default_shell() -> String {
    "/bin/bash".to_owned()
}

/// Load and deserialize a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let value: T = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(value)
}

/// Resolve the default config directory (`~/.dbkeeper/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".dbkeeper"))
}

/// Resolve a tool's config file: the explicit path if given, else
/// `~/.dbkeeper/<file_name>`.
///
/// # Errors
///
/// Returns an error if no path was given and the home directory is unknown.
pub fn resolve_config_path(explicit: Option<&Path>, file_name: &str) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(config_dir()?.join(file_name)),
    }
}
