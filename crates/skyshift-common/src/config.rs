//! Local configuration under `~/.skyconf/`
//!
//! `config.yaml` holds the current context (server URL, user, namespace,
//! session token); `slurm_config.yaml` declares pre-existing Slurm
//! clusters reachable over slurmrestd.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Directory holding all local SkyShift state
pub const SKYCONF_DIR: &str = ".skyconf";
/// Context configuration file name
pub const CONFIG_FILE: &str = "config.yaml";
/// Slurm cluster declarations file name
pub const SLURM_CONFIG_FILE: &str = "slurm_config.yaml";

/// Resolve `~/.skyconf`, honoring `SKYCONF_DIR` for tests
pub fn skyconf_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SKYCONF_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(SKYCONF_DIR)
}

/// Per-cluster local directory (kubeconfigs, controller logs)
pub fn cluster_dir(cluster_name: &str) -> PathBuf {
    skyconf_dir().join("clusters").join(cluster_name)
}

/// The active CLI/controller context
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Context {
    /// API server base URL (e.g. "http://127.0.0.1:50051")
    pub server: String,
    /// Current user name
    #[serde(default)]
    pub user: String,
    /// Current namespace for namespaced operations
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Session token for the current user
    #[serde(default)]
    pub token: String,
}

fn default_namespace() -> String {
    crate::object::DEFAULT_NAMESPACE.to_string()
}

/// Contents of `~/.skyconf/config.yaml`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SkyConfig {
    /// The active context
    pub current_context: Context,
}

impl SkyConfig {
    /// Load the config file, or defaults when it does not exist yet
    pub fn load() -> Result<Self> {
        let path = skyconf_dir().join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::transient("config", format!("read {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::invalid("SkyConfig", format!("parse {}: {e}", path.display())))
    }

    /// Persist the config file, creating `~/.skyconf` if needed
    pub fn save(&self) -> Result<()> {
        let dir = skyconf_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::transient("config", format!("mkdir {}: {e}", dir.display())))?;
        let path = dir.join(CONFIG_FILE);
        let raw = serde_yaml::to_string(self)
            .map_err(|e| Error::invalid("SkyConfig", e.to_string()))?;
        std::fs::write(&path, raw)
            .map_err(|e| Error::transient("config", format!("write {}: {e}", path.display())))
    }
}

/// A pre-declared Slurm cluster reachable over slurmrestd
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SlurmClusterConfig {
    /// slurmrestd base URL (e.g. "http://login01:6820")
    pub endpoint: String,
    /// slurmrestd OpenAPI version segment
    #[serde(default = "default_openapi_version")]
    pub openapi_version: String,
    /// User the REST calls run as
    pub user: String,
    /// JWT for slurmrestd authentication, if the daemon requires one
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Directory jobs write stdout files into
    #[serde(default)]
    pub stdout_dir: Option<String>,
}

fn default_openapi_version() -> String {
    "v0.0.39".to_string()
}

/// Contents of `~/.skyconf/slurm_config.yaml`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SlurmConfig {
    /// Declared clusters keyed by cluster name
    #[serde(default)]
    pub clusters: BTreeMap<String, SlurmClusterConfig>,
}

impl SlurmConfig {
    /// Load the Slurm declarations, or an empty set when absent
    pub fn load() -> Result<Self> {
        let path = skyconf_dir().join(SLURM_CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::transient("config", format!("read {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::invalid("SlurmConfig", format!("parse {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_round_trip() {
        let config = SkyConfig {
            current_context: Context {
                server: "http://127.0.0.1:50051".to_string(),
                user: "admin".to_string(),
                namespace: "default".to_string(),
                token: "tok".to_string(),
            },
        };
        let raw = serde_yaml::to_string(&config).unwrap();
        let parsed: SkyConfig = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_slurm_config_defaults() {
        let raw = r#"
clusters:
  hpc-a:
    endpoint: http://login01:6820
    user: alice
"#;
        let parsed: SlurmConfig = serde_yaml::from_str(raw).unwrap();
        let cluster = &parsed.clusters["hpc-a"];
        assert_eq!(cluster.openapi_version, "v0.0.39");
        assert!(cluster.auth_token.is_none());
    }
}
