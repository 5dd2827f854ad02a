//! `planctl.json` config loading, mirroring the teacher's
//! `~/.openclaw/openclaw.json` discovery convention: a small serde struct
//! tree, a state-dir override, and tolerant defaults when the file is
//! absent.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const STATE_DIR_ENV: &str = "PLANCTL_STATE_DIR";
const CONFIG_FILE_NAME: &str = "planctl.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMode {
    Loopback,
    Lan,
}

impl Default for BindMode {
    fn default() -> Self {
        Self::Loopback
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub bind: BindMode,
}

fn default_port() -> u16 {
    18790
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverySection {
    /// off | plan | sample
    #[serde(default = "default_discovery_mode")]
    pub default_mode: String,
}

fn default_discovery_mode() -> String {
    "off".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_sandbox_image")]
    pub image: String,
}

fn default_sandbox_image() -> String {
    "planctl-sandbox:latest".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanctlConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub sandbox: SandboxSection,
}

impl PlanctlConfig {
    pub fn default_path() -> PathBuf {
        if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
            return PathBuf::from(dir).join(CONFIG_FILE_NAME);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".planctl").join(CONFIG_FILE_NAME)
    }

    /// Tolerant load: a missing file yields defaults; a malformed file is an error.
    pub fn load() -> std::io::Result<Self> {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(std::io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // ==== defaults ====

    #[test]
    fn default_config_has_loopback_bind_and_off_discovery() {
        let cfg = PlanctlConfig::default();
        assert_eq!(cfg.gateway.bind, BindMode::Loopback);
        assert_eq!(cfg.discovery.default_mode, "off");
        assert_eq!(cfg.gateway.port, 18790);
    }

    // ==== load_from ====

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let cfg = PlanctlConfig::load_from(&path).unwrap();
        assert_eq!(cfg.gateway.port, 18790);
    }

    #[test]
    fn load_from_partial_json_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("planctl.json");
        std::fs::write(&path, r#"{"gateway": {"port": 9999}}"#).unwrap();
        let cfg = PlanctlConfig::load_from(&path).unwrap();
        assert_eq!(cfg.gateway.port, 9999);
        assert_eq!(cfg.gateway.bind, BindMode::Loopback);
        assert_eq!(cfg.sandbox.image, "planctl-sandbox:latest");
    }

    #[test]
    fn load_from_malformed_json_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("planctl.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(PlanctlConfig::load_from(&path).is_err());
    }

    #[test]
    fn default_path_honors_state_dir_env() {
        std::env::set_var(STATE_DIR_ENV, "/tmp/planctl-state-test");
        let p = PlanctlConfig::default_path();
        std::env::remove_var(STATE_DIR_ENV);
        assert_eq!(p, PathBuf::from("/tmp/planctl-state-test/planctl.json"));
    }
}
