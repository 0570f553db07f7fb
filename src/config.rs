//! Host agent configuration.
//!
//! Filesystem roots and tool locations are configurable so the agent can
//! be pointed at a scratch tree in tests; the defaults match a production
//! hypervisor host.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmhost/config.toml";

/// Environment variable naming an alternative configuration file.
pub const CONFIG_ENV: &str = "VMHOST_CONFIG";

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Parent of the per-VM home directories.
    pub vm_root: PathBuf,

    /// Parent of the per-VM disk directories.
    pub storage_root: PathBuf,

    /// Directory where SPDK creates vhost-user sockets.
    pub vhost_root: PathBuf,

    /// Boot-image cache directory.
    pub image_cache_dir: PathBuf,

    /// Directory systemd units are installed into.
    pub systemd_dir: PathBuf,

    /// SPDK RPC client script.
    pub spdk_rpc: PathBuf,

    /// SPDK RPC socket.
    pub spdk_socket: PathBuf,

    /// SPDK `spdk_dd` binary.
    pub spdk_dd: PathBuf,

    /// OS user the SPDK target runs as; granted access to disk files.
    pub spdk_user: String,

    /// Cloud Hypervisor binary.
    pub hypervisor_bin: PathBuf,

    /// Firmware the hypervisor boots.
    pub firmware: PathBuf,

    /// Host uplink used for NDP proxy entries.
    pub uplink_device: String,

    /// Source URLs of boot images, by logical name.
    pub images: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            vm_root: PathBuf::from("/vm"),
            storage_root: PathBuf::from("/var/storage"),
            vhost_root: PathBuf::from("/var/storage/vhost"),
            image_cache_dir: PathBuf::from("/opt"),
            systemd_dir: PathBuf::from("/etc/systemd/system"),
            spdk_rpc: PathBuf::from("/opt/spdk/scripts/rpc.py"),
            spdk_socket: PathBuf::from("/home/spdk/spdk.sock"),
            spdk_dd: PathBuf::from("/opt/spdk/bin/spdk_dd"),
            spdk_user: "spdk".to_string(),
            hypervisor_bin: PathBuf::from("/opt/cloud-hypervisor/cloud-hypervisor"),
            firmware: PathBuf::from("/opt/fw/CLOUDHV.fd"),
            uplink_device: "eth0".to_string(),
            images: BTreeMap::from([
                (
                    "ubuntu-jammy".to_string(),
                    "https://cloud-images.ubuntu.com/releases/jammy/release/ubuntu-22.04-server-cloudimg-amd64.img"
                        .to_string(),
                ),
                (
                    "almalinux-9".to_string(),
                    "https://repo.almalinux.org/almalinux/9/cloud/x86_64/images/AlmaLinux-9-GenericCloud-latest.x86_64.qcow2"
                        .to_string(),
                ),
            ]),
        }
    }
}

impl AgentConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, [`DEFAULT_CONFIG_PATH`] is
    /// read when present and the defaults are used otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::load_from(default)
                } else {
                    tracing::debug!("no config file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse a TOML file. Missing keys keep their defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&data).map_err(|e| match e {
            Error::ConfigLoad(msg) => Error::ConfigLoad(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Parse TOML text.
    pub fn from_toml(data: &str) -> Result<Self> {
        toml::from_str(data).map_err(|e| Error::ConfigLoad(e.to_string()))
    }

    /// Configuration rooted entirely under `root`, for scratch trees.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            vm_root: root.join("vm"),
            storage_root: root.join("var/storage"),
            vhost_root: root.join("var/storage/vhost"),
            image_cache_dir: root.join("opt"),
            systemd_dir: root.join("etc/systemd/system"),
            ..Self::default()
        }
    }

    /// Source URL of a boot image.
    pub fn image_url(&self, name: &str) -> Option<&str> {
        self.images.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AgentConfig::from_toml(
            r#"
            storage_root = "/srv/storage"
            uplink_device = "enp0s31f6"

            [images]
            debian-12 = "https://example.com/debian-12.qcow2"
            "#,
        )
        .unwrap();

        assert_eq!(config.storage_root, PathBuf::from("/srv/storage"));
        assert_eq!(config.uplink_device, "enp0s31f6");
        assert_eq!(config.vm_root, PathBuf::from("/vm"));
        assert_eq!(
            config.image_url("debian-12"),
            Some("https://example.com/debian-12.qcow2")
        );
        assert!(config.image_url("ubuntu-jammy").is_none());
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let err = AgentConfig::from_toml("vm_root = [").unwrap_err();
        assert!(matches!(err, Error::ConfigLoad(_)));
    }

    #[test]
    fn test_explicit_missing_file_fails() {
        let err = AgentConfig::load(Some(Path::new("/nonexistent/vmhost.toml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/vmhost.toml"));
    }

    #[test]
    fn test_rooted_at() {
        let config = AgentConfig::rooted_at(Path::new("/tmp/x"));
        assert_eq!(config.vm_root, PathBuf::from("/tmp/x/vm"));
        assert_eq!(config.image_cache_dir, PathBuf::from("/tmp/x/opt"));
        assert_eq!(config.spdk_user, "spdk");
    }
}
