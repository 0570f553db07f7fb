//! VM identity and every path, device and unit name derived from it.
//!
//! Setup, recreate and purge must agree on locations, so all of them are
//! computed here from `(VmIdentity, disk_index)` and the configured roots.

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Longest accepted VM name; `vetho<name>` must fit IFNAMSIZ (15 bytes).
pub const MAX_VM_NAME_LEN: usize = 10;

/// Disk image filename inside a per-disk directory.
pub const DISK_FILENAME: &str = "disk.raw";

/// Wrapped key filename inside a per-disk directory.
pub const KEY_FILENAME: &str = "data_encryption_key.json";

/// vhost socket symlink inside a per-disk directory.
pub const VHOST_LINK_FILENAME: &str = "vhost.sock";

/// A validated VM name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VmIdentity(String);

impl VmIdentity {
    /// Validate and wrap a VM name.
    ///
    /// Rules:
    /// - Length: 1..=[`MAX_VM_NAME_LEN`] characters
    /// - Allowed characters: alphanumeric, hyphen (-), underscore (_)
    /// - Must start with a letter or digit
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        check_name("vm name", &name)?;
        if name.len() > MAX_VM_NAME_LEN {
            return Err(Error::params(format!(
                "vm name too long: {} characters (max {})",
                name.len(),
                MAX_VM_NAME_LEN
            )));
        }
        Ok(Self(name))
    }

    /// The name as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check a volume's `device_id`.
///
/// It names SPDK objects and the controller socket under `vhost_root`, so it
/// follows the VM name rules without the length limit.
pub fn validate_device_id(device_id: &str) -> Result<()> {
    check_name("device_id", device_id)
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    let first = name
        .chars()
        .next()
        .ok_or_else(|| Error::params(format!("{} cannot be empty", kind)))?;

    if !first.is_ascii_alphanumeric() {
        return Err(Error::params(format!(
            "{} must start with a letter or digit: '{}'",
            kind, name
        )));
    }

    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_')
    {
        return Err(Error::params(format!(
            "{} '{}' contains invalid character: '{}'",
            kind, name, c
        )));
    }
    Ok(())
}

/// Paths and names owned by one VM.
#[derive(Debug, Clone)]
pub struct VmPaths {
    vm: VmIdentity,
    home: PathBuf,
    storage_dir: PathBuf,
    vhost_root: PathBuf,
    systemd_dir: PathBuf,
}

impl VmPaths {
    /// Derive paths for `vm` under the configured roots.
    pub fn new(vm: &VmIdentity, config: &AgentConfig) -> Self {
        Self {
            vm: vm.clone(),
            home: config.vm_root.join(vm.as_str()),
            storage_dir: config.storage_root.join(vm.as_str()),
            vhost_root: config.vhost_root.clone(),
            systemd_dir: config.systemd_dir.clone(),
        }
    }

    /// The VM these paths belong to.
    pub fn vm(&self) -> &VmIdentity {
        &self.vm
    }

    /// VM home directory, owned by the VM's OS user.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Persisted parameter manifest.
    pub fn manifest(&self) -> PathBuf {
        self.home.join(vmhost_protocol::MANIFEST_FILENAME)
    }

    /// Persisted guest ephemeral range.
    pub fn guest_ephemeral(&self) -> PathBuf {
        self.home.join("guest_ephemeral")
    }

    /// Persisted host-side ephemeral range.
    pub fn host_ephemeral(&self) -> PathBuf {
        self.home.join("host_ephemeral")
    }

    /// nftables ruleset applied inside the namespace.
    pub fn nftables_conf(&self) -> PathBuf {
        self.home.join("nftables.conf")
    }

    /// dnsmasq configuration for the DNS/DHCP helper.
    pub fn dnsmasq_conf(&self) -> PathBuf {
        self.home.join("dnsmasq.conf")
    }

    /// Hugepage mount point.
    pub fn hugepages(&self) -> PathBuf {
        self.home.join("hugepages")
    }

    /// Root of the VM's storage state.
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Per-disk directory.
    pub fn disk_dir(&self, disk_index: u32) -> PathBuf {
        self.storage_dir.join(disk_index.to_string())
    }

    /// Disk image of `disk_index`.
    pub fn disk_file(&self, disk_index: u32) -> PathBuf {
        self.disk_dir(disk_index).join(DISK_FILENAME)
    }

    /// Wrapped data-encryption key of `disk_index`.
    pub fn key_file(&self, disk_index: u32) -> PathBuf {
        self.disk_dir(disk_index).join(KEY_FILENAME)
    }

    /// Symlink to the vhost socket of `disk_index`, handed to the monitor.
    pub fn vhost_link(&self, disk_index: u32) -> PathBuf {
        self.disk_dir(disk_index).join(VHOST_LINK_FILENAME)
    }

    /// Socket SPDK creates for the vhost controller `device_id`.
    pub fn vhost_socket(&self, device_id: &str) -> PathBuf {
        self.vhost_root.join(device_id)
    }

    /// Namespace name.
    pub fn netns(&self) -> &str {
        self.vm.as_str()
    }

    /// Host side of the veth pair.
    pub fn veth_outer(&self) -> String {
        format!("vetho{}", self.vm)
    }

    /// Namespace side of the veth pair.
    pub fn veth_inner(&self) -> String {
        format!("vethi{}", self.vm)
    }

    /// Name of the VM's systemd service.
    pub fn service_name(&self) -> String {
        format!("{}.service", self.vm)
    }

    /// Name of the DNS helper's systemd service.
    pub fn dnsmasq_service_name(&self) -> String {
        format!("{}-dnsmasq.service", self.vm)
    }

    /// Installed VM service unit.
    pub fn service_unit(&self) -> PathBuf {
        self.systemd_dir.join(self.service_name())
    }

    /// Installed DNS helper unit.
    pub fn dnsmasq_unit(&self) -> PathBuf {
        self.systemd_dir.join(self.dnsmasq_service_name())
    }
}

/// Name of the SPDK crypto key of an encrypted device.
pub fn crypto_key_name(device_id: &str) -> String {
    format!("{}_key", device_id)
}

/// Name of the plaintext AIO device under an encrypted device.
pub fn aio_bdev_name(device_id: &str) -> String {
    format!("{}_aio", device_id)
}
