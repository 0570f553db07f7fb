//! Types exchanged between the provisioning orchestrator and vmhost.
//!
//! Everything here is plain serde data: the parameter document handed to
//! `vmhost setup` (and persisted as the VM's `prep.json` manifest), and the
//! key-wrapping secrets fed on standard input. Parsing of addresses and
//! validation happen on the host side, in the `vmhost` crate.

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// File name of the persisted parameter manifest inside the VM home.
pub const MANIFEST_FILENAME: &str = "prep.json";

/// The only key-wrapping algorithm accepted for storage secrets.
pub const WRAP_ALGORITHM: &str = "aes-256-gcm";

/// Errors produced while decoding boundary documents.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// JSON could not be parsed or produced.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A base64 field did not decode.
    #[error("invalid base64 in field '{field}': {reason}")]
    Base64 { field: &'static str, reason: String },
}

/// One disk attached to a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageVolumeSpec {
    /// Ordinal of the disk, unique within the VM.
    pub disk_index: u32,
    /// Handle exposed to the VM monitor; names the SPDK resources.
    pub device_id: String,
    /// Capacity in GiB.
    pub size_gib: u64,
    /// Whether the boot image is written onto this volume.
    #[serde(default)]
    pub boot: bool,
    /// Whether the volume is encrypted at rest.
    #[serde(default)]
    pub encrypted: bool,
}

/// A network interface handed to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicDescriptor {
    /// IPv6 network delegated to this NIC (`addr/len`).
    pub net6: String,
    /// Private IPv4 network of this NIC, if any.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub net4: Option<String>,
    /// Tap device name inside the VM's namespace.
    pub tap: String,
    /// Guest-side MAC address.
    pub mac: String,
}

/// Memory and CPU sizing for the VM monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmResources {
    /// Number of vCPUs.
    pub vcpus: u32,
    /// Guest memory in GiB, reserved as hugepages.
    pub mem_gib: u64,
}

/// Parameters of `setup` and `recreate_unpersisted`.
///
/// Persisted verbatim as the VM manifest so the storage volume list can be
/// reread after a reboot or by `purge`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmParams {
    /// Global unicast IPv6 prefix assigned to the VM.
    pub public_ipv6: String,
    /// Public IPv4 address; absent (or empty) for IPv6-only VMs.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub public_ipv4: Option<String>,
    /// Host-local IPv4 address used for the veth link.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub local_ipv4: Option<String>,
    /// Guest network interfaces.
    #[serde(default)]
    pub nics: Vec<NicDescriptor>,
    /// Route the whole guest range to the first NIC.
    #[serde(default)]
    pub single_nic: bool,
    /// Publish NDP proxy entries on the host uplink.
    #[serde(default)]
    pub ndp_needed: bool,
    /// Logical name of the boot image.
    pub boot_image: String,
    /// Source URL overriding the configured image table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_image_url: Option<String>,
    /// CPU and memory sizing.
    pub resources: VmResources,
    /// Attached disks, in the order the monitor sees them.
    #[serde(default)]
    pub storage_volumes: Vec<StorageVolumeSpec>,
}

impl VmParams {
    /// Parse a parameter document.
    pub fn from_json(data: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(data)?)
    }

    /// Render the document as it is stored in the manifest.
    pub fn to_json_pretty(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Storage volumes sorted by disk index.
    pub fn volumes_by_index(&self) -> Vec<&StorageVolumeSpec> {
        let mut volumes: Vec<_> = self.storage_volumes.iter().collect();
        volumes.sort_by_key(|v| v.disk_index);
        volumes
    }
}

/// Subset of the manifest that `purge` needs.
///
/// Decoding only this keeps purge working against manifests written by
/// other versions of the agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageManifest {
    #[serde(default)]
    pub storage_volumes: Vec<StorageVolumeSpec>,
    /// Whether setup added NDP proxy entries on the host uplink.
    #[serde(default)]
    pub ndp_needed: bool,
}

/// Externally supplied secret used to wrap a data-encryption key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappingSecret {
    /// Wrapping algorithm identifier, e.g. `aes-256-gcm`.
    pub algorithm: String,
    /// Base64 wrapping key.
    pub key: String,
    /// Base64 initialisation vector.
    pub init_vector: String,
    /// Additional authenticated data.
    pub auth_data: String,
}

impl WrappingSecret {
    /// Decoded wrapping key bytes.
    pub fn key_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        decode_b64("key", &self.key)
    }

    /// Decoded IV bytes.
    pub fn iv_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        decode_b64("init_vector", &self.init_vector)
    }
}

impl std::fmt::Debug for WrappingSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingSecret")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .field("init_vector", &"<redacted>")
            .field("auth_data", &self.auth_data)
            .finish()
    }
}

/// Secrets keyed by `device_id`, as read from standard input.
pub type StorageSecrets = BTreeMap<String, WrappingSecret>;

/// Parse a secrets document. Empty input means no secrets.
pub fn parse_secrets(data: &str) -> Result<StorageSecrets, ProtocolError> {
    if data.trim().is_empty() {
        return Ok(StorageSecrets::new());
    }
    Ok(serde_json::from_str(data)?)
}

/// Decode base64, ignoring embedded line breaks (MIME-style encoders wrap
/// at 60 columns).
pub fn decode_b64(field: &'static str, value: &str) -> Result<Vec<u8>, ProtocolError> {
    let compact: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| ProtocolError::Base64 {
            field,
            reason: e.to_string(),
        })
}

fn empty_as_none<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(d)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}
