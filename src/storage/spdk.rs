//! SPDK control plane: `rpc.py` calls and the `spdk_dd` device config.

use super::keys::{EncryptionMode, KeyMaterial};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::executor::{ignore_absent, Cmd, Executor};
use crate::paths::{aio_bdev_name, crypto_key_name};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Stderr fragments SPDK uses for objects that do not exist.
pub const SPDK_ABSENT: &[&str] = &["No such device", "does not exist", "not found"];

/// Block size of AIO devices.
const AIO_BLOCK_SIZE: &str = "512";

/// Plaintext sink inside `spdk_dd`.
pub const DD_PLAIN_SINK: &str = "aio0";

/// Encrypted sink inside `spdk_dd`.
pub const DD_CRYPT_SINK: &str = "crypt0";

const DD_KEY_NAME: &str = "dd_key";

/// Client for the long-running SPDK target.
pub struct SpdkRpc<'a> {
    exec: &'a dyn Executor,
    rpc: PathBuf,
    socket: PathBuf,
}

impl<'a> SpdkRpc<'a> {
    pub fn new(exec: &'a dyn Executor, config: &AgentConfig) -> Self {
        Self {
            exec,
            rpc: config.spdk_rpc.clone(),
            socket: config.spdk_socket.clone(),
        }
    }

    fn call(&self, method: &str) -> Cmd {
        Cmd::new(self.rpc.to_string_lossy())
            .argv(&["-s", &self.socket.to_string_lossy(), method])
    }

    /// Register `key` under `name`.
    pub fn accel_crypto_key_create(&self, name: &str, key: &KeyMaterial) -> Result<()> {
        let cmd = self
            .call("accel_crypto_key_create")
            .argv(&["-c", key.cipher(), "-k"])
            .secret_arg(key.key_hex())
            .arg("-e")
            .secret_arg(key.key2_hex())
            .argv(&["-n", name]);
        self.exec.run(&cmd)?;
        Ok(())
    }

    pub fn accel_crypto_key_destroy(&self, name: &str) -> Result<()> {
        let cmd = self.call("accel_crypto_key_destroy").argv(&["-n", name]);
        ignore_absent(self.exec.run(&cmd), SPDK_ABSENT)
    }

    /// Create an AIO block device over `file`.
    pub fn bdev_aio_create(&self, file: &Path, name: &str) -> Result<()> {
        let cmd = self
            .call("bdev_aio_create")
            .argv(&[&file.to_string_lossy(), name, AIO_BLOCK_SIZE]);
        self.exec.run(&cmd)?;
        Ok(())
    }

    pub fn bdev_aio_delete(&self, name: &str) -> Result<()> {
        let cmd = self.call("bdev_aio_delete").arg(name);
        ignore_absent(self.exec.run(&cmd), SPDK_ABSENT)
    }

    /// Create crypto device `name` over `base`, keyed by `key_name`.
    pub fn bdev_crypto_create(&self, key_name: &str, base: &str, name: &str) -> Result<()> {
        let cmd = self
            .call("bdev_crypto_create")
            .argv(&["-n", key_name, base, name]);
        self.exec.run(&cmd)?;
        Ok(())
    }

    pub fn bdev_crypto_delete(&self, name: &str) -> Result<()> {
        let cmd = self.call("bdev_crypto_delete").arg(name);
        ignore_absent(self.exec.run(&cmd), SPDK_ABSENT)
    }

    /// Create a vhost-user block controller `name` serving `bdev`.
    pub fn vhost_create_blk_controller(&self, name: &str, bdev: &str) -> Result<()> {
        let cmd = self
            .call("vhost_create_blk_controller")
            .argv(&[name, bdev]);
        self.exec.run(&cmd)?;
        Ok(())
    }

    pub fn vhost_delete_controller(&self, name: &str) -> Result<()> {
        let cmd = self.call("vhost_delete_controller").arg(name);
        ignore_absent(self.exec.run(&cmd), SPDK_ABSENT)
    }

    /// Create the block devices for `device_id`.
    ///
    /// Encrypted: key `<id>_key`, AIO `<id>_aio`, crypto `<id>`.
    /// Plain: AIO `<id>`.
    pub fn create_volume_bdevs(
        &self,
        device_id: &str,
        disk_file: &Path,
        encryption: &EncryptionMode,
    ) -> Result<()> {
        match encryption {
            EncryptionMode::Encrypted(key) => {
                let key_name = crypto_key_name(device_id);
                let aio = aio_bdev_name(device_id);
                self.accel_crypto_key_create(&key_name, key)?;
                self.bdev_aio_create(disk_file, &aio)?;
                self.bdev_crypto_create(&key_name, &aio, device_id)
            }
            EncryptionMode::Plain => self.bdev_aio_create(disk_file, device_id),
        }
    }
}

/// `spdk_dd` JSON config for writing into `disk_file`.
///
/// Returns the config and the name of the output device.
pub fn dd_config(disk_file: &Path, encryption: &EncryptionMode) -> (Value, &'static str) {
    let mut bdevs = vec![json!({
        "method": "bdev_aio_create",
        "params": {
            "name": DD_PLAIN_SINK,
            "filename": disk_file.to_string_lossy(),
            "block_size": 512,
            "readonly": false,
        }
    })];
    let mut subsystems = Vec::new();

    let sink = match encryption {
        EncryptionMode::Plain => DD_PLAIN_SINK,
        EncryptionMode::Encrypted(key) => {
            subsystems.push(json!({
                "subsystem": "accel",
                "config": [{
                    "method": "accel_crypto_key_create",
                    "params": {
                        "name": DD_KEY_NAME,
                        "cipher": key.cipher(),
                        "key": key.key_hex(),
                        "key2": key.key2_hex(),
                    }
                }]
            }));
            bdevs.push(json!({
                "method": "bdev_crypto_create",
                "params": {
                    "base_bdev_name": DD_PLAIN_SINK,
                    "name": DD_CRYPT_SINK,
                    "key_name": DD_KEY_NAME,
                }
            }));
            DD_CRYPT_SINK
        }
    };

    subsystems.push(json!({ "subsystem": "bdev", "config": bdevs }));
    (json!({ "subsystems": subsystems }), sink)
}
