//! Per-VM block storage.
//!
//! Every volume is a sparse raw file under `<storage_root>/<vm>/<index>/`,
//! served by SPDK as an AIO device (optionally wrapped in an AES-XTS crypto
//! device) behind a vhost-user block controller whose socket is linked into
//! the disk directory for the VM monitor.

pub mod image;
pub mod keys;
pub mod spdk;

pub use image::ImageCache;
pub use keys::{EncryptionMode, KeyMaterial, WrappedKey};
pub use spdk::SpdkRpc;

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::executor::{Cmd, Executor};
use crate::paths::{aio_bdev_name, crypto_key_name, validate_device_id, VmPaths};
use image::remove_if_exists;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use vmhost_protocol::{StorageVolumeSpec, WrappingSecret};

const GIB: u64 = 1024 * 1024 * 1024;

/// Block size `spdk_dd` copies with.
const DD_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// Storage operations of one VM.
pub struct StorageVolumeManager<'a> {
    exec: &'a dyn Executor,
    paths: &'a VmPaths,
    config: &'a AgentConfig,
}

impl<'a> StorageVolumeManager<'a> {
    pub fn new(exec: &'a dyn Executor, paths: &'a VmPaths, config: &'a AgentConfig) -> Self {
        Self {
            exec,
            paths,
            config,
        }
    }

    fn spdk(&self) -> SpdkRpc<'a> {
        SpdkRpc::new(self.exec, self.config)
    }

    fn owner(&self) -> String {
        format!("{0}:{0}", self.paths.vm())
    }

    /// Create the sparse disk file of `spec`, owned by the VM user.
    pub fn allocate_disk_file(&self, spec: &StorageVolumeSpec) -> Result<PathBuf> {
        let dir = self.paths.disk_dir(spec.disk_index);
        let disk = self.paths.disk_file(spec.disk_index);
        fs::create_dir_all(&dir)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&disk)?;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;

        let disk_arg = disk.to_string_lossy();
        self.exec
            .run(&Cmd::new("chown").argv(&[&self.owner(), &dir.to_string_lossy()]))?;
        self.exec
            .run(&Cmd::new("chown").argv(&[&self.owner(), &disk_arg]))?;
        self.exec.run(&Cmd::new("setfacl").argv(&[
            "-m",
            &format!("u:{}:rw", self.config.spdk_user),
            &disk_arg,
        ]))?;

        file.set_len(spec.size_gib * GIB)?;
        tracing::info!(
            disk_index = spec.disk_index,
            size_gib = spec.size_gib,
            path = %disk.display(),
            "disk file allocated"
        );
        Ok(disk)
    }

    /// Fetch the boot image into the cache.
    pub fn acquire_boot_image(&self, name: &str, url: Option<&str>) -> Result<PathBuf> {
        ImageCache::new(self.exec, self.config).acquire(name, url)
    }

    /// Copy the cached image `image_name` into `disk_file` through `spdk_dd`.
    ///
    /// Fails with [`Error::ImageTooLarge`] before running anything if the
    /// image does not fit.
    pub fn materialize_boot_volume(
        &self,
        disk_file: &Path,
        image_name: &str,
        size_gib: u64,
        encryption: &EncryptionMode,
    ) -> Result<()> {
        let image = ImageCache::new(self.exec, self.config).raw_path(image_name);
        let image_bytes = fs::metadata(&image)?.len();
        if image_bytes > size_gib * GIB {
            return Err(Error::ImageTooLarge {
                image: image_name.to_string(),
                image_bytes,
                size_gib,
            });
        }

        let (dd_config, sink) = spdk::dd_config(disk_file, encryption);
        let rpc_socket = disk_file.with_file_name("spdk_dd.sock");
        let cmd = Cmd::new(self.config.spdk_dd.to_string_lossy())
            .argv(&[
                "--config",
                "/dev/stdin",
                "--disable-cpumask-locks",
                "--rpc-socket",
                &rpc_socket.to_string_lossy(),
                "--if",
                &image.to_string_lossy(),
                "--ob",
                sink,
                &format!("--bs={}", DD_BLOCK_SIZE),
            ])
            .stdin_json(&dd_config)?;

        tracing::info!(image = image_name, sink, path = %disk_file.display(), "writing boot image");
        self.exec.run(&cmd)?;
        Ok(())
    }

    /// Generate, wrap and persist the data-encryption key of `disk_index`.
    pub fn derive_data_encryption_key(
        &self,
        disk_index: u32,
        secret: &WrappingSecret,
    ) -> Result<KeyMaterial> {
        let path = self.paths.key_file(disk_index);
        let key = KeyMaterial::generate()?;
        let wrapped = key.wrap(secret, &path)?;
        keys::write_key_file(&path, &wrapped)?;
        self.exec
            .run(&Cmd::new("chown").argv(&[&self.owner(), &path.to_string_lossy()]))?;
        tracing::info!(disk_index, path = %path.display(), "data-encryption key written");
        Ok(key)
    }

    /// Read back and unwrap the data-encryption key of `disk_index`.
    pub fn read_data_encryption_key(
        &self,
        disk_index: u32,
        secret: &WrappingSecret,
    ) -> Result<KeyMaterial> {
        let path = self.paths.key_file(disk_index);
        keys::read_key_file(&path)?.unwrap_with(secret, &path)
    }

    /// Create the SPDK block devices serving `disk_file` as `device_id`.
    pub fn expose_block_device(
        &self,
        device_id: &str,
        disk_file: &Path,
        encryption: &EncryptionMode,
    ) -> Result<()> {
        self.spdk()
            .create_volume_bdevs(device_id, disk_file, encryption)?;
        tracing::info!(
            device_id,
            encrypted = encryption.key_material().is_some(),
            "block device exposed"
        );
        Ok(())
    }

    /// Create the vhost controller of `device_id`, link it into the disk
    /// directory and hand the socket to the VM user.
    pub fn expose_vhost_controller(&self, disk_index: u32, device_id: &str) -> Result<PathBuf> {
        validate_device_id(device_id)?;
        let socket = self.paths.vhost_socket(device_id);
        let link = self.paths.vhost_link(disk_index);
        let socket_arg = socket.to_string_lossy();
        let vm_acl = format!("u:{}:rw", self.paths.vm());

        self.spdk()
            .vhost_create_blk_controller(device_id, device_id)?;
        self.exec
            .run(&Cmd::new("chmod").argv(&["0600", &socket_arg]))?;

        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link)?;
        }
        std::os::unix::fs::symlink(&socket, &link)?;
        self.exec
            .run(&Cmd::new("chown").argv(&[&self.owner(), &socket_arg]))?;
        self.exec
            .run(&Cmd::new("setfacl").argv(&["-m", &vm_acl, &socket_arg]))?;

        tracing::info!(device_id, disk_index, socket = %socket.display(), "vhost controller exposed");
        Ok(link)
    }

    /// Remove the SPDK objects and controller socket of `spec`.
    ///
    /// Objects that are already gone are skipped. Every delete is attempted
    /// even after a failure; the first failure is returned.
    pub fn teardown_volume(&self, spec: &StorageVolumeSpec) -> Result<()> {
        let id = spec.device_id.as_str();
        validate_device_id(id)?;
        let spdk = self.spdk();
        let aio = aio_bdev_name(id);
        let key = crypto_key_name(id);

        let mut results = vec![spdk.vhost_delete_controller(id)];
        if spec.encrypted {
            results.push(spdk.bdev_crypto_delete(id));
            results.push(spdk.bdev_aio_delete(&aio));
            results.push(spdk.accel_crypto_key_destroy(&key));
        } else {
            results.push(spdk.bdev_aio_delete(id));
        }
        results.push(remove_if_exists(&self.paths.vhost_socket(id)));

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                tracing::warn!(device_id = id, error = %e, "volume teardown step failed");
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        tracing::info!(device_id = id, disk_index = spec.disk_index, "volume torn down");
        Ok(())
    }
}
