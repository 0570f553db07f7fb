//! The three entry points driven by the external orchestrator.
//!
//! [`Lifecycle::setup`] provisions a VM from scratch,
//! [`Lifecycle::recreate_unpersisted`] rebuilds the resources a host reboot
//! loses from what setup persisted, and [`Lifecycle::purge`] removes
//! everything.

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::executor::{ignore_absent, Cmd, Executor};
use crate::net::{NetworkConfigurator, NetworkParams};
use crate::paths::{validate_device_id, VmIdentity, VmPaths};
use crate::storage::{EncryptionMode, StorageVolumeManager};
use crate::units::{self, UnitInstaller};
use std::collections::BTreeSet;
use std::fs;
use vmhost_protocol::{StorageManifest, StorageSecrets, StorageVolumeSpec, VmParams, WrappingSecret};

const USER_EXISTS: &[&str] = &["already exists"];
const USER_ABSENT: &[&str] = &["does not exist"];
const NOT_MOUNTED: &[&str] = &["not mounted", "no mount point specified", "No such file or directory"];

/// Lifecycle operations of one VM.
pub struct Lifecycle<'a> {
    exec: &'a dyn Executor,
    config: &'a AgentConfig,
    paths: VmPaths,
}

impl<'a> Lifecycle<'a> {
    pub fn new(exec: &'a dyn Executor, config: &'a AgentConfig, vm: &VmIdentity) -> Self {
        Self {
            exec,
            config,
            paths: VmPaths::new(vm, config),
        }
    }

    /// Paths of the VM.
    pub fn paths(&self) -> &VmPaths {
        &self.paths
    }

    fn storage(&self) -> StorageVolumeManager<'_> {
        StorageVolumeManager::new(self.exec, &self.paths, self.config)
    }

    fn network(&self) -> NetworkConfigurator<'_> {
        NetworkConfigurator::new(self.exec, &self.paths, self.config)
    }

    fn vm(&self) -> &str {
        self.paths.vm().as_str()
    }

    /// Provision the VM.
    pub fn setup(&self, params: &VmParams, secrets: &StorageSecrets) -> Result<()> {
        let net = validate(params, secrets)?;
        tracing::info!(vm = self.vm(), volumes = params.storage_volumes.len(), "setting up vm");

        self.create_user()?;
        self.write_manifest(params)?;

        let storage = self.storage();
        for spec in params.volumes_by_index() {
            let disk = storage.allocate_disk_file(spec)?;
            let encryption = match secret_for(spec, secrets)? {
                Some(secret) => EncryptionMode::Encrypted(
                    storage.derive_data_encryption_key(spec.disk_index, secret)?,
                ),
                None => EncryptionMode::Plain,
            };
            if spec.boot {
                storage.acquire_boot_image(&params.boot_image, params.boot_image_url.as_deref())?;
                storage.materialize_boot_volume(
                    &disk,
                    &params.boot_image,
                    spec.size_gib,
                    &encryption,
                )?;
            }
            storage.expose_block_device(&spec.device_id, &disk, &encryption)?;
            storage.expose_vhost_controller(spec.disk_index, &spec.device_id)?;
        }

        self.network().configure(&net, true)?;
        self.mount_hugepages(params.resources.mem_gib)?;
        self.install_units(params, &net)?;

        tracing::info!(vm = self.vm(), "setup complete");
        Ok(())
    }

    /// Rebuild the resources a host reboot loses.
    ///
    /// Uses the persisted ranges and key files; never downloads images or
    /// generates keys.
    pub fn recreate_unpersisted(&self, params: &VmParams, secrets: &StorageSecrets) -> Result<()> {
        let net = validate(params, secrets)?;
        tracing::info!(vm = self.vm(), "recreating unpersisted resources");

        self.network().configure(&net, false)?;
        self.mount_hugepages(params.resources.mem_gib)?;

        let storage = self.storage();
        for spec in params.volumes_by_index() {
            let disk = self.paths.disk_file(spec.disk_index);
            let encryption = match secret_for(spec, secrets)? {
                Some(secret) => EncryptionMode::Encrypted(
                    storage.read_data_encryption_key(spec.disk_index, secret)?,
                ),
                None => EncryptionMode::Plain,
            };
            storage.expose_block_device(&spec.device_id, &disk, &encryption)?;
            storage.expose_vhost_controller(spec.disk_index, &spec.device_id)?;
        }

        tracing::info!(vm = self.vm(), "recreate complete");
        Ok(())
    }

    /// Remove every trace of the VM.
    ///
    /// Missing resources are skipped. A failing step is logged and the
    /// remaining steps still run; the first failure is returned at the end.
    pub fn purge(&self) -> Result<()> {
        tracing::info!(vm = self.vm(), "purging vm");
        let mut first_error: Option<Error> = None;
        let mut step = |name: &str, result: Result<()>| {
            if let Err(e) = result {
                tracing::warn!(vm = self.vm(), step = name, error = %e, "purge step failed");
                first_error.get_or_insert(e);
            }
        };

        // Read before the home directory goes away with the user.
        let manifest = match self.persisted_manifest() {
            Ok(manifest) => manifest,
            Err(e) => {
                step("read manifest", Err(e));
                StorageManifest::default()
            }
        };
        let ranges = if manifest.ndp_needed {
            match self.network().load_ranges() {
                Ok(ranges) => ranges,
                Err(e) => {
                    step("read ranges", Err(e));
                    None
                }
            }
        } else {
            None
        };

        step("delete namespace", self.network().delete_namespace());
        step(
            "remove units",
            UnitInstaller::new(self.exec, &self.paths).remove(),
        );
        step("unmount hugepages", self.unmount_hugepages());

        let storage = self.storage();
        for spec in &manifest.storage_volumes {
            step("teardown volume", storage.teardown_volume(spec));
        }
        if let Some(ranges) = &ranges {
            step("remove ndp proxies", self.network().remove_ndp_proxies(ranges));
        }

        step("delete user", self.delete_user());
        step("remove storage", remove_dir_if_exists(self.paths.storage_dir()));

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(vm = self.vm(), "purge complete");
                Ok(())
            }
        }
    }

    /// Parameters persisted by setup, if any.
    pub fn load_manifest(&self) -> Result<Option<VmParams>> {
        let path = self.paths.manifest();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(VmParams::from_json(&fs::read_to_string(path)?)?))
    }

    /// What purge needs from the persisted manifest, volumes in disk-index
    /// order. Empty when there is no manifest.
    fn persisted_manifest(&self) -> Result<StorageManifest> {
        let path = self.paths.manifest();
        if !path.exists() {
            tracing::debug!(vm = self.vm(), "no manifest, no volumes to tear down");
            return Ok(StorageManifest::default());
        }
        let mut manifest: StorageManifest = serde_json::from_str(&fs::read_to_string(path)?)?;
        manifest.storage_volumes.sort_by_key(|v| v.disk_index);
        Ok(manifest)
    }

    fn create_user(&self) -> Result<()> {
        let home = self.paths.home().to_string_lossy();
        let result = self.exec.run(&Cmd::new("adduser").argv(&[
            "--disabled-password",
            "--gecos",
            "",
            "--home",
            &home,
            self.vm(),
        ]));
        ignore_absent(result, USER_EXISTS)?;
        fs::create_dir_all(self.paths.home())?;
        Ok(())
    }

    fn delete_user(&self) -> Result<()> {
        let result = self
            .exec
            .run(&Cmd::new("deluser").argv(&["--remove-home", self.vm()]));
        ignore_absent(result, USER_ABSENT)?;
        remove_dir_if_exists(self.paths.home())
    }

    fn write_manifest(&self, params: &VmParams) -> Result<()> {
        fs::write(self.paths.manifest(), params.to_json_pretty()?)?;
        Ok(())
    }

    fn mount_hugepages(&self, mem_gib: u64) -> Result<()> {
        let dir = self.paths.hugepages();
        let dir_arg = dir.to_string_lossy();
        fs::create_dir_all(&dir)?;
        self.exec.run(
            &Cmd::new("chown").argv(&[&format!("{0}:{0}", self.vm()), &dir_arg]),
        )?;
        self.exec.run(&Cmd::new("mount").argv(&[
            "-t",
            "hugetlbfs",
            "-o",
            &format!("uid={},size={}G", self.vm(), mem_gib),
            "nodev",
            &dir_arg,
        ]))?;
        Ok(())
    }

    fn unmount_hugepages(&self) -> Result<()> {
        let dir = self.paths.hugepages();
        let result = self
            .exec
            .run(&Cmd::new("umount").arg(dir.to_string_lossy()));
        ignore_absent(result, NOT_MOUNTED)
    }

    fn install_units(&self, params: &VmParams, net: &NetworkParams) -> Result<()> {
        let ranges = match self.network().load_ranges()? {
            Some(ranges) => ranges,
            None => self.network().partition_ephemeral_space(&net.gua)?,
        };
        let service = units::render_vm_service(
            &self.paths,
            self.config,
            &params.resources,
            net,
            &params.volumes_by_index(),
        );
        let dnsmasq = units::render_dnsmasq_conf(net, &ranges);
        UnitInstaller::new(self.exec, &self.paths).install(&service, &dnsmasq)
    }
}

/// Check the parameters before anything on the host is touched.
pub fn validate(params: &VmParams, secrets: &StorageSecrets) -> Result<NetworkParams> {
    let mut indexes = BTreeSet::new();
    let mut device_ids = BTreeSet::new();
    let mut boot = 0;
    for spec in &params.storage_volumes {
        if !indexes.insert(spec.disk_index) {
            return Err(Error::params(format!(
                "duplicate disk_index {}",
                spec.disk_index
            )));
        }
        validate_device_id(&spec.device_id)?;
        if !device_ids.insert(spec.device_id.as_str()) {
            return Err(Error::params(format!(
                "duplicate device_id '{}'",
                spec.device_id
            )));
        }
        if spec.size_gib == 0 {
            return Err(Error::params(format!(
                "volume {} has zero size",
                spec.device_id
            )));
        }
        if spec.boot {
            boot += 1;
        }
        secret_for(spec, secrets)?;
    }
    if boot > 1 {
        return Err(Error::params("more than one boot volume"));
    }
    if params.resources.vcpus == 0 || params.resources.mem_gib == 0 {
        return Err(Error::params("vcpus and mem_gib must be positive"));
    }

    let net = NetworkParams::from_params(params)?;
    if net.ip4.is_some() && net.local_ip4.is_none() {
        return Err(Error::params(
            "local_ipv4 is required when public_ipv4 is set",
        ));
    }
    Ok(net)
}

/// The wrapping secret of an encrypted volume; `None` for plain volumes.
fn secret_for<'s>(
    spec: &StorageVolumeSpec,
    secrets: &'s StorageSecrets,
) -> Result<Option<&'s WrappingSecret>> {
    if !spec.encrypted {
        return Ok(None);
    }
    secrets.get(&spec.device_id).map(Some).ok_or_else(|| {
        Error::params(format!(
            "no wrapping secret for encrypted volume {}",
            spec.device_id
        ))
    })
}

fn remove_dir_if_exists(path: &std::path::Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
