//! systemd units for the VM monitor and its DNS/DHCP helper.

use crate::config::AgentConfig;
use crate::error::Result;
use crate::executor::{ignore_absent, Cmd, Executor};
use crate::net::{addr::format_mac, EphemeralRanges, NetworkParams};
use crate::paths::VmPaths;
use crate::storage::image::remove_if_exists;
use std::fmt::Write as _;
use vmhost_protocol::{StorageVolumeSpec, VmResources};

const DNSMASQ_BIN: &str = "/usr/sbin/dnsmasq";

/// Stderr of `systemctl` for units it does not know.
const UNIT_ABSENT: &[&str] = &["not loaded", "does not exist", "No such file"];

const DNS_SERVERS: [&str; 2] = ["2620:fe::fe", "2620:fe::9"];

/// Monitor service running the VM inside its namespace as the VM user.
pub fn render_vm_service(
    paths: &VmPaths,
    config: &AgentConfig,
    resources: &VmResources,
    net: &NetworkParams,
    volumes: &[&StorageVolumeSpec],
) -> String {
    let vm = paths.vm();
    let disks = volumes
        .iter()
        .map(|v| {
            format!(
                "vhost_user=true,socket={},num_queues=1,queue_size=256",
                paths.vhost_link(v.disk_index).display()
            )
        })
        .collect::<Vec<_>>()
        .join(" ");
    let nics = net
        .nics
        .iter()
        .map(|n| format!("mac={},tap={},ip=,mask=", format_mac(&n.mac), n.tap))
        .collect::<Vec<_>>()
        .join(" ");

    let mut exec_start = format!(
        "{} -v --api-socket path={}/ch-api.sock --kernel {}",
        config.hypervisor_bin.display(),
        paths.home().display(),
        config.firmware.display(),
    );
    if !disks.is_empty() {
        let _ = write!(exec_start, " --disk {}", disks);
    }
    let _ = write!(
        exec_start,
        " --console off --serial file={}/serial.log --cpus boot={} --memory size={}G,hugepages=on,hugepage_size=1G --net {}",
        paths.home().display(),
        resources.vcpus,
        resources.mem_gib,
        nics,
    );

    format!(
        "\
[Unit]
Description={vm}
After=network.target
After={dnsmasq}
Requires={dnsmasq}

[Service]
NetworkNamespacePath=/var/run/netns/{vm}
ExecStart={exec_start}
User={vm}
Group={vm}
LimitNOFILE=500000
",
        dnsmasq = paths.dnsmasq_service_name(),
    )
}

/// DNS/DHCP helper service, sharing the VM's namespace.
pub fn render_dnsmasq_service(paths: &VmPaths) -> String {
    let vm = paths.vm();
    let conf = paths.dnsmasq_conf();
    format!(
        "\
[Unit]
Description=DHCP and DNS for {vm}
After=network.target

[Service]
NetworkNamespacePath=/var/run/netns/{vm}
Type=simple
ExecStartPre={DNSMASQ_BIN} --test -C {conf}
ExecStart={DNSMASQ_BIN} -k -h -C {conf} --user={vm} --group={vm}
ExecReload=/bin/kill -HUP $MAINPID
ProtectSystem=strict
PrivateDevices=yes
",
        conf = conf.display(),
    )
}

/// dnsmasq configuration handing each tap its guest addresses.
///
/// The first NIC leases the third address of the guest range.
pub fn render_dnsmasq_conf(net: &NetworkParams, ranges: &EphemeralRanges) -> String {
    let mut conf = String::from(
        "\
pid-file=
leasefile-ro
enable-ra
dhcp-authoritative
domain-needed
bogus-priv
no-resolv
bind-interfaces
dns-forward-max=10000
",
    );
    for server in DNS_SERVERS {
        let _ = writeln!(conf, "server={}", server);
    }
    let _ = writeln!(conf, "dhcp-option=option6:dns-server,{}", DNS_SERVERS.join(","));

    for (i, nic) in net.nics.iter().enumerate() {
        let _ = writeln!(conf, "interface={}", nic.tap);
        let (net6, lease) = if i == 0 {
            (ranges.guest, ranges.guest.nth(2))
        } else {
            (nic.net6, nic.net6.nth(2))
        };
        if let Some(lease) = lease {
            let _ = writeln!(
                conf,
                "dhcp-range={},{},{},{}",
                nic.tap,
                lease,
                lease,
                net6.prefix_len()
            );
        }
        if let Some(lease4) = nic.guest_ip4() {
            let _ = writeln!(conf, "dhcp-range={},{},{},6h", nic.tap, lease4, lease4);
        }
        let _ = writeln!(conf, "dhcp-host={}", format_mac(&nic.mac));
    }
    conf
}

/// Installs and removes the units of one VM.
pub struct UnitInstaller<'a> {
    exec: &'a dyn Executor,
    paths: &'a VmPaths,
}

impl<'a> UnitInstaller<'a> {
    pub fn new(exec: &'a dyn Executor, paths: &'a VmPaths) -> Self {
        Self { exec, paths }
    }

    /// Write the dnsmasq config and both units, then reload systemd.
    pub fn install(&self, vm_service: &str, dnsmasq_conf: &str) -> Result<()> {
        let unit = self.paths.service_unit();
        if let Some(dir) = unit.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(self.paths.dnsmasq_conf(), dnsmasq_conf)?;
        std::fs::write(
            self.paths.dnsmasq_unit(),
            render_dnsmasq_service(self.paths),
        )?;
        std::fs::write(&unit, vm_service)?;
        self.exec
            .run(&Cmd::new("systemctl").arg("daemon-reload"))?;
        tracing::info!(vm = %self.paths.vm(), unit = %unit.display(), "units installed");
        Ok(())
    }

    /// Stop, disable and delete both units, then reload systemd.
    pub fn remove(&self) -> Result<()> {
        for name in [
            self.paths.service_name(),
            self.paths.dnsmasq_service_name(),
        ] {
            let result = self
                .exec
                .run(&Cmd::new("systemctl").argv(&["disable", "--now", &name]));
            ignore_absent(result, UNIT_ABSENT)?;
        }
        remove_if_exists(&self.paths.service_unit())?;
        remove_if_exists(&self.paths.dnsmasq_unit())?;
        self.exec
            .run(&Cmd::new("systemctl").arg("daemon-reload"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingExecutor;
    use crate::paths::VmIdentity;
    use vmhost_protocol::{NicDescriptor, VmParams};

    fn params() -> VmParams {
        VmParams {
            public_ipv6: "2a01:4f9:2b:35b:7e40::/79".to_string(),
            public_ipv4: None,
            local_ipv4: None,
            nics: vec![NicDescriptor {
                net6: "fd10:9b0b:6b4b:8fbb::/64".to_string(),
                net4: Some("10.0.0.4/30".to_string()),
                tap: "tapvm1".to_string(),
                mac: "52:54:00:12:34:56".to_string(),
            }],
            single_nic: true,
            ndp_needed: false,
            boot_image: "ubuntu-jammy".to_string(),
            boot_image_url: None,
            resources: VmResources {
                vcpus: 2,
                mem_gib: 4,
            },
            storage_volumes: vec![StorageVolumeSpec {
                disk_index: 0,
                device_id: "vm1_0".to_string(),
                size_gib: 20,
                boot: true,
                encrypted: true,
            }],
        }
    }

    #[test]
    fn test_vm_service() {
        let config = AgentConfig::default();
        let paths = VmPaths::new(&VmIdentity::new("vm1").unwrap(), &config);
        let p = params();
        let net = NetworkParams::from_params(&p).unwrap();
        let unit = render_vm_service(
            &paths,
            &config,
            &p.resources,
            &net,
            &p.volumes_by_index(),
        );
        assert!(unit.contains("NetworkNamespacePath=/var/run/netns/vm1\n"));
        assert!(unit.contains("Requires=vm1-dnsmasq.service\n"));
        assert!(unit.contains("User=vm1\n"));
        assert!(unit.contains("--disk vhost_user=true,socket=/var/storage/vm1/0/vhost.sock,"));
        assert!(unit.contains("--cpus boot=2 --memory size=4G,hugepages=on"));
        assert!(unit.contains("--net mac=52:54:00:12:34:56,tap=tapvm1,ip=,mask="));
    }

    #[test]
    fn test_dnsmasq_conf_leases() {
        let p = params();
        let net = NetworkParams::from_params(&p).unwrap();
        let ranges = EphemeralRanges {
            guest: "2a01:4f9:2b:35b:7e40::/80".parse().unwrap(),
            host: "2a01:4f9:2b:35b:7e41::/80".parse().unwrap(),
        };
        let conf = render_dnsmasq_conf(&net, &ranges);
        assert!(conf.contains("interface=tapvm1\n"));
        assert!(conf.contains("dhcp-range=tapvm1,2a01:4f9:2b:35b:7e40::2,2a01:4f9:2b:35b:7e40::2,80\n"));
        assert!(conf.contains("dhcp-range=tapvm1,10.0.0.5,10.0.0.5,6h\n"));
        assert!(conf.contains("dhcp-host=52:54:00:12:34:56\n"));
    }

    #[test]
    fn test_install_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::rooted_at(dir.path());
        let paths = VmPaths::new(&VmIdentity::new("vm1").unwrap(), &config);
        std::fs::create_dir_all(paths.home()).unwrap();

        let exec = RecordingExecutor::new()
            .fail_when("disable --now vm1-dnsmasq", 5, "Unit vm1-dnsmasq.service not loaded.");
        let units = UnitInstaller::new(&exec, &paths);
        units.install("[Unit]\n", "pid-file=\n").unwrap();
        assert!(paths.service_unit().exists());
        assert!(paths.dnsmasq_unit().exists());
        assert!(paths.dnsmasq_conf().exists());

        units.remove().unwrap();
        assert!(!paths.service_unit().exists());
        assert!(!paths.dnsmasq_unit().exists());
        assert_eq!(
            exec.command_lines(),
            vec![
                "systemctl daemon-reload",
                "systemctl disable --now vm1.service",
                "systemctl disable --now vm1-dnsmasq.service",
                "systemctl daemon-reload",
            ]
        );
    }
}
