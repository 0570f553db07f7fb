//! VM network isolation.
//!
//! Each VM gets a network namespace named after it, joined to the host by a
//! veth pair (`vetho<vm>` outside, `vethi<vm>` inside) and holding one tap
//! per guest NIC. IPv6 is routed, IPv4 (when the VM has a public address)
//! is 1:1 NATed inside the namespace.

pub mod addr;
pub mod nat;

pub use addr::{link_local, partition, Ipv4Net, Ipv6Net};

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::executor::{ignore_absent, Cmd, Executor};
use crate::paths::VmPaths;
use vmhost_protocol::{NicDescriptor, VmParams};

/// Stderr of `ip netns del` when the namespace does not exist.
const NETNS_ABSENT: &[&str] = &["No such file or directory"];

/// Stderr of `ip -6 neigh del proxy` for an entry that does not exist.
const NEIGH_ABSENT: &[&str] = &["No such file or directory"];

/// Addresses answered for on the uplink when NDP proxying is needed.
fn ndp_proxied(ranges: &EphemeralRanges) -> Vec<std::net::Ipv6Addr> {
    [ranges.guest.nth(2), ranges.host.nth(0)]
        .into_iter()
        .flatten()
        .collect()
}

/// A parsed guest NIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nic {
    pub net6: Ipv6Net,
    pub net4: Option<Ipv4Net>,
    pub tap: String,
    pub mac: [u8; 6],
}

impl Nic {
    /// Parse a NIC descriptor.
    pub fn from_descriptor(desc: &NicDescriptor) -> Result<Self> {
        if desc.tap.is_empty() || desc.tap.len() > 15 {
            return Err(Error::params(format!("invalid tap name '{}'", desc.tap)));
        }
        Ok(Self {
            net6: desc.net6.parse()?,
            net4: desc.net4.as_deref().map(str::parse).transpose()?,
            tap: desc.tap.clone(),
            mac: addr::parse_mac(&desc.mac)?,
        })
    }

    /// IPv4 address leased to the guest: the address itself for a /32,
    /// otherwise the first host address of `net4`.
    pub fn guest_ip4(&self) -> Option<std::net::Ipv4Addr> {
        let net4 = self.net4?;
        if net4.prefix_len() == 32 {
            Some(net4.network())
        } else {
            net4.nth(1)
        }
    }
}

/// Networking parameters of one VM, parsed.
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub gua: Ipv6Net,
    pub ip4: Option<Ipv4Net>,
    pub local_ip4: Option<Ipv4Net>,
    pub nics: Vec<Nic>,
    pub single_nic: bool,
    pub ndp_needed: bool,
}

impl NetworkParams {
    /// Parse the networking part of the VM parameters.
    pub fn from_params(params: &VmParams) -> Result<Self> {
        let nics = params
            .nics
            .iter()
            .map(Nic::from_descriptor)
            .collect::<Result<Vec<_>>>()?;
        if nics.is_empty() {
            return Err(Error::params("at least one nic is required"));
        }
        Ok(Self {
            gua: params.public_ipv6.parse()?,
            ip4: params.public_ipv4.as_deref().map(str::parse).transpose()?,
            local_ip4: params.local_ipv4.as_deref().map(str::parse).transpose()?,
            nics,
            single_nic: params.single_nic,
            ndp_needed: params.ndp_needed,
        })
    }
}

/// The two halves of a VM's IPv6 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EphemeralRanges {
    /// Lower half, visible to the guest.
    pub guest: Ipv6Net,
    /// Upper half, used on the host side of the namespace.
    pub host: Ipv6Net,
}

/// MAC addresses given to the veth pair when it was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VethPair {
    pub outer_mac: [u8; 6],
    pub inner_mac: [u8; 6],
}

impl VethPair {
    /// Generate a fresh pair of addresses.
    pub fn generate() -> Result<Self> {
        Ok(Self {
            outer_mac: addr::random_mac()?,
            inner_mac: addr::random_mac()?,
        })
    }
}

/// Issues the namespace, link, route and NAT commands for one VM.
pub struct NetworkConfigurator<'a> {
    exec: &'a dyn Executor,
    paths: &'a VmPaths,
    config: &'a AgentConfig,
}

impl<'a> NetworkConfigurator<'a> {
    pub fn new(exec: &'a dyn Executor, paths: &'a VmPaths, config: &'a AgentConfig) -> Self {
        Self {
            exec,
            paths,
            config,
        }
    }

    fn ip(&self) -> Cmd {
        Cmd::new("ip")
    }

    fn ip_ns(&self) -> Cmd {
        Cmd::new("ip").argv(&["-n", self.paths.netns()])
    }

    fn netns_exec(&self) -> Cmd {
        Cmd::new("ip").argv(&["netns", "exec", self.paths.netns()])
    }

    /// Bring up networking end to end.
    ///
    /// With `persist_ranges` the partitioned ranges are written to the VM
    /// home; otherwise previously persisted ranges are reused when present.
    pub fn configure(&self, net: &NetworkParams, persist_ranges: bool) -> Result<()> {
        let ranges = if persist_ranges {
            let ranges = self.partition_ephemeral_space(&net.gua)?;
            self.persist_ranges(&ranges)?;
            ranges
        } else {
            match self.load_ranges()? {
                Some(ranges) => ranges,
                None => self.partition_ephemeral_space(&net.gua)?,
            }
        };

        let veth = self.create_namespace_and_links(&net.nics)?;
        self.wire_ipv6(&ranges, net, &veth)?;
        self.wire_ipv4(net.ip4, net.local_ip4, &net.nics)?;
        self.configure_nat(net.ip4, &net.nics)?;
        self.enable_forwarding()
    }

    /// Split the VM prefix into guest and host ranges.
    pub fn partition_ephemeral_space(&self, gua: &Ipv6Net) -> Result<EphemeralRanges> {
        let (guest, host) = partition(gua)?;
        Ok(EphemeralRanges { guest, host })
    }

    /// Write both ranges to the VM home.
    pub fn persist_ranges(&self, ranges: &EphemeralRanges) -> Result<()> {
        std::fs::create_dir_all(self.paths.home())?;
        std::fs::write(self.paths.guest_ephemeral(), format!("{}\n", ranges.guest))?;
        std::fs::write(self.paths.host_ephemeral(), format!("{}\n", ranges.host))?;
        tracing::debug!(
            vm = %self.paths.vm(),
            guest = %ranges.guest,
            host = %ranges.host,
            "persisted ephemeral ranges"
        );
        Ok(())
    }

    /// Read persisted ranges, if both files exist.
    pub fn load_ranges(&self) -> Result<Option<EphemeralRanges>> {
        let guest_path = self.paths.guest_ephemeral();
        let host_path = self.paths.host_ephemeral();
        if !guest_path.exists() || !host_path.exists() {
            return Ok(None);
        }
        Ok(Some(EphemeralRanges {
            guest: std::fs::read_to_string(guest_path)?.parse()?,
            host: std::fs::read_to_string(host_path)?.parse()?,
        }))
    }

    /// Create the namespace, the veth pair and one tap per NIC.
    ///
    /// A stale namespace from an earlier run is deleted first.
    pub fn create_namespace_and_links(&self, nics: &[Nic]) -> Result<VethPair> {
        let vm = self.paths.netns();
        tracing::info!(vm, nics = nics.len(), "creating network namespace");

        self.delete_namespace()?;
        self.exec.run(&self.ip().argv(&["netns", "add", vm]))?;

        // MACs are chosen here so link-local addresses are known without
        // reading them back from sysfs.
        let veth = VethPair::generate()?;
        self.exec.run(&self.ip().argv(&[
            "link",
            "add",
            &self.paths.veth_outer(),
            "addr",
            &addr::format_mac(&veth.outer_mac),
            "type",
            "veth",
            "peer",
            "name",
            &self.paths.veth_inner(),
            "addr",
            &addr::format_mac(&veth.inner_mac),
            "netns",
            vm,
        ]))?;

        for nic in nics {
            self.exec.run(
                &self
                    .ip_ns()
                    .argv(&["tuntap", "add", "dev", &nic.tap, "mode", "tap", "user", vm]),
            )?;
        }
        Ok(veth)
    }

    /// Route IPv6 between host, namespace and guest taps.
    ///
    /// The first NIC serves DHCPv6 and receives the guest range. With
    /// `single_nic` that NIC's own `net6` is the guest range, so no
    /// per-NIC route is added; otherwise every NIC gets a route for its
    /// `net6`.
    pub fn wire_ipv6(
        &self,
        ranges: &EphemeralRanges,
        net: &NetworkParams,
        veth: &VethPair,
    ) -> Result<()> {
        let outer = self.paths.veth_outer();
        let inner = self.paths.veth_inner();
        let inner_ll = link_local(&veth.inner_mac).to_string();
        let outer_ll = link_local(&veth.outer_mac).to_string();

        // Host to namespace.
        self.exec
            .run(&self.ip().argv(&["link", "set", "dev", &outer, "up"]))?;
        self.exec.run(&self.ip().argv(&[
            "-6",
            "route",
            "replace",
            &net.gua.to_string(),
            "via",
            &inner_ll,
            "dev",
            &outer,
        ]))?;

        if net.ndp_needed {
            let uplink = self.config.uplink_device.as_str();
            for addr in ndp_proxied(ranges) {
                self.exec.run(&self.ip().argv(&[
                    "-6",
                    "neigh",
                    "add",
                    "proxy",
                    &addr.to_string(),
                    "dev",
                    uplink,
                ]))?;
            }
        }

        // Namespace to host.
        self.exec.run(&self.ip_ns().argv(&[
            "addr",
            "replace",
            &ranges.host.to_string(),
            "dev",
            &inner,
        ]))?;
        self.exec
            .run(&self.ip_ns().argv(&["link", "set", "dev", &inner, "up"]))?;
        self.exec.run(&self.ip_ns().argv(&[
            "route", "replace", "2000::/3", "via", &outer_ll, "dev", &inner,
        ]))?;

        // Namespace to guest.
        let dhcp_nic = net
            .nics
            .first()
            .ok_or_else(|| Error::params("at least one nic is required"))?;
        let intrusive = ranges
            .guest
            .nth(1)
            .ok_or_else(|| Error::InvalidPrefix(ranges.guest.to_string()))?;
        self.exec.run(&self.ip_ns().argv(&[
            "addr",
            "replace",
            &format!("{}/{}", intrusive, ranges.guest.prefix_len()),
            "dev",
            &dhcp_nic.tap,
        ]))?;
        self.exec
            .run(&self.ip_ns().argv(&["link", "set", "dev", &dhcp_nic.tap, "up"]))?;
        self.exec.run(&self.ip_ns().argv(&[
            "route",
            "replace",
            &ranges.guest.to_string(),
            "via",
            &link_local(&dhcp_nic.mac).to_string(),
            "dev",
            &dhcp_nic.tap,
        ]))?;

        for (i, nic) in net.nics.iter().enumerate() {
            if i > 0 {
                self.exec
                    .run(&self.ip_ns().argv(&["link", "set", "dev", &nic.tap, "up"]))?;
            }
            if net.single_nic {
                continue;
            }
            self.exec.run(&self.ip_ns().argv(&[
                "route",
                "replace",
                &nic.net6.to_string(),
                "via",
                &link_local(&nic.mac).to_string(),
                "dev",
                &nic.tap,
            ]))?;
        }
        Ok(())
    }

    /// Drop the NDP proxy entries `wire_ipv6` added on the host uplink.
    ///
    /// Entries that are already gone are skipped.
    pub fn remove_ndp_proxies(&self, ranges: &EphemeralRanges) -> Result<()> {
        let uplink = self.config.uplink_device.as_str();
        for addr in ndp_proxied(ranges) {
            let result = self.exec.run(&self.ip().argv(&[
                "-6",
                "neigh",
                "del",
                "proxy",
                &addr.to_string(),
                "dev",
                uplink,
            ]));
            ignore_absent(result, NEIGH_ABSENT)?;
        }
        tracing::debug!(vm = %self.paths.vm(), uplink, "ndp proxy entries removed");
        Ok(())
    }

    /// Route IPv4 into the namespace. Skipped when the VM has no `ip4`.
    ///
    /// The host side of the veth takes `local_ip4`, the namespace side the
    /// next address.
    pub fn wire_ipv4(
        &self,
        ip4: Option<Ipv4Net>,
        local_ip4: Option<Ipv4Net>,
        nics: &[Nic],
    ) -> Result<()> {
        let Some(ip4) = ip4 else {
            tracing::debug!(vm = %self.paths.vm(), "no public ipv4, skipping ipv4 routes");
            return Ok(());
        };
        let local = local_ip4
            .ok_or_else(|| Error::params("local_ipv4 is required when public_ipv4 is set"))?;
        let host_side = local.network();
        let ns_side = u32::from(host_side)
            .checked_add(1)
            .map(std::net::Ipv4Addr::from)
            .ok_or_else(|| Error::address(local.to_string(), "no address after local ipv4"))?;
        let host_side = host_side.to_string();
        let outer = self.paths.veth_outer();
        let inner = self.paths.veth_inner();

        self.exec.run(&self.ip().argv(&[
            "addr",
            "replace",
            &format!("{}/32", host_side),
            "dev",
            &outer,
        ]))?;
        self.exec
            .run(&self.ip().argv(&["route", "replace", &ip4.to_string(), "dev", &outer]))?;
        self.exec.run(&self.ip_ns().argv(&[
            "addr",
            "replace",
            &format!("{}/32", ns_side),
            "dev",
            &inner,
        ]))?;
        self.exec
            .run(&self.ip_ns().argv(&["route", "replace", &host_side, "dev", &inner]))?;

        for nic in nics {
            if let Some(net4) = nic.net4 {
                self.exec.run(&self.ip_ns().argv(&[
                    "route",
                    "replace",
                    &net4.to_string(),
                    "dev",
                    &nic.tap,
                ]))?;
            }
        }

        self.exec.run(&self.ip_ns().argv(&[
            "route", "replace", "default", "via", &host_side, "dev", &inner,
        ]))?;
        Ok(())
    }

    /// Write and apply the NAT ruleset. Skipped when the VM has no `ip4`.
    pub fn configure_nat(&self, ip4: Option<Ipv4Net>, nics: &[Nic]) -> Result<()> {
        let Some(ip4) = ip4 else {
            return Ok(());
        };
        let private = nics
            .iter()
            .find_map(Nic::guest_ip4)
            .ok_or_else(|| Error::params("public_ipv4 is set but no nic has an ipv4 network"))?;

        let conf = self.paths.nftables_conf();
        std::fs::create_dir_all(self.paths.home())?;
        std::fs::write(&conf, nat::render_ruleset(ip4.network(), private))?;
        tracing::info!(vm = %self.paths.vm(), public = %ip4, private = %private, "applying nat");

        self.exec.run(
            &self
                .netns_exec()
                .argv(&["nft", "-f", &conf.to_string_lossy()]),
        )?;
        Ok(())
    }

    /// Turn on forwarding inside the namespace.
    pub fn enable_forwarding(&self) -> Result<()> {
        for key in ["net.ipv6.conf.all.forwarding=1", "net.ipv4.ip_forward=1"] {
            self.exec
                .run(&self.netns_exec().argv(&["sysctl", "-w", key]))?;
        }
        Ok(())
    }

    /// Delete the namespace; a missing namespace is not an error.
    pub fn delete_namespace(&self) -> Result<()> {
        ignore_absent(
            self.exec
                .run(&self.ip().argv(&["netns", "del", self.paths.netns()])),
            NETNS_ABSENT,
        )
    }
}
