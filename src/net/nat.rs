//! nftables ruleset for 1:1 IPv4 NAT inside the VM namespace.

use std::net::Ipv4Addr;

/// Private ranges that are never source-translated.
const RFC1918: &str = "10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16";

/// Render the NAT ruleset mapping `public` to the guest's `private` address.
pub fn render_ruleset(public: Ipv4Addr, private: Ipv4Addr) -> String {
    format!(
        "\
flush ruleset
table ip nat {{
  chain prerouting {{
    type nat hook prerouting priority dstnat; policy accept;
    ip daddr {public} dnat to {private}
  }}

  chain postrouting {{
    type nat hook postrouting priority srcnat; policy accept;
    ip saddr {private} ip daddr != {{ {RFC1918} }} snat to {public}
    ip saddr {private} ip daddr {private} snat to {public}
  }}
}}
"
    )
}
