//! End-to-end runs of setup, recreate and purge against a scratch tree.

use base64::Engine;
use regex::Regex;
use std::fs;
use std::path::Path;
use vmhost::config::AgentConfig;
use vmhost::executor::RecordingExecutor;
use vmhost::net::link_local;
use vmhost::net::addr::parse_mac;
use vmhost::paths::VmIdentity;
use vmhost::{Error, Lifecycle};
use vmhost_protocol::{
    NicDescriptor, StorageSecrets, StorageVolumeSpec, VmParams, VmResources, WrappingSecret,
};

const GIB: u64 = 1024 * 1024 * 1024;

struct Host {
    _dir: tempfile::TempDir,
    config: AgentConfig,
    vm: VmIdentity,
}

fn host() -> Host {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig::rooted_at(dir.path());
    fs::create_dir_all(&config.vhost_root).unwrap();
    fs::create_dir_all(&config.image_cache_dir).unwrap();
    fs::write(config.image_cache_dir.join("ubuntu-jammy.raw"), vec![0u8; 4096]).unwrap();
    Host {
        _dir: dir,
        config,
        vm: VmIdentity::new("vm1").unwrap(),
    }
}

fn params() -> VmParams {
    VmParams {
        public_ipv6: "2a01:4f9:2b:35b:7e40::/79".to_string(),
        public_ipv4: Some("203.0.113.7/32".to_string()),
        local_ipv4: Some("169.254.0.10".to_string()),
        nics: vec![NicDescriptor {
            net6: "fd10:9b0b:6b4b:8fbb::/64".to_string(),
            net4: Some("10.0.0.5/32".to_string()),
            tap: "ncvm1".to_string(),
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
        storage_volumes: vec![
            StorageVolumeSpec {
                disk_index: 1,
                device_id: "vm1_1".to_string(),
                size_gib: 1,
                boot: false,
                encrypted: false,
            },
            StorageVolumeSpec {
                disk_index: 0,
                device_id: "vm1_0".to_string(),
                size_gib: 2,
                boot: true,
                encrypted: true,
            },
        ],
    }
}

fn secrets() -> StorageSecrets {
    let b64 = base64::engine::general_purpose::STANDARD;
    StorageSecrets::from([(
        "vm1_0".to_string(),
        WrappingSecret {
            algorithm: "aes-256-gcm".to_string(),
            key: b64.encode([0x42u8; 32]),
            init_vector: b64.encode([0x24u8; 12]),
            auth_data: "vm1_0".to_string(),
        },
    )])
}

fn position(lines: &[String], needle: &str) -> usize {
    lines
        .iter()
        .position(|l| l.contains(needle))
        .unwrap_or_else(|| panic!("no command containing '{}' in {:#?}", needle, lines))
}

fn key_args(exec: &RecordingExecutor) -> Vec<String> {
    exec.calls()
        .iter()
        .find(|c| c.get_args().iter().any(|a| a == "accel_crypto_key_create"))
        .map(|c| c.get_args().to_vec())
        .expect("no crypto key registered")
}

#[test]
fn setup_provisions_everything_in_order() {
    let h = host();
    let exec = RecordingExecutor::new();
    let lifecycle = Lifecycle::new(&exec, &h.config, &h.vm);
    let paths = lifecycle.paths().clone();

    lifecycle.setup(&params(), &secrets()).unwrap();

    let lines = exec.command_lines();
    assert!(lines[0].starts_with("adduser --disabled-password --gecos '' --home "));
    assert!(lines[0].ends_with(" vm1"));

    // Disks are handled in index order, the boot disk through spdk_dd.
    let dd = position(&lines, "spdk_dd");
    assert!(lines[dd].contains("--ob crypt0"));
    assert!(position(&lines, "bdev_crypto_create -n vm1_0_key vm1_0_aio vm1_0") > dd);
    assert!(
        position(&lines, "vhost_create_blk_controller vm1_0 vm1_0")
            < position(&lines, "1/disk.raw vm1_1 512")
    );
    assert_eq!(exec.matching("spdk_dd").len(), 1);
    assert!(exec.matching("curl").is_empty());

    // Network after storage, hugepages after network, units last.
    let netns = position(&lines, "ip netns add vm1");
    assert!(netns > position(&lines, "vhost_create_blk_controller vm1_1"));
    let mount = position(&lines, "mount -t hugetlbfs -o uid=vm1,size=4G nodev ");
    assert!(mount > position(&lines, "sysctl"));
    assert_eq!(lines.last().unwrap(), "systemctl daemon-reload");

    // Persisted state.
    let manifest: VmParams =
        VmParams::from_json(&fs::read_to_string(paths.manifest()).unwrap()).unwrap();
    assert_eq!(manifest, params());
    assert!(paths.key_file(0).exists());
    assert!(!paths.key_file(1).exists());
    assert_eq!(fs::metadata(paths.disk_file(0)).unwrap().len(), 2 * GIB);
    assert_eq!(fs::metadata(paths.disk_file(1)).unwrap().len(), GIB);
    assert_eq!(
        fs::read_to_string(paths.guest_ephemeral()).unwrap().trim(),
        "2a01:4f9:2b:35b:7e40::/80"
    );
    assert_eq!(
        fs::read_to_string(paths.host_ephemeral()).unwrap().trim(),
        "2a01:4f9:2b:35b:7e41::/80"
    );
    assert!(fs::read_to_string(paths.nftables_conf())
        .unwrap()
        .contains("dnat to 10.0.0.5"));
    assert!(paths.service_unit().exists());
    assert!(paths.dnsmasq_unit().exists());

    // Routes point at the link-local addresses of the generated veth MACs.
    let link_re = Regex::new(
        r"^ip link add vethovm1 addr ([0-9a-f:]{17}) type veth peer name vethivm1 addr ([0-9a-f:]{17}) netns vm1$",
    )
    .unwrap();
    let caps = lines
        .iter()
        .find_map(|l| link_re.captures(l))
        .expect("veth pair not created");
    let inner_ll = link_local(&parse_mac(&caps[2]).unwrap());
    let outer_ll = link_local(&parse_mac(&caps[1]).unwrap());
    assert!(lines.contains(&format!(
        "ip -6 route replace 2a01:4f9:2b:35b:7e40::/79 via {} dev vethovm1",
        inner_ll
    )));
    assert!(lines.contains(&format!(
        "ip -n vm1 route replace 2000::/3 via {} dev vethivm1",
        outer_ll
    )));
}

#[test]
fn setup_keeps_keys_out_of_command_lines() {
    let h = host();
    let exec = RecordingExecutor::new();
    Lifecycle::new(&exec, &h.config, &h.vm)
        .setup(&params(), &secrets())
        .unwrap();

    let args = key_args(&exec);
    let hex_re = Regex::new(r"^[0-9a-f]{64}$").unwrap();
    let keys: Vec<&String> = args.iter().filter(|a| hex_re.is_match(a)).collect();
    assert_eq!(keys.len(), 2);
    for line in exec.command_lines() {
        assert!(!line.contains(keys[0].as_str()));
        assert!(!line.contains(keys[1].as_str()));
    }
}

#[test]
fn setup_rejects_oversized_image_before_writing() {
    let h = host();
    let image = h.config.image_cache_dir.join("ubuntu-jammy.raw");
    fs::File::create(&image).unwrap().set_len(2 * GIB + 1).unwrap();

    let exec = RecordingExecutor::new();
    let err = Lifecycle::new(&exec, &h.config, &h.vm)
        .setup(&params(), &secrets())
        .unwrap_err();
    assert!(matches!(err, Error::ImageTooLarge { size_gib: 2, .. }));
    assert!(exec.matching("spdk_dd").is_empty());
    assert!(exec.matching("bdev_").is_empty());
}

#[test]
fn setup_without_secret_touches_nothing() {
    let h = host();
    let exec = RecordingExecutor::new();
    let lifecycle = Lifecycle::new(&exec, &h.config, &h.vm);
    let err = lifecycle
        .setup(&params(), &StorageSecrets::new())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParams(_)));
    assert!(exec.calls().is_empty());
    assert!(!lifecycle.paths().manifest().exists());
}

#[test]
fn setup_surfaces_command_failures() {
    let h = host();
    let exec = RecordingExecutor::new().fail_when("ip netns add", 1, "File exists");
    let err = Lifecycle::new(&exec, &h.config, &h.vm)
        .setup(&params(), &secrets())
        .unwrap_err();
    assert!(matches!(err, Error::CommandFailed { exit_code: 1, .. }));
    assert!(exec.matching("hugetlbfs").is_empty());
}

#[test]
fn recreate_reuses_persisted_state() {
    let h = host();
    let setup_exec = RecordingExecutor::new();
    let lifecycle = Lifecycle::new(&setup_exec, &h.config, &h.vm);
    lifecycle.setup(&params(), &secrets()).unwrap();
    let paths = lifecycle.paths().clone();
    let key_file = fs::read(paths.key_file(0)).unwrap();
    let guest_range = fs::read_to_string(paths.guest_ephemeral()).unwrap();

    let exec = RecordingExecutor::new();
    let lifecycle = Lifecycle::new(&exec, &h.config, &h.vm);
    let manifest = lifecycle.load_manifest().unwrap().unwrap();
    lifecycle.recreate_unpersisted(&manifest, &secrets()).unwrap();

    let lines = exec.command_lines();
    assert!(exec.matching("curl").is_empty());
    assert!(exec.matching("qemu-img").is_empty());
    assert!(exec.matching("spdk_dd").is_empty());
    assert!(exec.matching("adduser").is_empty());
    assert!(position(&lines, "ip netns add vm1") < position(&lines, "hugetlbfs"));
    assert!(position(&lines, "hugetlbfs") < position(&lines, "bdev_aio_create"));
    assert_eq!(exec.matching("vhost_create_blk_controller").len(), 2);

    // Same key registered as at setup; nothing on disk rewritten.
    assert_eq!(key_args(&exec), key_args(&setup_exec));
    assert_eq!(fs::read(paths.key_file(0)).unwrap(), key_file);
    assert_eq!(fs::read_to_string(paths.guest_ephemeral()).unwrap(), guest_range);
    assert_eq!(
        fs::read_link(paths.vhost_link(0)).unwrap(),
        paths.vhost_socket("vm1_0")
    );
}

#[test]
fn recreate_fails_loudly_on_duplicates() {
    let h = host();
    let lifecycle_exec = RecordingExecutor::new();
    Lifecycle::new(&lifecycle_exec, &h.config, &h.vm)
        .setup(&params(), &secrets())
        .unwrap();

    let exec = RecordingExecutor::new().fail_when(
        "bdev_aio_create",
        1,
        "Code=-17 Msg=File exists",
    );
    let err = Lifecycle::new(&exec, &h.config, &h.vm)
        .recreate_unpersisted(&params(), &secrets())
        .unwrap_err();
    assert!(matches!(err, Error::CommandFailed { .. }));
}

#[test]
fn recreate_with_wrong_secret_fails() {
    let h = host();
    let setup_exec = RecordingExecutor::new();
    Lifecycle::new(&setup_exec, &h.config, &h.vm)
        .setup(&params(), &secrets())
        .unwrap();

    let mut wrong = secrets();
    if let Some(secret) = wrong.get_mut("vm1_0") {
        secret.key = base64::engine::general_purpose::STANDARD.encode([0x43u8; 32]);
    }
    let exec = RecordingExecutor::new();
    let err = Lifecycle::new(&exec, &h.config, &h.vm)
        .recreate_unpersisted(&params(), &wrong)
        .unwrap_err();
    assert!(matches!(err, Error::KeyMaterialUnreadable { .. }));
    assert!(exec.matching("accel_crypto_key_create").is_empty());
}

#[test]
fn purge_tears_down_in_order() {
    let h = host();
    let setup_exec = RecordingExecutor::new();
    let lifecycle = Lifecycle::new(&setup_exec, &h.config, &h.vm);
    lifecycle.setup(&params(), &secrets()).unwrap();
    let paths = lifecycle.paths().clone();
    fs::write(paths.vhost_socket("vm1_0"), b"").unwrap();

    let exec = RecordingExecutor::new();
    Lifecycle::new(&exec, &h.config, &h.vm).purge().unwrap();

    let lines = exec.command_lines();
    let order = [
        "ip netns del vm1",
        "systemctl disable --now vm1.service",
        "systemctl disable --now vm1-dnsmasq.service",
        "umount ",
        "vhost_delete_controller vm1_0",
        "bdev_crypto_delete vm1_0",
        "bdev_aio_delete vm1_0_aio",
        "accel_crypto_key_destroy -n vm1_0_key",
        "vhost_delete_controller vm1_1",
        "bdev_aio_delete vm1_1",
        "deluser --remove-home vm1",
    ];
    let positions: Vec<usize> = order.iter().map(|n| position(&lines, n)).collect();
    assert!(
        positions.windows(2).all(|w| w[0] < w[1]),
        "unexpected order: {:#?}",
        lines
    );

    assert!(!paths.storage_dir().exists());
    assert!(!paths.home().exists());
    assert!(!paths.service_unit().exists());
    assert!(!paths.vhost_socket("vm1_0").exists());
}

#[test]
fn purge_drops_ndp_proxies_on_the_uplink() {
    let h = host();
    let mut p = params();
    p.ndp_needed = true;
    let setup_exec = RecordingExecutor::new();
    Lifecycle::new(&setup_exec, &h.config, &h.vm)
        .setup(&p, &secrets())
        .unwrap();
    let added: Vec<String> = setup_exec
        .matching("neigh add proxy")
        .iter()
        .map(|l| l.replace(" add ", " del "))
        .collect();
    assert_eq!(added.len(), 2);

    let exec = RecordingExecutor::new();
    let lifecycle = Lifecycle::new(&exec, &h.config, &h.vm);
    lifecycle.purge().unwrap();

    assert_eq!(exec.matching("neigh del proxy"), added);
    let lines = exec.command_lines();
    assert!(position(&lines, "neigh del proxy") < position(&lines, "deluser"));
    assert!(!lifecycle.paths().home().exists());
}

#[test]
fn purge_without_ndp_leaves_uplink_alone() {
    let h = host();
    let setup_exec = RecordingExecutor::new();
    Lifecycle::new(&setup_exec, &h.config, &h.vm)
        .setup(&params(), &secrets())
        .unwrap();

    let exec = RecordingExecutor::new();
    Lifecycle::new(&exec, &h.config, &h.vm).purge().unwrap();
    assert!(exec.matching("neigh").is_empty());
}

#[test]
fn purge_tolerates_absent_resources() {
    let h = host();
    let exec = RecordingExecutor::new()
        .fail_when("netns del", 1, "Cannot remove namespace file: No such file or directory")
        .fail_when("systemctl disable", 1, "Unit vm1.service not loaded.")
        .fail_when("umount", 32, "umount: /vm/vm1/hugepages: not mounted.")
        .fail_when("deluser", 2, "The user `vm1' does not exist.");

    Lifecycle::new(&exec, &h.config, &h.vm).purge().unwrap();

    // No manifest, so no volumes to tear down.
    assert!(exec.matching("rpc.py").is_empty());
}

#[test]
fn purge_continues_past_failures() {
    let h = host();
    let setup_exec = RecordingExecutor::new();
    let lifecycle = Lifecycle::new(&setup_exec, &h.config, &h.vm);
    lifecycle.setup(&params(), &secrets()).unwrap();
    let storage_dir = lifecycle.paths().storage_dir().to_path_buf();

    let exec = RecordingExecutor::new().fail_when(
        "vhost_delete_controller vm1_0",
        1,
        "Connection refused",
    );
    let err = Lifecycle::new(&exec, &h.config, &h.vm).purge().unwrap_err();
    assert!(matches!(err, Error::CommandFailed { .. }));

    assert_eq!(exec.matching("vhost_delete_controller vm1_1").len(), 1);
    assert_eq!(exec.matching("deluser").len(), 1);
    assert!(!Path::new(&storage_dir).exists());
}
