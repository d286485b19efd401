//! Integration tests for the CNI network interface.
//!
//! Each test works in its own temporary configuration directory:
//! 1. Construction and the synthesized default network
//! 2. Create, inspect, list, and remove round trips
//! 3. Validation of names, subnets, and drivers
//! 4. Plugin discovery

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::Path;

use stevedore_common::error::StevedoreError;
use stevedore_network::{ContainerNetwork, InitConfig, Network, Subnet, new_cni_network_interface};

fn config(dir: &Path) -> InitConfig {
    InitConfig {
        cni_config_dir: dir.join("net.d"),
        cni_plugin_dirs: vec![dir.join("libexec"), dir.join("bin")],
        default_network: "podman".into(),
        default_subnet: "10.88.0.0/16".into(),
    }
}

fn interface(dir: &Path) -> Box<dyn ContainerNetwork> {
    new_cni_network_interface(config(dir)).expect("interface")
}

fn named(name: &str) -> Network {
    Network {
        name: name.into(),
        ..Network::default()
    }
}

// ── Construction ─────────────────────────────────────────────────────

#[test]
fn construction_creates_the_config_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let net = interface(dir.path());
    assert!(dir.path().join("net.d").is_dir());
    assert_eq!(net.default_network(), "podman");
}

#[test]
fn default_network_is_synthesized() {
    let dir = tempfile::tempdir().expect("tempdir");
    let net = interface(dir.path());

    let networks = net.networks().expect("list");
    assert_eq!(networks.len(), 1);
    let default = &networks[0];
    assert_eq!(default.name, "podman");
    assert_eq!(default.driver, "bridge");
    assert_eq!(default.network_interface, "cni-podman0");
    assert_eq!(
        default.subnets,
        vec![Subnet {
            subnet: "10.88.0.0/16".into(),
            gateway: Some("10.88.0.1".into()),
        }]
    );
    assert!(
        std::fs::read_dir(dir.path().join("net.d"))
            .expect("read")
            .filter_map(Result::ok)
            .all(|e| e.path().extension().is_none_or(|ext| ext != "conflist")),
        "the default network is never written to disk"
    );
}

#[test]
fn default_network_from_file_wins() {
    let dir = tempfile::tempdir().expect("tempdir");
    let net = interface(dir.path());
    std::fs::write(
        dir.path().join("net.d/87-podman.conflist"),
        br#"{"cniVersion":"0.4.0","name":"podman","plugins":[
            {"type":"bridge","bridge":"cni-podman0","isGateway":true,
             "ipam":{"type":"host-local","ranges":[[{"subnet":"10.77.0.0/16","gateway":"10.77.0.1"}]]}}]}"#,
    )
    .expect("write");

    let default = net.network_inspect("podman").expect("inspect");
    assert_eq!(default.subnets[0].subnet, "10.77.0.0/16");
    assert!(default.created.is_some());
}

// ── Create / inspect / remove ────────────────────────────────────────

#[test]
fn create_fills_in_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let net = interface(dir.path());

    let created = net.network_create(named("backend")).expect("create");
    assert_eq!(created.driver, "bridge");
    assert_eq!(created.network_interface, "cni-podman1");
    assert_eq!(
        created.subnets,
        vec![Subnet {
            subnet: "10.89.0.0/24".into(),
            gateway: Some("10.89.0.1".into()),
        }]
    );
    assert_eq!(created.id.len(), 64);
    assert!(dir.path().join("net.d/backend.conflist").is_file());

    let second = net.network_create(named("frontend")).expect("create");
    assert_eq!(second.subnets[0].subnet, "10.89.1.0/24");
}

#[test]
fn created_networks_persist_across_interfaces() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut wanted = named("data");
    wanted.subnets.push(Subnet {
        subnet: "192.168.50.0/24".into(),
        gateway: Some("192.168.50.254".into()),
    });
    let _ = wanted.labels.insert("team".into(), "storage".into());
    wanted.dns_enabled = true;
    let created = interface(dir.path()).network_create(wanted).expect("create");

    let reopened = interface(dir.path());
    let mut loaded = reopened.network_inspect("data").expect("inspect");
    assert!(loaded.created.is_some());
    loaded.created = created.created;
    assert_eq!(loaded, created);

    let names: Vec<String> = reopened
        .networks()
        .expect("list")
        .into_iter()
        .map(|n| n.name)
        .collect();
    assert_eq!(names, vec!["data".to_string(), "podman".to_string()]);
}

#[test]
fn inspect_by_id_and_prefix() {
    let dir = tempfile::tempdir().expect("tempdir");
    let net = interface(dir.path());
    let created = net.network_create(named("backend")).expect("create");

    assert_eq!(net.network_inspect(&created.id).expect("full id").name, "backend");
    assert_eq!(net.network_inspect(&created.id[..12]).expect("prefix").name, "backend");
    assert!(matches!(
        net.network_inspect("missing"),
        Err(StevedoreError::NotFound { .. })
    ));
}

#[test]
fn remove_deletes_the_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let net = interface(dir.path());
    let _ = net.network_create(named("scratch")).expect("create");

    net.network_remove("scratch").expect("remove");
    assert!(!dir.path().join("net.d/scratch.conflist").exists());
    assert!(matches!(
        net.network_remove("scratch"),
        Err(StevedoreError::NotFound { .. })
    ));
}

#[test]
fn default_network_cannot_be_removed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let net = interface(dir.path());
    assert!(matches!(
        net.network_remove("podman"),
        Err(StevedoreError::Network { .. })
    ));
}

// ── Validation ───────────────────────────────────────────────────────

#[test]
fn duplicate_names_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let net = interface(dir.path());
    let _ = net.network_create(named("backend")).expect("create");
    for name in ["backend", "podman"] {
        assert!(matches!(
            net.network_create(named(name)),
            Err(StevedoreError::Network { .. })
        ));
    }
}

#[test]
fn invalid_definitions_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let net = interface(dir.path());

    let overlapping = Network {
        subnets: vec![Subnet {
            subnet: "10.88.12.0/24".into(),
            gateway: None,
        }],
        ..named("overlap")
    };
    let foreign_gateway = Network {
        subnets: vec![Subnet {
            subnet: "172.30.0.0/24".into(),
            gateway: Some("172.31.0.1".into()),
        }],
        ..named("gateway")
    };
    let bad_driver = Network {
        driver: "overlay".into(),
        ..named("driver")
    };
    let bad_mtu = {
        let mut n = named("mtu");
        let _ = n.options.insert("mtu".into(), "big".into());
        n
    };
    for (network, what) in [
        (named("bad name"), "name"),
        (overlapping, "overlapping subnet"),
        (foreign_gateway, "gateway outside subnet"),
        (bad_driver, "driver"),
        (bad_mtu, "mtu"),
    ] {
        assert!(
            matches!(net.network_create(network), Err(StevedoreError::Network { .. })),
            "{what} should be rejected"
        );
    }
    assert_eq!(net.networks().expect("list").len(), 1);
}

#[test]
fn macvlan_keeps_its_parent_interface() {
    let dir = tempfile::tempdir().expect("tempdir");
    let net = interface(dir.path());
    let created = net
        .network_create(Network {
            driver: "macvlan".into(),
            network_interface: "eth0".into(),
            ..named("lan")
        })
        .expect("create");
    assert_eq!(created.network_interface, "eth0");
    let loaded = net.network_inspect("lan").expect("inspect");
    assert_eq!(loaded.driver, "macvlan");
    assert_eq!(loaded.network_interface, "eth0");
    assert!(!loaded.internal);
}

// ── Plugins ──────────────────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn plugins_are_found_in_configured_dirs() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let bin = dir.path().join("bin");
    std::fs::create_dir_all(&bin).expect("mkdir");
    let plugin = bin.join("bridge");
    std::fs::write(&plugin, b"#!/bin/sh\n").expect("write");
    std::fs::set_permissions(&plugin, std::fs::Permissions::from_mode(0o755)).expect("chmod");

    let net = interface(dir.path());
    assert_eq!(net.plugin_path("bridge").expect("found"), plugin);
    assert!(matches!(
        net.plugin_path("dnsname"),
        Err(StevedoreError::NotFound { .. })
    ));
}
