//! Integration tests for the read-only commands
//!
//! - `virtmate domain-list`
//! - `virtmate pool-list`
//! - `virtmate volume-list`
//! - `virtmate guest-ping` and `domain-iface-list` error paths

use color_eyre::eyre::eyre;
use color_eyre::Result;
use integration_tests::{integration_test, unique_name};
use linkme::distributed_slice;

use crate::{run_virtmate, skip_without_libvirt, virsh};

fn test_domain_list() -> Result<()> {
    if skip_without_libvirt() {
        return Ok(());
    }
    let out = run_virtmate(&["domain-list"])?;
    out.assert_success("domain-list");
    let domains = out.json()?;
    let domains = domains
        .as_array()
        .ok_or_else(|| eyre!("Expected JSON array, got: {}", out.stdout))?;

    let uuids: Vec<&str> = domains
        .iter()
        .map(|d| d["uuid"].as_str().unwrap_or_default())
        .collect();
    let mut sorted = uuids.clone();
    sorted.sort();
    assert_eq!(uuids, sorted, "domains must be sorted by uuid");
    for d in domains {
        assert!(d["name"].is_string(), "{d}");
        assert!(d["state"].is_string(), "{d}");
    }

    let table = run_virtmate(&["domain-list", "--format", "table"])?;
    table.assert_success("domain-list --format table");
    Ok(())
}
integration_test!(test_domain_list);

fn test_pool_list() -> Result<()> {
    if skip_without_libvirt() {
        return Ok(());
    }
    let out = run_virtmate(&["pool-list"])?;
    out.assert_success("pool-list");
    let pools = out.json()?;
    let pools = pools
        .as_array()
        .ok_or_else(|| eyre!("Expected JSON array, got: {}", out.stdout))?;
    for pool in pools {
        for key in [
            "name",
            "uuid",
            "state",
            "active",
            "persistent",
            "capacity",
            "allocation",
            "available",
            "number_of_volumes",
        ] {
            assert!(pool.get(key).is_some(), "missing {key} in {pool}");
        }
        let active = pool["active"].as_bool().unwrap_or_default();
        assert_eq!(active, pool["number_of_volumes"].is_u64(), "{pool}");
    }
    Ok(())
}
integration_test!(test_pool_list);

fn test_volume_list() -> Result<()> {
    if skip_without_libvirt() {
        return Ok(());
    }
    let pools = virsh(&["pool-list", "--name"])?;
    let Some(pool) = pools.lines().map(str::trim).find(|l| !l.is_empty()) else {
        println!("Skipping: no active storage pool");
        return Ok(());
    };
    let out = run_virtmate(&["volume-list", pool])?;
    out.assert_success("volume-list");
    let volumes = out.json()?;
    let volumes = volumes
        .as_array()
        .ok_or_else(|| eyre!("Expected JSON array, got: {}", out.stdout))?;
    let names: Vec<&str> = volumes
        .iter()
        .map(|v| v["name"].as_str().unwrap_or_default())
        .collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted, "volumes must be sorted by name");
    for v in volumes {
        assert!(v["target"]["path"].is_string(), "{v}");
        assert!(v.get("backing_store").is_some(), "{v}");
    }
    Ok(())
}
integration_test!(test_volume_list);

fn test_volume_list_unknown_pool() -> Result<()> {
    if skip_without_libvirt() {
        return Ok(());
    }
    let pool = unique_name("nopool");
    let out = run_virtmate(&["volume-list", &pool])?;
    assert!(!out.success());
    assert_eq!(out.exit_code(), Some(1));
    assert!(out.stderr.contains("does not exist"), "{}", out.stderr);
    Ok(())
}
integration_test!(test_volume_list_unknown_pool);

fn test_unknown_domain() -> Result<()> {
    if skip_without_libvirt() {
        return Ok(());
    }
    let domain = unique_name("nodomain");
    for args in [
        vec!["guest-ping", domain.as_str()],
        vec!["domain-iface-list", domain.as_str()],
    ] {
        let out = run_virtmate(&args)?;
        assert_eq!(out.exit_code(), Some(1), "{args:?}");
        assert!(out.stderr.contains("does not exist"), "{}", out.stderr);
    }
    Ok(())
}
integration_test!(test_unknown_domain);
