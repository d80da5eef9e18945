//! Cleanup utility for integration test resources
//!
//! This binary removes the libvirt domains and volumes whose names carry the
//! integration test prefix, e.g. after an aborted test run.

use std::process::Command;

// Import shared helpers from the library
use integration_tests::{is_test_resource, test_connection};

/// Run virsh against the test connection, returning stdout on success
fn virsh(args: &[&str]) -> Result<String, Box<dyn std::error::Error>> {
    let output = Command::new("virsh")
        .arg("-c")
        .arg(test_connection())
        .args(args)
        .output()?;
    if !output.status.success() {
        return Err(format!(
            "virsh {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn names(out: &str) -> Vec<&str> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect()
}

fn cleanup_integration_test_domains() -> Result<(), Box<dyn std::error::Error>> {
    println!("Cleaning up integration test domains...");

    let out = virsh(&["list", "--all", "--name"])?;
    let domains: Vec<&str> = names(&out)
        .into_iter()
        .filter(|d| is_test_resource(d))
        .collect();

    if domains.is_empty() {
        println!("No integration test domains found to clean up");
        return Ok(());
    }

    let mut cleaned = 0;
    for domain in domains {
        print!("  Removing domain {}... ", domain);
        // Only fails for domains that are not running
        let _ = virsh(&["destroy", domain]);
        match virsh(&["undefine", "--nvram", domain]) {
            Ok(_) => {
                println!("✓");
                cleaned += 1;
            }
            Err(e) => {
                println!("✗ (failed)");
                eprintln!("    Error: {}", e);
            }
        }
    }

    println!("Cleanup completed: {} domain(s) removed", cleaned);
    Ok(())
}

fn cleanup_integration_test_volumes() -> Result<(), Box<dyn std::error::Error>> {
    println!("Cleaning up integration test volumes...");

    let pools = virsh(&["pool-list", "--name"])?;
    let mut cleaned = 0;
    for pool in names(&pools) {
        let out = virsh(&["vol-list", "--pool", pool])?;
        let volumes: Vec<&str> = out
            .lines()
            .skip(2)
            .filter_map(|l| l.split_whitespace().next())
            .filter(|v| is_test_resource(v))
            .collect();
        for volume in volumes {
            print!("  Removing volume {}/{}... ", pool, volume);
            match virsh(&["vol-delete", "--pool", pool, volume]) {
                Ok(_) => {
                    println!("✓");
                    cleaned += 1;
                }
                Err(e) => {
                    println!("✗ (failed)");
                    eprintln!("    Error: {}", e);
                }
            }
        }
    }

    println!("Cleanup completed: {} volume(s) removed", cleaned);
    Ok(())
}

fn main() {
    let mut errors = Vec::new();

    // Domains first, so their disks are no longer in use
    if let Err(e) = cleanup_integration_test_domains() {
        eprintln!("Error during domain cleanup: {}", e);
        errors.push(format!("domains: {}", e));
    }

    if let Err(e) = cleanup_integration_test_volumes() {
        eprintln!("Error during volume cleanup: {}", e);
        errors.push(format!("volumes: {}", e));
    }

    if !errors.is_empty() {
        eprintln!("Cleanup completed with errors: {}", errors.join(", "));
        std::process::exit(1);
    }
}
