//! Integration tests for virtmate
//!
//! The tests drive the `virtmate` binary against a real libvirt daemon. When
//! `virsh` cannot reach the daemon every test passes with a note instead.

use camino::Utf8Path;
use std::process::Output;
use std::sync::OnceLock;

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use integration_tests::integration_test;
use libtest_mimic::{Arguments, Trial};
use linkme::distributed_slice;
use serde_json::Value;
use xshell::{cmd, Shell};

pub(crate) use integration_tests::{test_connection, INTEGRATION_TESTS};

mod tests {
    pub mod domain_clone;
    pub mod listing;
}

/// Get the path to the virtmate binary, checking VIRTMATE_PATH env var first
pub(crate) fn get_virtmate_command() -> Result<String> {
    if let Ok(path) = std::env::var("VIRTMATE_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/virtmate", "target/release/virtmate"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set VIRTMATE_PATH={path} to run using this binary"
        ));
    }
    Ok("virtmate".to_owned())
}

/// Whether the test daemon is unreachable, in which case the caller should
/// return early. Checked once per run.
pub(crate) fn skip_without_libvirt() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    let available = *AVAILABLE.get_or_init(|| {
        let conn = test_connection();
        std::process::Command::new("virsh")
            .args(["-c", conn.as_str(), "version"])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    });
    if !available {
        println!("Skipping: libvirt is not reachable at {}", test_connection());
    }
    !available
}

/// Captured output from a command with decoded stdout/stderr strings
pub(crate) struct CapturedOutput {
    pub output: Output,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// Create from a raw Output
    pub fn new(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Self {
            output,
            stdout,
            stderr,
        }
    }

    /// Assert that the command succeeded, printing debug info on failure
    pub fn assert_success(&self, context: &str) {
        assert!(
            self.output.status.success(),
            "{} failed: {}",
            context,
            self.stderr
        );
    }

    /// Get the exit code
    pub fn exit_code(&self) -> Option<i32> {
        self.output.status.code()
    }

    /// Check if the command succeeded
    pub fn success(&self) -> bool {
        self.output.status.success()
    }

    /// Parse stdout as JSON
    pub fn json(&self) -> Result<Value> {
        serde_json::from_str(&self.stdout)
            .with_context(|| format!("Failed to parse JSON output: {}", self.stdout))
    }
}

/// Run the virtmate command against the test connection, capturing output
pub(crate) fn run_virtmate(args: &[&str]) -> Result<CapturedOutput> {
    let virtmate = get_virtmate_command()?;
    let output = std::process::Command::new(&virtmate)
        .arg("-c")
        .arg(test_connection())
        .args(args)
        .output()
        .with_context(|| format!("Running {virtmate}"))?;
    Ok(CapturedOutput::new(output))
}

/// Run virsh against the test connection and return its stdout
pub(crate) fn virsh(args: &[&str]) -> Result<String> {
    let sh = Shell::new()?;
    let conn = test_connection();
    let out = cmd!(sh, "virsh -c {conn} {args...}")
        .quiet()
        .read()
        .with_context(|| format!("virsh {}", args.join(" ")))?;
    Ok(out)
}

fn test_version() -> Result<()> {
    let out = run_virtmate(&["--version"])?;
    out.assert_success("virtmate --version");
    assert!(out.stdout.starts_with("virtmate "), "{}", out.stdout);
    Ok(())
}
integration_test!(test_version);

fn main() {
    let args = Arguments::from_args();

    // Collect tests from the distributed slice
    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let name = test.name;
            let f = test.f;
            Trial::test(name, move || f().map_err(|e| format!("{:?}", e).into()))
        })
        .collect();

    // Run the tests and exit with the result
    libtest_mimic::run(&args, tests).exit();
}
