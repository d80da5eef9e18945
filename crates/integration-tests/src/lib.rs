//! Shared library code for integration tests
//!
//! This module contains constants and utilities that are shared between
//! the main test binary and helper binaries like cleanup.

// Unfortunately needed here to work with linkme
#![allow(unsafe_code)]

use linkme::distributed_slice;
use rand::Rng;

/// Prefix of every domain and volume created by integration tests
pub const TEST_RESOURCE_PREFIX: &str = "virtmate-it-";

/// Environment variable selecting the libvirt connection used by the tests
pub const TEST_CONNECTION_ENV: &str = "VIRTMATE_TEST_CONNECTION";

/// Connection used when [`TEST_CONNECTION_ENV`] is unset
pub const DEFAULT_TEST_CONNECTION: &str = "qemu:///system";

/// The libvirt connection URI the tests run against
pub fn test_connection() -> String {
    std::env::var(TEST_CONNECTION_ENV).unwrap_or_else(|_| DEFAULT_TEST_CONNECTION.to_owned())
}

/// A test function that returns a Result
pub type TestFn = fn() -> color_eyre::Result<()>;

/// Metadata for a registered integration test
#[derive(Debug)]
pub struct IntegrationTest {
    /// Name of the integration test
    pub name: &'static str,
    /// Test function to execute
    pub f: TestFn,
}

impl IntegrationTest {
    /// Create a new integration test with the given name and function
    pub const fn new(name: &'static str, f: TestFn) -> Self {
        Self { name, f }
    }
}

/// Distributed slice holding all registered integration tests
#[distributed_slice]
pub static INTEGRATION_TESTS: [IntegrationTest];

/// Register an integration test with less boilerplate.
///
/// This macro generates the static registration for an integration test function.
///
/// # Examples
///
/// ```ignore
/// fn test_basic_functionality() -> Result<()> {
///     let output = run_virtmate(&["domain-list"])?;
///     output.assert_success("test");
///     Ok(())
/// }
/// integration_test!(test_basic_functionality);
/// ```
#[macro_export]
macro_rules! integration_test {
    ($fn_name:ident) => {
        ::paste::paste! {
            #[distributed_slice($crate::INTEGRATION_TESTS)]
            static [<$fn_name:upper>]: $crate::IntegrationTest =
                $crate::IntegrationTest::new(stringify!($fn_name), $fn_name);
        }
    };
}

/// A fresh resource name carrying [`TEST_RESOURCE_PREFIX`]
///
/// `kind` is embedded to make leftovers easy to attribute, e.g.
/// `virtmate-it-clone-3f9a0c`.
pub fn unique_name(kind: &str) -> String {
    let suffix: u32 = rand::rng().random_range(0..0x100_0000);
    format!("{TEST_RESOURCE_PREFIX}{kind}-{suffix:06x}")
}

/// Whether a domain or volume name was created by the integration tests
pub fn is_test_resource(name: &str) -> bool {
    name.starts_with(TEST_RESOURCE_PREFIX)
}
