//! Helper functions for interacting with qemu-img

use std::process::Command;

use camino::Utf8Path;
use color_eyre::{eyre::Context, Result};
use serde::Deserialize;

use crate::cmdext::CommandRunExt;

/// Information returned by `qemu-img info --output=json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QemuImgInfo {
    /// Virtual size of the disk image in bytes
    pub virtual_size: u64,
    /// Image format (e.g., "qcow2", "raw")
    pub format: String,
    /// Actual size on disk in bytes (if available)
    pub actual_size: Option<u64>,
    /// Backing file name, for layered images
    pub backing_filename: Option<String>,
}

/// Run `qemu-img info --force-share --output=json` on a disk image
///
/// The `--force-share` flag allows reading disk info even when the image
/// is locked by a running VM.
pub fn info(path: &Utf8Path) -> Result<QemuImgInfo> {
    Command::new("qemu-img")
        .args(["info", "--force-share", "--output=json", path.as_str()])
        .run_and_parse_json()
        .with_context(|| format!("Failed to run qemu-img info on {path}"))
}
