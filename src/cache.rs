//! Linux filesystem cache dropping between conversions.
//!
//! Long batch runs over large DICOM trees fill the page cache faster than
//! the kernel reclaims it; dropping it between cases is a resource-pressure
//! workaround with no effect on the converted output. Requires sudo.

use anyhow::{ensure, Result};
use tokio::process::Command;

/// Clears the Linux filesystem cache (PageCache, Dentries, and Inodes).
///
/// Failures propagate to the caller and abort the run.
pub async fn clear_filesystem_cache() -> Result<()> {
    // Sync to ensure all buffers are flushed
    let status = Command::new("sudo").arg("sync").status().await?;
    ensure!(status.success(), "sync exited with {}", status);

    let status = Command::new("sudo")
        .args(["sh", "-c", "echo 3 > /proc/sys/vm/drop_caches"])
        .status()
        .await?;
    ensure!(status.success(), "drop_caches exited with {}", status);

    println!("Cleared filesystem cache");
    Ok(())
}
