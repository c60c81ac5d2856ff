//! Block-device discovery via `lsblk -b -r -p`: one header line naming the
//! columns, then one space-separated row per device. The parser keys cells
//! by header position and treats missing trailing columns (an unmounted
//! device has no MOUNTPOINT cell) as empty.

use anyhow::Context;
use anyhow::bail;
use anyhow::ensure;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    pub kind: String,
    pub mountpoint: String,
}

pub async fn list() -> anyhow::Result<Vec<BlockDevice>> {
    let output = Command::new("lsblk")
        .args(["-b", "-r", "-p"])
        .output()
        .await
        .context("running lsblk")?;
    ensure!(output.status.success(), "lsblk exited with {}", output.status);
    parse_lsblk(&String::from_utf8_lossy(&output.stdout))
}

pub fn parse_lsblk(text: &str) -> anyhow::Result<Vec<BlockDevice>> {
    let mut lines = text.trim_end().lines();
    let Some(header) = lines.next() else {
        bail!("empty lsblk output");
    };
    let columns: Vec<&str> = header.split(' ').collect();
    let index_of = |name: &str| {
        columns
            .iter()
            .position(|column| *column == name)
            .with_context(|| format!("lsblk output has no {name} column"))
    };
    let name_index = index_of("NAME")?;
    let kind_index = index_of("TYPE")?;
    let mount_index = index_of("MOUNTPOINT")?;

    let mut devices = Vec::new();
    for line in lines {
        let cells: Vec<&str> = line.split(' ').collect();
        let cell = |index: usize| cells.get(index).copied().unwrap_or("").to_string();
        devices.push(BlockDevice {
            name: cell(name_index),
            kind: cell(kind_index),
            mountpoint: cell(mount_index),
        });
    }
    Ok(devices)
}

/// The device the root filesystem lives on.
pub fn root_device(devices: &[BlockDevice]) -> Option<&BlockDevice> {
    devices.iter().find(|device| device.mountpoint == "/")
}

/// Whole disks that are not (a partition of) the root device.
pub fn scratch_disks<'a>(
    devices: &'a [BlockDevice],
    root: &BlockDevice,
) -> Vec<&'a BlockDevice> {
    devices
        .iter()
        .filter(|device| device.kind == "disk" && !root.name.contains(&device.name))
        .collect()
}

/// Everything mounted somewhere other than `/`, to be unmounted before the
/// scratch volume is assembled.
pub fn stale_mounts(devices: &[BlockDevice]) -> Vec<&BlockDevice> {
    devices
        .iter()
        .filter(|device| !device.mountpoint.is_empty() && device.mountpoint != "/")
        .collect()
}
