//! Scratch storage: fold the instance's extra local disks into one xfs
//! volume mounted at /tmp, and move the worker home onto it. With no extra
//! disk the job simply runs on the root volume.

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;

use anyhow::Context;
use anyhow::ensure;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;
use tracing::warn;

use crate::BASE_DIR;
use crate::MOUNT_DIR;
use crate::WORKER_USER;
use crate::blockdev;
use crate::blockdev::BlockDevice;

const RAID_DEVICE: &str = "/dev/md0";

pub async fn setup_scratch() -> anyhow::Result<()> {
    let devices = blockdev::list().await?;
    let Some(root) = blockdev::root_device(&devices) else {
        anyhow::bail!("no root mount in lsblk output");
    };

    for mounted in blockdev::stale_mounts(&devices) {
        run_logged("umount", &[&mounted.mountpoint]).await;
    }

    let disks = blockdev::scratch_disks(&devices, root);
    let device = match disks.len() {
        0 => {
            info!("no scratch disk found");
            return Ok(());
        }
        1 => disks[0].name.clone(),
        _ => {
            assemble_raid0(&disks).await?;
            RAID_DEVICE.to_string()
        }
    };

    run_checked("mkfs.xfs", &["-f", &device]).await?;
    // park the home dir while /tmp is replaced underneath it
    run_checked("mv", &[BASE_DIR, "/home/"]).await?;
    run_checked("mount", &[&device, MOUNT_DIR]).await?;
    let parked = format!("/home/{WORKER_USER}");
    run_checked("mv", &[&parked, MOUNT_DIR]).await?;
    std::fs::set_permissions(MOUNT_DIR, Permissions::from_mode(0o777))
        .context("chmod scratch mount")?;
    Ok(())
}

async fn assemble_raid0(disks: &[&BlockDevice]) -> anyhow::Result<()> {
    let mut command = Command::new("mdadm");
    command.args(["-C", "--force", RAID_DEVICE, "--level=0", "-n"]);
    command.arg(disks.len().to_string());
    for disk in disks {
        command.arg(&disk.name);
    }
    command.stdin(Stdio::piped());
    let mut child = command.spawn().context("starting mdadm")?;
    if let Some(mut stdin) = child.stdin.take() {
        // mdadm asks for confirmation when members carry filesystem traces
        let _ = stdin.write_all(b"y\ny\ny\ny\n").await;
    }
    let status = child.wait().await.context("waiting for mdadm")?;
    ensure!(status.success(), "mdadm exited with {status}");
    Ok(())
}

async fn run_checked(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("starting {program}"))?;
    ensure!(status.success(), "{program} {args:?} exited with {status}");
    Ok(())
}

async fn run_logged(program: &str, args: &[&str]) {
    match Command::new(program).args(args).status().await {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("{program} {args:?} exited with {status}"),
        Err(err) => warn!("{program} failed to start: {err}"),
    }
}
