//! Spawn the jobscript as the worker user, with the environment the
//! workflow tooling expects.

use anyhow::Context;
use tokio::process::Child;
use tokio::process::Command;

use crate::BASE_DIR;
use crate::CONDA_BIN;
use crate::JOBSCRIPT_PATH;
use crate::WORKFLOW_DIR;
use crate::user;
use crate::user::WorkerUser;

pub fn spawn(worker: WorkerUser) -> anyhow::Result<Child> {
    let inherited_path = std::env::var("PATH").unwrap_or_default();
    let mut command = Command::new("/bin/bash");
    command
        .arg(JOBSCRIPT_PATH)
        .current_dir(WORKFLOW_DIR)
        .env("LC_ALL", "C")
        .env("LANG", "C")
        .env("HOME", BASE_DIR)
        .env("PATH", format!("{CONDA_BIN}:{inherited_path}"));
    unsafe {
        command.pre_exec(move || user::drop_privileges(worker));
    }
    command.spawn().context("spawning the jobscript")
}
