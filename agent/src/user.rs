//! Worker-user lookup and the mandatory privilege drop: the job process
//! never runs as root.

use std::ffi::CString;
use std::io;

use anyhow::Context;
use anyhow::bail;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerUser {
    pub uid: u32,
    pub gid: u32,
}

pub fn lookup(name: &str) -> anyhow::Result<WorkerUser> {
    let cname = CString::new(name).context("user name contains a NUL byte")?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; 16 * 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwnam_r(
            cname.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr().cast::<libc::c_char>(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 {
        bail!("getpwnam_r({name}): {}", io::Error::from_raw_os_error(rc));
    }
    if result.is_null() {
        bail!("user {name} not found");
    }
    Ok(WorkerUser {
        uid: pwd.pw_uid,
        gid: pwd.pw_gid,
    })
}

/// Runs between fork and exec in the job child: clear supplementary
/// groups, set gid before uid, then relax the umask for shared output.
pub fn drop_privileges(user: WorkerUser) -> io::Result<()> {
    unsafe {
        if libc::setgroups(0, std::ptr::null()) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setgid(user.gid) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setuid(user.uid) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::umask(0o022);
    }
    Ok(())
}
