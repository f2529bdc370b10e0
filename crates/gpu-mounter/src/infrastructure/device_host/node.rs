//! Device files inside a container's mount namespace, reached through
//! `/proc/<pid>/root`.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use crate::domain::resource::DeviceNode;

const NODE_MODE: u32 = 0o666;

/// glibc `makedev` encoding.
pub fn makedev(major: u32, minor: u32) -> u64 {
    let (major, minor) = (u64::from(major), u64::from(minor));
    ((major & 0xffff_f000) << 32)
        | ((major & 0x0000_0fff) << 8)
        | ((minor & 0xffff_ff00) << 12)
        | (minor & 0x0000_00ff)
}

pub fn major(dev: u64) -> u32 {
    (((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0000_0fff)) as u32
}

pub fn minor(dev: u64) -> u32 {
    (((dev >> 12) & 0xffff_ff00) | (dev & 0x0000_00ff)) as u32
}

/// Reads major and minor of a character device on the host.
pub fn stat_device(path: &Path) -> io::Result<DeviceNode> {
    let rdev = std::fs::metadata(path)?.rdev();
    Ok(DeviceNode::new(path, major(rdev), minor(rdev)))
}

/// Host path of `node` as seen by process `pid`.
pub fn path_in_container(proc_root: &Path, pid: u32, node: &DeviceNode) -> PathBuf {
    let relative = node.path.strip_prefix("/").unwrap_or(&node.path);
    proc_root.join(pid.to_string()).join("root").join(relative)
}

/// Creates the character device with mode 0666. An existing file counts as
/// success.
pub fn create(proc_root: &Path, pid: u32, node: &DeviceNode) -> io::Result<()> {
    let path = path_in_container(proc_root, pid, node);
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
    let ret = unsafe {
        libc::mknod(
            c_path.as_ptr(),
            libc::S_IFCHR | NODE_MODE as libc::mode_t,
            makedev(node.major, node.minor) as libc::dev_t,
        )
    };
    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EEXIST) {
            return Ok(());
        }
        return Err(err);
    }
    // mknod applies the umask
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(NODE_MODE))
}

/// Removes the device file. A missing file counts as success.
pub fn remove(proc_root: &Path, pid: u32, node: &DeviceNode) -> io::Result<()> {
    match std::fs::remove_file(path_in_container(proc_root, pid, node)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
