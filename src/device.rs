//! Block device enumeration from the sysfs class registry.
//!
//! A pre-boot environment has no udevd, so device special files for the
//! drives we want to unlock may not exist yet; they are created here from
//! the registry's `dev` attribute.

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SYSFS_BLOCK: &str = "/sys/class/block";
const DEV_ROOT: &str = "/dev";

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("failed to read {}: {source}", path.display())]
    Attribute {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed device numbers `{0}`")]
    DevNumbers(String),
    #[error("mknod {}: {source}", path.display())]
    Mknod {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T, E = DeviceError> = core::result::Result<T, E>;

/// Scans the block device class registry.
///
/// Roots are parameters so tests can point the scan at a synthetic tree;
/// production uses `/sys/class/block` and `/dev`.
#[derive(Debug, Clone)]
pub struct BlockDeviceScan {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for BlockDeviceScan {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(SYSFS_BLOCK),
            dev_root: PathBuf::from(DEV_ROOT),
        }
    }
}

impl BlockDeviceScan {
    pub fn new(sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            dev_root: dev_root.into(),
        }
    }

    /// Candidate drives in registry enumeration order. Entries without a
    /// backing `device` attribute (loop, ram, partitions of the above) are
    /// not physical drives and are dropped here.
    ///
    /// Failure to read the registry at all is the one hard error of the
    /// whole unlock pass.
    pub fn candidates(&self) -> std::io::Result<Vec<BlockDevice>> {
        let mut entries = fs::read_dir(&self.sysfs_root)?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        let mut devices = Vec::new();
        for entry in entries {
            if !entry.path().join("device").exists() {
                continue;
            }
            devices.push(BlockDevice {
                node: self.dev_root.join(entry.file_name()),
                sysfs_path: entry.path(),
            });
        }
        Ok(devices)
    }
}

/// One enumerated block device.
#[derive(Debug, Clone)]
pub struct BlockDevice {
    sysfs_path: PathBuf,
    node: PathBuf,
}

impl BlockDevice {
    pub fn name(&self) -> String {
        self.sysfs_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Ensure the device special file exists, creating it from the
    /// registry's major:minor numbers when absent. Owner-only permissions;
    /// nothing else runs this early, but the node outlives us.
    pub fn ensure_node(&self) -> Result<PathBuf> {
        if self.node.exists() {
            return Ok(self.node.clone());
        }
        let attr = self.sysfs_path.join("dev");
        let raw = fs::read_to_string(&attr).map_err(|source| DeviceError::Attribute {
            path: attr,
            source,
        })?;
        let (major, minor) = parse_dev_numbers(&raw)?;
        mknod_block(&self.node, major, minor)?;
        Ok(self.node.clone())
    }
}

fn parse_dev_numbers(raw: &str) -> Result<(u32, u32)> {
    let malformed = || DeviceError::DevNumbers(raw.trim().to_string());
    let (major, minor) = raw.trim().split_once(':').ok_or_else(malformed)?;
    Ok((
        major.parse().map_err(|_| malformed())?,
        minor.parse().map_err(|_| malformed())?,
    ))
}

fn mknod_block(node: &Path, major: u32, minor: u32) -> Result<()> {
    let c_path = CString::new(node.as_os_str().as_bytes()).map_err(|_| DeviceError::Mknod {
        path: node.to_path_buf(),
        source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
    })?;
    let dev = libc::makedev(major, minor);
    let ret = unsafe { libc::mknod(c_path.as_ptr(), libc::S_IFBLK | 0o600, dev) };
    if ret != 0 {
        return Err(DeviceError::Mknod {
            path: node.to_path_buf(),
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}
