//! Locking-protocol capability consumed by the unlock orchestrator.
//!
//! The traits here are the seam between orchestration and whatever actually
//! speaks to the drive. [`kernel`] supplies the production backend via the
//! Linux sed-opal ioctl family; tests supply in-memory fakes.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod kernel;

#[derive(Error, Debug)]
pub enum SedError {
    #[error("{op} on {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("drive rejected the supplied key")]
    Rejected,
    #[error("drive has no readable serial number")]
    NoSerial,
}

pub type Result<T, E = SedError> = core::result::Result<T, E>;

impl SedError {
    pub(crate) fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        SedError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Locking state reported by protocol discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// The device does not speak the locking protocol; not a SED.
    NotSupported,
    /// Lockable but currently unlocked (factory state or a prior boot).
    Unlocked,
    Locked { mbr_enabled: bool, mbr_done: bool },
}

/// Opens drives by device node path.
pub trait SedTransport {
    type Drive: SedDrive;

    fn open(&mut self, path: &Path) -> Result<Self::Drive>;
}

/// One candidate drive. Identity and serial are best-effort diagnostics;
/// discovery decides whether the drive is worth an unlock attempt at all.
pub trait SedDrive {
    fn identify(&mut self) -> Result<String>;
    fn serial_number(&mut self) -> Result<Vec<u8>>;
    fn discover(&mut self) -> Result<LockState>;

    /// Establish a locking session authenticated with `key`. The session is
    /// scoped to one unlock attempt and released on drop; it is never held
    /// across loop iterations.
    fn open_session(&mut self, key: &[u8]) -> Result<Box<dyn SedSession + '_>>;
}

/// An authenticated locking session.
pub trait SedSession {
    /// Number of locking ranges this session can address.
    fn ranges(&self) -> usize;
    fn unlock_read(&mut self, range: usize) -> Result<()>;
    fn unlock_write(&mut self, range: usize) -> Result<()>;
    fn mbr_enabled(&self) -> bool;
    fn mbr_done(&self) -> bool;
    fn set_mbr_done(&mut self, done: bool) -> Result<()>;
}
