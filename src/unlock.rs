//! Disk discovery and unlock orchestration.
//!
//! Enumerates block devices, decides which ones are locked self-encrypting
//! drives, and drives the per-drive unlock loop. Generic over the credential
//! source, the key derivation scheme, and the locking transport; the loop
//! itself never cares which concrete variants are in play.

use crate::auth::{AuthError, Authenticator};
use crate::device::BlockDeviceScan;
use crate::kdf::KeyDerivation;
use crate::sed::{LockState, SedDrive, SedError, SedTransport};
use log::{info, warn};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum UnlockError {
    /// Without enumeration no drives can be considered at all.
    #[error("failed to enumerate block devices: {0}")]
    Enumeration(#[source] std::io::Error),
    /// The credential source itself broke; re-prompting cannot help.
    #[error("failed to retrieve credential: {0}")]
    Credential(#[from] AuthError),
}

pub type Result<T, E = UnlockError> = core::result::Result<T, E>;

pub struct DiskUnlocker<A, K, T> {
    auth: A,
    kdf: K,
    transport: T,
    scan: BlockDeviceScan,
}

impl<A, K, T> DiskUnlocker<A, K, T>
where
    A: Authenticator,
    K: KeyDerivation,
    T: SedTransport,
{
    pub fn new(auth: A, kdf: K, transport: T, scan: BlockDeviceScan) -> Self {
        Self {
            auth,
            kdf,
            transport,
            scan,
        }
    }

    /// Run one unlock pass over every enumerated drive; returns how many
    /// drives changed state to unlocked.
    ///
    /// The device set is fixed once enumeration completes. A credential,
    /// once accepted, is carried forward to later drives without
    /// re-prompting; any unlock failure clears it so the next attempt has
    /// to re-acquire. Per-device trouble is logged and skips that device
    /// only.
    pub fn unlock_disks(&mut self) -> Result<usize> {
        let devices = self.scan.candidates().map_err(UnlockError::Enumeration)?;

        let mut unlocked_disks = 0;
        // Held credential for this pass, scoped to this call frame.
        let mut credential: Option<Zeroizing<String>> = None;

        for device in devices {
            let node = match device.ensure_node() {
                Ok(node) => node,
                Err(err) => {
                    warn!("{}: {}", device.name(), err);
                    continue;
                }
            };
            let mut drive = match self.transport.open(&node) {
                Ok(drive) => drive,
                Err(err) => {
                    warn!("open {}: {}", node.display(), err);
                    continue;
                }
            };
            let identity = match drive.identify() {
                Ok(identity) => identity,
                Err(err) => {
                    warn!("identify {}: {}", node.display(), err);
                    node.display().to_string()
                }
            };
            let serial = match drive.serial_number() {
                Ok(serial) => serial,
                Err(err) => {
                    warn!("serial number of {}: {}", node.display(), err);
                    Vec::new()
                }
            };
            let state = match drive.discover() {
                Ok(state) => state,
                Err(err) => {
                    warn!("discovery on {}: {}", node.display(), err);
                    continue;
                }
            };

            match state {
                // Simply not a self-encrypting drive.
                LockState::NotSupported => continue,
                LockState::Unlocked => {
                    info!("considered drive {}, but drive is not locked", identity);
                }
                LockState::Locked {
                    mbr_enabled,
                    mbr_done,
                } => {
                    info!("drive {} is locked", identity);
                    log::debug!(
                        "drive {} serial (key salt): {}",
                        identity,
                        hex::encode(&serial)
                    );
                    if mbr_enabled && !mbr_done {
                        info!("drive {} has active shadow MBR", identity);
                    }
                    if self.unlock_loop(&mut drive, &identity, &serial, &mut credential)? {
                        info!("drive {} has been unlocked", node.display());
                        unlocked_disks += 1;
                    }
                }
            }
        }
        Ok(unlocked_disks)
    }

    /// Retry until the drive unlocks or the credential source declines.
    /// Intentionally unbounded: an operator who keeps trying should keep
    /// being able to.
    fn unlock_loop(
        &mut self,
        drive: &mut T::Drive,
        identity: &str,
        serial: &[u8],
        credential: &mut Option<Zeroizing<String>>,
    ) -> Result<bool> {
        loop {
            let held = match credential {
                Some(held) => held,
                None => {
                    let fresh = self.auth.retrieve_password()?;
                    if fresh.is_empty() {
                        // The source chose to skip this drive.
                        info!("no credential supplied, skipping {}", identity);
                        return Ok(false);
                    }
                    credential.insert(fresh)
                }
            };
            let key = self.kdf.derive_key(held.as_str(), serial);

            match unlock_drive(drive, key.as_slice()) {
                Ok(()) => return Ok(true),
                Err(err) => {
                    warn!("failed to unlock {}: {}", identity, err);
                    // force re-acquisition on the next iteration
                    *credential = None;
                }
            }
        }
    }
}

/// One unlock attempt inside a scoped locking session.
///
/// Individual range failures are logged per range; the hand-over of the
/// shadow MBR must succeed or the whole attempt counts as rejected.
fn unlock_drive<D: SedDrive>(drive: &mut D, key: &[u8]) -> Result<(), SedError> {
    let mut session = drive.open_session(key)?;

    for range in 0..session.ranges() {
        if let Err(err) = session.unlock_read(range) {
            warn!("read unlock of range {} failed: {}", range, err);
        }
        if let Err(err) = session.unlock_write(range) {
            warn!("write unlock of range {} failed: {}", range, err);
        }
    }

    if session.mbr_enabled() && !session.mbr_done() {
        session.set_mbr_done(true)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::SedutilSha1;
    use crate::sed::SedSession;
    use eyre::Result;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::rc::Rc;
    use tempfile::{tempdir, TempDir};

    /// Authenticator that replays a scripted sequence of responses and
    /// counts how often it was asked.
    struct ScriptedAuth {
        responses: RefCell<VecDeque<&'static str>>,
        calls: Rc<RefCell<usize>>,
    }

    impl ScriptedAuth {
        fn new(responses: &[&'static str]) -> (Self, Rc<RefCell<usize>>) {
            let calls = Rc::new(RefCell::new(0));
            (
                Self {
                    responses: RefCell::new(responses.iter().copied().collect()),
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl Authenticator for ScriptedAuth {
        fn retrieve_password(&self) -> crate::auth::Result<Zeroizing<String>> {
            *self.calls.borrow_mut() += 1;
            let next = self.responses.borrow_mut().pop_front().unwrap_or_else(|| {
                panic!("authenticator called more often than scripted")
            });
            Ok(Zeroizing::new(next.to_string()))
        }
    }

    /// What one fake drive did during the pass.
    #[derive(Debug, Default)]
    struct DriveJournal {
        observed_keys: Vec<Vec<u8>>,
        read_unlocks: Vec<usize>,
        write_unlocks: Vec<usize>,
        mbr_done_calls: usize,
    }

    struct FakeDriveSpec {
        state: LockState,
        serial: &'static [u8],
        /// Keys the firmware accepts.
        accepted: Vec<Vec<u8>>,
        journal: Rc<RefCell<DriveJournal>>,
    }

    struct FakeTransport {
        drives: Vec<(PathBuf, FakeDriveSpec)>,
    }

    impl SedTransport for FakeTransport {
        type Drive = FakeDrive;

        fn open(&mut self, path: &Path) -> crate::sed::Result<Self::Drive> {
            let spec = self
                .drives
                .iter()
                .find(|(node, _)| node == path)
                .map(|(_, spec)| spec)
                .expect("opened a device that was never scripted");
            Ok(FakeDrive {
                state: spec.state,
                serial: spec.serial.to_vec(),
                accepted: spec.accepted.clone(),
                journal: spec.journal.clone(),
            })
        }
    }

    struct FakeDrive {
        state: LockState,
        serial: Vec<u8>,
        accepted: Vec<Vec<u8>>,
        journal: Rc<RefCell<DriveJournal>>,
    }

    impl SedDrive for FakeDrive {
        fn identify(&mut self) -> crate::sed::Result<String> {
            Ok("Fake SED 1000".to_string())
        }

        fn serial_number(&mut self) -> crate::sed::Result<Vec<u8>> {
            Ok(self.serial.clone())
        }

        fn discover(&mut self) -> crate::sed::Result<LockState> {
            Ok(self.state)
        }

        fn open_session(&mut self, key: &[u8]) -> crate::sed::Result<Box<dyn SedSession + '_>> {
            self.journal.borrow_mut().observed_keys.push(key.to_vec());
            if !self.accepted.iter().any(|k| k == key) {
                return Err(SedError::Rejected);
            }
            let (mbr_enabled, mbr_done) = match self.state {
                LockState::Locked {
                    mbr_enabled,
                    mbr_done,
                } => (mbr_enabled, mbr_done),
                _ => (false, false),
            };
            Ok(Box::new(FakeSession {
                journal: self.journal.clone(),
                mbr_enabled,
                mbr_done,
            }))
        }
    }

    struct FakeSession {
        journal: Rc<RefCell<DriveJournal>>,
        mbr_enabled: bool,
        mbr_done: bool,
    }

    impl SedSession for FakeSession {
        fn ranges(&self) -> usize {
            2
        }

        fn unlock_read(&mut self, range: usize) -> crate::sed::Result<()> {
            self.journal.borrow_mut().read_unlocks.push(range);
            Ok(())
        }

        fn unlock_write(&mut self, range: usize) -> crate::sed::Result<()> {
            self.journal.borrow_mut().write_unlocks.push(range);
            Ok(())
        }

        fn mbr_enabled(&self) -> bool {
            self.mbr_enabled
        }

        fn mbr_done(&self) -> bool {
            self.mbr_done
        }

        fn set_mbr_done(&mut self, done: bool) -> crate::sed::Result<()> {
            assert!(done);
            self.journal.borrow_mut().mbr_done_calls += 1;
            Ok(())
        }
    }

    /// Fake sysfs/dev trees with one entry per drive; nodes pre-exist so no
    /// mknod is attempted.
    fn scripted_scan(names: &[&str]) -> Result<(TempDir, TempDir, BlockDeviceScan, Vec<PathBuf>)> {
        let sysfs = tempdir()?;
        let dev = tempdir()?;
        let mut nodes = Vec::new();
        for name in names {
            fs::create_dir_all(sysfs.path().join(name).join("device"))?;
            let node = dev.path().join(name);
            fs::write(&node, b"")?;
            nodes.push(node);
        }
        let scan = BlockDeviceScan::new(sysfs.path(), dev.path());
        Ok((sysfs, dev, scan, nodes))
    }

    fn key_for(credential: &str, serial: &[u8]) -> Vec<u8> {
        SedutilSha1.derive_key(credential, serial).to_vec()
    }

    fn locked_plain() -> LockState {
        LockState::Locked {
            mbr_enabled: false,
            mbr_done: false,
        }
    }

    #[test]
    fn empty_credential_abandons_every_drive() -> Result<()> {
        let (_sysfs, _dev, scan, nodes) = scripted_scan(&["sda", "sdb"])?;
        let journals: Vec<_> = (0..2)
            .map(|_| Rc::new(RefCell::new(DriveJournal::default())))
            .collect();
        let transport = FakeTransport {
            drives: nodes
                .iter()
                .zip(&journals)
                .map(|(node, journal)| {
                    (
                        node.clone(),
                        FakeDriveSpec {
                            state: locked_plain(),
                            serial: b"SER-1",
                            accepted: vec![],
                            journal: journal.clone(),
                        },
                    )
                })
                .collect(),
        };
        let (auth, calls) = ScriptedAuth::new(&["", ""]);

        let mut unlocker = DiskUnlocker::new(auth, SedutilSha1, transport, scan);
        assert_eq!(unlocker.unlock_disks()?, 0);
        // one decline per locked drive, no unlock attempts at all
        assert_eq!(*calls.borrow(), 2);
        for journal in &journals {
            assert!(journal.borrow().observed_keys.is_empty());
        }
        Ok(())
    }

    #[test]
    fn credential_is_reused_across_drives() -> Result<()> {
        let (_sysfs, _dev, scan, nodes) = scripted_scan(&["sda", "sdb"])?;
        let journals: Vec<_> = (0..2)
            .map(|_| Rc::new(RefCell::new(DriveJournal::default())))
            .collect();
        let serials: [&'static [u8]; 2] = [b"SER-1", b"SER-2"];
        let transport = FakeTransport {
            drives: nodes
                .iter()
                .zip(&journals)
                .zip(serials)
                .map(|((node, journal), serial)| {
                    (
                        node.clone(),
                        FakeDriveSpec {
                            state: locked_plain(),
                            serial,
                            accepted: vec![key_for("X", serial)],
                            journal: journal.clone(),
                        },
                    )
                })
                .collect(),
        };
        // a second call would panic the scripted authenticator
        let (auth, calls) = ScriptedAuth::new(&["X"]);

        let mut unlocker = DiskUnlocker::new(auth, SedutilSha1, transport, scan);
        assert_eq!(unlocker.unlock_disks()?, 2);
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(journals[1].borrow().observed_keys, vec![key_for("X", b"SER-2")]);
        Ok(())
    }

    #[test]
    fn rejected_credential_is_cleared_and_reacquired() -> Result<()> {
        let (_sysfs, _dev, scan, nodes) = scripted_scan(&["sda"])?;
        let journal = Rc::new(RefCell::new(DriveJournal::default()));
        let transport = FakeTransport {
            drives: vec![(
                nodes[0].clone(),
                FakeDriveSpec {
                    state: locked_plain(),
                    serial: b"SER-1",
                    accepted: vec![key_for("right", b"SER-1")],
                    journal: journal.clone(),
                },
            )],
        };
        let (auth, calls) = ScriptedAuth::new(&["wrong", "right"]);

        let mut unlocker = DiskUnlocker::new(auth, SedutilSha1, transport, scan);
        assert_eq!(unlocker.unlock_disks()?, 1);
        assert_eq!(*calls.borrow(), 2);
        let observed = &journal.borrow().observed_keys;
        assert_eq!(observed.len(), 2);
        assert_ne!(observed[0], observed[1]);
        Ok(())
    }

    #[test]
    fn unsupported_and_unlocked_drives_are_noops() -> Result<()> {
        let (_sysfs, _dev, scan, nodes) = scripted_scan(&["sda", "sdb"])?;
        let journals: Vec<_> = (0..2)
            .map(|_| Rc::new(RefCell::new(DriveJournal::default())))
            .collect();
        let states = [LockState::NotSupported, LockState::Unlocked];
        let transport = FakeTransport {
            drives: nodes
                .iter()
                .zip(&journals)
                .zip(states)
                .map(|((node, journal), state)| {
                    (
                        node.clone(),
                        FakeDriveSpec {
                            state,
                            serial: b"SER-1",
                            accepted: vec![],
                            journal: journal.clone(),
                        },
                    )
                })
                .collect(),
        };
        // any authenticator call would panic
        let (auth, calls) = ScriptedAuth::new(&[]);

        let mut unlocker = DiskUnlocker::new(auth, SedutilSha1, transport, scan);
        assert_eq!(unlocker.unlock_disks()?, 0);
        assert_eq!(*calls.borrow(), 0);
        Ok(())
    }

    #[test]
    fn end_to_end_shadow_mbr_handover() -> Result<()> {
        let (_sysfs, _dev, scan, nodes) = scripted_scan(&["nvme0n1"])?;
        let journal = Rc::new(RefCell::new(DriveJournal::default()));
        let transport = FakeTransport {
            drives: vec![(
                nodes[0].clone(),
                FakeDriveSpec {
                    state: LockState::Locked {
                        mbr_enabled: true,
                        mbr_done: false,
                    },
                    serial: b"ABC123",
                    accepted: vec![key_for("secret", b"ABC123")],
                    journal: journal.clone(),
                },
            )],
        };
        let (auth, _calls) = ScriptedAuth::new(&["secret"]);

        let mut unlocker = DiskUnlocker::new(auth, SedutilSha1, transport, scan);
        assert_eq!(unlocker.unlock_disks()?, 1);

        let journal = journal.borrow();
        assert_eq!(journal.observed_keys, vec![key_for("secret", b"ABC123")]);
        assert_eq!(journal.read_unlocks, vec![0, 1]);
        assert_eq!(journal.write_unlocks, vec![0, 1]);
        assert_eq!(journal.mbr_done_calls, 1);
        Ok(())
    }

    #[test]
    fn enumeration_failure_is_hard() {
        let scan = BlockDeviceScan::new("/definitely/not/sysfs", "/dev");
        let (auth, _calls) = ScriptedAuth::new(&[]);
        let transport = FakeTransport { drives: vec![] };
        let mut unlocker = DiskUnlocker::new(auth, SedutilSha1, transport, scan);
        assert!(matches!(
            unlocker.unlock_disks(),
            Err(UnlockError::Enumeration(_))
        ));
    }
}
