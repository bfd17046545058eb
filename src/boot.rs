//! Boot orchestration: system bring-up, the unlock pass, the confirmation
//! window, and hand-off to the next stage.

use crate::auth::Authenticator;
use crate::console::{self, Console};
use crate::kdf::KeyDerivation;
use crate::sed::SedTransport;
use crate::unlock::{DiskUnlocker, UnlockError};
use log::{error, info, warn};
use std::ffi::CString;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

const CONFIRM_WINDOW: Duration = Duration::from_secs(3);
const CONFIRM_TICK: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum BringupError {
    #[error("failed to mount {fstype} on {target}: {source}")]
    Mount {
        fstype: &'static str,
        target: &'static str,
        source: std::io::Error,
    },
}

pub type Result<T, E = BringupError> = core::result::Result<T, E>;

/// Computed once per boot from the unlock results and the operator's
/// confirmation-window input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDecision {
    ProceedToOs,
    EmergencyShell,
}

/// Minimal system bring-up. Everything after this point assumes a working
/// process and firmware view, so a machine that cannot mount these has no
/// recovery path.
pub fn bring_up() -> Result<()> {
    mount("proc", "/proc", "proc")?;
    mount("sysfs", "/sys", "sysfs")?;
    mount("efivarfs", "/sys/firmware/efi/efivars", "efivarfs")?;
    Ok(())
}

fn mount(source: &'static str, target: &'static str, fstype: &'static str) -> Result<()> {
    // CString::new never fails for these literals.
    let c_source = CString::new(source).unwrap_or_default();
    let c_target = CString::new(target).unwrap_or_default();
    let c_fstype = CString::new(fstype).unwrap_or_default();
    let ret = unsafe {
        libc::mount(
            c_source.as_ptr(),
            c_target.as_ptr(),
            c_fstype.as_ptr(),
            0,
            std::ptr::null(),
        )
    };
    if ret != 0 {
        return Err(BringupError::Mount {
            fstype,
            target,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn set_boot_env() {
    std::env::set_var("PATH", "/bin:/sbin:/usr/bin:/usr/sbin");
    std::env::set_var("USER", "root");
    std::env::set_var("HOME", "/root");
    std::env::set_var("TZ", "UTC");
}

/// Map the unlock outcome and the operator's window input to a decision.
///
/// Zero drives unlocked means either nothing needed unlocking or every
/// attempt was abandoned; both cases defer to a human. The window is only
/// entered when at least one drive actually unlocked.
pub fn decide<F>(unlock_result: std::result::Result<usize, UnlockError>, confirm: F) -> BootDecision
where
    F: FnOnce() -> bool,
{
    match unlock_result {
        Err(err) => {
            error!("failed to unlock disks: {}", err);
            BootDecision::EmergencyShell
        }
        Ok(0) => {
            warn!("no drives changed state to unlocked, starting shell for troubleshooting");
            BootDecision::EmergencyShell
        }
        Ok(count) => {
            info!("{} drive(s) unlocked", count);
            if confirm() {
                BootDecision::EmergencyShell
            } else {
                BootDecision::ProceedToOs
            }
        }
    }
}

fn confirmation_window() -> bool {
    let mut console = match Console::open() {
        Ok(console) => console,
        Err(err) => {
            warn!("open {} failed: {}", console::CONSOLE_PATH, err);
            return false;
        }
    };
    console.wait_for_interrupt(
        "Starting OS in 3 seconds, press Enter to start shell instead: ",
        CONFIRM_WINDOW,
        CONFIRM_TICK,
    )
}

/// Run the whole boot sequence. Never returns in the normal case: either the
/// machine restarts into the next stage or the emergency shell loops forever.
pub fn run<A, K, T>(mut unlocker: DiskUnlocker<A, K, T>, shell: &Path) -> Result<()>
where
    A: Authenticator,
    K: KeyDerivation,
    T: SedTransport,
{
    bring_up()?;

    println!();
    println!(
        "Welcome to {} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    println!();
    info!("starting system...");

    if let Err(err) = console::set_console_log_level(console::KLOG_NOTICE) {
        warn!("could not set console log level: {}", err);
    }
    set_boot_env();

    match decide(unlocker.unlock_disks(), confirmation_window) {
        BootDecision::ProceedToOs => {
            // A direct mount-and-boot would replay a dirty journal even under
            // a read-only mount and corrupt a hibernated image; a controlled
            // restart lets the next stage pick the mount mode.
            execute(Path::new("/sbin/reboot"), &[]);
        }
        BootDecision::EmergencyShell => {}
    }

    emergency_shell(shell)
}

/// Terminal state of the whole system: relaunch the shell unconditionally,
/// forever. There is no further fallback below this.
fn emergency_shell(shell: &Path) -> ! {
    info!("starting emergency shell...");
    loop {
        execute(shell, &[]);
    }
}

/// Run a program with the fixed boot environment, the console as its
/// controlling terminal, and a fresh session group. Blocks until it exits.
pub fn execute(program: &Path, args: &[&str]) {
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir("/")
        .env("USER", "root")
        .env("HOME", "/root")
        .env("TZ", "UTC");
    unsafe {
        command.pre_exec(|| {
            // Best effort: already being a session leader is fine, and a
            // missing controlling terminal should not stop the shell.
            libc::setsid();
            libc::ioctl(0, libc::TIOCSCTTY, 1);
            Ok(())
        });
    }
    match command.status() {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("{} exited with {}", program.display(), status),
        Err(err) => warn!("failed to execute {}: {}", program.display(), err),
    }
}
