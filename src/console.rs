//! Console plumbing: kernel log verbosity and the bounded wait for operator
//! input before hand-off.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

pub const CONSOLE_PATH: &str = "/dev/console";

/// Console log levels per `syslog(2)`.
pub const KLOG_NOTICE: libc::c_int = 6;
pub const KLOG_WARNING: libc::c_int = 5;

const SYSLOG_ACTION_CONSOLE_LEVEL: libc::c_int = 8;

/// Set the minimum severity the kernel prints to the console.
pub fn set_console_log_level(level: libc::c_int) -> std::io::Result<()> {
    let ret = unsafe { libc::klogctl(SYSLOG_ACTION_CONSOLE_LEVEL, std::ptr::null_mut(), level) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// The system console, switched to raw non-blocking mode for the duration of
/// the confirmation window. Terminal attributes are restored on drop.
pub struct Console {
    file: File,
    saved_termios: Option<libc::termios>,
}

impl Console {
    pub fn open() -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(Path::new(CONSOLE_PATH))?;
        Ok(Self::from_file(file))
    }

    /// Raw mode and echo handling are best effort: a console that is not a
    /// terminal (serial redirect, test pipe) still gets a working countdown.
    pub fn from_file(file: File) -> Self {
        let fd = file.as_raw_fd();
        let saved_termios = unsafe {
            let mut termios: libc::termios = mem::zeroed();
            if libc::tcgetattr(fd, &mut termios) == 0 {
                let saved = termios;
                libc::cfmakeraw(&mut termios);
                if libc::tcsetattr(fd, libc::TCSANOW, &termios) == 0 {
                    Some(saved)
                } else {
                    None
                }
            } else {
                None
            }
        };
        Console {
            file,
            saved_termios,
        }
    }

    /// Display `prompt` and wait up to `window` for any operator input,
    /// polling in `tick` increments and printing a progress dot per tick.
    ///
    /// Returns true as soon as the console becomes readable. Every console
    /// error degrades to "no input" so a broken console cannot block boot.
    pub fn wait_for_interrupt(&mut self, prompt: &str, window: Duration, tick: Duration) -> bool {
        write!(self.file, "{}", prompt).ok();
        self.file.flush().ok();

        let ticks = (window.as_millis() / tick.as_millis().max(1)).max(1) as u32;
        for i in 0..ticks {
            if i > 0 {
                write!(self.file, ".").ok();
                self.file.flush().ok();
            }
            match self.poll_readable(tick) {
                Ok(true) => {
                    write!(self.file, "\r\n").ok();
                    return true;
                }
                Ok(false) => {}
                Err(err) => {
                    log::warn!("console poll failed: {}", err);
                    break;
                }
            }
        }
        // nobody pressed a key; \r resets the cursor after the dots
        write!(self.file, "\r\n").ok();
        false
    }

    fn poll_readable(&self, timeout: Duration) -> std::io::Result<bool> {
        let mut fds = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut fds, 1, timeout.as_millis() as libc::c_int) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(ret > 0 && fds.revents & libc::POLLIN != 0)
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        if let Some(saved) = self.saved_termios.take() {
            unsafe {
                libc::tcsetattr(self.file.as_raw_fd(), libc::TCSANOW, &saved);
            }
        }
    }
}
