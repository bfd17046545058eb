//! Pre-boot authentication agent for self-encrypting drives.
//!
//! Runs as the first userspace process, finds drives that speak the Opal
//! locking protocol, unlocks them with a key derived from an operator or
//! machine credential, and hands off to the real OS, or to an emergency
//! shell when that is not possible.

pub mod auth;
pub mod boot;
pub mod cli;
pub mod console;
pub mod device;
pub mod kdf;
pub mod sed;
pub mod unlock;
