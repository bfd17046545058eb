//! Credential acquisition.
//!
//! An [`Authenticator`] produces the secret an operator (or the machine
//! itself) presents to a locked drive. The variant is chosen at process
//! start; the unlock orchestration is generic over this trait and never
//! branches on which one is in play.

use crate::console;
use thiserror::Error;
use zeroize::Zeroizing;

pub mod dmi;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("failed to read credential from terminal: {0}")]
    Terminal(#[source] std::io::Error),
    #[error("failed to read platform identity: {0}")]
    Dmi(#[from] dmi::DmiError),
}

pub type Result<T, E = AuthError> = core::result::Result<T, E>;

/// Source of the drive-unlock credential.
///
/// An empty credential is not an error: it means the source chose to skip
/// unlocking the drive currently being considered.
pub trait Authenticator {
    fn retrieve_password(&self) -> Result<Zeroizing<String>>;
}

/// Interactive variant: masked prompt on the console.
#[derive(Debug, Default, Clone, Copy)]
pub struct PasswordPrompt;

impl Authenticator for PasswordPrompt {
    fn retrieve_password(&self) -> Result<Zeroizing<String>> {
        // Keep kernel chatter from interleaving with the prompt.
        if let Err(err) = console::set_console_log_level(console::KLOG_WARNING) {
            log::warn!("could not lower console log level: {}", err);
        }

        println!();
        let password = rpassword::prompt_password("Enter drive password (empty to skip): ")
            .map_err(AuthError::Terminal)?;
        Ok(Zeroizing::new(password))
    }
}

/// Headless variant: the credential is the machine itself.
///
/// Reads the firmware identification tables, logs the identifying fields for
/// audit, and hands back the system UUID. The same physical machine always
/// reproduces the same credential, so drives provisioned against it unlock
/// with no operator present.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemId;

impl Authenticator for SystemId {
    fn retrieve_password(&self) -> Result<Zeroizing<String>> {
        let dmi = dmi::read()?;

        log::info!("System UUID:            {}", dmi.system_uuid);
        log::info!("System serial:          {}", dmi.system_serial);
        log::info!("Baseboard manufacturer: {}", dmi.board_manufacturer);
        log::info!("Baseboard product:      {}", dmi.board_product);
        log::info!("Baseboard serial:       {}", dmi.board_serial);
        log::info!("Chassis serial:         {}", dmi.chassis_serial);

        Ok(Zeroizing::new(dmi.system_uuid))
    }
}
