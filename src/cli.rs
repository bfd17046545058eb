use crate::auth::{dmi, Authenticator, PasswordPrompt, SystemId};
use crate::boot;
use crate::device::BlockDeviceScan;
use crate::kdf::SedutilSha1;
use crate::sed::kernel::KernelSed;
use crate::unlock::DiskUnlocker;
use clap::{Parser, Subcommand, ValueEnum};
use eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Credential source used when a locked drive is found
    #[arg(short, long, value_enum, default_value = "system-id", env = "PBA_AUTH")]
    auth: AuthSource,

    /// Emergency shell launched when boot cannot proceed
    #[arg(long, default_value = "/bin/sh", env = "PBA_SHELL")]
    shell: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum AuthSource {
    /// Masked password prompt on the console
    Prompt,
    /// Headless: system UUID from the firmware tables
    SystemId,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Bring the system up, unlock drives, and hand off (the default)
    Boot,
    /// Run a single unlock pass and report the count (troubleshooting)
    Unlock,
    /// Show the platform identity fields the headless credential is built from
    Identity,
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub fn run(&self) -> Result<&Self> {
        // The Authenticator variant is fixed here, once, at process start;
        // everything downstream is generic over it.
        match self.auth {
            AuthSource::Prompt => self.dispatch(PasswordPrompt)?,
            AuthSource::SystemId => self.dispatch(SystemId)?,
        };
        Ok(self)
    }

    fn dispatch<A: Authenticator>(&self, auth: A) -> Result<()> {
        match self.command.unwrap_or(Commands::Boot) {
            Commands::Boot => {
                let unlocker = DiskUnlocker::new(
                    auth,
                    SedutilSha1,
                    KernelSed::default(),
                    BlockDeviceScan::default(),
                );
                boot::run(unlocker, &self.shell)?;
            }
            Commands::Unlock => {
                let mut unlocker = DiskUnlocker::new(
                    auth,
                    SedutilSha1,
                    KernelSed::default(),
                    BlockDeviceScan::default(),
                );
                let count = unlocker.unlock_disks()?;
                println!("{} drive(s) unlocked", count);
            }
            Commands::Identity => {
                let dmi = dmi::read()?;
                println!("System UUID:            {}", dmi.system_uuid);
                println!("System serial:          {}", dmi.system_serial);
                println!("Baseboard manufacturer: {}", dmi.board_manufacturer);
                println!("Baseboard product:      {}", dmi.board_product);
                println!("Baseboard serial:       {}", dmi.board_serial);
                println!("Chassis serial:         {}", dmi.chassis_serial);
            }
        };
        Ok(())
    }
}
