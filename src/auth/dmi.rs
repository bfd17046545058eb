//! Platform identity from the firmware DMI/SMBIOS tables, as decoded by the
//! kernel under `/sys/class/dmi/id`.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DMI_ID_PATH: &str = "/sys/class/dmi/id";

#[derive(Error, Debug)]
pub enum DmiError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("firmware tables carry no system UUID")]
    MissingUuid,
}

pub type Result<T, E = DmiError> = core::result::Result<T, E>;

/// Identifying fields exposed by the platform firmware.
#[derive(Debug, Clone, Default)]
pub struct DmiData {
    pub system_uuid: String,
    pub system_serial: String,
    pub board_manufacturer: String,
    pub board_product: String,
    pub board_serial: String,
    pub chassis_serial: String,
}

pub fn read() -> Result<DmiData> {
    read_from(Path::new(DMI_ID_PATH))
}

/// The system UUID is the one field we cannot do without; the rest is
/// best-effort audit data.
pub fn read_from(dir: &Path) -> Result<DmiData> {
    let system_uuid = required_field(dir, "product_uuid")?;
    Ok(DmiData {
        system_uuid,
        system_serial: optional_field(dir, "product_serial"),
        board_manufacturer: optional_field(dir, "board_vendor"),
        board_product: optional_field(dir, "board_name"),
        board_serial: optional_field(dir, "board_serial"),
        chassis_serial: optional_field(dir, "chassis_serial"),
    })
}

fn required_field(dir: &Path, name: &str) -> Result<String> {
    let path = dir.join(name);
    let raw = fs::read_to_string(&path).map_err(|source| DmiError::Read { path, source })?;
    let value = raw.trim().to_string();
    if value.is_empty() {
        return Err(DmiError::MissingUuid);
    }
    Ok(value)
}

fn optional_field(dir: &Path, name: &str) -> String {
    fs::read_to_string(dir.join(name))
        .map(|raw| raw.trim().to_string())
        .unwrap_or_default()
}
