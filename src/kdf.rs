use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use zeroize::Zeroizing;

/// Length of a derived unlock key in bytes.
pub const KEY_LEN: usize = 32;

const SALT_WIDTH: usize = 20;
const ITERATIONS: u32 = 75_000;

/// Turns an operator credential plus a per-drive serial number into
/// fixed-length unlocking key material.
///
/// Implementations must be pure and deterministic: the same inputs always
/// produce the same key, and derivation never fails. Callers decide what an
/// empty credential means.
pub trait KeyDerivation {
    fn derive_key(&self, credential: &str, drive_serial: &[u8]) -> Zeroizing<[u8; KEY_LEN]>;
}

/// PBKDF2-HMAC-SHA1 derivation compatible with sedutil-provisioned drives.
///
/// The drive serial is right-padded with spaces to 20 bytes (truncated if
/// longer) to form the salt, then stretched with 75,000 iterations into a
/// 32-byte key. The parameters are not negotiable: the derived key is
/// verified by SED firmware that was provisioned with exactly this scheme,
/// so any deviation shows up as an unlock failure rather than a test
/// mismatch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SedutilSha1;

impl KeyDerivation for SedutilSha1 {
    fn derive_key(&self, credential: &str, drive_serial: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
        let salt = normalize_salt(drive_serial);
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2_hmac::<Sha1>(credential.as_bytes(), &salt, ITERATIONS, key.as_mut_slice());
        key
    }
}

/// Serial numbers vary in length across vendors; a fixed salt width keeps
/// keys reproducible for a given physical drive.
fn normalize_salt(drive_serial: &[u8]) -> [u8; SALT_WIDTH] {
    let mut salt = [b' '; SALT_WIDTH];
    let len = drive_serial.len().min(SALT_WIDTH);
    salt[..len].copy_from_slice(&drive_serial[..len]);
    salt
}
