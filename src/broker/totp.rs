/// Time-based one-time codes (RFC 6238, HMAC-SHA1, 30 s step, 6 digits)

use crate::error::{Error, Result};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

const STEP_SECS: u64 = 30;
const DIGITS: u32 = 6;

/// Code for the current time
pub fn generate(seed: &str) -> Result<String> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| Error::Configuration(format!("system clock before epoch: {e}")))?;
    generate_at(seed, now.as_secs())
}

/// Code for an explicit unix time
pub fn generate_at(seed: &str, unix_secs: u64) -> Result<String> {
    let key = decode_base32(seed)?;
    let counter = unix_secs / STEP_SECS;

    let mut mac = HmacSha1::new_from_slice(&key)
        .map_err(|e| Error::Configuration(format!("invalid TOTP key: {e}")))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    let code = binary % 10u32.pow(DIGITS);

    Ok(format!("{:0width$}", code, width = DIGITS as usize))
}

/// RFC 4648 base32, case-insensitive, ignoring spaces, dashes and padding
fn decode_base32(seed: &str) -> Result<Vec<u8>> {
    let normalized: String = seed
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '='))
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if normalized.is_empty() {
        return Err(Error::Configuration("TOTP seed is empty".to_string()));
    }

    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|e| Error::Configuration(format!("TOTP seed is not base32: {e}")))
}
