//! RFC 6238 TOTP codes for broker two-factor login.
//!
//! Angel One and Shoonya accept a 6-digit time-based code generated from a
//! base32 secret. Codes use the standard 30-second step and HMAC-SHA1.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

const STEP_SECS: u64 = 30;
const DIGITS: u32 = 6;

/// TOTP generation failures.
#[derive(Debug, Error)]
pub enum TotpError {
    /// The secret is not valid base32.
    #[error("invalid TOTP secret: {0}")]
    InvalidSecret(String),
}

/// Generates the TOTP code for the current wall-clock time.
///
/// # Errors
/// Returns an error if the secret is not valid base32.
pub fn totp_now(secret_base32: &str) -> Result<String, TotpError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    totp_at(secret_base32, now)
}

/// Generates the TOTP code for a specific unix timestamp.
///
/// # Errors
/// Returns an error if the secret is not valid base32.
pub fn totp_at(secret_base32: &str, unix_seconds: u64) -> Result<String, TotpError> {
    let normalized: String = secret_base32
        .trim()
        .trim_end_matches('=')
        .to_ascii_uppercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    let key = BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|e| TotpError::InvalidSecret(e.to_string()))?;

    let counter = unix_seconds / STEP_SECS;
    let mut mac = HmacSha1::new_from_slice(&key)
        .map_err(|e| TotpError::InvalidSecret(e.to_string()))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // RFC 4226 dynamic truncation.
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = (u32::from(digest[offset]) & 0x7f) << 24
        | u32::from(digest[offset + 1]) << 16
        | u32::from(digest[offset + 2]) << 8
        | u32::from(digest[offset + 3]);
    let code = binary % 10u32.pow(DIGITS);

    Ok(format!("{code:06}"))
}

/// Heuristic from the credential format: anything longer than a one-time
/// code is treated as a base32 secret to generate from; short values are
/// passed through as pre-generated codes.
#[must_use]
pub fn looks_like_secret(value: &str) -> bool {
    value.trim().len() > 10
}
