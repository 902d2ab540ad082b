//! GitHub webhook signature verification

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Name of the header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Checks that `payload` was signed with `secret`.
///
/// `signature_header` is the raw `X-Hub-Signature-256` value, with or without
/// the `sha256=` prefix. An absent header is never valid. The HMAC is computed
/// over the exact bytes received, and the digest comparison is constant-time.
pub fn is_valid(signature_header: Option<&str>, payload: &[u8], secret: &str) -> bool {
    let Some(signature_header) = signature_header else {
        return false;
    };

    let hex_signature = signature_header
        .strip_prefix(SIGNATURE_PREFIX)
        .unwrap_or(signature_header);

    let Ok(signature_bytes) = hex::decode(hex_signature.trim()) else {
        debug!("Signature header is not valid hex");
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&signature_bytes).is_ok()
}

/// Computes the `sha256=<hex>` signature GitHub would send for `payload`.
pub fn sign(payload: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length, including empty ones.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(payload);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}
