//! Hashing helpers shared by the data, auth and avatar layers.

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded SHA-1 of `data`.
pub fn sha1_hex(data: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Provider-scoped user id: `<provider>_<sha1(raw_id)>`.
pub fn provider_user_id(provider: &str, raw_id: &str) -> String {
    format!("{provider}_{}", sha1_hex(raw_id))
}

/// Keyed hash of a client address so raw IPs are never stored.
pub fn hash_ip(ip: &str, secret: &str) -> String {
    if ip.is_empty() {
        return String::new();
    }
    // HMAC accepts keys of any length, the error branch is never taken
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(ip.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
