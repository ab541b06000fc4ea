//! Webhook signature: base64(HMAC-SHA512(secret, raw body)) in the `X-Goog-Signature` header.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

pub const SIGNATURE_HEADER: &str = "X-Goog-Signature";

/// Signature for `body` under `secret`, base64-encoded.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a provided signature against the raw body.
pub fn verify(secret: &str, body: &[u8], provided: &str) -> bool {
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(provided.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
