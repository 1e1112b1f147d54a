use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;

const TOKEN_BYTES: usize = 32;

/// A fresh URL-safe bearer token from the OS random source.
pub fn mint() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A fresh `X-Request-ID` value.
pub fn request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
