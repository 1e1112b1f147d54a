use crate::error::RegistrationError;
use crate::registry::Registry;

const TOKEN_SCHEME: &str = "Token ";

/// Extract the credential from an `Authorization` header value.
pub fn credential_from_header(value: &str) -> Option<String> {
    let value = value.trim_start();
    let token = value.strip_prefix(TOKEN_SCHEME).unwrap_or(value).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// `Authorization` header value for calling a peer.
pub fn authorization_header(remote_token: &str) -> String {
    format!("{}{}", TOKEN_SCHEME, remote_token)
}

/// Map an inbound credential to the local token of a known peer.
///
/// Protocol operations locate their record through the returned token,
/// never through anything else the caller sent.
pub fn authorize(
    registry: &Registry,
    credential: Option<&str>,
) -> Result<String, RegistrationError> {
    let token = match credential {
        Some(token) if !token.is_empty() => token,
        _ => return Err(RegistrationError::Unauthorized),
    };
    if registry.contains(token).map_err(RegistrationError::Store)? {
        Ok(token.to_string())
    } else {
        Err(RegistrationError::Forbidden)
    }
}
