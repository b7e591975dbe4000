use axum::http::HeaderMap;

use crate::error::ApiError;

/// Constant-time byte comparison for shared secrets.
fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Extract the token from an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Admin endpoints authenticate with a static bearer token. Session-based
/// staff auth lives outside this service.
pub fn require_admin(headers: &HeaderMap, admin_token: &str) -> Result<(), ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    if admin_token.is_empty() || !secure_eq(token.as_bytes(), admin_token.as_bytes()) {
        tracing::warn!("admin auth rejected");
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

/// The sweep trigger authenticates with a shared secret header set by the
/// external scheduler.
pub fn require_sweep_secret(headers: &HeaderMap, sweep_secret: &str) -> Result<(), ApiError> {
    let provided = headers
        .get("x-sweep-secret")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    if sweep_secret.is_empty() || !secure_eq(provided.as_bytes(), sweep_secret.as_bytes()) {
        tracing::warn!("sweep trigger rejected");
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_secure_eq() {
        assert!(secure_eq(b"secret", b"secret"));
        assert!(!secure_eq(b"secret", b"secret2"));
        assert!(!secure_eq(b"secret", b"sekret"));
        assert!(!secure_eq(b"", b"x"));
        assert!(secure_eq(b"", b""));
    }

    #[test]
    fn test_admin_token_accepted() {
        let headers = headers_with("authorization", "Bearer hunter2");
        assert!(require_admin(&headers, "hunter2").is_ok());
    }

    #[test]
    fn test_admin_token_rejected() {
        let headers = headers_with("authorization", "Bearer wrong");
        assert!(require_admin(&headers, "hunter2").is_err());
    }

    #[test]
    fn test_admin_header_missing() {
        assert!(matches!(
            require_admin(&HeaderMap::new(), "hunter2"),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn test_empty_configured_token_locks_endpoint() {
        // An unset ADMIN_API_TOKEN must not accept an empty bearer.
        let headers = headers_with("authorization", "Bearer ");
        assert!(require_admin(&headers, "").is_err());
    }

    #[test]
    fn test_sweep_secret() {
        let headers = headers_with("x-sweep-secret", "tick");
        assert!(require_sweep_secret(&headers, "tick").is_ok());
        assert!(require_sweep_secret(&headers, "tock").is_err());
        assert!(require_sweep_secret(&HeaderMap::new(), "tick").is_err());
    }
}
