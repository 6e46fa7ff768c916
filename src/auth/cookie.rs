//! Session cookie parsing and signing.
//!
//! The session cookie carries a session token followed by a MAC over it:
//! `<token>.<base64url(HMAC-SHA256(token))>`. A cookie whose MAC does not
//! verify is treated as if it was never sent.

use axum::http::{HeaderMap, header};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac, digest::InvalidLength};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Cookie name for the signed session token.
pub const SESSION_COOKIE_NAME: &str = "bg_session";

/// Extract a cookie value from the Cookie header.
pub fn get_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    for cookie_header in headers.get_all(header::COOKIE) {
        let Ok(cookie_header) = cookie_header.to_str() else {
            continue;
        };
        for part in cookie_header.split(';') {
            let part = part.trim();
            if let Some((key, value)) = part.split_once('=') {
                if key.trim() == name {
                    return Some(value.trim());
                }
            }
        }
    }
    None
}

/// Signs and unsigns cookie values with a keyed MAC.
#[derive(Clone)]
pub struct CookieSigner {
    /// Keyed MAC state, cloned for every operation
    mac: HmacSha256,
}

impl CookieSigner {
    pub fn new(key: &[u8]) -> Result<Self, InvalidLength> {
        Ok(Self {
            mac: HmacSha256::new_from_slice(key)?,
        })
    }

    /// Append a MAC to the value.
    pub fn sign(&self, value: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(value.as_bytes());
        let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{}.{}", value, tag)
    }

    /// Return the original value if the MAC verifies.
    pub fn unsign<'a>(&self, signed: &'a str) -> Option<&'a str> {
        let (value, tag) = signed.rsplit_once('.')?;
        let tag = URL_SAFE_NO_PAD.decode(tag).ok()?;
        let mut mac = self.mac.clone();
        mac.update(value.as_bytes());
        mac.verify_slice(&tag).ok()?;
        Some(value)
    }
}

/// Build the Set-Cookie value for a signed session token.
pub fn session_cookie(signed_value: &str, max_age_secs: u64, secure: bool) -> String {
    let secure = if secure { "; Secure" } else { "" };
    format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}{}",
        SESSION_COOKIE_NAME, signed_value, max_age_secs, secure
    )
}

/// Build the Set-Cookie value that removes the session cookie.
pub fn clear_session_cookie(secure: bool) -> String {
    session_cookie("", 0, secure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_get_cookie_simple() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("bg_session=abc123"));

        assert_eq!(get_cookie(&headers, "bg_session"), Some("abc123"));
    }

    #[test]
    fn test_get_cookie_multiple() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("foo=bar; bg_session=abc.def; theme=dark"),
        );

        assert_eq!(get_cookie(&headers, "bg_session"), Some("abc.def"));
        assert_eq!(get_cookie(&headers, "theme"), Some("dark"));
        assert_eq!(get_cookie(&headers, "foo"), Some("bar"));
    }

    #[test]
    fn test_get_cookie_across_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("foo=bar"));
        headers.append(header::COOKIE, HeaderValue::from_static("bg_session=xyz"));

        assert_eq!(get_cookie(&headers, "bg_session"), Some("xyz"));
    }

    #[test]
    fn test_get_cookie_not_found() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("foo=bar"));

        assert_eq!(get_cookie(&headers, "bg_session"), None);
        assert_eq!(get_cookie(&HeaderMap::new(), "bg_session"), None);
    }

    #[test]
    fn test_sign_unsign() {
        let signer = CookieSigner::new(b"cookie-secret").unwrap();
        let signed = signer.sign("header.payload.sig");

        assert!(signed.starts_with("header.payload.sig."));
        assert_eq!(signer.unsign(&signed), Some("header.payload.sig"));
    }

    #[test]
    fn test_unsign_rejects_tampering() {
        let signer = CookieSigner::new(b"cookie-secret").unwrap();
        let signed = signer.sign("header.payload.sig");

        let tampered = signed.replacen("payload", "pAyload", 1);
        assert_eq!(signer.unsign(&tampered), None);
        assert_eq!(signer.unsign("header.payload.sig"), None);
        assert_eq!(signer.unsign("no-dot-at-all"), None);

        let other = CookieSigner::new(b"another-secret").unwrap();
        assert_eq!(other.unsign(&signed), None);
    }

    #[test]
    fn test_signer_is_reusable() {
        let signer = CookieSigner::new(b"cookie-secret").unwrap();
        let first = signer.sign("token-a");
        let second = signer.sign("token-b");

        assert_eq!(signer.sign("token-a"), first);
        assert_eq!(signer.unsign(&second), Some("token-b"));
        assert_eq!(signer.unsign(&first), Some("token-a"));
    }

    #[test]
    fn test_empty_key_is_accepted() {
        let signer = CookieSigner::new(b"").unwrap();
        let signed = signer.sign("v");
        assert_eq!(signer.unsign(&signed), Some("v"));
    }

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie("v.s", 60, true);
        assert_eq!(
            cookie,
            "bg_session=v.s; HttpOnly; SameSite=Strict; Path=/; Max-Age=60; Secure"
        );
        assert!(clear_session_cookie(false).contains("Max-Age=0"));
    }
}
