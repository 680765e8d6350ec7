use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;

use crate::error::WavereqError;

/// Identity extracted from a valid token, shown to the user and kept next to
/// the stored token.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthInfo {
    pub user_id: String,
    pub valid_until: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenPayload {
    mail: String,
    valid_until: DateTime<Utc>,
}

fn cleartext_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Armor headers (Hash: ...) end at the first blank line; the payload
        // runs up to the signature block.
        Regex::new(
            r"(?s)-----BEGIN PGP SIGNED MESSAGE-----\r?\n(?:[^\n]*\r?\n)*?\r?\n(.*?)\r?\n-----BEGIN PGP SIGNATURE-----",
        )
        .expect("static regex")
    })
}

/// Parse a clear-signed token and extract the identity it certifies. The
/// signature itself is checked by the auth endpoint, not locally.
pub fn parse_token(token: &str) -> Result<AuthInfo, WavereqError> {
    let text = cleartext_re()
        .captures(token)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| WavereqError::InvalidAuthToken("no auth data".to_string()))?
        .as_str();

    let payload: TokenPayload = serde_json::from_str(text.trim())
        .map_err(|err| WavereqError::InvalidAuthToken(err.to_string()))?;

    Ok(AuthInfo {
        user_id: payload.mail,
        valid_until: payload.valid_until,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const TOKEN: &str = "-----BEGIN PGP SIGNED MESSAGE-----\n\
Hash: SHA256\n\
\n\
{\"mail\": \"user@example.org\", \"valid_until\": \"2026-12-31T00:00:00Z\"}\n\
-----BEGIN PGP SIGNATURE-----\n\
\n\
iQEcBAEBCAAGBQJdummy\n\
-----END PGP SIGNATURE-----\n";

    #[test]
    fn extracts_identity() {
        let info = parse_token(TOKEN).unwrap();
        assert_eq!(info.user_id, "user@example.org");
        assert_eq!(info.valid_until.to_rfc3339(), "2026-12-31T00:00:00+00:00");
    }

    #[test]
    fn rejects_unsigned_text() {
        let err = parse_token("{\"mail\": \"user@example.org\"}");
        assert_matches!(err, Err(WavereqError::InvalidAuthToken(_)));
    }

    #[test]
    fn rejects_garbage_payload() {
        let token = TOKEN.replace("{\"mail\"", "{\"broken\"");
        let err = parse_token(&token);
        assert_matches!(err, Err(WavereqError::InvalidAuthToken(_)));
    }
}
