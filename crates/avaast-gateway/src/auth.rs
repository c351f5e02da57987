//! Identity extraction for sticky routing.
//!
//! The bearer token's payload segment is base64-decoded to recover the
//! issuer identifier. No signature verification happens here — that is
//! an upstream concern; the issuer only seeds the sticky routing key.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Extract the sticky key from an `Authorization` header value.
pub fn sticky_key_from_bearer(header: Option<&str>) -> Option<String> {
    let token = header?.strip_prefix("Bearer ")?;
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("iss")?.as_str().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with_payload(payload: &serde_json::Value) -> String {
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("header.{body}.signature")
    }

    #[test]
    fn extracts_issuer_from_bearer_token() {
        let token = token_with_payload(&serde_json::json!({"iss": "did:plc:alice"}));
        let key = sticky_key_from_bearer(Some(&format!("Bearer {token}")));
        assert_eq!(key.as_deref(), Some("did:plc:alice"));
    }

    #[test]
    fn missing_header_or_scheme_yields_none() {
        assert!(sticky_key_from_bearer(None).is_none());
        assert!(sticky_key_from_bearer(Some("Basic abc")).is_none());
    }

    #[test]
    fn malformed_tokens_yield_none() {
        assert!(sticky_key_from_bearer(Some("Bearer not-a-jwt")).is_none());
        assert!(sticky_key_from_bearer(Some("Bearer a.!!!.c")).is_none());
        let token = token_with_payload(&serde_json::json!({"sub": "no issuer"}));
        assert!(sticky_key_from_bearer(Some(&format!("Bearer {token}"))).is_none());
    }

    #[test]
    fn signature_is_ignored() {
        let payload = URL_SAFE_NO_PAD.encode(r#"{"iss":"did:plc:bob"}"#);
        let header = format!("Bearer x.{payload}.completely-bogus-signature");
        assert_eq!(
            sticky_key_from_bearer(Some(&header)).as_deref(),
            Some("did:plc:bob")
        );
    }
}
