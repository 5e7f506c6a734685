//! Well-known discovery documents.

use serde_json::{json, Value};

/// `/.well-known/openid-configuration` for this issuer.
#[must_use]
pub fn discovery_document(issuer: &str) -> Value {
    let base = issuer.trim_end_matches('/');
    json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/authorize"),
        "token_endpoint": format!("{base}/token"),
        "jwks_uri": format!("{base}/.well-known/jwks.json"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
        "id_token_signing_alg_values_supported": ["EdDSA"],
        "subject_types_supported": ["public"],
        "scopes_supported": ["openid", "profile", "email"],
        "token_endpoint_auth_methods_supported": ["none"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_has_fixed_suites_and_no_trailing_slash() {
        let doc = discovery_document("https://idp.example.com/");
        assert_eq!(doc["issuer"], "https://idp.example.com");
        assert_eq!(doc["token_endpoint"], "https://idp.example.com/token");
        assert_eq!(doc["response_types_supported"], serde_json::json!(["code"]));
        assert_eq!(
            doc["code_challenge_methods_supported"],
            serde_json::json!(["S256"])
        );
        assert_eq!(
            doc["id_token_signing_alg_values_supported"],
            serde_json::json!(["EdDSA"])
        );
    }
}
