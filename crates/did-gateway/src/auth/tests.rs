use super::*;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::json;

const SECRET: &str = "test_secret_for_unit_testing_only";

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn hs_token(alg: Algorithm, secret: &str, claims: serde_json::Value) -> String {
    encode(
        &Header::new(alg),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

/// Token with an arbitrary header and a junk signature.
fn forged_token(header: serde_json::Value, claims: serde_json::Value) -> String {
    format!(
        "{}.{}.c2lnbmF0dXJl",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

fn valid_claims() -> serde_json::Value {
    json!({
        "sub": "agent-7",
        "org_id": "org-42",
        "exp": now() + 3600,
    })
}

fn policy(tier: EnvironmentTier, secret: Option<&str>) -> JwtPolicy {
    JwtPolicy::new(tier, secret.map(String::from)).unwrap()
}

#[test]
fn test_none_algorithm_rejected_on_every_tier() {
    let token = forged_token(json!({"alg": "none", "typ": "JWT"}), valid_claims());
    for p in [
        policy(EnvironmentTier::Strict, Some(SECRET)),
        policy(EnvironmentTier::RelaxedTest, None),
        policy(EnvironmentTier::PermissiveDev, None),
    ] {
        let err = validate_legacy_jwt(&token, &p).unwrap_err();
        assert!(err.to_string().contains("unsafe algorithm"), "{:?}", p);
    }

    let token = forged_token(json!({"alg": "", "typ": "JWT"}), valid_claims());
    let err = validate_legacy_jwt(&token, &policy(EnvironmentTier::PermissiveDev, None)).unwrap_err();
    assert!(err.to_string().contains("unsafe algorithm"));

    let token = forged_token(json!({"typ": "JWT"}), valid_claims());
    assert!(validate_legacy_jwt(&token, &policy(EnvironmentTier::PermissiveDev, None)).is_err());
}

#[test]
fn test_strict_requires_secret() {
    let err = JwtPolicy::new(EnvironmentTier::Strict, None).unwrap_err();
    assert!(matches!(err, GatewayError::Config { .. }));
    assert!(JwtPolicy::new(EnvironmentTier::Strict, Some("  ".into())).is_err());
}

#[test]
fn test_strict_accepts_valid_hs256() {
    let token = hs_token(Algorithm::HS256, SECRET, valid_claims());
    let claims = validate_legacy_jwt(&token, &policy(EnvironmentTier::Strict, Some(SECRET))).unwrap();
    assert_eq!(claims.org_id.as_deref(), Some("org-42"));
    assert_eq!(claims.sub.as_deref(), Some("agent-7"));
}

#[test]
fn test_strict_rejects_other_algorithms() {
    let token = hs_token(Algorithm::HS512, SECRET, valid_claims());
    let err = validate_legacy_jwt(&token, &policy(EnvironmentTier::Strict, Some(SECRET))).unwrap_err();
    assert!(err.to_string().contains("only HS256"));
}

#[test]
fn test_strict_rejects_bad_signature_and_expiry() {
    let p = policy(EnvironmentTier::Strict, Some(SECRET));

    let token = hs_token(Algorithm::HS256, "other-secret", valid_claims());
    assert!(validate_legacy_jwt(&token, &p)
        .unwrap_err()
        .to_string()
        .contains("invalid signature"));

    let token = hs_token(
        Algorithm::HS256,
        SECRET,
        json!({"sub": "agent-7", "exp": now() - 60}),
    );
    assert!(validate_legacy_jwt(&token, &p)
        .unwrap_err()
        .to_string()
        .contains("expired"));

    let token = hs_token(Algorithm::HS256, SECRET, json!({"sub": "agent-7"}));
    assert!(validate_legacy_jwt(&token, &p).is_err());
}

#[test]
fn test_relaxed_skips_signature_for_asymmetric() {
    let token = forged_token(json!({"alg": "ES256", "typ": "JWT"}), valid_claims());
    let claims = validate_legacy_jwt(&token, &policy(EnvironmentTier::RelaxedTest, Some(SECRET))).unwrap();
    assert_eq!(claims.org_id.as_deref(), Some("org-42"));
}

#[test]
fn test_relaxed_enforces_expiry() {
    let token = forged_token(
        json!({"alg": "RS256"}),
        json!({"sub": "agent-7", "exp": now() - 60}),
    );
    let err = validate_legacy_jwt(&token, &policy(EnvironmentTier::RelaxedTest, None)).unwrap_err();
    assert!(err.to_string().contains("expired"));
}

#[test]
fn test_relaxed_verifies_hmac_when_secret_set() {
    let token = hs_token(Algorithm::HS384, "wrong", valid_claims());

    let err = validate_legacy_jwt(&token, &policy(EnvironmentTier::RelaxedTest, Some(SECRET))).unwrap_err();
    assert!(err.to_string().contains("invalid signature"));

    // No secret, no signature check.
    assert!(validate_legacy_jwt(&token, &policy(EnvironmentTier::RelaxedTest, None)).is_ok());
}

#[test]
fn test_permissive_ignores_expiry_and_signature() {
    let token = hs_token(
        Algorithm::HS256,
        "whatever",
        json!({"org_id": "org-dev", "exp": now() - 3600}),
    );
    let claims = validate_legacy_jwt(&token, &policy(EnvironmentTier::PermissiveDev, None)).unwrap();
    assert_eq!(claims.org_id.as_deref(), Some("org-dev"));
}

#[test]
fn test_malformed_token() {
    let p = policy(EnvironmentTier::PermissiveDev, None);
    assert!(validate_legacy_jwt("not-a-jwt", &p).is_err());
    assert!(validate_legacy_jwt("a.b", &p).is_err());
    assert!(validate_legacy_jwt("!!!.e30.sig", &p).is_err());
}

#[test]
fn test_org_id_from_jwt() {
    let token = hs_token(Algorithm::HS256, SECRET, valid_claims());
    let org = org_id_from_jwt(&token, &policy(EnvironmentTier::Strict, Some(SECRET))).unwrap();
    assert_eq!(org.as_deref(), Some("org-42"));

    let token = hs_token(Algorithm::HS256, SECRET, json!({"exp": now() + 60, "org_id": ""}));
    let org = org_id_from_jwt(&token, &policy(EnvironmentTier::Strict, Some(SECRET))).unwrap();
    assert_eq!(org, None);
}

#[test]
fn test_api_key_metadata() {
    let cred = Credential::api_key("  key-123 \n").unwrap();
    assert_eq!(cred.authorization().unwrap().to_str().unwrap(), "ApiKey key-123");
}

#[test]
fn test_bearer_metadata() {
    let cred = Credential::bearer_token("tok").unwrap();
    assert_eq!(cred.authorization().unwrap().to_str().unwrap(), "Bearer tok");
}

#[test]
fn test_jwt_metadata_revalidated() {
    let token = hs_token(Algorithm::HS256, SECRET, valid_claims());
    let cred = Credential::legacy_jwt(&token, policy(EnvironmentTier::Strict, Some(SECRET))).unwrap();
    assert_eq!(
        cred.authorization().unwrap().to_str().unwrap(),
        format!("Bearer {}", token)
    );
    assert_eq!(cred.org_id().as_deref(), Some("org-42"));
}

#[test]
fn test_credential_conflict() {
    let config = GatewayConfig::new("https://gw.example.com")
        .with_api_key("key")
        .with_bearer_token("tok");
    let err = Credential::from_config(&config).unwrap_err();
    assert!(matches!(err, GatewayError::Config { .. }));
    assert!(err.to_string().contains("api_key, bearer_token"));
}

#[test]
fn test_blank_values_count_as_absent() {
    let config = GatewayConfig::new("https://gw.example.com")
        .with_api_key("key")
        .with_bearer_token("   ");
    let cred = Credential::from_config(&config).unwrap().unwrap();
    assert_eq!(cred.kind(), "api_key");

    let config = GatewayConfig::new("https://gw.example.com");
    assert!(Credential::from_config(&config).unwrap().is_none());
}

#[test]
fn test_from_config_jwt_strict_without_secret() {
    let token = hs_token(Algorithm::HS256, SECRET, valid_claims());
    let config = GatewayConfig::new("https://gw.example.com").with_jwt(
        token,
        EnvironmentTier::Strict,
        None,
    );
    assert!(Credential::from_config(&config).is_err());
}

#[test]
fn test_debug_redacts_secrets() {
    let cred = Credential::api_key("super-secret").unwrap();
    assert!(!format!("{:?}", cred).contains("super-secret"));

    let p = policy(EnvironmentTier::Strict, Some(SECRET));
    assert!(!format!("{:?}", p).contains(SECRET));
}

#[test]
fn test_tier_aliases() {
    assert_eq!("production".parse::<EnvironmentTier>().unwrap(), EnvironmentTier::Strict);
    assert_eq!("qa".parse::<EnvironmentTier>().unwrap(), EnvironmentTier::RelaxedTest);
    assert_eq!("dev".parse::<EnvironmentTier>().unwrap(), EnvironmentTier::PermissiveDev);
    assert!("staging".parse::<EnvironmentTier>().is_err());
}
