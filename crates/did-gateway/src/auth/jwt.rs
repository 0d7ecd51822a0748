//! Tiered validation of legacy JWT credentials.
//!
//! The `alg` header is read by hand before anything else so that `none` and
//! empty algorithms are rejected on every tier, including ones that never look
//! at the signature.

use std::collections::HashSet;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::config::{EnvironmentTier, JwtPolicy};
use crate::error::{GatewayError, GatewayResult};

/// Algorithms rejected regardless of tier (compared case-insensitively).
const UNSAFE_ALGORITHMS: &[&str] = &["none", ""];

/// Claims the client reads from a legacy JWT.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub exp: Option<f64>,
}

fn rejected(reason: impl std::fmt::Display) -> GatewayError {
    GatewayError::config(format!("legacy JWT rejected: {}", reason))
}

/// Validate `token` under `policy` and return its claims.
pub fn validate_legacy_jwt(token: &str, policy: &JwtPolicy) -> GatewayResult<LegacyClaims> {
    let parts: Vec<&str> = token.trim().split('.').collect();
    if parts.len() != 3 {
        return Err(rejected("invalid JWT format"));
    }

    let header_json = URL_SAFE_NO_PAD
        .decode(parts[0])
        .map_err(|e| rejected(format!("header is not base64url: {}", e)))?;
    let header: serde_json::Value = serde_json::from_slice(&header_json)
        .map_err(|e| rejected(format!("header is not JSON: {}", e)))?;

    let alg = header.get("alg").and_then(|v| v.as_str()).unwrap_or("");
    if UNSAFE_ALGORITHMS.contains(&alg.to_lowercase().as_str()) {
        return Err(rejected(format!("unsafe algorithm '{}'", alg)));
    }

    let tier = policy.tier();
    match tier {
        EnvironmentTier::Strict => {
            if alg != "HS256" {
                return Err(rejected(format!(
                    "algorithm {} not allowed in {} tier (only HS256)",
                    alg, tier
                )));
            }
            let secret = policy
                .secret()
                .ok_or_else(|| rejected("strict tier has no signing secret"))?;
            decode_verified(token, Algorithm::HS256, secret, true)
        }
        EnvironmentTier::RelaxedTest => {
            let algorithm = Algorithm::from_str(alg)
                .map_err(|_| rejected(format!("unsupported algorithm '{}'", alg)))?;
            let is_hmac = matches!(
                algorithm,
                Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
            );
            match policy.secret() {
                Some(secret) if is_hmac => decode_verified(token, algorithm, secret, false),
                _ => decode_unverified(parts[1], true),
            }
        }
        EnvironmentTier::PermissiveDev => decode_unverified(parts[1], false),
    }
}

/// Extract the `org_id` claim from a legacy JWT validated under `policy`.
pub fn org_id_from_jwt(token: &str, policy: &JwtPolicy) -> GatewayResult<Option<String>> {
    let claims = validate_legacy_jwt(token, policy)?;
    Ok(claims.org_id.filter(|o| !o.is_empty()))
}

fn decode_verified(
    token: &str,
    algorithm: Algorithm,
    secret: &str,
    require_exp: bool,
) -> GatewayResult<LegacyClaims> {
    let mut validation = Validation::new(algorithm);
    validation.leeway = 0;
    validation.validate_aud = false;
    validation.validate_exp = true;
    validation.required_spec_claims = if require_exp {
        HashSet::from(["exp".to_string()])
    } else {
        HashSet::new()
    };

    let key = DecodingKey::from_secret(secret.as_bytes());
    let data = decode::<LegacyClaims>(token.trim(), &key, &validation).map_err(|e| {
        match e.kind() {
            ErrorKind::ExpiredSignature => rejected("token has expired"),
            ErrorKind::InvalidSignature => rejected("invalid signature"),
            ErrorKind::MissingRequiredClaim(claim) => {
                rejected(format!("missing required claim '{}'", claim))
            }
            _ => rejected(e),
        }
    })?;

    tracing::debug!(algorithm = ?algorithm, "legacy JWT signature verified");
    Ok(data.claims)
}

fn decode_unverified(payload: &str, check_exp: bool) -> GatewayResult<LegacyClaims> {
    let payload_json = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| rejected(format!("payload is not base64url: {}", e)))?;
    let claims: LegacyClaims = serde_json::from_slice(&payload_json)
        .map_err(|e| rejected(format!("payload is not valid claims JSON: {}", e)))?;

    if check_exp {
        if let Some(exp) = claims.exp {
            let now = chrono::Utc::now().timestamp() as f64;
            if exp < now {
                return Err(rejected("token has expired"));
            }
        }
    }

    Ok(claims)
}
