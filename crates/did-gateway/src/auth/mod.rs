//! Credential resolution for gateway requests.
//!
//! Exactly one credential kind may be configured:
//!
//! - API key (preferred), sent as `authorization: ApiKey <key>`
//! - Bearer token (deprecated), sent as `authorization: Bearer <token>`
//! - Legacy JWT, validated under an [`EnvironmentTier`] before every attempt
//!   and sent as `authorization: Bearer <jwt>`

pub mod config;
pub mod jwt;

use std::fmt;

use tonic::metadata::AsciiMetadataValue;

pub use config::{EnvironmentTier, JwtPolicy};
pub use jwt::{org_id_from_jwt, validate_legacy_jwt, LegacyClaims};

use crate::error::{GatewayError, GatewayResult};
use crate::types::GatewayConfig;

/// Metadata key carrying the credential.
pub const AUTHORIZATION: &str = "authorization";

/// Authentication material for one client or one call.
#[derive(Clone)]
pub enum Credential {
    ApiKey(String),
    /// Deprecated; prefer [`Credential::ApiKey`].
    BearerToken(String),
    LegacyJwt { token: String, policy: JwtPolicy },
}

impl Credential {
    pub fn api_key(key: impl Into<String>) -> GatewayResult<Self> {
        let key = non_empty("API key", key.into())?;
        Ok(Self::ApiKey(key))
    }

    pub fn bearer_token(token: impl Into<String>) -> GatewayResult<Self> {
        let token = non_empty("bearer token", token.into())?;
        tracing::warn!(
            "bearer token authentication is deprecated and will be removed; use an API key"
        );
        Ok(Self::BearerToken(token))
    }

    /// Legacy JWT credential. The token is validated immediately so a bad
    /// credential fails here rather than on the first attempt.
    pub fn legacy_jwt(token: impl Into<String>, policy: JwtPolicy) -> GatewayResult<Self> {
        let token = non_empty("legacy JWT", token.into())?;
        validate_legacy_jwt(&token, &policy)?;
        Ok(Self::LegacyJwt { token, policy })
    }

    /// Resolve the credential configured in `config`, if any.
    ///
    /// Configuring more than one kind is an error. Blank values count as absent.
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Option<Self>> {
        let api_key = present(config.api_key.as_deref());
        let bearer = present(config.bearer_token.as_deref());
        let jwt = present(config.jwt.as_deref());

        let configured: Vec<&str> = [
            api_key.map(|_| "api_key"),
            bearer.map(|_| "bearer_token"),
            jwt.map(|_| "jwt"),
        ]
        .into_iter()
        .flatten()
        .collect();

        if configured.len() > 1 {
            return Err(GatewayError::config(format!(
                "multiple credentials configured ({}); configure exactly one",
                configured.join(", ")
            )));
        }

        if let Some(key) = api_key {
            return Self::api_key(key).map(Some);
        }
        if let Some(token) = bearer {
            return Self::bearer_token(token).map(Some);
        }
        if let Some(token) = jwt {
            let policy = JwtPolicy::new(config.env_tier, config.jwt_secret.clone())?;
            return Self::legacy_jwt(token, policy).map(Some);
        }
        Ok(None)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApiKey(_) => "api_key",
            Self::BearerToken(_) => "bearer_token",
            Self::LegacyJwt { .. } => "legacy_jwt",
        }
    }

    /// Render the `authorization` metadata value, revalidating legacy JWTs.
    pub fn authorization(&self) -> GatewayResult<AsciiMetadataValue> {
        let header = match self {
            Self::ApiKey(key) => format!("ApiKey {}", key),
            Self::BearerToken(token) => format!("Bearer {}", token),
            Self::LegacyJwt { token, policy } => {
                validate_legacy_jwt(token, policy)?;
                format!("Bearer {}", token)
            }
        };
        header.parse().map_err(|_| {
            GatewayError::config(format!(
                "{} contains characters not allowed in metadata",
                self.kind()
            ))
        })
    }

    /// `org_id` claim of a legacy JWT credential.
    pub fn org_id(&self) -> Option<String> {
        match self {
            Self::LegacyJwt { token, policy } => org_id_from_jwt(token, policy).ok().flatten(),
            _ => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey([redacted])"),
            Self::BearerToken(_) => f.write_str("BearerToken([redacted])"),
            Self::LegacyJwt { policy, .. } => f
                .debug_struct("LegacyJwt")
                .field("token", &"[redacted]")
                .field("policy", policy)
                .finish(),
        }
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn non_empty(what: &str, value: String) -> GatewayResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::config(format!("{} is empty", what)));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests;
