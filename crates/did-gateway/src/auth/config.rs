use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Environment tier governing legacy JWT validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentTier {
    /// HS256 only, secret mandatory, signature and expiry verified.
    #[default]
    #[serde(alias = "production", alias = "prod")]
    Strict,
    /// Any safe algorithm, expiry enforced, HMAC signatures verified when a secret is set.
    #[serde(alias = "test", alias = "testing", alias = "qa")]
    RelaxedTest,
    /// Only the unsafe-algorithm check.
    #[serde(alias = "dev", alias = "development", alias = "local")]
    PermissiveDev,
}

impl EnvironmentTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::RelaxedTest => "relaxed-test",
            Self::PermissiveDev => "permissive-dev",
        }
    }
}

impl fmt::Display for EnvironmentTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentTier {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" | "production" | "prod" => Ok(Self::Strict),
            "relaxed-test" | "test" | "testing" | "qa" => Ok(Self::RelaxedTest),
            "permissive-dev" | "dev" | "development" | "local" => Ok(Self::PermissiveDev),
            other => Err(GatewayError::config(format!(
                "unknown environment tier '{}'",
                other
            ))),
        }
    }
}

/// Validation policy for a legacy JWT: the tier plus the optional HMAC secret.
#[derive(Clone, PartialEq, Eq)]
pub struct JwtPolicy {
    tier: EnvironmentTier,
    secret: Option<String>,
}

impl JwtPolicy {
    /// Build a policy. The strict tier refuses to exist without a secret.
    pub fn new(tier: EnvironmentTier, secret: Option<String>) -> GatewayResult<Self> {
        let secret = secret.filter(|s| !s.trim().is_empty());
        if tier == EnvironmentTier::Strict && secret.is_none() {
            return Err(GatewayError::config(
                "strict JWT tier requires a signing secret",
            ));
        }
        Ok(Self { tier, secret })
    }

    pub fn tier(&self) -> EnvironmentTier {
        self.tier
    }

    pub(crate) fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }
}

impl fmt::Debug for JwtPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtPolicy")
            .field("tier", &self.tier)
            .field("secret", &self.secret.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}
