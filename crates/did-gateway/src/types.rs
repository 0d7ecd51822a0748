//! Request/response types and client configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::EnvironmentTier;
use crate::error::{GatewayError, GatewayResult};
use crate::validate::{normalize_cid, validate_did};

/// Application-level registration error code reported by the gateway.
///
/// `UnknownUnspecified` (wire value 0) doubles as the "no error" sentinel on
/// successful receipts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegisterErrorCode {
    #[default]
    UnknownUnspecified,
    DocCidEmpty,
    AlreadyRegistered,
    InvalidDid,
    InvalidDocCid,
    InvalidOperator,
    DidQuotaExceeded,
    Unauthorized,
    InvalidPayload,
    ProcessingError,
}

impl RegisterErrorCode {
    /// Decode a wire value. Unknown values collapse to `UnknownUnspecified`.
    pub fn from_wire(value: i32) -> Self {
        match value {
            1 => Self::DocCidEmpty,
            2 => Self::AlreadyRegistered,
            3 => Self::InvalidDid,
            4 => Self::InvalidDocCid,
            5 => Self::InvalidOperator,
            6 => Self::DidQuotaExceeded,
            7 => Self::Unauthorized,
            8 => Self::InvalidPayload,
            9 => Self::ProcessingError,
            _ => Self::UnknownUnspecified,
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            Self::UnknownUnspecified => 0,
            Self::DocCidEmpty => 1,
            Self::AlreadyRegistered => 2,
            Self::InvalidDid => 3,
            Self::InvalidDocCid => 4,
            Self::InvalidOperator => 5,
            Self::DidQuotaExceeded => 6,
            Self::Unauthorized => 7,
            Self::InvalidPayload => 8,
            Self::ProcessingError => 9,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownUnspecified => "UNKNOWN_UNSPECIFIED",
            Self::DocCidEmpty => "DOC_CID_EMPTY",
            Self::AlreadyRegistered => "ALREADY_REGISTERED",
            Self::InvalidDid => "INVALID_DID",
            Self::InvalidDocCid => "INVALID_DOC_CID",
            Self::InvalidOperator => "INVALID_OPERATOR",
            Self::DidQuotaExceeded => "DID_QUOTA_EXCEEDED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::ProcessingError => "PROCESSING_ERROR",
        }
    }
}

impl fmt::Display for RegisterErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DID document submitted for registration.
///
/// Built through [`DidDocument::builder`]; every field is validated and CIDs
/// are normalized before the document exists, so a constructed document is
/// always safe to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DidDocument {
    did: String,
    pub_key: Vec<u8>,
    org_id: Option<String>,
    label: Option<String>,
    schema_version: Option<u32>,
    doc_cid: Option<String>,
    payload_cid: Option<String>,
}

impl DidDocument {
    pub fn builder(did: impl Into<String>, pub_key: impl Into<Vec<u8>>) -> DidDocumentBuilder {
        DidDocumentBuilder {
            did: did.into(),
            pub_key: pub_key.into(),
            org_id: None,
            label: None,
            schema_version: None,
            doc_cid: None,
            payload_cid: None,
        }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn pub_key(&self) -> &[u8] {
        &self.pub_key
    }

    pub fn org_id(&self) -> Option<&str> {
        self.org_id.as_deref()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// `None` means unset; `Some(0)` is an explicit zero.
    pub fn schema_version(&self) -> Option<u32> {
        self.schema_version
    }

    /// Normalized document CID (64 lowercase hex characters, no prefix).
    pub fn doc_cid(&self) -> Option<&str> {
        self.doc_cid.as_deref()
    }

    /// Normalized payload CID (64 lowercase hex characters, no prefix).
    pub fn payload_cid(&self) -> Option<&str> {
        self.payload_cid.as_deref()
    }

    /// Copy of this document with `org_id` filled in, if it was empty.
    pub(crate) fn with_default_org_id(&self, org_id: Option<String>) -> Self {
        let mut doc = self.clone();
        if doc.org_id.is_none() {
            doc.org_id = org_id.filter(|o| !o.is_empty());
        }
        doc
    }
}

/// Builder for [`DidDocument`].
#[derive(Debug, Clone)]
pub struct DidDocumentBuilder {
    did: String,
    pub_key: Vec<u8>,
    org_id: Option<String>,
    label: Option<String>,
    schema_version: Option<u32>,
    doc_cid: Option<String>,
    payload_cid: Option<String>,
}

impl DidDocumentBuilder {
    pub fn org_id(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = Some(version);
        self
    }

    pub fn doc_cid(mut self, cid: impl Into<String>) -> Self {
        self.doc_cid = Some(cid.into());
        self
    }

    pub fn payload_cid(mut self, cid: impl Into<String>) -> Self {
        self.payload_cid = Some(cid.into());
        self
    }

    /// Validate and build the document.
    pub fn build(self) -> GatewayResult<DidDocument> {
        validate_did(&self.did)?;

        let doc_cid = self
            .doc_cid
            .as_deref()
            .map(|c| normalize_cid("doc_cid", c))
            .transpose()?;
        let payload_cid = self
            .payload_cid
            .as_deref()
            .map(|c| normalize_cid("payload_cid", c))
            .transpose()?;

        Ok(DidDocument {
            did: self.did,
            pub_key: self.pub_key,
            org_id: self.org_id.filter(|o| !o.is_empty()),
            label: self.label.filter(|l| !l.is_empty()),
            schema_version: self.schema_version,
            doc_cid,
            payload_cid,
        })
    }
}

/// Transaction receipt returned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    /// Transaction / operation hash.
    pub hash: String,

    /// Resource cost of the operation.
    pub gas_used: u64,

    /// Whether the registration succeeded.
    pub success: bool,

    /// Human-readable error message (empty on success).
    #[serde(default)]
    pub error: String,

    /// Structured error code.
    #[serde(default)]
    pub error_code: RegisterErrorCode,
}

impl TxReceipt {
    /// Check that `success` and `error_code` agree.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.success && self.error_code != RegisterErrorCode::UnknownUnspecified {
            return Err(GatewayError::Gateway {
                message: format!(
                    "inconsistent receipt: success with error code {}",
                    self.error_code
                ),
                transient: false,
            });
        }
        Ok(())
    }

    pub fn is_already_registered(&self) -> bool {
        !self.success && self.error_code == RegisterErrorCode::AlreadyRegistered
    }
}

/// Lock backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStrategy {
    /// Lock files on the local filesystem (single host).
    #[default]
    Local,
    /// Shared store (multi host).
    Shared,
}

impl FromStr for LockStrategy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" | "file" => Ok(Self::Local),
            "shared" | "redis" => Ok(Self::Shared),
            other => Err(GatewayError::config(format!(
                "invalid lock strategy '{}' (expected local or shared)",
                other
            ))),
        }
    }
}

/// How a custom trust anchor combines with the system roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaMode {
    Append,
    #[default]
    Replace,
}

impl FromStr for CaMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "replace" => Ok(Self::Replace),
            other => Err(GatewayError::config(format!(
                "invalid trust anchor mode '{}' (expected append or replace)",
                other
            ))),
        }
    }
}

/// Gateway client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway URL (`https://`, `grpcs://`, or loopback/overridden `http://`, `grpc://`).
    pub url: String,

    /// API key (preferred credential).
    #[serde(default)]
    pub api_key: Option<String>,

    /// Bearer token (deprecated).
    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Legacy JWT credential.
    #[serde(default)]
    pub jwt: Option<String>,

    /// Shared secret for HMAC-signed legacy JWTs.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Environment tier for legacy JWT validation.
    #[serde(default)]
    pub env_tier: EnvironmentTier,

    /// Network name used in lock keys (defaults to the gateway host).
    #[serde(default)]
    pub network: Option<String>,

    /// Lock backend.
    #[serde(default)]
    pub lock_strategy: LockStrategy,

    /// Shared-store address (e.g. `redis://host:6379/0`).
    #[serde(default)]
    pub lock_url: Option<String>,

    /// Directory for local lock files.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,

    /// Upper bound on lock acquisition wait, in seconds.
    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: f64,

    /// Lock lease, in seconds. Reclaims locks abandoned by crashed holders.
    #[serde(default = "default_lock_lease")]
    pub lock_lease_secs: u64,

    /// Per-attempt request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries for retryable failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay in seconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: f64,

    /// Allow plaintext transport to non-loopback hosts.
    #[serde(default)]
    pub allow_insecure: bool,

    /// Allow TLS without certificate-chain validation.
    #[serde(default)]
    pub allow_skip_verify: bool,

    /// Request full certificate validation (needs `allow_skip_verify` to turn off).
    #[serde(default = "default_true")]
    pub verify_certificates: bool,

    /// Custom trust anchor (PEM).
    #[serde(default)]
    pub ca_path: Option<PathBuf>,

    /// How the custom trust anchor combines with system roots.
    #[serde(default)]
    pub ca_mode: CaMode,

    /// Fail instead of falling back to system roots when the anchor cannot be loaded.
    #[serde(default)]
    pub strict_ca: bool,

    /// TTL of deduplicated diagnostics, in seconds.
    #[serde(default = "default_diagnostics_ttl")]
    pub diagnostics_ttl_secs: u64,

    /// Maximum tracked diagnostic signatures.
    #[serde(default = "default_diagnostics_max")]
    pub diagnostics_max_entries: u64,
}

fn default_lock_wait() -> f64 {
    10.0
}

fn default_lock_lease() -> u64 {
    30
}

fn default_timeout() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

fn default_diagnostics_ttl() -> u64 {
    3600
}

fn default_diagnostics_max() -> u64 {
    100
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: None,
            bearer_token: None,
            jwt: None,
            jwt_secret: None,
            env_tier: EnvironmentTier::default(),
            network: None,
            lock_strategy: LockStrategy::default(),
            lock_url: None,
            lock_dir: None,
            lock_wait_secs: default_lock_wait(),
            lock_lease_secs: default_lock_lease(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base(),
            allow_insecure: false,
            allow_skip_verify: false,
            verify_certificates: true,
            ca_path: None,
            ca_mode: CaMode::default(),
            strict_ca: false,
            diagnostics_ttl_secs: default_diagnostics_ttl(),
            diagnostics_max_entries: default_diagnostics_max(),
        }
    }
}

impl GatewayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `DID_GATEWAY_URL` | Gateway URL (required) |
    /// | `DID_GATEWAY_API_KEY` | API key |
    /// | `DID_GATEWAY_BEARER_TOKEN` | Bearer token (deprecated) |
    /// | `DID_GATEWAY_JWT` / `DID_GATEWAY_JWT_SECRET` | Legacy JWT and its secret |
    /// | `DID_GATEWAY_ENV_TIER` | `strict`, `relaxed-test`, `permissive-dev` |
    /// | `DID_GATEWAY_NETWORK` | Network name for lock keys |
    /// | `DID_GATEWAY_LOCK_STRATEGY` | `local` or `shared` |
    /// | `DID_GATEWAY_LOCK_URL` | Shared-store address |
    /// | `DID_GATEWAY_LOCK_DIR` | Lock file directory |
    /// | `DID_GATEWAY_LOCK_WAIT` / `DID_GATEWAY_LOCK_LEASE` | Lock wait bound / lease (seconds) |
    /// | `DID_GATEWAY_TIMEOUT` | Per-attempt timeout in seconds (default: 5) |
    /// | `DID_GATEWAY_MAX_RETRIES` | Max retries (default: 3) |
    /// | `DID_GATEWAY_BACKOFF_BASE` | Backoff base in seconds (default: 0.5) |
    /// | `DID_GATEWAY_INSECURE` | Allow plaintext to non-loopback hosts |
    /// | `DID_GATEWAY_SKIP_VERIFY` | Allow TLS without certificate validation |
    /// | `DID_GATEWAY_CA` / `DID_GATEWAY_CA_MODE` / `DID_GATEWAY_STRICT_CA` | Trust anchor settings |
    /// | `DID_GATEWAY_DIAG_TTL` / `DID_GATEWAY_DIAG_MAX` | Diagnostics dedup window and bound |
    pub fn from_env() -> GatewayResult<Self> {
        let url = env_string("DID_GATEWAY_URL")
            .ok_or_else(|| GatewayError::config("DID_GATEWAY_URL is not set"))?;

        let defaults = Self::default();

        let env_tier = match env_string("DID_GATEWAY_ENV_TIER") {
            Some(v) => v.parse().unwrap_or_else(|_| {
                tracing::warn!(tier = %v, "unknown environment tier, defaulting to strict");
                EnvironmentTier::Strict
            }),
            None => defaults.env_tier,
        };

        let lock_strategy = match env_string("DID_GATEWAY_LOCK_STRATEGY") {
            Some(v) => v.parse()?,
            None => defaults.lock_strategy,
        };

        let ca_mode = match env_string("DID_GATEWAY_CA_MODE") {
            Some(v) => v.parse()?,
            None => defaults.ca_mode,
        };

        Ok(Self {
            url,
            api_key: env_string("DID_GATEWAY_API_KEY"),
            bearer_token: env_string("DID_GATEWAY_BEARER_TOKEN"),
            jwt: env_string("DID_GATEWAY_JWT"),
            jwt_secret: env_string("DID_GATEWAY_JWT_SECRET"),
            env_tier,
            network: env_string("DID_GATEWAY_NETWORK"),
            lock_strategy,
            lock_url: env_string("DID_GATEWAY_LOCK_URL"),
            lock_dir: env_string("DID_GATEWAY_LOCK_DIR").map(PathBuf::from),
            lock_wait_secs: env_parse("DID_GATEWAY_LOCK_WAIT").unwrap_or(defaults.lock_wait_secs),
            lock_lease_secs: env_parse("DID_GATEWAY_LOCK_LEASE")
                .unwrap_or(defaults.lock_lease_secs),
            timeout_secs: env_parse("DID_GATEWAY_TIMEOUT").unwrap_or(defaults.timeout_secs),
            max_retries: env_parse("DID_GATEWAY_MAX_RETRIES").unwrap_or(defaults.max_retries),
            backoff_base_secs: env_parse("DID_GATEWAY_BACKOFF_BASE")
                .unwrap_or(defaults.backoff_base_secs),
            allow_insecure: env_flag("DID_GATEWAY_INSECURE"),
            allow_skip_verify: env_flag("DID_GATEWAY_SKIP_VERIFY"),
            verify_certificates: defaults.verify_certificates,
            ca_path: env_string("DID_GATEWAY_CA").map(PathBuf::from),
            ca_mode,
            strict_ca: env_flag("DID_GATEWAY_STRICT_CA"),
            diagnostics_ttl_secs: env_parse("DID_GATEWAY_DIAG_TTL")
                .unwrap_or(defaults.diagnostics_ttl_secs),
            diagnostics_max_entries: env_parse("DID_GATEWAY_DIAG_MAX")
                .unwrap_or(defaults.diagnostics_max_entries),
        })
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Use a legacy JWT credential validated under `tier`.
    pub fn with_jwt(
        mut self,
        token: impl Into<String>,
        tier: EnvironmentTier,
        secret: Option<String>,
    ) -> Self {
        self.jwt = Some(token.into());
        self.env_tier = tier;
        self.jwt_secret = secret;
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_strategy = LockStrategy::Local;
        self.lock_dir = Some(dir.into());
        self
    }

    pub fn with_shared_lock(mut self, url: impl Into<String>) -> Self {
        self.lock_strategy = LockStrategy::Shared;
        self.lock_url = Some(url.into());
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait_secs = wait.as_secs_f64();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_secs = base.as_secs_f64();
        self
    }

    pub fn with_allow_insecure(mut self, allow: bool) -> Self {
        self.allow_insecure = allow;
        self
    }

    /// Disable certificate-chain validation (TLS stays on). Requires the override.
    pub fn with_skip_verify(mut self, allow_override: bool) -> Self {
        self.verify_certificates = false;
        self.allow_skip_verify = allow_override;
        self
    }

    pub fn with_ca(mut self, path: impl Into<PathBuf>, mode: CaMode, strict: bool) -> Self {
        self.ca_path = Some(path.into());
        self.ca_mode = mode;
        self.strict_ca = strict;
        self
    }

    pub fn with_diagnostics(mut self, ttl: Duration, max_entries: u64) -> Self {
        self.diagnostics_ttl_secs = ttl.as_secs();
        self.diagnostics_max_entries = max_entries;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Fails on negative, NaN or out-of-range values.
    pub fn backoff_base(&self) -> GatewayResult<Duration> {
        secs_f64("backoff base", self.backoff_base_secs)
    }

    /// Fails on negative, NaN or out-of-range values.
    pub fn lock_wait(&self) -> GatewayResult<Duration> {
        secs_f64("lock wait", self.lock_wait_secs)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }
}

fn secs_f64(field: &str, secs: f64) -> GatewayResult<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| GatewayError::config(format!("invalid {} of {} seconds: {}", field, secs, e)))
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
