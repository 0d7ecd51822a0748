//! DID registration client for the gateway service.
//!
//! This crate implements the client side of `gateway.v1.GatewayService`,
//! providing:
//!
//! - gRPC channel setup with TLS by default and explicit, logged overrides
//! - Credential resolution (API key, deprecated bearer token, tiered legacy JWT)
//! - Classification of transport and application failures
//! - Bounded exponential backoff with jitter
//! - Per-DID locking across processes (lock files) or hosts (Redis)
//! - Rate-limited diagnostics for repeated failures
//!
//! # Quick Start
//!
//! ```no_run
//! use did_gateway::{DidDocument, RegisterOptions, RegistrationClient};
//!
//! # async fn example() -> did_gateway::GatewayResult<()> {
//! // Create client from environment
//! let client = RegistrationClient::from_env()?;
//!
//! let doc = DidDocument::builder("did:key:z6MkhaXgBZDvotDkL5257faiztiGiC2QtKLGpbnnEGta2doK", b"pk".to_vec())
//!     .label("agent-7")
//!     .build()?;
//!
//! let receipt = client.register(&doc, RegisterOptions::default()).await?;
//! if receipt.is_already_registered() {
//!     println!("already on chain");
//! } else {
//!     println!("registered in {}", receipt.hash);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Authentication
//!
//! At most one credential may be configured:
//!
//! - `DID_GATEWAY_API_KEY` (preferred)
//! - `DID_GATEWAY_BEARER_TOKEN` (deprecated, logs a warning)
//! - `DID_GATEWAY_JWT`, checked under `DID_GATEWAY_ENV_TIER`
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `DID_GATEWAY_URL` | Gateway URL (required) |
//! | `DID_GATEWAY_NETWORK` | Network name in lock keys (default: gateway host) |
//! | `DID_GATEWAY_LOCK_STRATEGY` | `local` (lock files) or `shared` (Redis) |
//! | `DID_GATEWAY_TIMEOUT` | Per-attempt timeout in seconds (default: 5) |
//! | `DID_GATEWAY_MAX_RETRIES` | Max retries for transient failures (default: 3) |
//! | `DID_GATEWAY_INSECURE` | Allow plaintext to non-loopback hosts |
//!
//! See [`GatewayConfig::from_env`] for the full list.

pub mod auth;
pub mod channel;
pub mod classify;
pub mod client;
pub mod diagnostics;
pub mod error;
pub mod lock;
pub mod proto;
pub mod retry;
pub mod types;
pub mod validate;

// Re-export main types
pub use auth::{org_id_from_jwt, Credential, EnvironmentTier, JwtPolicy};
pub use channel::ChannelPlan;
pub use client::{GatewayTransport, GrpcTransport, RegisterOptions, RegistrationClient};
pub use diagnostics::DiagnosticsCache;
pub use error::{GatewayError, GatewayResult};
pub use lock::{
    FileLockBackend, LockBackend, LockHandle, LockManager, LockStore, MemoryLockStore,
    RedisLockStore, SharedStoreLockBackend,
};
pub use types::{CaMode, DidDocument, GatewayConfig, LockStrategy, RegisterErrorCode, TxReceipt};
