//! Registration client.
//!
//! Public API: no status code knowledge. Statuses and receipts are mapped in
//! [`crate::classify`]; the wire lives behind [`GatewayTransport`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

mod transport;

pub use transport::{GatewayTransport, GrpcTransport};

use crate::auth::Credential;
use crate::channel::ChannelPlan;
use crate::classify::{
    classify_local_timeout, classify_receipt, classify_status, Failure, RetryCause, Verdict,
};
use crate::diagnostics::DiagnosticsCache;
use crate::error::{GatewayError, GatewayResult};
use crate::lock::{lock_key, LockManager};
use crate::retry::{RetryEngine, RetryPolicy, Step};
use crate::types::{DidDocument, GatewayConfig, TxReceipt};
use crate::validate::truncate;

/// Network name used when neither the config nor the URL provide one.
const DEFAULT_NETWORK: &str = "default";

/// Diagnostics subject for batch-level failures.
const BATCH_SUBJECT: &str = "batch";

/// Slack added to the worst-case run when sizing a lock lease.
const LEASE_MARGIN: Duration = Duration::from_secs(5);

/// Per-call overrides of the client defaults.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub credential: Option<Credential>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl RegisterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// DID registration client.
///
/// Cheap to clone; clones share the channel, locks, diagnostics and the
/// registered-DID memo.
pub struct RegistrationClient<T: GatewayTransport = GrpcTransport> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    transport: T,
    credential: Option<Credential>,
    locks: LockManager,
    network: String,
    diagnostics: DiagnosticsCache,
    registered: Mutex<HashSet<String>>,
    timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
}

impl<T: GatewayTransport> Clone for RegistrationClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: GatewayTransport> std::fmt::Debug for RegistrationClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationClient")
            .field("network", &self.inner.network)
            .field("credential", &self.inner.credential.as_ref().map(Credential::kind))
            .field("locks", &self.inner.locks)
            .field("diagnostics", &self.inner.diagnostics)
            .field("timeout", &self.inner.timeout)
            .field("max_retries", &self.inner.max_retries)
            .finish()
    }
}

impl RegistrationClient<GrpcTransport> {
    /// Plan the channel, resolve credentials and select the lock backend.
    ///
    /// Fails with [`GatewayError::Config`] before any network I/O.
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let plan = ChannelPlan::from_config(&config)?;
        let transport = GrpcTransport::new(plan)?;
        Self::with_transport(config, transport)
    }

    pub fn from_env() -> GatewayResult<Self> {
        Self::new(GatewayConfig::from_env()?)
    }
}

impl<T: GatewayTransport> RegistrationClient<T> {
    /// Client over a caller-supplied transport.
    pub fn with_transport(config: GatewayConfig, transport: T) -> GatewayResult<Self> {
        let locks = LockManager::from_config(&config)?;
        Self::with_lock_manager(config, transport, locks)
    }

    pub fn with_lock_manager(
        config: GatewayConfig,
        transport: T,
        locks: LockManager,
    ) -> GatewayResult<Self> {
        let credential = Credential::from_config(&config)?;
        let timeout = config.timeout();
        let backoff_base = config.backoff_base()?;
        worst_case_lease(&RetryPolicy::new(config.max_retries, backoff_base), timeout)?;
        let network = network_name(&config);
        let diagnostics = DiagnosticsCache::new(
            Duration::from_secs(config.diagnostics_ttl_secs),
            config.diagnostics_max_entries,
        );

        debug!(
            network = %network,
            credential = credential.as_ref().map(Credential::kind).unwrap_or("none"),
            locks = locks.backend_name(),
            "registration client ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                credential,
                locks,
                network,
                diagnostics,
                registered: Mutex::new(HashSet::new()),
                timeout,
                max_retries: config.max_retries,
                backoff_base,
            }),
        })
    }

    /// Network name used in lock keys.
    pub fn network(&self) -> &str {
        &self.inner.network
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.inner.locks
    }

    pub fn diagnostics(&self) -> &DiagnosticsCache {
        &self.inner.diagnostics
    }

    /// Whether this client registered `did`, or saw it already registered.
    pub fn is_registered(&self, did: &str) -> bool {
        self.memo().contains(did)
    }

    /// Register `doc` with the gateway.
    ///
    /// An already-registered DID is not an error: the gateway's receipt is
    /// returned with `success == false` and `error_code == AlreadyRegistered`.
    pub async fn register(
        &self,
        doc: &DidDocument,
        options: RegisterOptions,
    ) -> GatewayResult<TxReceipt> {
        let lease = self.lease_for(&options)?;
        let (credential, doc) = self.prepare(doc, &options)?;
        self.locked(
            doc.did(),
            lease,
            self.register_locked(&doc, credential.as_ref(), &options),
        )
        .await
    }

    /// Register `doc` unless this client already knows it is registered.
    ///
    /// Returns `true` for a fresh registration and `false` otherwise. The
    /// memo is consulted again once the lock is held, so concurrent callers
    /// in one process send a single request.
    pub async fn ensure_registered(&self, doc: &DidDocument, force: bool) -> GatewayResult<bool> {
        if !force && self.is_registered(doc.did()) {
            debug!(did = %truncate(doc.did()), "DID already registered by this client");
            return Ok(false);
        }

        let options = RegisterOptions::default();
        let lease = self.lease_for(&options)?;
        let (credential, doc) = self.prepare(doc, &options)?;
        let registered = self
            .locked(doc.did(), lease, async {
                if !force && self.is_registered(doc.did()) {
                    return Ok(None);
                }
                self.register_locked(&doc, credential.as_ref(), &options)
                    .await
                    .map(Some)
            })
            .await?;

        Ok(registered.is_some_and(|receipt| receipt.success))
    }

    /// Submit `docs` over the streaming RPC.
    ///
    /// The outer error covers the whole batch (credentials, transport failures
    /// after retries). Each document then gets its own result; application
    /// failures are not retried per item. No per-DID locks are taken.
    pub async fn register_batch(
        &self,
        docs: &[DidDocument],
        options: RegisterOptions,
    ) -> GatewayResult<Vec<GatewayResult<TxReceipt>>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let credential = self.credential_for(&options);
        let org_id = match &credential {
            Some(credential) => {
                credential.authorization()?;
                credential.org_id()
            }
            None => None,
        };
        let docs: Vec<DidDocument> = docs
            .iter()
            .map(|doc| doc.with_default_org_id(org_id.clone()))
            .collect();

        let timeout = options.timeout.unwrap_or(self.inner.timeout);
        let mut engine = RetryEngine::new(self.policy(&options));
        let credential = credential.as_ref();
        let docs_ref = &docs;

        let responses = engine
            .run(|attempt| async move {
                let authorization = match credential.map(Credential::authorization).transpose() {
                    Ok(value) => value,
                    Err(e) => return Step::Fail(e),
                };
                debug!(count = docs_ref.len(), attempt, "sending registration batch");

                let call = self
                    .inner
                    .transport
                    .register_did_stream(docs_ref, authorization, timeout);
                let failure = match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(responses)) => return Step::Done(responses),
                    Ok(Err(status)) => classify_status(&status, timeout),
                    Err(_) => classify_local_timeout(timeout),
                };
                if let Failure::Retryable(cause) = &failure {
                    self.report_retry(BATCH_SUBJECT, attempt, cause);
                }
                Step::from(failure)
            })
            .await
            .inspect_err(|e| self.report_fatal(BATCH_SUBJECT, e))?;

        if responses.len() != docs.len() {
            warn!(
                expected = docs.len(),
                received = responses.len(),
                "batch response count does not match request count"
            );
        }

        let mut responses = responses.into_iter();
        let results = docs
            .iter()
            .map(|doc| {
                let result = match responses.next() {
                    Some(response) => match response.into_receipt().map(classify_receipt) {
                        Ok(Verdict::Success(receipt) | Verdict::SuccessEquivalent(receipt)) => {
                            self.remember(doc.did());
                            Ok(receipt)
                        }
                        Ok(Verdict::Retryable(cause)) => Err(GatewayError::Gateway {
                            message: cause.message().to_string(),
                            transient: true,
                        }),
                        Ok(Verdict::Fatal(e)) | Err(e) => Err(e),
                    },
                    None => Err(GatewayError::Gateway {
                        message: "no response for document in batch".to_string(),
                        transient: true,
                    }),
                };
                if let Err(e) = &result {
                    self.report_fatal(doc.did(), e);
                }
                result
            })
            .collect();

        Ok(results)
    }

    fn credential_for(&self, options: &RegisterOptions) -> Option<Credential> {
        options
            .credential
            .clone()
            .or_else(|| self.inner.credential.clone())
    }

    fn policy(&self, options: &RegisterOptions) -> RetryPolicy {
        RetryPolicy::new(
            options.max_retries.unwrap_or(self.inner.max_retries),
            self.inner.backoff_base,
        )
    }

    /// Lease long enough to cover every attempt and backoff of one call.
    fn lease_for(&self, options: &RegisterOptions) -> GatewayResult<Duration> {
        let timeout = options.timeout.unwrap_or(self.inner.timeout);
        worst_case_lease(&self.policy(options), timeout)
    }

    /// Resolve the credential, check it once, and fill `org_id` from a legacy JWT.
    fn prepare(
        &self,
        doc: &DidDocument,
        options: &RegisterOptions,
    ) -> GatewayResult<(Option<Credential>, DidDocument)> {
        let credential = self.credential_for(options);
        let org_id = match &credential {
            Some(credential) => {
                if let Err(e) = credential.authorization() {
                    self.report_fatal(doc.did(), &e);
                    return Err(e);
                }
                credential.org_id()
            }
            None => None,
        };
        Ok((credential, doc.with_default_org_id(org_id)))
    }

    /// Run `op` while holding the lock for `did`, if one could be taken.
    async fn locked<R>(&self, did: &str, lease: Duration, op: impl Future<Output = R>) -> R {
        let key = lock_key(&self.inner.network, did);
        let handle = self.inner.locks.acquire_with_lease(&key, lease).await;
        let result = op.await;
        if let Some(handle) = handle {
            self.inner.locks.release(handle).await;
        }
        result
    }

    async fn register_locked(
        &self,
        doc: &DidDocument,
        credential: Option<&Credential>,
        options: &RegisterOptions,
    ) -> GatewayResult<TxReceipt> {
        let timeout = options.timeout.unwrap_or(self.inner.timeout);
        let policy = self.policy(options);
        let mut engine = RetryEngine::new(policy);

        let result = engine
            .run(|attempt| self.attempt(doc, credential, timeout, attempt))
            .await;

        match &result {
            Ok(receipt) => {
                self.remember(doc.did());
                if receipt.success {
                    info!(
                        did = %truncate(doc.did()),
                        hash = %receipt.hash,
                        gas_used = receipt.gas_used,
                        attempts = engine.attempts(),
                        "DID registered"
                    );
                } else {
                    info!(did = %truncate(doc.did()), "DID already registered");
                }
            }
            Err(e) => self.report_fatal(doc.did(), e),
        }
        result
    }

    async fn attempt(
        &self,
        doc: &DidDocument,
        credential: Option<&Credential>,
        timeout: Duration,
        attempt: u32,
    ) -> Step<TxReceipt> {
        let authorization = match credential.map(Credential::authorization).transpose() {
            Ok(value) => value,
            Err(e) => return Step::Fail(e),
        };

        debug!(did = %truncate(doc.did()), attempt, "sending registration");
        let call = self.inner.transport.register_did(doc, authorization, timeout);
        let verdict = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(response)) => match response.into_receipt() {
                Ok(receipt) => classify_receipt(receipt),
                Err(e) => Verdict::Fatal(e),
            },
            Ok(Err(status)) => classify_status(&status, timeout).into(),
            Err(_) => classify_local_timeout(timeout).into(),
        };

        if let Verdict::Retryable(cause) = &verdict {
            self.report_retry(doc.did(), attempt, cause);
        }
        Step::from(verdict)
    }

    fn report_retry(&self, did: &str, attempt: u32, cause: &RetryCause) {
        self.inner.diagnostics.warn(
            did,
            cause.retry_kind(),
            &format!("attempt {} failed: {}", attempt, cause.message()),
        );
    }

    fn report_fatal(&self, did: &str, error: &GatewayError) {
        self.inner
            .diagnostics
            .warn(did, error.code(), &error.to_string());
    }

    fn remember(&self, did: &str) {
        self.memo().insert(did.to_string());
    }

    fn memo(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.inner
            .registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

fn worst_case_lease(policy: &RetryPolicy, timeout: Duration) -> GatewayResult<Duration> {
    policy
        .worst_case_run(timeout)
        .map(|run| run.saturating_add(LEASE_MARGIN))
        .ok_or_else(|| {
            GatewayError::config(format!(
                "retry settings too large: {} retries with {:?} timeout and {:?} backoff base",
                policy.max_retries, timeout, policy.base
            ))
        })
}

fn network_name(config: &GatewayConfig) -> String {
    if let Some(network) = config.network.as_deref().map(str::trim) {
        if !network.is_empty() {
            return network.to_string();
        }
    }
    Url::parse(config.url.trim())
        .ok()
        .and_then(|url| url.host_str().map(|h| h.trim_matches(['[', ']']).to_string()))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| DEFAULT_NETWORK.to_string())
}
