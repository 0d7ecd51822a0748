//! In-memory gateway used by the integration tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use did_gateway::proto::RegisterDidResponse;
use did_gateway::{DidDocument, GatewayConfig, GatewayTransport, RegisterErrorCode, TxReceipt};
use tonic::metadata::AsciiMetadataValue;
use tonic::Status;
use tracing_subscriber::fmt::MakeWriter;

/// One scripted reply for a unary call (or a whole stream call).
pub enum Reply {
    Response(RegisterDidResponse),
    Status(Status),
    /// Never answers; exercises the local per-attempt timeout.
    Hang,
}

/// Scripted replies first, then a simulated gateway that registers each DID
/// once and answers `ALREADY_REGISTERED` afterwards.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    registered: Mutex<HashSet<String>>,
    latency: Duration,
    calls: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    authorization: Mutex<Vec<Option<String>>>,
    documents: Mutex<Vec<DidDocument>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most unary requests the gateway was handling at the same time.
    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn authorization_seen(&self) -> Vec<Option<String>> {
        self.authorization.lock().unwrap().clone()
    }

    pub fn documents_seen(&self) -> Vec<DidDocument> {
        self.documents.lock().unwrap().clone()
    }

    fn record(&self, authorization: &Option<AsciiMetadataValue>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let value = authorization
            .as_ref()
            .map(|v| v.to_str().unwrap().to_string());
        self.authorization.lock().unwrap().push(value);
    }

    fn next_scripted(&self) -> Option<Reply> {
        self.script.lock().unwrap().pop_front()
    }

    fn simulate(&self, doc: &DidDocument) -> RegisterDidResponse {
        self.documents.lock().unwrap().push(doc.clone());
        let fresh = self.registered.lock().unwrap().insert(doc.did().to_string());
        if fresh {
            success(&format!("0x{:064x}", self.calls()))
        } else {
            failure(RegisterErrorCode::AlreadyRegistered, "DID already registered")
        }
    }
}

/// Decrements the in-flight counter when a request finishes or is dropped.
struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GatewayTransport for ScriptedTransport {
    async fn register_did(
        &self,
        doc: &DidDocument,
        authorization: Option<AsciiMetadataValue>,
        _timeout: Duration,
    ) -> Result<RegisterDidResponse, Status> {
        self.record(&authorization);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.next_scripted() {
            Some(Reply::Response(response)) => {
                self.documents.lock().unwrap().push(doc.clone());
                Ok(response)
            }
            Some(Reply::Status(status)) => Err(status),
            Some(Reply::Hang) => std::future::pending().await,
            None => Ok(self.simulate(doc)),
        }
    }

    async fn register_did_stream(
        &self,
        docs: &[DidDocument],
        authorization: Option<AsciiMetadataValue>,
        _timeout: Duration,
    ) -> Result<Vec<RegisterDidResponse>, Status> {
        self.record(&authorization);
        match self.next_scripted() {
            Some(Reply::Response(response)) => Ok(vec![response]),
            Some(Reply::Status(status)) => Err(status),
            Some(Reply::Hang) => std::future::pending().await,
            None => Ok(docs.iter().map(|doc| self.simulate(doc)).collect()),
        }
    }
}

pub fn success(hash: &str) -> RegisterDidResponse {
    RegisterDidResponse::from(&TxReceipt {
        hash: hash.to_string(),
        gas_used: 21_000,
        success: true,
        error: String::new(),
        error_code: RegisterErrorCode::UnknownUnspecified,
    })
}

pub fn failure(code: RegisterErrorCode, message: &str) -> RegisterDidResponse {
    RegisterDidResponse::from(&TxReceipt {
        hash: String::new(),
        gas_used: 0,
        success: false,
        error: message.to_string(),
        error_code: code,
    })
}

pub fn document(did: &str) -> DidDocument {
    DidDocument::builder(did, b"ed25519-public-key".to_vec())
        .doc_cid(format!("0x{}", "ab".repeat(32)))
        .build()
        .unwrap()
}

/// Loopback config with fast retries and locks in `lock_dir`.
pub fn config(lock_dir: &std::path::Path) -> GatewayConfig {
    GatewayConfig::new("http://127.0.0.1:50051")
        .with_api_key("test-key")
        .with_lock_dir(lock_dir)
        .with_backoff_base(Duration::from_millis(10))
        .with_lock_wait(Duration::from_secs(5))
}

#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl LogCapture {
    /// `kind` fields of the WARN events logged so far.
    pub fn warning_kinds(&self) -> Vec<String> {
        let output = String::from_utf8(self.buf.lock().unwrap().clone()).unwrap();
        output
            .lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter(|v| v["level"] == "WARN")
            .filter_map(|v| v["fields"]["kind"].as_str().map(String::from))
            .collect()
    }
}

/// JSON log capture for the current thread.
pub fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .json()
        .finish();
    (capture, tracing::subscriber::set_default(subscriber))
}
