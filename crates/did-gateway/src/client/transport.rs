//! Transport layer: one RPC per call, no retry or classification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_rustls::TlsConnector;
use tonic::metadata::AsciiMetadataValue;
use tonic::{Request, Status};
use tracing::debug;

use crate::auth::AUTHORIZATION;
use crate::channel::{ChannelPlan, MAX_MESSAGE_SIZE};
use crate::error::GatewayResult;
use crate::proto::{GatewayServiceClient, RegisterDidRequest, RegisterDidResponse};
use crate::types::DidDocument;

/// Sends registration requests to the gateway.
///
/// Implementations return raw statuses; the orchestrator classifies them.
#[async_trait]
pub trait GatewayTransport: Send + Sync + 'static {
    /// Unary `RegisterDid`.
    async fn register_did(
        &self,
        doc: &DidDocument,
        authorization: Option<AsciiMetadataValue>,
        timeout: Duration,
    ) -> Result<RegisterDidResponse, Status>;

    /// Streaming `StreamDids`: one response per document, in order.
    async fn register_did_stream(
        &self,
        docs: &[DidDocument],
        authorization: Option<AsciiMetadataValue>,
        timeout: Duration,
    ) -> Result<Vec<RegisterDidResponse>, Status>;
}

#[async_trait]
impl<T: GatewayTransport + ?Sized> GatewayTransport for Arc<T> {
    async fn register_did(
        &self,
        doc: &DidDocument,
        authorization: Option<AsciiMetadataValue>,
        timeout: Duration,
    ) -> Result<RegisterDidResponse, Status> {
        (**self).register_did(doc, authorization, timeout).await
    }

    async fn register_did_stream(
        &self,
        docs: &[DidDocument],
        authorization: Option<AsciiMetadataValue>,
        timeout: Duration,
    ) -> Result<Vec<RegisterDidResponse>, Status> {
        (**self)
            .register_did_stream(docs, authorization, timeout)
            .await
    }
}

/// tonic transport over a lazily created channel.
pub struct GrpcTransport {
    plan: ChannelPlan,
    tls: Option<TlsConnector>,
    client: OnceCell<GatewayServiceClient>,
}

impl std::fmt::Debug for GrpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcTransport")
            .field("plan", &self.plan)
            .field("tls", &self.tls.is_some())
            .field("connected", &self.client.initialized())
            .finish()
    }
}

impl GrpcTransport {
    /// Prepare TLS from `plan`. No network I/O happens until the first request.
    pub fn new(plan: ChannelPlan) -> GatewayResult<Self> {
        let tls = plan.tls_connector()?;
        Ok(Self {
            plan,
            tls,
            client: OnceCell::new(),
        })
    }

    pub fn plan(&self) -> &ChannelPlan {
        &self.plan
    }

    async fn client(&self) -> Result<GatewayServiceClient, Status> {
        let client = self
            .client
            .get_or_try_init(|| async {
                debug!(
                    endpoint = %self.plan.authority(),
                    secure = self.plan.is_secure(),
                    verified = self.plan.is_verified(),
                    "creating gateway channel"
                );
                self.plan
                    .connect_lazy(self.tls.clone())
                    .map(|channel| {
                        GatewayServiceClient::new(channel).with_message_limits(MAX_MESSAGE_SIZE)
                    })
                    .map_err(|e| Status::failed_precondition(e.to_string()))
            })
            .await?;
        Ok(client.clone())
    }
}

fn prepare<T>(
    message: T,
    authorization: Option<AsciiMetadataValue>,
    timeout: Duration,
) -> Request<T> {
    let mut request = Request::new(message);
    request.set_timeout(timeout);
    if let Some(value) = authorization {
        request.metadata_mut().insert(AUTHORIZATION, value);
    }
    request
}

#[async_trait]
impl GatewayTransport for GrpcTransport {
    async fn register_did(
        &self,
        doc: &DidDocument,
        authorization: Option<AsciiMetadataValue>,
        timeout: Duration,
    ) -> Result<RegisterDidResponse, Status> {
        let mut client = self.client().await?;
        let request = prepare(RegisterDidRequest::from(doc), authorization, timeout);
        let response = client.register_did(request).await?;
        Ok(response.into_inner())
    }

    async fn register_did_stream(
        &self,
        docs: &[DidDocument],
        authorization: Option<AsciiMetadataValue>,
        timeout: Duration,
    ) -> Result<Vec<RegisterDidResponse>, Status> {
        let mut client = self.client().await?;
        let messages: Vec<RegisterDidRequest> = docs.iter().map(RegisterDidRequest::from).collect();
        let request = prepare(tokio_stream::iter(messages), authorization, timeout);

        let mut stream = client.stream_dids(request).await?.into_inner();
        let mut responses = Vec::with_capacity(docs.len());
        while let Some(response) = stream.message().await? {
            responses.push(response);
        }
        Ok(responses)
    }
}
