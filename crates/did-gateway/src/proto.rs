//! Wire messages and client stub for `gateway.v1.GatewayService`.

use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{IntoRequest, IntoStreamingRequest, Response, Status};

use crate::error::{GatewayError, GatewayResult};
use crate::types::{DidDocument, RegisterErrorCode, TxReceipt};

/// `gateway.v1.DidDocument`.
///
/// Tag 5 is reserved for `parent_did` and must not be reused.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DidDocumentMessage {
    #[prost(string, tag = "1")]
    pub did: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub pub_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "3")]
    pub org_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub label: ::prost::alloc::string::String,
    /// `google.protobuf.UInt32Value`; prost encodes `Option<u32>` as the wrapper.
    #[prost(message, optional, tag = "6")]
    pub schema_version: ::core::option::Option<u32>,
    #[prost(string, tag = "7")]
    pub doc_cid: ::prost::alloc::string::String,
    #[prost(string, tag = "8")]
    pub payload_cid: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterDidRequest {
    #[prost(message, optional, tag = "1")]
    pub document: ::core::option::Option<DidDocumentMessage>,
}

/// `gateway.v1.TxReceipt`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TxReceiptMessage {
    #[prost(string, tag = "1")]
    pub hash: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub gas_used: u64,
    #[prost(bool, tag = "3")]
    pub success: bool,
    #[prost(string, tag = "4")]
    pub error: ::prost::alloc::string::String,
    /// `gateway.v1.RegisterError`.
    #[prost(int32, tag = "5")]
    pub error_code: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterDidResponse {
    #[prost(message, optional, tag = "1")]
    pub receipt: ::core::option::Option<TxReceiptMessage>,
}

impl From<&DidDocument> for RegisterDidRequest {
    fn from(doc: &DidDocument) -> Self {
        Self {
            document: Some(DidDocumentMessage {
                did: doc.did().to_string(),
                pub_key: doc.pub_key().to_vec(),
                org_id: doc.org_id().unwrap_or_default().to_string(),
                label: doc.label().unwrap_or_default().to_string(),
                schema_version: doc.schema_version(),
                doc_cid: doc.doc_cid().unwrap_or_default().to_string(),
                payload_cid: doc.payload_cid().unwrap_or_default().to_string(),
            }),
        }
    }
}

impl RegisterDidResponse {
    /// Convert to a receipt, rejecting a missing receipt or an inconsistent
    /// success/code pair.
    pub fn into_receipt(self) -> GatewayResult<TxReceipt> {
        let Some(msg) = self.receipt else {
            return Err(GatewayError::Gateway {
                message: "response does not contain a receipt".to_string(),
                transient: false,
            });
        };
        let receipt = TxReceipt {
            hash: msg.hash,
            gas_used: msg.gas_used,
            success: msg.success,
            error: msg.error,
            error_code: RegisterErrorCode::from_wire(msg.error_code),
        };
        receipt.validate()?;
        Ok(receipt)
    }
}

impl From<&TxReceipt> for RegisterDidResponse {
    fn from(receipt: &TxReceipt) -> Self {
        Self {
            receipt: Some(TxReceiptMessage {
                hash: receipt.hash.clone(),
                gas_used: receipt.gas_used,
                success: receipt.success,
                error: receipt.error.clone(),
                error_code: receipt.error_code.to_wire(),
            }),
        }
    }
}

const REGISTER_DID: &str = "/gateway.v1.GatewayService/RegisterDid";
const STREAM_DIDS: &str = "/gateway.v1.GatewayService/StreamDids";

/// Client stub for `gateway.v1.GatewayService`.
#[derive(Debug, Clone)]
pub struct GatewayServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl GatewayServiceClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Apply message size limits in both directions.
    pub fn with_message_limits(mut self, limit: usize) -> Self {
        self.inner = self
            .inner
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit);
        self
    }

    pub async fn register_did(
        &mut self,
        request: impl IntoRequest<RegisterDidRequest>,
    ) -> Result<Response<RegisterDidResponse>, Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {}", e)))?;
        let codec = ProstCodec::default();
        let path = PathAndQuery::from_static(REGISTER_DID);
        self.inner.unary(request.into_request(), path, codec).await
    }

    pub async fn stream_dids(
        &mut self,
        request: impl IntoStreamingRequest<Message = RegisterDidRequest>,
    ) -> Result<Response<Streaming<RegisterDidResponse>>, Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {}", e)))?;
        let codec = ProstCodec::default();
        let path = PathAndQuery::from_static(STREAM_DIDS);
        self.inner
            .streaming(request.into_streaming_request(), path, codec)
            .await
    }
}
