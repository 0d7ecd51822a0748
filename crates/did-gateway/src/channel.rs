//! Gateway channel construction.
//!
//! [`ChannelPlan::from_config`] resolves the URL and security policy without
//! touching the network or the filesystem. [`ChannelPlan::tls_connector`]
//! loads trust anchors, and [`ChannelPlan::connect_lazy`] creates the tonic
//! channel; the TCP/TLS connection itself is made on the first request.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::codegen::http::Uri;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};
use url::Url;

use crate::error::{GatewayError, GatewayResult};
use crate::types::{CaMode, GatewayConfig};

/// HTTP/2 keepalive ping interval.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// HTTP/2 keepalive ping timeout.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum gRPC message size in either direction (10 MiB).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Custom trust anchor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustAnchor {
    pub path: PathBuf,
    pub mode: CaMode,
    pub strict: bool,
}

/// Validated channel parameters. Building one performs no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPlan {
    host: String,
    port: u16,
    secure: bool,
    verify_certificates: bool,
    trust_anchor: Option<TrustAnchor>,
    connect_timeout: Duration,
}

impl ChannelPlan {
    /// Validate the gateway URL and security flags.
    ///
    /// Plaintext is only allowed for loopback hosts unless `allow_insecure`
    /// is set, and skipping certificate validation requires
    /// `allow_skip_verify`. Both produce a warning when accepted.
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let raw = config.url.trim();
        if raw.is_empty() {
            return Err(GatewayError::config("gateway URL is empty"));
        }

        let url = Url::parse(raw)
            .map_err(|e| GatewayError::config(format!("invalid gateway URL '{}': {}", raw, e)))?;

        let secure = match url.scheme() {
            "https" | "grpcs" => true,
            "http" | "grpc" => false,
            other => {
                return Err(GatewayError::config(format!(
                    "unsupported gateway URL scheme '{}' (expected https, grpcs, http or grpc)",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| GatewayError::config(format!("gateway URL '{}' has no host", raw)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = url.port().unwrap_or(if secure { 443 } else { 80 });

        if !secure {
            if is_loopback(&host) {
                warn!(host = %host, "plaintext channel to loopback host; traffic is not encrypted");
            } else if config.allow_insecure {
                warn!(
                    host = %host,
                    "insecure plaintext channel to non-loopback gateway; traffic is not encrypted"
                );
            } else {
                return Err(GatewayError::config(format!(
                    "refusing plaintext connection to non-loopback host '{}'; use https/grpcs or set the insecure override",
                    host
                )));
            }
        }

        let verify_certificates = !secure || config.verify_certificates;
        if secure && !verify_certificates {
            if !config.allow_skip_verify {
                return Err(GatewayError::config(
                    "certificate verification can only be disabled with the skip-verify override",
                ));
            }
            warn!(
                host = %host,
                "TLS certificate verification disabled; the gateway identity is not authenticated"
            );
        }

        let trust_anchor = config.ca_path.as_ref().map(|path| TrustAnchor {
            path: path.clone(),
            mode: config.ca_mode,
            strict: config.strict_ca,
        });

        Ok(Self {
            host,
            port,
            secure,
            verify_certificates,
            trust_anchor,
            connect_timeout: config.timeout(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Whether the channel authenticates the gateway (TLS with full chain validation).
    pub fn is_verified(&self) -> bool {
        self.secure && self.verify_certificates
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Build the TLS connector. Returns `None` for plaintext plans.
    ///
    /// Reads the trust anchor from disk; in strict-anchor mode a missing or
    /// unparsable anchor is a configuration error, otherwise the system roots
    /// are used instead.
    pub fn tls_connector(&self) -> GatewayResult<Option<TlsConnector>> {
        if !self.secure {
            return Ok(None);
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| GatewayError::config(format!("TLS setup failed: {}", e)))?;

        let mut tls = if self.verify_certificates {
            let roots = self.root_store()?;
            builder.with_root_certificates(roots).with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(provider)))
                .with_no_client_auth()
        };
        tls.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Some(TlsConnector::from(Arc::new(tls))))
    }

    /// Create the channel. The connection is established on first use.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect_lazy(&self, tls: Option<TlsConnector>) -> GatewayResult<Channel> {
        let scheme = if self.secure { "https" } else { "http" };
        let origin: Uri = format!("{}://{}", scheme, self.authority())
            .parse()
            .map_err(|e| GatewayError::config(format!("invalid gateway authority: {}", e)))?;

        let endpoint = Endpoint::from_shared(format!("http://{}", self.authority()))
            .map_err(GatewayError::from)?
            .origin(origin)
            .connect_timeout(self.connect_timeout)
            .tcp_nodelay(true)
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true);

        let Some(connector) = tls else {
            return Ok(endpoint.connect_lazy());
        };

        let server_name = ServerName::try_from(self.host.clone()).map_err(|e| {
            GatewayError::config(format!("invalid TLS server name '{}': {}", self.host, e))
        })?;

        let connect = tower::service_fn(move |uri: Uri| {
            let connector = connector.clone();
            let server_name = server_name.clone();
            async move {
                let authority = uri
                    .authority()
                    .map(|a| a.as_str().to_string())
                    .ok_or_else(|| std::io::Error::other("gateway URI has no authority"))?;
                let tcp = TcpStream::connect(authority).await?;
                tcp.set_nodelay(true)?;
                let stream = connector.connect(server_name, tcp).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        });

        Ok(endpoint.connect_with_connector_lazy(connect))
    }

    fn root_store(&self) -> GatewayResult<RootCertStore> {
        let mut roots = RootCertStore::empty();

        let custom = match &self.trust_anchor {
            Some(anchor) => match load_pem_certs(&anchor.path) {
                Ok(certs) => Some((anchor.mode, certs)),
                Err(e) if anchor.strict => {
                    return Err(GatewayError::config(format!(
                        "failed to load trust anchor {}: {}",
                        anchor.path.display(),
                        e
                    )))
                }
                Err(e) => {
                    warn!(
                        path = %anchor.path.display(),
                        error = %e,
                        "failed to load trust anchor, falling back to system roots"
                    );
                    None
                }
            },
            None => None,
        };

        let use_system = !matches!(custom, Some((CaMode::Replace, _)));
        if use_system {
            let native = rustls_native_certs::load_native_certs();
            for e in &native.errors {
                debug!(error = %e, "skipping unreadable system certificate");
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            debug!(added, ignored, "loaded system trust roots");
        }

        if let Some((mode, certs)) = custom {
            let (added, ignored) = roots.add_parsable_certificates(certs);
            debug!(added, ignored, mode = ?mode, "loaded custom trust anchor");
        }

        if roots.is_empty() {
            return Err(GatewayError::config("no usable TLS trust anchors"));
        }
        Ok(roots)
    }
}

fn load_pem_certs(path: &Path) -> std::io::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "no PEM certificates found",
        ));
    }
    Ok(certs)
}

/// `localhost`, 127.0.0.0/8 or `::1`.
pub fn is_loopback(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

/// Accepts any server certificate chain. Handshake signatures are still
/// checked so the peer must hold the key for the certificate it presents.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
