//! gRPC transport for the generation service
//!
//! [`Transport`] establishes a channel and hands back a [`Session`], a stub
//! bound to that channel which opens `Generate` streams. [`GrpcTransport`] is
//! the tonic implementation: TLS with native roots (unless the host has an
//! explicit `http://` scheme) and the API key attached to every call as a
//! bearer token.

use crate::error::{Error, Result};
use crate::proto::{self, generation_service_client::GenerationServiceClient};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::fmt;
use std::time::Duration;
use tonic::codec::CompressionEncoding;
use tonic::metadata::{errors::InvalidMetadataValue, Ascii, MetadataValue};
use tonic::service::{interceptor::InterceptedService, Interceptor};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint, Uri};
use tonic::Status;

/// Stream of answers as delivered by the server
pub type AnswerStream = BoxStream<'static, std::result::Result<proto::Answer, Status>>;

// Answers carry full PNGs; tonic's 4MB default is too small for large images
const MAX_DECODING_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Parsed API host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    host: String,
    uri: Uri,
    tls: bool,
}

impl Target {
    /// Parse a host string.
    ///
    /// `grpc.stability.ai:443` dials `https://grpc.stability.ai:443`. An
    /// explicit `http://` scheme selects a plaintext channel.
    pub fn parse(host: &str) -> Result<Self> {
        let with_scheme = if host.contains("://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };

        let uri: Uri = with_scheme
            .parse()
            .map_err(|_| Error::InvalidHost(host.to_string()))?;

        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(Error::InvalidHost(host.to_string())),
        };

        if uri.host().map_or(true, str::is_empty) {
            return Err(Error::InvalidHost(host.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            uri,
            tls,
        })
    }

    /// Host string as configured
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Domain name checked against the server certificate
    pub fn domain(&self) -> &str {
        self.uri.host().unwrap_or_default()
    }
}

/// Everything needed to establish a session
#[derive(Clone)]
pub struct ConnectOptions {
    pub target: Target,
    pub api_key: String,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("target", &self.target)
            .field("api_key", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Establishes sessions with the generation service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn Session>>;
}

/// Stub bound to an established channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send {
    /// Open a server-streaming `Generate` call
    async fn generate(&mut self, request: proto::Request)
        -> std::result::Result<AnswerStream, Status>;
}

/// Attaches `authorization: Bearer <token>` to every call
#[derive(Clone)]
pub struct BearerAuth {
    header: MetadataValue<Ascii>,
}

impl BearerAuth {
    pub fn new(token: &str) -> std::result::Result<Self, InvalidMetadataValue> {
        let header = format!("Bearer {token}").parse()?;
        Ok(Self { header })
    }
}

impl fmt::Debug for BearerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerAuth(<redacted>)")
    }
}

impl Interceptor for BearerAuth {
    fn call(
        &mut self,
        mut request: tonic::Request<()>,
    ) -> std::result::Result<tonic::Request<()>, Status> {
        request
            .metadata_mut()
            .insert("authorization", self.header.clone());
        Ok(request)
    }
}

/// tonic-backed transport
#[derive(Debug, Clone, Default)]
pub struct GrpcTransport;

impl GrpcTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn Session>> {
        let target = &options.target;

        let auth = BearerAuth::new(&options.api_key)
            .map_err(|e| Error::connection(target.host(), e))?;

        let mut endpoint = Endpoint::from(target.uri().clone());
        if target.is_tls() {
            let tls = ClientTlsConfig::new().domain_name(target.domain());
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| Error::connection(target.host(), e))?;
        }
        if let Some(timeout) = options.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        if let Some(timeout) = options.request_timeout {
            endpoint = endpoint.timeout(timeout);
        }

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Error::connection(target.host(), e))?;

        let client = GenerationServiceClient::with_interceptor(channel, auth)
            .accept_compressed(CompressionEncoding::Gzip)
            .max_decoding_message_size(MAX_DECODING_MESSAGE_SIZE);

        Ok(Box::new(GrpcSession { client }))
    }
}

struct GrpcSession {
    client: GenerationServiceClient<InterceptedService<Channel, BearerAuth>>,
}

#[async_trait]
impl Session for GrpcSession {
    async fn generate(
        &mut self,
        request: proto::Request,
    ) -> std::result::Result<AnswerStream, Status> {
        let response = self.client.generate(request).await?;
        Ok(response.into_inner().boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host_defaults_to_tls() {
        let target = Target::parse("grpc.stability.ai:443").unwrap();

        assert!(target.is_tls());
        assert_eq!(target.host(), "grpc.stability.ai:443");
        assert_eq!(target.domain(), "grpc.stability.ai");
        assert_eq!(target.uri().port_u16(), Some(443));
    }

    #[test]
    fn test_explicit_schemes() {
        let plain = Target::parse("http://127.0.0.1:50051").unwrap();
        assert!(!plain.is_tls());
        assert_eq!(plain.domain(), "127.0.0.1");

        let tls = Target::parse("https://localhost:8443").unwrap();
        assert!(tls.is_tls());
        assert_eq!(tls.domain(), "localhost");
    }

    #[test]
    fn test_invalid_hosts() {
        for host in ["", "ftp://grpc.stability.ai", "not a host"] {
            assert!(
                matches!(Target::parse(host), Err(Error::InvalidHost(_))),
                "{host:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_bearer_auth_sets_header() {
        let mut auth = BearerAuth::new("sk-123").unwrap();
        let request = auth.call(tonic::Request::new(())).unwrap();

        let header = request.metadata().get("authorization").unwrap();
        assert_eq!(header.to_str().unwrap(), "Bearer sk-123");
    }

    #[test]
    fn test_bearer_auth_rejects_control_characters() {
        assert!(BearerAuth::new("sk-123\n").is_err());
    }

    #[test]
    fn test_debug_output_hides_api_key() {
        let options = ConnectOptions {
            target: Target::parse("grpc.stability.ai:443").unwrap(),
            api_key: "sk-secret".to_string(),
            connect_timeout: None,
            request_timeout: None,
        };

        assert!(!format!("{options:?}").contains("sk-secret"));
        assert!(!format!("{:?}", BearerAuth::new("sk-secret").unwrap()).contains("sk-secret"));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let options = ConnectOptions {
            target: Target::parse(&format!("http://127.0.0.1:{port}")).unwrap(),
            api_key: "sk-test".to_string(),
            connect_timeout: Some(Duration::from_secs(2)),
            request_timeout: None,
        };

        match GrpcTransport::new().connect(&options).await {
            Err(Error::Connection { host, .. }) => {
                assert_eq!(host, format!("http://127.0.0.1:{port}"))
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("connect should fail"),
        }
    }
}
