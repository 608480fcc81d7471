//! Generation client
//!
//! [`Client`] owns one connection to the generation service. It connects
//! lazily on the first generation call, drains each response stream into a
//! `Vec` of non-empty answers, and marks the connection broken when a stream
//! fails so the next call does not silently reuse it.

use crate::config::GenerationParams;
use crate::error::{Error, Result};
use crate::proto;
use crate::request;
use crate::transport::{ConnectOptions, GrpcTransport, Session, Target, Transport};
use futures::{future, Stream, TryStreamExt};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

/// Observable connection state of a [`Client`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempt has succeeded yet
    Unconnected,
    Connected,
    /// A stream failed on this connection; `connect` must be called again
    Broken,
}

enum Connection {
    Unconnected,
    Connected(Box<dyn Session>),
    Broken,
}

/// Client for the Stability AI generation API
pub struct Client {
    transport: Box<dyn Transport>,
    host: String,
    api_key: String,
    engine: String,
    params: GenerationParams,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    span: Span,
    connection: Connection,
}

impl Client {
    /// Client with default host, engine and parameters and no API key
    pub fn new() -> Self {
        ClientBuilder::new().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn generation_params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn state(&self) -> ConnectionState {
        match self.connection {
            Connection::Unconnected => ConnectionState::Unconnected,
            Connection::Connected(_) => ConnectionState::Connected,
            Connection::Broken => ConnectionState::Broken,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect to the API host.
    ///
    /// Replaces any existing connection on success, which is also how a
    /// broken connection is recovered. On failure the state is unchanged.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHost`] when the host string cannot be turned into a
    ///   URI, or uses a scheme other than `http` or `https`. Nothing is dialled.
    /// - [`Error::Connection`] when dialling fails: DNS, refused, TLS, connect
    ///   timeout, or an API key that is not a valid header value.
    pub async fn connect(&mut self) -> Result<()> {
        let span = self.span.clone();
        self.connect_inner().instrument(span).await
    }

    async fn connect_inner(&mut self) -> Result<()> {
        let target = Target::parse(&self.host)?;
        let options = ConnectOptions {
            target,
            api_key: self.api_key.clone(),
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
        };

        info!("Dialling {}", self.host);
        let session = self.transport.connect(&options).await?;
        self.connection = Connection::Connected(session);

        Ok(())
    }

    /// Run a `Generate` call and collect every answer that carries artifacts.
    ///
    /// Connects first if the client has never connected. Answers are returned
    /// in arrival order. Any stream error discards everything received so far
    /// and leaves the connection [`ConnectionState::Broken`].
    pub async fn generate(&mut self, request: proto::Request) -> Result<Vec<proto::Answer>> {
        let span = self.span.clone();
        let cancel = self.cancel.clone();
        let work = self.generate_inner(request).instrument(span);

        match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Cancelled),
                result = work => result,
            },
            None => work.await,
        }
    }

    async fn generate_inner(&mut self, request: proto::Request) -> Result<Vec<proto::Answer>> {
        if matches!(self.connection, Connection::Unconnected) {
            self.connect_inner().await?;
        }

        let request_timeout = self.request_timeout;
        let session = match &mut self.connection {
            Connection::Connected(session) => session,
            _ => {
                return Err(Error::ConnectionBroken {
                    host: self.host.clone(),
                });
            }
        };

        info!(
            request_id = %request.request_id,
            engine = %request.engine_id,
            "Sending generation request"
        );
        debug!("Request: {:?}", request);

        let call = async {
            match session.generate(request).await {
                Ok(stream) => collect_answers(stream).await,
                Err(status) => Err(Error::Stream(status)),
            }
        };

        let result = match request_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Stream(tonic::Status::deadline_exceeded(format!(
                        "generation did not finish within {limit:?}"
                    ))))
                }),
            None => call.await,
        };

        match &result {
            Ok(answers) => debug!("Received {} answers with artifacts", answers.len()),
            Err(e) => {
                warn!("Generation failed, marking connection broken: {}", e);
                self.connection = Connection::Broken;
            }
        }

        result
    }

    /// Generate an image from a text prompt with a random seed
    pub async fn generate_image(
        &mut self,
        text: &str,
        width: u64,
        height: u64,
    ) -> Result<Vec<proto::Answer>> {
        self.generate_image_with_seed(text, width, height, request::random_seed())
            .await
    }

    /// Generate an image from a text prompt with a fixed seed
    pub async fn generate_image_with_seed(
        &mut self,
        text: &str,
        width: u64,
        height: u64,
        seed: u32,
    ) -> Result<Vec<proto::Answer>> {
        let request = request::image_request(&self.engine, text, width, height, seed, &self.params);
        self.generate(request).await
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.host)
            .field("engine", &self.engine)
            .field("params", &self.params)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Drain an answer stream, dropping answers without artifacts.
///
/// All or nothing: the first error is returned and earlier answers are lost.
pub async fn collect_answers<S>(stream: S) -> Result<Vec<proto::Answer>>
where
    S: Stream<Item = std::result::Result<proto::Answer, tonic::Status>>,
{
    let answers: Vec<proto::Answer> = stream
        .try_filter(|answer| future::ready(!answer.artifacts.is_empty()))
        .try_collect()
        .await?;

    Ok(answers)
}

/// Options for [`Client`]. Each setter may be called repeatedly; the last
/// value wins.
pub struct ClientBuilder {
    transport: Option<Box<dyn Transport>>,
    host: String,
    api_key: String,
    engine: String,
    params: GenerationParams,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    span: Option<Span>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            host: crate::DEFAULT_API_HOST.to_string(),
            api_key: String::new(),
            engine: crate::DEFAULT_ENGINE.to_string(),
            params: GenerationParams::default(),
            connect_timeout: None,
            request_timeout: None,
            cancel: None,
            span: None,
        }
    }

    pub fn with_api_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn with_generation_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Deadline for each call, from opening the stream until it is fully
    /// drained. Expiry fails the call with a `DeadlineExceeded` stream error.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Abort in-flight generations with [`Error::Cancelled`] once `token` fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Span that client logs are recorded in (default: `stabilityai`)
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    pub fn build(self) -> Client {
        Client {
            transport: self
                .transport
                .unwrap_or_else(|| Box::new(GrpcTransport::new())),
            host: self.host,
            api_key: self.api_key,
            engine: self.engine,
            params: self.params,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            cancel: self.cancel,
            span: self
                .span
                .unwrap_or_else(|| tracing::info_span!("stabilityai")),
            connection: Connection::Unconnected,
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
