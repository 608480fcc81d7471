pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by the generation client
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Dial, TLS or credential failure while establishing the channel
    #[error("failed to connect to {host}: {source}")]
    Connection {
        host: String,
        #[source]
        source: BoxError,
    },

    /// An earlier stream failure left the connection unusable
    #[error("connection to {host} is broken, reconnect before generating")]
    ConnectionBroken { host: String },

    #[error("generation stream failed: {0}")]
    Stream(#[from] tonic::Status),

    #[error("generation cancelled")]
    Cancelled,

    #[error("invalid API host: {0}")]
    InvalidHost(String),
}

impl Error {
    pub(crate) fn connection(host: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::Connection {
            host: host.into(),
            source: source.into(),
        }
    }

    /// Whether the error came from the stream rather than the connection setup
    pub fn is_stream(&self) -> bool {
        matches!(self, Error::Stream(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
