pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod render;
pub mod request;
pub mod transport;

// Re-export commonly used types
pub use client::{Client, ClientBuilder, ConnectionState};
pub use config::{Config, GenerationParams};
pub use error::{Error, Result};

// gRPC generated code
pub mod proto {
    tonic::include_proto!("gooseai");
}

/// Default gRPC endpoint of the Stability AI API
pub const DEFAULT_API_HOST: &str = "grpc.stability.ai:443";

/// Default engine used for generation
pub const DEFAULT_ENGINE: &str = "stable-diffusion-v1";
