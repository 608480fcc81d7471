use std::path::PathBuf;

use crate::config::Config;

/// Generate images with the Stability AI gRPC API
#[derive(Debug, clap::Parser)]
#[command(name = "stabilityai", version)]
pub struct Cli {
    /// Stability AI API key
    #[arg(short = 'a', long, env = "STABILITY_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Stability AI engine [default: stable-diffusion-v1]
    #[arg(short = 'e', long)]
    pub engine: Option<String>,

    /// Stability AI API host [default: grpc.stability.ai:443]
    #[arg(short = 'p', long)]
    pub api_host: Option<String>,

    /// Image width
    #[arg(short = 'W', long, default_value_t = 512)]
    pub width: u64,

    /// Image height
    #[arg(short = 'H', long, default_value_t = 512)]
    pub height: u64,

    /// Fixed seed (random when omitted)
    #[arg(long)]
    pub seed: Option<u32>,

    /// Diffusion steps [default: 50]
    #[arg(long)]
    pub steps: Option<u64>,

    /// Images per request [default: 1]
    #[arg(long)]
    pub samples: Option<u64>,

    /// Prompt adherence [default: 7.0]
    #[arg(long)]
    pub cfg_scale: Option<f32>,

    /// Config file (TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Directory for image files (system temp dir when omitted)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Prompt text
    #[arg(required = true, num_args = 1..)]
    pub prompt: Vec<String>,
}

impl Cli {
    /// All positional words joined with spaces
    pub fn prompt_text(&self) -> String {
        self.prompt.join(" ")
    }

    /// Overlay flags that were given on top of `config`
    pub fn apply(&self, config: &mut Config) {
        if let Some(api_key) = &self.api_key {
            config.api.api_key = api_key.clone();
        }
        if let Some(engine) = &self.engine {
            config.api.engine = engine.clone();
        }
        if let Some(host) = &self.api_host {
            config.api.host = host.clone();
        }
        if let Some(steps) = self.steps {
            config.generation.steps = steps;
        }
        if let Some(samples) = self.samples {
            config.generation.samples = samples;
        }
        if let Some(cfg_scale) = self.cfg_scale {
            config.generation.cfg_scale = cfg_scale;
        }
    }
}
