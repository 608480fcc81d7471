use anyhow::{Context, Result};
use clap::Parser;
use stabilityai::{
    cli::Cli,
    config::{self, Config},
    render::{self, TempFileSink},
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // .env first so env-backed flags such as --api-key pick it up
    config::load_env_file(None);

    // Usage errors exit here, before any network activity
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate();

    let prompt = cli.prompt_text();

    let mut client = config.client_builder().build();
    client.connect().await.context("Failed to connect")?;

    let answers = match cli.seed {
        Some(seed) => {
            client
                .generate_image_with_seed(&prompt, cli.width, cli.height, seed)
                .await
        }
        None => client.generate_image(&prompt, cli.width, cli.height).await,
    }
    .context("Failed to generate")?;

    info!("Received {} answers", answers.len());

    let mut sink = match &cli.output_dir {
        Some(dir) => TempFileSink::in_dir(dir),
        None => TempFileSink::new(),
    };

    let stdout = std::io::stdout();
    let summary = render::render_answers(&answers, &mut stdout.lock(), &mut sink)?;

    if !summary.write_errors.is_empty() {
        warn!(
            "{} of {} artifacts could not be written to disk",
            summary.write_errors.len(),
            summary.artifacts
        );
    }

    Ok(())
}
