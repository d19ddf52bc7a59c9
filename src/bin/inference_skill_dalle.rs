//! Generate images for every caption of a PaintSkills split.

use anyhow::Result;
use clap::Parser;
use skill_dalle::app::InferenceApp;
use skill_dalle::cli::InferenceArgs;
use tracing::info;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("skill_dalle=info".parse()?)
                .add_directive("inference_skill_dalle=info".parse()?),
        )
        .init();

    let args = InferenceArgs::parse();
    info!(?args, "starting");

    let app = InferenceApp::new(args)?;
    let images = app.run()?;
    info!(images, run = app.run_name(), "done");
    Ok(())
}
