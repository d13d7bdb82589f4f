//! Map street-level greenery: sample panoramas per tile, segment and measure them, then krige the
//! measurements into a continuous map.
#![expect(
    clippy::panic_in_result_fn,
    reason = "This is just code for short tasks, so panicking is better"
)]
#![cfg_attr(
    test,
    expect(
        clippy::indexing_slicing,
        clippy::as_conversions,
        clippy::unreadable_literal,
        reason = "Tests aren't so strict"
    )
)]

mod bbox;
mod config;
mod error;
mod fetch;
mod greenery;
mod job;
mod kriging;
mod manager;
mod map;
mod meta;
mod panorama;
mod projector;
mod query;
mod segmentation;
mod semivariogram;
mod store;
mod tile;
mod variogram;

use clap::Parser as _;
use color_eyre::Result;
use tracing_subscriber::{Layer as _, layer::SubscriberExt as _, util::SubscriberInitExt as _};

use crate::config::Commands;

/// How long to wait before asking the metadata API again after a failure.
const METADATA_RETRY_SLEEP: std::time::Duration = std::time::Duration::from_secs(60);

fn main() -> Result<()> {
    color_eyre::install()?;
    setup_logging()?;

    let config = crate::config::Config::parse();
    tracing::info!("Initialising with config: {config:?}",);

    let source = meta::AmsterdamApi::new(METADATA_RETRY_SLEEP)?;
    match &config.command {
        Commands::Prepare(prepare) => {
            let manager = manager::TileManager::new(prepare.common.settings(), &source)?;
            manager.prepare()?;
        }
        Commands::Run(run) => {
            let settings = run.common.settings();
            let segmenter = segmentation::CommandSegmenter {
                executable: run.segmenter.clone(),
                model: settings.model,
            };
            let fetcher = fetch::HttpFetcher::new()?;
            let manager = manager::TileManager::new(settings, &source)?;
            let report = manager.run(&fetcher, &segmenter, fetch::RetryPolicy::default())?;
            if report.failed > 0 {
                tracing::warn!("{} panoramas failed and are now marked broken", report.failed);
            }
        }
        Commands::Krige(krige) => {
            let manager = manager::TileManager::new(krige.common.settings(), &source)?;
            let kriging = kriging::KrigingConfig {
                window: krige.window,
                upscale: krige.upscale,
                ..kriging::KrigingConfig::default()
            };
            let map = manager.krige(
                krige.variogram,
                kriging,
                &semivariogram::Estimator::default(),
            )?;
            tracing::info!(
                "Map {} is {}x{} pixels, values {:?}",
                map.name,
                map.width,
                map.height,
                map.value_range
            );
        }
        Commands::Summary(summary) => {
            let manager = manager::TileManager::new(summary.common.settings(), &source)?;
            manager.summary()?;
        }
    }

    Ok(())
}

/// Setup logging.
fn setup_logging() -> Result<()> {
    let filters = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("info".parse()?)
        .from_env_lossy();
    let filter_layer = tracing_subscriber::fmt::layer().with_filter(filters);
    let tracing_setup = tracing_subscriber::registry().with(filter_layer);
    tracing_setup.init();

    Ok(())
}
