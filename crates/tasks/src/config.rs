//! Defines all the CLI arguments.

use color_eyre::Result;

use crate::{
    bbox::BoundingBox,
    greenery::{Measure, Weighting},
    manager::Settings,
    panorama::Projection,
    query::History,
    segmentation::ModelId,
    variogram::VariogramKind,
};

/// `Config`
#[derive(clap::Parser, Debug)]
#[clap(author, version)]
#[command(name = "gs-tasks")]
#[command(about = "Map street-level greenery from panorama segmentations")]
pub struct Config {
    #[command(subcommand)]
    /// The subcommand.
    pub command: Commands,
}

/// CLI subcommand.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Fetch panorama metadata for every tile and sample it.
    Prepare(Prepare),
    /// Download, segment and measure every sampled panorama.
    Run(Run),
    /// Fit a variogram to the measurements and krige them into a map.
    Krige(Krige),
    /// Report how far along each tile is.
    Summary(Summary),
}

/// Arguments shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct Common {
    /// Where all data is cached.
    #[arg(long, env = "GS_DATA_DIR", default_value = "data")]
    pub data_dir: std::path::PathBuf,

    /// A named area, eg `oosterpark`, or `lat_sw,lon_sw,lat_ne,lon_ne`.
    #[arg(
        long,
        allow_hyphen_values(true),
        value_parser = parse_bbox,
        default_value = "amsterdam"
    )]
    pub bbox: BoundingBox,

    /// Each tile is sampled on a grid of `2^level` cells per side.
    #[arg(
        long,
        default_value_t = 0,
        value_parser = clap::value_parser!(u32).range(0..=i64::from(crate::query::MAX_LEVEL))
    )]
    pub grid_level: u32,

    /// Tile size in meters.
    #[arg(long, default_value_t = 1024)]
    pub tile_resolution: u32,

    /// Use the single equirectangular image instead of the cube faces.
    #[arg(long)]
    pub panorama: bool,

    /// Also sample one panorama per other year near each pick.
    #[arg(long)]
    pub historical: bool,

    /// How far, in meters, other years' panoramas may be from the pick.
    #[arg(long, default_value_t = 7.0)]
    pub max_range: f64,

    /// The segmentation model, eg `deeplab-xception_65`.
    #[arg(long, default_value_t = ModelId::default())]
    pub model: ModelId,

    /// A class name, or `class=weight,...` with an optional trailing intercept.
    #[arg(long, value_parser = parse_measure, default_value = "vegetation")]
    pub measure: Measure,

    /// Count every pixel the same instead of by the solid angle it covers.
    #[arg(long)]
    pub unweighted: bool,

    /// Split the tiles between this many jobs.
    #[arg(long, default_value_t = 1)]
    pub njobs: usize,

    /// Which of the jobs this is, from 0.
    #[arg(long, default_value_t = 0)]
    pub jobid: usize,
}

impl Common {
    /// Everything the tile manager needs.
    pub fn settings(&self) -> Settings {
        Settings {
            data_dir: self.data_dir.clone(),
            bbox: self.bbox,
            grid_level: self.grid_level,
            tile_resolution: self.tile_resolution,
            projection: if self.panorama {
                Projection::Equirectangular
            } else {
                Projection::CubicFaces
            },
            history: self.historical.then_some(History {
                max_range: self.max_range,
            }),
            model: self.model,
            measure: self.measure.clone(),
            weighting: if self.unweighted {
                Weighting::Uniform
            } else {
                Weighting::Projected
            },
            njobs: self.njobs,
            jobid: self.jobid,
        }
    }
}

/// `gs-tasks prepare` arguments.
#[derive(clap::Parser, Debug, Clone)]
pub struct Prepare {
    /// Shared arguments.
    #[command(flatten)]
    pub common: Common,
}

/// `gs-tasks run` arguments.
#[derive(clap::Parser, Debug, Clone)]
pub struct Run {
    /// Shared arguments.
    #[command(flatten)]
    pub common: Common,

    /// The program that segments an image: `<segmenter> --model <variant> <image>`.
    #[arg(long, env = "GS_SEGMENTER")]
    pub segmenter: std::path::PathBuf,
}

/// `gs-tasks krige` arguments.
#[derive(clap::Parser, Debug, Clone)]
pub struct Krige {
    /// Shared arguments.
    #[command(flatten)]
    pub common: Common,

    /// Tiles within this many steps of a tile contribute to its kriging.
    #[arg(long, default_value_t = 1)]
    pub window: usize,

    /// Raster pixels per sampling cell.
    #[arg(long, default_value_t = 2)]
    pub upscale: usize,

    /// The variogram model.
    #[arg(long, value_enum, default_value_t = VariogramKind::Exponential)]
    pub variogram: VariogramKind,
}

/// `gs-tasks summary` arguments.
#[derive(clap::Parser, Debug, Clone)]
pub struct Summary {
    /// Shared arguments.
    #[command(flatten)]
    pub common: Common,
}

/// Parse a bounding box.
fn parse_bbox(string: &str) -> Result<BoundingBox> {
    BoundingBox::parse(string)
}

/// Parse a greenery measure.
fn parse_measure(string: &str) -> Result<Measure> {
    string.parse()
}
