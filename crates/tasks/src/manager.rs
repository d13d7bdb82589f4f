//! Drives a whole region: fetching and sampling metadata per tile, running the panorama pipelines,
//! aggregating tile results, and kriging them into a map.
//!
//! On disk, under the data directory:
//!
//! ```text
//! cache/                      broken.json, empty_tiles.json, index.lock
//! tiles/<tile>/meta.json      everything the provider has for the tile
//! tiles/<tile>/queries/       cached samples per grid level
//! tiles/<tile>/pics/<id>/     images, segmentations and stage records
//! tiles/<tile>/results/       measured points per result key
//! maps/<region>/<map key>/    variogram, kriged tiles, the map and its GeoJSON
//! ```

use std::collections::BTreeMap;

use color_eyre::Result;
use rayon::iter::{IntoParallelRefIterator as _, ParallelIterator as _};

use crate::{
    bbox::BoundingBox,
    fetch::{Fetcher, RetryPolicy},
    greenery::{Fractions, GreeneryModel, Measure, Weighting},
    job::{JobPipeline, PipelineStatus},
    kriging::{Interpolator, KrigedTile, KrigingConfig, Sample},
    map::GreenMap,
    meta::{MetadataSource, PanoramaMeta, TileMeta},
    panorama::Projection,
    projector::{Convert, LatLonCoord},
    query::{GridQuery, History},
    segmentation::{ModelId, Segmenter},
    semivariogram::{Estimator, TileSamples},
    store::{FsStore, JobRecord, RegionIndex, ResultStore as _, Stage, StageKey},
    tile::{Tile, TileGrid},
    variogram::{VariogramKind, VariogramModel},
};

/// Everything that decides what a run does.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of all cached data.
    pub data_dir: std::path::PathBuf,
    /// The region.
    pub bbox: BoundingBox,
    /// Sampling grid level within each tile.
    pub grid_level: u32,
    /// Tile size in meters.
    pub tile_resolution: u32,
    /// Which images to use.
    pub projection: Projection,
    /// Whether to also sample other years.
    pub history: Option<History>,
    /// The segmentation model.
    pub model: ModelId,
    /// The scalar to map.
    pub measure: Measure,
    /// The pixel weighting.
    pub weighting: Weighting,
    /// Number of jobs the tiles are split between.
    pub njobs: usize,
    /// Which of those jobs this is.
    pub jobid: usize,
}

/// One measured panorama, as aggregated per tile.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MeasuredPoint {
    /// The panorama.
    pub pano_id: String,
    /// Where it was captured.
    pub coordinate: LatLonCoord,
    /// When it was captured.
    pub timestamp: chrono::NaiveDateTime,
    /// Its class fractions.
    pub fractions: Fractions,
}

/// Counts of how panoramas fared in a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Panoramas that are fully processed.
    pub done: usize,
    /// Panoramas skipped because they're known to be broken.
    pub skipped: usize,
    /// Panoramas that failed in this run.
    pub failed: usize,
}

/// What is known about one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileSummary {
    /// The tile.
    pub name: String,
    /// Panoramas the provider has, or `None` if the metadata hasn't been fetched.
    pub available: Option<usize>,
    /// Panoramas picked by the sampling.
    pub sampled: usize,
    /// Sampled panoramas that have been measured.
    pub measured: usize,
}

/// Works on the tiles of one region.
pub struct TileManager<'deps> {
    /// What to do.
    pub settings: Settings,
    /// The tiles.
    pub grid: TileGrid,
    /// The shared broken and empty sets.
    index: RegionIndex,
    /// Where metadata comes from.
    source: &'deps dyn MetadataSource,
    /// Computes class fractions.
    greenery: GreeneryModel,
}

impl<'deps> TileManager<'deps> {
    /// Instantiate.
    pub fn new(settings: Settings, source: &'deps dyn MetadataSource) -> Result<Self> {
        if settings.njobs == 0 || settings.jobid >= settings.njobs {
            color_eyre::eyre::bail!(
                "Job id {} must be below the number of jobs {}",
                settings.jobid,
                settings.njobs
            );
        }

        if settings.grid_level > crate::query::MAX_LEVEL {
            color_eyre::eyre::bail!(
                "Grid level {} is finer than the maximum of {}",
                settings.grid_level,
                crate::query::MAX_LEVEL
            );
        }

        let grid = TileGrid::new(
            &settings.bbox,
            settings.tile_resolution,
            &settings.data_dir.join("tiles"),
        )?;
        let index = RegionIndex::new(settings.data_dir.join("cache"))?;
        let greenery = GreeneryModel::new(settings.weighting);
        tracing::info!(
            "Region has {} tiles of {}m, job {}/{} handles {}",
            grid.tiles.len(),
            grid.resolution,
            settings.jobid,
            settings.njobs,
            grid.tiles
                .iter()
                .filter(|tile| grid.linear_index(tile) % settings.njobs == settings.jobid)
                .count()
        );

        Ok(Self {
            settings,
            grid,
            index,
            source,
            greenery,
        })
    }

    /// Whether this job is responsible for a tile.
    fn is_mine(&self, tile: &Tile) -> bool {
        self.grid.linear_index(tile) % self.settings.njobs == self.settings.jobid
    }

    /// The tiles this job is responsible for.
    pub fn my_tiles(&self) -> Vec<&Tile> {
        self.grid
            .tiles
            .iter()
            .filter(|tile| self.is_mine(tile))
            .collect()
    }

    /// The sampling of one tile.
    fn query(&self, tile: &Tile) -> GridQuery {
        GridQuery {
            bbox: tile.bbox,
            level: self.settings.grid_level,
            history: self.settings.history,
        }
    }

    /// Identifies measured tile results: everything except the scalar measure.
    pub fn results_key(&self) -> String {
        let mut key = format!(
            "{}-{}-{}-{}-lvl_{}",
            self.source.name(),
            self.settings.model,
            self.settings.projection.tag(),
            self.settings.weighting.tag(),
            self.settings.grid_level
        );
        if self.settings.history.is_some() {
            key.push_str("-historical");
        }
        key
    }

    /// Identifies a map. Unweighted fractions are marked on the measure.
    pub fn map_key(&self) -> String {
        let mut measure = self.settings.measure.name();
        if self.settings.weighting == Weighting::Uniform {
            measure = format!("{measure}_{}", Weighting::Uniform.tag());
        }
        let mut key = format!(
            "{}-{measure}-{}-{}-lvl_{}",
            self.source.name(),
            self.settings.model,
            self.settings.projection.tag(),
            self.settings.grid_level
        );
        if self.settings.history.is_some() {
            key.push_str("-historical");
        }
        key
    }

    /// Where a map and everything it's made from are kept, per region.
    pub fn map_directory(&self) -> std::path::PathBuf {
        self.settings
            .data_dir
            .join("maps")
            .join(self.settings.bbox.tag())
            .join(self.map_key())
    }

    /// The result store of one tile.
    fn store(&self, tile: &Tile) -> FsStore {
        FsStore::new(tile.panoramas_directory(), self.index.clone())
    }

    /// A tile's metadata and sampled panoramas. `None` for tiles without any panoramas, which
    /// are remembered so they're never fetched again.
    fn sample_tile(&self, tile: &Tile) -> Result<Option<(TileMeta, Vec<String>)>> {
        if self.index.empty_tiles()?.contains(&tile.name) {
            tracing::trace!("{} is known to be empty", tile.name);
            return Ok(None);
        }

        let meta = TileMeta::load_or_fetch(&tile.meta_path(), self.source, &tile.bbox)?;
        if meta.is_empty() {
            tracing::debug!("{} has no panoramas", tile.name);
            self.index.mark_empty(&tile.name)?;
            return Ok(None);
        }

        let sampled = self
            .query(tile)
            .load_or_sample(&tile.queries_directory(), &meta)?;
        Ok(Some((meta, sampled)))
    }

    /// Fetch metadata and sample every tile.
    pub fn prepare(&self) -> Result<()> {
        let tiles = self.my_tiles();
        let total = tiles.len();
        for (count, tile) in tiles.into_iter().enumerate() {
            match self.sample_tile(tile)? {
                Some((meta, sampled)) => tracing::info!(
                    "[{}/{total}] {}: sampled {} of {} panoramas",
                    count + 1,
                    tile.name,
                    sampled.len(),
                    meta.panoramas.len()
                ),
                None => tracing::info!("[{}/{total}] {}: empty", count + 1, tile.name),
            }
        }
        Ok(())
    }

    /// Run the pipeline for every sampled panorama and aggregate each tile's results. Tiles that
    /// already have aggregated results are skipped.
    pub fn run(
        &self,
        fetcher: &dyn Fetcher,
        segmenter: &dyn Segmenter,
        retry: RetryPolicy,
    ) -> Result<RunReport> {
        if segmenter.model() != self.settings.model {
            color_eyre::eyre::bail!(
                "Segmenter runs {} but {} was requested",
                segmenter.model(),
                self.settings.model
            );
        }

        let key = self.results_key();
        let mut report = RunReport::default();
        let tiles = self.my_tiles();
        let total = tiles.len();
        for (count, tile) in tiles.into_iter().enumerate() {
            let results_path = tile.results_path(&key);
            if results_path.exists() {
                tracing::debug!("{} already has results for {key}", tile.name);
                continue;
            }
            let Some((meta, sampled)) = self.sample_tile(tile)? else {
                continue;
            };

            let store = self.store(tile);
            let pipeline = JobPipeline {
                store: &store,
                fetcher,
                segmenter,
                greenery: &self.greenery,
                projection: self.settings.projection,
                retry,
                pictures: tile.panoramas_directory(),
            };
            let panoramas: Vec<&PanoramaMeta> =
                sampled.iter().filter_map(|pano_id| meta.get(pano_id)).collect();
            for outcome in pipeline.execute_all(&panoramas)? {
                match outcome.status {
                    PipelineStatus::Done => report.done += 1,
                    PipelineStatus::Skipped => report.skipped += 1,
                    PipelineStatus::Failed { stage, .. } => {
                        tracing::debug!("{} failed at {stage}", outcome.pano_id);
                        report.failed += 1;
                    }
                }
            }

            let points = self.measured_points(&store, &pipeline, &panoramas)?;
            let json = serde_json::to_string(&points)?;
            crate::store::write_atomically(&results_path, json.as_bytes())?;
            tracing::info!(
                "[{}/{total}] {}: {} of {} sampled panoramas measured",
                count + 1,
                tile.name,
                points.len(),
                panoramas.len()
            );
        }

        tracing::info!("Run finished: {report:?}");
        Ok(report)
    }

    /// The measured points among some panoramas.
    fn measured_points(
        &self,
        store: &FsStore,
        pipeline: &JobPipeline<'_>,
        panoramas: &[&PanoramaMeta],
    ) -> Result<Vec<MeasuredPoint>> {
        let key = pipeline.key(Stage::Measure);
        let mut points = Vec::new();
        for meta in panoramas {
            let Some(record) = store.get(&meta.pano_id, &key)? else {
                continue;
            };
            if record.is_ok()
                && let Some(fractions) = record.fractions
            {
                points.push(MeasuredPoint {
                    pano_id: meta.pano_id.clone(),
                    coordinate: meta.coordinate,
                    timestamp: meta.timestamp,
                    fractions,
                });
            }
        }
        Ok(points)
    }

    /// Aggregated results of every tile that has them, by local position.
    pub fn load_results(&self) -> Result<BTreeMap<(usize, usize), Vec<MeasuredPoint>>> {
        let key = self.results_key();
        let mut results = BTreeMap::new();
        for tile in &self.grid.tiles {
            let path = tile.results_path(&key);
            if !path.exists() {
                continue;
            }
            let points: Vec<MeasuredPoint> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            results.insert(tile.local, points);
        }
        Ok(results)
    }

    /// The measure at every point of some tiles.
    fn samples(
        &self,
        tiles: &[&Tile],
        results: &BTreeMap<(usize, usize), Vec<MeasuredPoint>>,
    ) -> Vec<Sample> {
        tiles
            .iter()
            .filter_map(|tile| results.get(&tile.local))
            .flatten()
            .map(|point| Sample {
                coordinate: point.coordinate,
                value: self.settings.measure.compute(&point.fractions),
            })
            .collect()
    }

    /// The cached variogram, or a freshly estimated one.
    fn variogram(
        &self,
        kind: VariogramKind,
        estimator: &Estimator,
        converter: &Convert,
        results: &BTreeMap<(usize, usize), Vec<MeasuredPoint>>,
    ) -> Result<VariogramModel> {
        let path = self.map_directory().join("variogram.json");
        if path.exists() {
            let model = VariogramModel::load(&path)?;
            if model.kind == kind {
                tracing::info!("Using cached variogram: {model:?}");
                return Ok(model);
            }
            tracing::info!("Cached variogram is {}, refitting as {kind}", model.kind);
        }

        let tiles: Vec<TileSamples> = self
            .grid
            .tiles
            .iter()
            .map(|tile| {
                let samples = self.samples(&[tile], results);
                TileSamples {
                    local: tile.local,
                    points: samples
                        .iter()
                        .map(|sample| converter.to_point(sample.coordinate))
                        .collect(),
                    values: samples.iter().map(|sample| sample.value).collect(),
                }
            })
            .collect();
        let model = estimator.estimate(&tiles, kind)?;
        model.save(&path)?;
        Ok(model)
    }

    /// Krige every tile of this job, reusing cached rasters whose inputs haven't changed, then
    /// assemble whatever rasters exist for the region into a map.
    pub fn krige(
        &self,
        kind: VariogramKind,
        config: KrigingConfig,
        estimator: &Estimator,
    ) -> Result<GreenMap> {
        let results = self.load_results()?;
        if results.is_empty() {
            color_eyre::eyre::bail!(
                "No tile results for {}, run the pipeline first",
                self.results_key()
            );
        }

        let converter = Convert {
            base: self.settings.bbox.centre(),
        };
        let model = self.variogram(kind, estimator, &converter, &results)?;
        let interpolator = Interpolator {
            model,
            config,
            converter,
        };
        let resolution = config.tile_resolution(self.settings.grid_level);
        let directory = self.map_directory();

        let rasters = self
            .grid
            .tiles
            .par_iter()
            .map(|tile| -> Result<Option<((usize, usize), KrigedTile)>> {
                let neighbourhood = self.grid.neighbourhood(tile, config.window);
                let samples = self.samples(&neighbourhood, &results);
                let fingerprint =
                    crate::kriging::fingerprint(&model, &config, resolution, &samples)?;
                let path = directory
                    .join("kriged")
                    .join(format!("{}-{fingerprint}.bin", tile.name));

                if path.exists() {
                    match KrigedTile::load(&path, resolution) {
                        Ok(raster) => return Ok(Some((tile.local, raster))),
                        Err(error) => {
                            tracing::warn!("Ignoring unreadable kriged tile {path:?}: {error}");
                        }
                    }
                }
                if !self.is_mine(tile) {
                    return Ok(None);
                }
                let Some(raster) = interpolator.krige_tile(&tile.bbox, &samples, resolution) else {
                    tracing::debug!("Too few samples to krige {}", tile.name);
                    return Ok(None);
                };
                raster.save(&path)?;
                tracing::debug!("Kriged {} from {} samples", tile.name, samples.len());
                Ok(Some((tile.local, raster)))
            })
            .filter_map(Result::transpose)
            .collect::<Result<BTreeMap<_, _>>>()?;

        let map = GreenMap::assemble(&self.map_key(), &self.grid, resolution, &rasters);
        map.save(&directory.join("map.json"))?;

        let all_tiles: Vec<&Tile> = self.grid.tiles.iter().collect();
        let samples = self.samples(&all_tiles, &results);
        crate::store::write_atomically(
            &directory.join("samples.geojson"),
            crate::map::samples_geojson(&samples).as_bytes(),
        )?;
        crate::store::write_atomically(
            &directory.join("tiles.geojson"),
            crate::map::tiles_geojson(&all_tiles).as_bytes(),
        )?;

        Ok(map)
    }

    /// How far along each of this job's tiles is. Doesn't fetch or write anything.
    pub fn summary(&self) -> Result<Vec<TileSummary>> {
        let results_key = self.results_key();
        let measure_key = StageKey {
            stage: Stage::Measure,
            projection: self.settings.projection,
            model: self.settings.model,
            weighting: self.settings.weighting,
        };

        let mut summaries = Vec::new();
        for tile in self.my_tiles() {
            let meta_path = tile.meta_path();
            if !meta_path.exists() {
                summaries.push(TileSummary {
                    name: tile.name.clone(),
                    available: None,
                    sampled: 0,
                    measured: 0,
                });
                continue;
            }

            let meta = TileMeta::load(&meta_path)?;
            let query = self.query(tile);
            let sampled = match query.load_cached(&tile.queries_directory())? {
                Some(cached) => cached,
                None => query.sample(&meta.panoramas),
            };
            let results_path = tile.results_path(&results_key);
            let measured = if results_path.exists() {
                let points: Vec<MeasuredPoint> =
                    serde_json::from_str(&std::fs::read_to_string(results_path)?)?;
                points.len()
            } else {
                let store = self.store(tile);
                let mut count = 0;
                for pano_id in &sampled {
                    if store
                        .get(pano_id, &measure_key)?
                        .is_some_and(|record| JobRecord::is_ok(&record))
                    {
                        count += 1;
                    }
                }
                count
            };

            summaries.push(TileSummary {
                name: tile.name.clone(),
                available: Some(meta.panoramas.len()),
                sampled: sampled.len(),
                measured,
            });
        }

        for summary in &summaries {
            tracing::info!(
                "{}: available {}, sampled {}, measured {}",
                summary.name,
                summary
                    .available
                    .map_or_else(|| "?".to_owned(), |count| count.to_string()),
                summary.sampled,
                summary.measured
            );
        }
        tracing::info!(
            "Total: sampled {}, measured {}",
            summaries.iter().map(|summary| summary.sampled).sum::<usize>(),
            summaries.iter().map(|summary| summary.measured).sum::<usize>()
        );

        let map_path = self.map_directory().join("map.json");
        if map_path.exists() {
            let map = GreenMap::load(&map_path)?;
            let centre = self.settings.bbox.centre();
            tracing::info!(
                "Map {} ranges over {:?}, {:?} at the centre of the region",
                map.name,
                map.value_range,
                map.get(centre)
            );
        }

        Ok(summaries)
    }
}

#[expect(
    clippy::default_numeric_fallback,
    clippy::unwrap_used,
    reason = "These are just tests"
)]
#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        fetch::FakeFetcher, kriging::KrigedCell, meta::FixedSource, segmentation::FakeSegmenter,
    };

    fn settings(data_dir: &std::path::Path) -> Settings {
        Settings {
            data_dir: data_dir.to_path_buf(),
            bbox: BoundingBox::named("oosterpark").unwrap(),
            grid_level: 2,
            tile_resolution: 256,
            projection: Projection::CubicFaces,
            history: None,
            model: ModelId::default(),
            measure: Measure::class("vegetation"),
            weighting: Weighting::Projected,
            njobs: 1,
            jobid: 0,
        }
    }

    /// Panoramas spread over the south-western part of the region only, so some tiles are empty.
    fn panoramas() -> Vec<PanoramaMeta> {
        let bbox = BoundingBox::named("oosterpark").unwrap();
        let mut panoramas = Vec::new();
        for step in 0..40 {
            let fraction = f64::from(step) / 40.0;
            panoramas.push(crate::meta::fake_panorama(
                &format!("p{step:02}"),
                (fraction * 0.3).mul_add(bbox.height(), bbox.south_west.latitude()),
                (fraction * 0.5).mul_add(bbox.width(), bbox.south_west.longitude()),
                2016 + step % 4,
            ));
        }
        panoramas
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            attempts: 1,
            backoff: std::time::Duration::ZERO,
        }
    }

    #[test]
    fn keys_describe_the_settings() {
        let directory = tempfile::tempdir().unwrap();
        let source = FixedSource::new(Vec::new());
        let historical = Settings {
            history: Some(History { max_range: 7.0 }),
            ..settings(directory.path())
        };
        let manager = TileManager::new(historical, &source).unwrap();
        assert_eq!(
            manager.map_key(),
            "fixed-vegetation-deeplab-mobilenet-cubic-lvl_2-historical"
        );
        assert_eq!(
            manager.results_key(),
            "fixed-deeplab-mobilenet-cubic-weighted-lvl_2-historical"
        );

        let unweighted = Settings {
            weighting: Weighting::Uniform,
            projection: Projection::Equirectangular,
            ..settings(directory.path())
        };
        let manager = TileManager::new(unweighted, &source).unwrap();
        assert_eq!(
            manager.map_key(),
            "fixed-vegetation_unweighted-deeplab-mobilenet-panorama-lvl_2"
        );
    }

    #[test]
    fn regions_keep_their_own_maps() {
        let directory = tempfile::tempdir().unwrap();
        let source = FixedSource::new(Vec::new());
        let oosterpark = TileManager::new(settings(directory.path()), &source).unwrap();
        let gaasperdam = Settings {
            bbox: BoundingBox::named("gaasperdam").unwrap(),
            ..settings(directory.path())
        };
        let gaasperdam = TileManager::new(gaasperdam, &source).unwrap();
        assert_eq!(oosterpark.map_key(), gaasperdam.map_key());
        assert_ne!(oosterpark.map_directory(), gaasperdam.map_directory());
        assert!(oosterpark.map_directory().ends_with(format!(
            "{}/{}",
            oosterpark.settings.bbox.tag(),
            oosterpark.map_key()
        )));
    }

    #[test]
    fn jobs_split_the_tiles() {
        let directory = tempfile::tempdir().unwrap();
        let source = FixedSource::new(Vec::new());
        let mut names = Vec::new();
        for jobid in 0..3 {
            let settings = Settings {
                njobs: 3,
                jobid,
                ..settings(directory.path())
            };
            let manager = TileManager::new(settings, &source).unwrap();
            names.extend(manager.my_tiles().iter().map(|tile| tile.name.clone()));
        }
        let manager = TileManager::new(settings(directory.path()), &source).unwrap();
        names.sort();
        let mut all: Vec<String> =
            manager.grid.tiles.iter().map(|tile| tile.name.clone()).collect();
        all.sort();
        assert_eq!(names, all);

        let invalid = Settings {
            njobs: 2,
            jobid: 2,
            ..settings(directory.path())
        };
        assert!(TileManager::new(invalid, &source).is_err());
    }

    #[test]
    fn prepare_caches_metadata_and_empty_tiles() {
        let directory = tempfile::tempdir().unwrap();
        let source = FixedSource::new(panoramas());
        let manager = TileManager::new(settings(directory.path()), &source).unwrap();
        manager.prepare().unwrap();
        let fetches = source.calls.load(Ordering::SeqCst);
        assert_eq!(fetches, manager.grid.tiles.len());

        manager.prepare().unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), fetches);

        let empty = manager.index.empty_tiles().unwrap();
        assert!(!empty.is_empty());
        assert!(empty.len() < manager.grid.tiles.len());
        let summaries = manager.summary().unwrap();
        let sampled: usize = summaries.iter().map(|summary| summary.sampled).sum();
        assert!(sampled > 0);
        assert!(summaries.iter().all(|summary| summary.measured == 0));

        // Metadata that changes after sampling doesn't change what was sampled.
        for tile in &manager.grid.tiles {
            if tile.meta_path().exists() {
                TileMeta::new("fixed", &tile.bbox, Vec::new())
                    .save(&tile.meta_path())
                    .unwrap();
            }
        }
        let after = manager.summary().unwrap();
        assert_eq!(
            after.iter().map(|summary| summary.sampled).sum::<usize>(),
            sampled
        );
    }

    #[test]
    fn run_measures_and_is_idempotent() {
        let directory = tempfile::tempdir().unwrap();
        let source = FixedSource::new(panoramas());
        let fetcher = FakeFetcher::new();
        let segmenter = FakeSegmenter::new(vec![vec![0, 1], vec![1, 2]]);
        let manager = TileManager::new(settings(directory.path()), &source).unwrap();

        let report = manager.run(&fetcher, &segmenter, quick()).unwrap();
        assert!(report.done > 0);
        assert_eq!(report.failed, 0);
        let fetches = fetcher.calls();

        let results = manager.load_results().unwrap();
        let measured: usize = results.values().map(Vec::len).sum();
        assert_eq!(measured, report.done);
        let summaries = manager.summary().unwrap();
        assert_eq!(
            summaries.iter().map(|summary| summary.measured).sum::<usize>(),
            measured
        );

        let again = manager.run(&fetcher, &segmenter, quick()).unwrap();
        assert_eq!(again, RunReport::default());
        assert_eq!(fetcher.calls(), fetches);
    }

    fn write_results(manager: &TileManager<'_>) {
        let key = manager.results_key();
        for tile in &manager.grid.tiles {
            let points: Vec<MeasuredPoint> = (0..25)
                .map(|step| {
                    let row = f64::from(step / 5) / 5.0;
                    let column = f64::from(step % 5) / 5.0;
                    let coordinate = LatLonCoord::new(
                        (row + 0.1).mul_add(tile.bbox.height(), tile.bbox.south_west.latitude()),
                        (column + 0.1)
                            .mul_add(tile.bbox.width(), tile.bbox.south_west.longitude()),
                    );
                    let vegetation = (coordinate.longitude() * 400.0).sin().mul_add(0.2, 0.3);
                    MeasuredPoint {
                        pano_id: format!("{}-{step}", tile.name),
                        coordinate,
                        timestamp: chrono::NaiveDateTime::default(),
                        fractions: Fractions::from([("vegetation".to_owned(), vegetation)]),
                    }
                })
                .collect();
            crate::store::write_atomically(
                &tile.results_path(&key),
                serde_json::to_string(&points).unwrap().as_bytes(),
            )
            .unwrap();
        }
    }

    fn kriged_files(manager: &TileManager<'_>) -> usize {
        std::fs::read_dir(manager.map_directory().join("kriged"))
            .unwrap()
            .count()
    }

    #[test]
    fn krige_builds_and_reuses_a_map() {
        let directory = tempfile::tempdir().unwrap();
        let source = FixedSource::new(Vec::new());
        let manager = TileManager::new(settings(directory.path()), &source).unwrap();
        assert!(
            manager
                .krige(
                    VariogramKind::Exponential,
                    KrigingConfig::default(),
                    &Estimator::default()
                )
                .is_err()
        );

        write_results(&manager);
        let map = manager
            .krige(
                VariogramKind::Exponential,
                KrigingConfig::default(),
                &Estimator::default(),
            )
            .unwrap();
        assert_eq!(map.width, manager.grid.columns * 10);
        assert!(map.alpha.iter().any(|alpha| *alpha > 0.0));
        assert!(map.values.iter().all(|value| *value >= 0.0));
        assert!(manager.map_directory().join("variogram.json").exists());
        assert!(manager.map_directory().join("samples.geojson").exists());
        let files = kriged_files(&manager);
        assert_eq!(files, manager.grid.tiles.len());

        let again = manager
            .krige(
                VariogramKind::Exponential,
                KrigingConfig::default(),
                &Estimator::default(),
            )
            .unwrap();
        assert_eq!(again, map);
        assert_eq!(kriged_files(&manager), files);
        assert_eq!(GreenMap::load(&manager.map_directory().join("map.json")).unwrap(), map);

        let cached = std::fs::read_dir(manager.map_directory().join("kriged"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        std::fs::write(&cached, b"truncated").unwrap();
        let repaired = manager
            .krige(
                VariogramKind::Exponential,
                KrigingConfig::default(),
                &Estimator::default(),
            )
            .unwrap();
        assert_eq!(repaired, map);
        assert_eq!(kriged_files(&manager), files);
        assert_eq!(
            std::fs::metadata(&cached).unwrap().len(),
            u64::try_from(100 * std::mem::size_of::<KrigedCell>()).unwrap()
        );
    }
}
