//! Ordinary kriging of greenery measurements onto a regular raster per tile, together with an
//! alpha raster saying how close each pixel is to real data.

use std::collections::HashMap;

use color_eyre::Result;
use rstar::PointDistance as _;
use sha2::Digest as _;

use crate::{
    bbox::BoundingBox,
    projector::{Convert, LatLonCoord},
    variogram::VariogramModel,
};

/// Raster pixels per tile along each axis are capped at this.
pub const MAX_TILE_RESOLUTION: usize = 1024;

/// An ordinary kriging system, factorised once and then evaluated at many points.
pub struct OrdinaryKriging {
    /// Sample positions in meters.
    points: Vec<[f64; 2]>,
    /// Sample values.
    values: Vec<f64>,
    /// The covariance structure.
    model: VariogramModel,
    /// LU decomposition of the kriging matrix.
    lu: nalgebra::LU<f64, nalgebra::Dyn, nalgebra::Dyn>,
}

impl OrdinaryKriging {
    /// Set up the kriging system. Samples at exactly the same position are averaged. Returns
    /// `None` when fewer than two distinct positions remain or the system is singular.
    pub fn new(points: &[[f64; 2]], values: &[f64], model: VariogramModel) -> Option<Self> {
        let (points, values) = merge_duplicates(points, values);
        let count = points.len();
        if count < 2 {
            return None;
        }

        let matrix = nalgebra::DMatrix::from_fn(count + 1, count + 1, |row, column| {
            match (points.get(row), points.get(column)) {
                _ if row == column => 0.0,
                (Some(first), Some(second)) => -model.evaluate(distance(*first, *second)),
                _ => 1.0,
            }
        });
        let lu = matrix.lu();
        if !lu.is_invertible() {
            tracing::debug!("Singular kriging system for {count} points");
            return None;
        }

        Some(Self {
            points,
            values,
            model,
            lu,
        })
    }

    /// The kriged estimate at a point in meters.
    pub fn predict(&self, target: [f64; 2]) -> f64 {
        let count = self.points.len();
        let right_hand_side = nalgebra::DVector::from_fn(count + 1, |row, _| {
            self.points.get(row).map_or(1.0, |point| {
                let separation = distance(*point, target);
                if separation <= f64::EPSILON {
                    0.0
                } else {
                    -self.model.evaluate(separation)
                }
            })
        });

        let Some(weights) = self.lu.solve(&right_hand_side) else {
            return f64::NAN;
        };
        weights
            .iter()
            .zip(&self.values)
            .map(|(weight, value)| weight * value)
            .sum()
    }
}

/// Euclidean distance in meters.
fn distance(a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - b[0]).hypot(a[1] - b[1])
}

/// Average the values of samples sharing a position.
#[expect(
    clippy::as_conversions,
    clippy::cast_precision_loss,
    reason = "Duplicate counts are tiny"
)]
fn merge_duplicates(points: &[[f64; 2]], values: &[f64]) -> (Vec<[f64; 2]>, Vec<f64>) {
    let mut index: HashMap<(u64, u64), usize> = HashMap::new();
    let mut merged_points = Vec::new();
    let mut sums: Vec<(f64, usize)> = Vec::new();

    for (point, value) in points.iter().zip(values) {
        let key = (point[0].to_bits(), point[1].to_bits());
        if let Some(existing) = index.get(&key).and_then(|position| sums.get_mut(*position)) {
            existing.0 += value;
            existing.1 += 1;
            continue;
        }
        index.insert(key, merged_points.len());
        merged_points.push(*point);
        sums.push((*value, 1));
    }

    let merged_values = sums
        .into_iter()
        .map(|(sum, count)| sum / count as f64)
        .collect();
    (merged_points, merged_values)
}

/// How the alpha raster fades with distance from the nearest sample, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlphaConfig {
    /// Pixels at most this far from a sample are fully trusted.
    pub full: f64,
    /// Pixels at least this far from a sample aren't trusted at all.
    pub fade: f64,
}

impl Default for AlphaConfig {
    fn default() -> Self {
        Self {
            full: 1.0,
            fade: 6.0,
        }
    }
}

impl AlphaConfig {
    /// Alpha for a pixel `pixels` away from the nearest sample.
    pub fn alpha(&self, pixels: f64) -> f64 {
        if pixels <= self.full {
            1.0
        } else if pixels >= self.fade {
            0.0
        } else {
            (self.fade - pixels) / (self.fade - self.full)
        }
    }
}

/// Settings for kriging tiles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KrigingConfig {
    /// Neighbouring tiles within this many steps contribute samples.
    pub window: usize,
    /// Raster pixels per grid cell along each axis.
    pub upscale: usize,
    /// The smallest raster size per tile along each axis.
    pub min_resolution: usize,
    /// The alpha fade.
    pub alpha: AlphaConfig,
}

impl Default for KrigingConfig {
    fn default() -> Self {
        Self {
            window: 1,
            upscale: 2,
            min_resolution: 10,
            alpha: AlphaConfig::default(),
        }
    }
}

impl KrigingConfig {
    /// Raster pixels per tile along each axis for a grid level, never more than
    /// `MAX_TILE_RESOLUTION`.
    pub fn tile_resolution(&self, level: u32) -> usize {
        let cells = 1_usize.checked_shl(level).unwrap_or(usize::MAX);
        self.upscale
            .saturating_mul(cells)
            .min(MAX_TILE_RESOLUTION)
            .max(self.min_resolution)
    }
}

/// One raster pixel.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct KrigedCell {
    /// The interpolated measure.
    pub value: f32,
    /// How much to trust it, from 0 to 1.
    pub alpha: f32,
}

/// The raster of one tile. Row 0 is the southern edge, column 0 the western edge.
#[derive(Debug, Clone, PartialEq)]
pub struct KrigedTile {
    /// Pixels along each axis.
    pub resolution: usize,
    /// Row-major pixels.
    pub cells: Vec<KrigedCell>,
}

impl KrigedTile {
    /// The pixel at a row and column.
    pub fn get(&self, row: usize, column: usize) -> Option<&KrigedCell> {
        if column >= self.resolution {
            return None;
        }
        self.cells.get(row * self.resolution + column)
    }

    /// Save the raster to disk. An interrupted save leaves no file behind.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(&self.cells);
        crate::store::write_atomically(path, bytes)?;
        Ok(())
    }

    /// Load a raster from disk.
    pub fn load(path: &std::path::Path, resolution: usize) -> Result<Self> {
        let bytes = std::fs::read(path)?;

        let expected = resolution * resolution * std::mem::size_of::<KrigedCell>();
        if bytes.len() != expected {
            color_eyre::eyre::bail!(
                "Saved raster {path:?} has {} bytes, expected {expected}",
                bytes.len()
            );
        }

        Ok(Self {
            resolution,
            cells: bytemuck::pod_collect_to_vec(&bytes),
        })
    }
}

/// A measured point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Where.
    pub coordinate: LatLonCoord,
    /// The measure.
    pub value: f64,
}

/// Hash of everything a kriged tile depends on, so a cached raster can be matched to its inputs.
pub fn fingerprint(
    model: &VariogramModel,
    config: &KrigingConfig,
    resolution: usize,
    samples: &[Sample],
) -> Result<String> {
    let mut hasher = sha2::Sha256::new();
    hasher.update(serde_json::to_vec(model)?);
    hasher.update(resolution.to_le_bytes());
    hasher.update(config.alpha.full.to_le_bytes());
    hasher.update(config.alpha.fade.to_le_bytes());
    for sample in samples {
        hasher.update(sample.coordinate.latitude().to_le_bytes());
        hasher.update(sample.coordinate.longitude().to_le_bytes());
        hasher.update(sample.value.to_le_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Kriges tiles with a fixed variogram in a fixed metric plane.
pub struct Interpolator {
    /// The fitted variogram.
    pub model: VariogramModel,
    /// Raster settings.
    pub config: KrigingConfig,
    /// The region-wide metric projection.
    pub converter: Convert,
}

impl Interpolator {
    /// Krige the samples of a tile's neighbourhood over the tile's bounds. Returns `None` when
    /// there's too little data, in which case the tile should be left blank.
    #[expect(
        clippy::as_conversions,
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        reason = "Raster sizes are small and values are only stored as f32"
    )]
    pub fn krige_tile(
        &self,
        bbox: &BoundingBox,
        samples: &[Sample],
        resolution: usize,
    ) -> Option<KrigedTile> {
        let points: Vec<[f64; 2]> = samples
            .iter()
            .map(|sample| self.converter.to_point(sample.coordinate))
            .collect();
        let values: Vec<f64> = samples.iter().map(|sample| sample.value).collect();
        let kriging = OrdinaryKriging::new(&points, &values, self.model)?;
        let tree = rstar::RTree::bulk_load(points);

        let steps = resolution as f64;
        let latitude_step = bbox.height() / steps;
        let longitude_step = bbox.width() / steps;
        let south_west = self.converter.to_meters(bbox.south_west);
        let north_east = self.converter.to_meters(bbox.north_east);
        let pixel_size = (((north_east.x - south_west.x) / steps)
            * ((north_east.y - south_west.y) / steps))
            .sqrt();

        let mut cells = Vec::with_capacity(resolution * resolution);
        for row in 0..resolution {
            for column in 0..resolution {
                let position = LatLonCoord::new(
                    (row as f64).mul_add(latitude_step, bbox.south_west.latitude()),
                    (column as f64).mul_add(longitude_step, bbox.south_west.longitude()),
                );
                let target = self.converter.to_point(position);
                let nearest = tree
                    .nearest_neighbor(&target)
                    .map_or(f64::INFINITY, |point| point.distance_2(&target).sqrt());
                cells.push(KrigedCell {
                    value: kriging.predict(target) as f32,
                    alpha: self.config.alpha.alpha(nearest / pixel_size) as f32,
                });
            }
        }

        Some(KrigedTile { resolution, cells })
    }
}

#[expect(
    clippy::default_numeric_fallback,
    clippy::unwrap_used,
    reason = "These are just tests"
)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::variogram::VariogramKind;

    fn model() -> VariogramModel {
        VariogramModel {
            kind: VariogramKind::Exponential,
            sill: 0.05,
            range: 400.0,
            nugget: 0.001,
        }
    }

    fn interpolator(bbox: &BoundingBox) -> Interpolator {
        Interpolator {
            model: model(),
            config: KrigingConfig::default(),
            converter: Convert {
                base: bbox.centre(),
            },
        }
    }

    fn tile_bbox() -> BoundingBox {
        let base = LatLonCoord::new(52.36, 4.91);
        let (latitude_scale, longitude_scale) =
            crate::projector::meters_per_degree(base.latitude());
        BoundingBox::new(
            base,
            LatLonCoord::new(
                base.latitude() + 1000.0 / latitude_scale,
                base.longitude() + 1000.0 / longitude_scale,
            ),
        )
    }

    #[test]
    fn kriging_honours_the_samples() {
        let points = [[0.0, 0.0], [100.0, 0.0], [0.0, 250.0], [300.0, 300.0]];
        let values = [0.1, 0.5, 0.3, 0.8];
        let kriging = OrdinaryKriging::new(&points, &values, model()).unwrap();
        for (point, value) in points.iter().zip(values) {
            assert!((kriging.predict(*point) - value).abs() < 1e-9);
        }
        let between = kriging.predict([50.0, 0.0]);
        assert!(between > 0.1 && between < 0.5, "{between}");
    }

    #[test]
    fn far_away_predictions_tend_to_the_mean() {
        let points = [[0.0, 0.0], [10.0, 0.0]];
        let kriging = OrdinaryKriging::new(&points, &[0.2, 0.4], model()).unwrap();
        assert!((kriging.predict([1e6, 1e6]) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn duplicate_points_are_averaged() {
        let points = [[0.0, 0.0], [0.0, 0.0], [200.0, 0.0]];
        let kriging = OrdinaryKriging::new(&points, &[0.2, 0.4, 0.9], model()).unwrap();
        assert!((kriging.predict([0.0, 0.0]) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn too_few_points_is_degenerate() {
        assert!(OrdinaryKriging::new(&[[0.0, 0.0]], &[0.5], model()).is_none());
        assert!(OrdinaryKriging::new(&[[1.0, 1.0], [1.0, 1.0]], &[0.5, 0.6], model()).is_none());

        let bbox = tile_bbox();
        let lonely = [Sample {
            coordinate: bbox.centre(),
            value: 0.4,
        }];
        assert!(interpolator(&bbox).krige_tile(&bbox, &lonely, 10).is_none());
    }

    #[test]
    fn alpha_fades_linearly() {
        let config = AlphaConfig::default();
        assert!((config.alpha(0.0) - 1.0).abs() < f64::EPSILON);
        assert!((config.alpha(1.0) - 1.0).abs() < f64::EPSILON);
        assert!((config.alpha(3.5) - 0.5).abs() < 1e-12);
        assert!(config.alpha(6.0).abs() < f64::EPSILON);
        assert!(config.alpha(60.0).abs() < f64::EPSILON);
        let mut previous = config.alpha(1.0);
        for step in 1..50 {
            let current = config.alpha(1.0 + f64::from(step) * 0.1);
            assert!(current < previous);
            previous = current;
        }
    }

    #[test]
    fn kriged_tile_alpha_follows_the_samples() {
        let bbox = tile_bbox();
        let samples = [
            Sample {
                coordinate: bbox.south_west,
                value: 0.2,
            },
            Sample {
                coordinate: LatLonCoord::new(
                    bbox.south_west.latitude() + bbox.height() * 0.3,
                    bbox.south_west.longitude(),
                ),
                value: 0.6,
            },
        ];
        let raster = interpolator(&bbox).krige_tile(&bbox, &samples, 20).unwrap();
        assert_eq!(raster.cells.len(), 400);

        let at_sample = raster.get(0, 0).unwrap();
        assert!((at_sample.alpha - 1.0).abs() < f32::EPSILON);
        assert!((at_sample.value - 0.2).abs() < 1e-5);

        let mut previous = at_sample.alpha;
        for column in 1..20 {
            let alpha = raster.get(0, column).unwrap().alpha;
            assert!(alpha <= previous);
            previous = alpha;
        }
        assert!(raster.get(19, 19).unwrap().alpha.abs() < f32::EPSILON);
    }

    #[test]
    fn tile_resolution_has_a_minimum() {
        let config = KrigingConfig::default();
        assert_eq!(config.tile_resolution(0), 10);
        assert_eq!(config.tile_resolution(3), 16);
        assert_eq!(config.tile_resolution(12), MAX_TILE_RESOLUTION);
        assert_eq!(config.tile_resolution(70), MAX_TILE_RESOLUTION);
    }

    #[test]
    fn save_and_load() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let raster = KrigedTile {
            resolution: 2,
            cells: vec![
                KrigedCell {
                    value: 0.1,
                    alpha: 1.0,
                },
                KrigedCell::default(),
                KrigedCell {
                    value: 0.3,
                    alpha: 0.5,
                },
                KrigedCell::default(),
            ],
        };
        raster.save(file.path()).unwrap();
        assert_eq!(KrigedTile::load(file.path(), 2).unwrap(), raster);
        assert!(KrigedTile::load(file.path(), 3).is_err());

        let mut partial = file.path().as_os_str().to_owned();
        partial.push(".part");
        assert!(!std::path::Path::new(&partial).exists());
    }

    #[test]
    fn truncated_rasters_are_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let raster = KrigedTile {
            resolution: 2,
            cells: vec![KrigedCell::default(); 4],
        };
        raster.save(file.path()).unwrap();
        let bytes = std::fs::read(file.path()).unwrap();
        std::fs::write(file.path(), &bytes[..bytes.len() - 3]).unwrap();
        assert!(KrigedTile::load(file.path(), 2).is_err());
    }

    #[test]
    fn fingerprint_tracks_inputs() {
        let config = KrigingConfig::default();
        let sample = Sample {
            coordinate: LatLonCoord::new(52.0, 4.0),
            value: 0.3,
        };
        let first = fingerprint(&model(), &config, 10, &[sample]).unwrap();
        let same = fingerprint(&model(), &config, 10, &[sample]).unwrap();
        let changed = fingerprint(
            &model(),
            &config,
            10,
            &[Sample {
                value: 0.4,
                ..sample
            }],
        )
        .unwrap();
        assert_eq!(first, same);
        assert_ne!(first, changed);
        assert_eq!(first.len(), 64);
    }
}
