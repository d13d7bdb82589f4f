//! Estimate the empirical semivariogram of the measured greenery and fit a model to it.
//!
//! Comparing every point with every other point is quadratic in the size of the region. Instead
//! all pairs within a tile are used, pairs between nearby tiles are randomly subsampled, and
//! tiles further apart than the cutoff aren't compared at all.

use color_eyre::Result;
use rand::{Rng as _, SeedableRng as _};
use rayon::iter::{IndexedParallelIterator as _, IntoParallelIterator as _, ParallelIterator as _};

use crate::variogram::{VariogramKind, VariogramModel};

/// The measured points of one tile, in a region-wide metric plane.
#[derive(Debug, Clone, Default)]
pub struct TileSamples {
    /// The tile's position in the region's tile grid.
    pub local: (usize, usize),
    /// Metric coordinates, `[x, y]`.
    pub points: Vec<[f64; 2]>,
    /// The measured value at each point.
    pub values: Vec<f64>,
}

/// A `(distance, semivariance)` pair.
pub type Pair = (f64, f64);

/// Binned semivariances.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Binned {
    /// Mean distance per bin.
    pub lags: Vec<f64>,
    /// Mean semivariance per bin.
    pub semivariances: Vec<f64>,
}

/// Settings for estimating the semivariogram.
#[derive(Debug, Clone, Copy)]
pub struct Estimator {
    /// Tiles further apart than this many tile widths aren't compared.
    pub cutoff: f64,
    /// The smallest number of pairs to sample between two different tiles.
    pub min_samples: usize,
    /// Number of bins. Chosen from the number of pairs when absent.
    pub nlags: Option<usize>,
    /// Seed for the pair subsampling.
    pub seed: u64,
}

impl Default for Estimator {
    fn default() -> Self {
        Self {
            cutoff: 3.0,
            min_samples: 10_000,
            nlags: None,
            seed: 0,
        }
    }
}

/// Euclidean distance between two metric points.
fn distance(a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - b[0]).hypot(a[1] - b[1])
}

/// Half the squared difference.
fn semivariance(a: f64, b: f64) -> f64 {
    0.5 * (a - b).powi(2)
}

impl Estimator {
    /// Distance between two tiles in tile widths.
    #[expect(
        clippy::as_conversions,
        clippy::cast_precision_loss,
        reason = "Tile grids are small"
    )]
    fn tile_distance(first: &TileSamples, second: &TileSamples) -> f64 {
        let dx = first.local.0.abs_diff(second.local.0) as f64;
        let dy = first.local.1.abs_diff(second.local.1) as f64;
        dx.hypot(dy)
    }

    /// Every pair of points within a single tile.
    fn within_tile(tile: &TileSamples) -> Vec<Pair> {
        let mut pairs = Vec::new();
        for (index, (point, value)) in tile.points.iter().zip(&tile.values).enumerate() {
            for (other_point, other_value) in tile.points.iter().zip(&tile.values).skip(index + 1) {
                pairs.push((
                    distance(*point, *other_point),
                    semivariance(*value, *other_value),
                ));
            }
        }
        pairs
    }

    /// How many pairs to sample between tiles of `first` and `second` points `tile_distance`
    /// apart.
    #[expect(
        clippy::as_conversions,
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        reason = "Counts are small and positive"
    )]
    fn sample_count(&self, first: usize, second: usize, tile_distance: f64) -> usize {
        let shrink = (10.0 * (tile_distance + 1.0)).sqrt();
        let first_share = (first as f64 / shrink).max(1.0);
        let second_share = (second as f64 / shrink).max(1.0);
        let wanted = (first_share * second_share).round() as usize;
        wanted.max(self.min_samples).min(first * second)
    }

    /// The pairs contributed by two tiles. Zero pairs beyond the cutoff.
    pub fn tile_pair(
        &self,
        first: &TileSamples,
        second: &TileSamples,
        same: bool,
        rng: &mut impl rand::Rng,
    ) -> Vec<Pair> {
        if same {
            return Self::within_tile(first);
        }

        let tile_distance = Self::tile_distance(first, second);
        if tile_distance > self.cutoff || first.values.is_empty() || second.values.is_empty() {
            return Vec::new();
        }

        let count = self.sample_count(first.values.len(), second.values.len(), tile_distance);
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            let left = rng.gen_range(0..first.values.len());
            let right = rng.gen_range(0..second.values.len());
            if let (Some(left_point), Some(left_value), Some(right_point), Some(right_value)) = (
                first.points.get(left),
                first.values.get(left),
                second.points.get(right),
                second.values.get(right),
            ) {
                pairs.push((
                    distance(*left_point, *right_point),
                    semivariance(*left_value, *right_value),
                ));
            }
        }
        pairs
    }

    /// Pairs from every unordered pair of tiles, including each tile with itself.
    pub fn pairs(&self, tiles: &[TileSamples]) -> Vec<Pair> {
        let combinations: Vec<(usize, usize)> = (0..tiles.len())
            .flat_map(|first| (first..tiles.len()).map(move |second| (first, second)))
            .collect();

        combinations
            .into_par_iter()
            .enumerate()
            .flat_map_iter(|(index, (first, second))| {
                let seed = self.seed.wrapping_add(u64::try_from(index).unwrap_or(u64::MAX));
                let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
                match (tiles.get(first), tiles.get(second)) {
                    (Some(left), Some(right)) => {
                        self.tile_pair(left, right, first == second, &mut rng)
                    }
                    _ => Vec::new(),
                }
            })
            .collect()
    }

    /// Sort pairs by distance and average them in equal-count bins. Empty bins are dropped.
    #[expect(
        clippy::as_conversions,
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        reason = "Counts are small and positive"
    )]
    pub fn bin(&self, mut pairs: Vec<Pair>) -> Binned {
        pairs.sort_by(|left, right| left.0.total_cmp(&right.0));
        let total = pairs.len();
        let nlags = self
            .nlags
            .unwrap_or_else(|| ((total as f64 / 10.0).round() as usize).clamp(6, 200))
            .max(1);

        let mut binned = Binned::default();
        for bin in 0..nlags {
            let start = bin * total / nlags;
            let end = ((bin + 1) * total / nlags).min(total);
            let Some(members) = pairs.get(start..end) else {
                continue;
            };
            if members.is_empty() {
                continue;
            }
            let count = members.len() as f64;
            binned
                .lags
                .push(members.iter().map(|pair| pair.0).sum::<f64>() / count);
            binned
                .semivariances
                .push(members.iter().map(|pair| pair.1).sum::<f64>() / count);
        }
        binned
    }

    /// Estimate and fit the semivariogram for a whole region.
    pub fn estimate(&self, tiles: &[TileSamples], kind: VariogramKind) -> Result<VariogramModel> {
        let pairs = self.pairs(tiles);
        if pairs.is_empty() {
            color_eyre::eyre::bail!("No point pairs to estimate a semivariogram from");
        }
        tracing::info!("Estimating semivariogram from {} point pairs", pairs.len());

        let binned = self.bin(pairs);
        tracing::debug!("Binned semivariogram: {binned:?}");
        VariogramModel::fit(kind, &binned.lags, &binned.semivariances)
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

    fn tile(local: (usize, usize), count: usize) -> TileSamples {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let origin = [local.0 as f64 * 1000.0, local.1 as f64 * 1000.0];
        let points: Vec<[f64; 2]> = (0..count)
            .map(|_| {
                [
                    origin[0] + rng.gen_range(0.0..1000.0),
                    origin[1] + rng.gen_range(0.0..1000.0),
                ]
            })
            .collect();
        let values = points
            .iter()
            .map(|point| (point[0] / 300.0).sin() * 0.2 + 0.3)
            .collect();
        TileSamples {
            local,
            points,
            values,
        }
    }

    #[test]
    fn same_tile_uses_every_pair() {
        let estimator = Estimator::default();
        let samples = tile((0, 0), 20);
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let pairs = estimator.tile_pair(&samples, &samples, true, &mut rng);
        assert_eq!(pairs.len(), 20 * 19 / 2);
    }

    #[test]
    fn distant_tiles_contribute_nothing() {
        let estimator = Estimator::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let pairs = estimator.tile_pair(&tile((0, 0), 50), &tile((4, 0), 50), false, &mut rng);
        assert_eq!(pairs.len(), 0);

        let region = vec![tile((0, 0), 10), tile((4, 0), 10)];
        assert_eq!(estimator.pairs(&region).len(), 2 * (10 * 9 / 2));
    }

    #[test]
    fn nearby_tiles_are_subsampled_within_bounds() {
        let estimator = Estimator::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);

        let few = estimator.tile_pair(&tile((0, 0), 5), &tile((1, 0), 5), false, &mut rng);
        assert_eq!(few.len(), 25);

        let many = estimator.tile_pair(&tile((0, 0), 200), &tile((1, 1), 200), false, &mut rng);
        assert_eq!(many.len(), 10_000);
    }

    #[test]
    fn sample_count_shrinks_with_distance() {
        let estimator = Estimator {
            min_samples: 0,
            ..Estimator::default()
        };
        let near = estimator.sample_count(1000, 1000, 1.0);
        let far = estimator.sample_count(1000, 1000, 3.0);
        assert!(far < near);
        assert_eq!(near, 50_000);
    }

    #[test]
    fn pairs_are_reproducible() {
        let estimator = Estimator::default();
        let region = vec![tile((0, 0), 30), tile((1, 0), 30), tile((0, 1), 30)];
        assert_eq!(estimator.pairs(&region), estimator.pairs(&region));
    }

    #[test]
    fn bins_hold_equal_counts() {
        let estimator = Estimator::default();
        let pairs: Vec<Pair> = (0..60).rev().map(|step| (f64::from(step), 1.0)).collect();
        let binned = estimator.bin(pairs);
        assert_eq!(binned.lags.len(), 6);
        assert!((binned.lags[0] - 4.5).abs() < 1e-12);
        assert!((binned.lags[5] - 54.5).abs() < 1e-12);
    }

    #[test]
    fn empty_bins_are_dropped() {
        let estimator = Estimator {
            nlags: Some(10),
            ..Estimator::default()
        };
        let binned = estimator.bin(vec![(1.0, 0.5), (2.0, 0.5), (3.0, 0.5)]);
        assert_eq!(binned.lags.len(), 3);
    }

    #[test]
    fn estimates_a_usable_model() {
        let estimator = Estimator::default();
        let region = vec![
            tile((0, 0), 60),
            tile((1, 0), 60),
            tile((0, 1), 60),
            tile((1, 1), 60),
        ];
        let model = estimator
            .estimate(&region, VariogramKind::Exponential)
            .unwrap();
        assert!(model.sill > model.nugget);
        assert!(model.range > 0.0);
    }

    #[test]
    fn refuses_an_empty_region() {
        let estimator = Estimator::default();
        assert!(
            estimator
                .estimate(&[TileSamples::default()], VariogramKind::Spherical)
                .is_err()
        );
    }
}
