//! Turn segmentations into greenery: the fraction of the visible world covered by each class,
//! and scalar measures derived from those fractions.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use color_eyre::Result;

use crate::{
    panorama::Face,
    segmentation::{SegmentationFile, SegmentationResult},
};

/// Class name to fractional coverage.
pub type Fractions = BTreeMap<String, f64>;

/// How much each pixel counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weighting {
    /// Every pixel counts the same.
    Uniform,
    /// Pixels are weighted by the solid angle they cover.
    Projected,
}

impl Weighting {
    /// Name used in file names and map keys.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Uniform => "unweighted",
            Self::Projected => "weighted",
        }
    }
}

/// The pixel layout a weight table is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Layout {
    /// Equirectangular: rows near the horizon cover more of the sphere.
    Equirectangular,
    /// A flat cube face: pixels near the centre cover more of the sphere.
    CubeFace,
}

/// Memoisation key: the layout and `(height, width)`.
type TableKey = (Layout, usize, usize);

/// Computes class fractions from segmentations. Weight tables are cached per image shape for the
/// lifetime of the model.
#[derive(Debug)]
pub struct GreeneryModel {
    /// The weighting scheme.
    pub weighting: Weighting,
    /// Normalised per-pixel weights, row-major, summing to 1.
    tables: parking_lot::Mutex<HashMap<TableKey, Arc<Vec<f64>>>>,
}

impl GreeneryModel {
    /// Instantiate.
    pub fn new(weighting: Weighting) -> Self {
        Self {
            weighting,
            tables: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Get, or compute, the weight table for an image shape.
    fn weights(&self, layout: Layout, height: usize, width: usize) -> Arc<Vec<f64>> {
        let key = (layout, height, width);
        let mut tables = self.tables.lock();
        if let Some(table) = tables.get(&key) {
            return Arc::clone(table);
        }

        tracing::trace!("Computing {layout:?} weights for {height}x{width}");
        let table = Arc::new(Self::weight_table(self.weighting, layout, height, width));
        tables.insert(key, Arc::clone(&table));
        table
    }

    /// Normalised weights for every pixel.
    #[expect(
        clippy::as_conversions,
        clippy::cast_precision_loss,
        reason = "Image dimensions are far below 2^52"
    )]
    fn weight_table(weighting: Weighting, layout: Layout, height: usize, width: usize) -> Vec<f64> {
        let h = height as f64;
        let w = width as f64;
        let mut table = Vec::with_capacity(height * width);
        for row in 0..height {
            for column in 0..width {
                let weight = match (weighting, layout) {
                    (Weighting::Uniform, _) => 1.0,
                    (Weighting::Projected, Layout::Equirectangular) => {
                        (std::f64::consts::PI * (row as f64 + 0.5) / h).sin()
                    }
                    (Weighting::Projected, Layout::CubeFace) => {
                        let dx = 2.0 * column as f64 / w - 1.0;
                        let dy = 2.0 * row as f64 / h - 1.0;
                        dx.mul_add(dx, dy.mul_add(dy, 1.0)).powf(-1.5)
                    }
                };
                table.push(weight);
            }
        }

        let total: f64 = table.iter().sum();
        for weight in &mut table {
            *weight /= total;
        }
        table
    }

    /// Weighted class fractions of a single image. Every class in the palette gets an entry.
    pub fn face_fractions(&self, face: Face, segmentation: &SegmentationResult) -> Fractions {
        let layout = if face.is_cubic() {
            Layout::CubeFace
        } else {
            Layout::Equirectangular
        };
        let weights = self.weights(layout, segmentation.height, segmentation.width);

        let mut totals = vec![0.0; segmentation.palette.names.len()];
        for (class, weight) in segmentation.classes.iter().zip(weights.iter()) {
            if let Some(total) = totals.get_mut(usize::from(*class)) {
                *total += weight;
            }
        }

        segmentation
            .palette
            .names
            .iter()
            .cloned()
            .zip(totals)
            .collect()
    }

    /// Class fractions of a whole panorama: the unweighted mean of its faces' fractions.
    #[expect(
        clippy::as_conversions,
        clippy::cast_precision_loss,
        reason = "There are never more than a handful of faces"
    )]
    pub fn fractions(&self, segmentations: &SegmentationFile) -> Fractions {
        let face_count = segmentations.faces.len() as f64;
        let mut mean = Fractions::new();
        for (face, segmentation) in &segmentations.faces {
            for (class, fraction) in self.face_fractions(*face, segmentation) {
                *mean.entry(class).or_insert(0.0) += fraction / face_count;
            }
        }
        mean
    }

    /// How many weight tables are cached.
    #[cfg(test)]
    fn cached_tables(&self) -> usize {
        self.tables.lock().len()
    }
}

/// A scalar greenery measure: `intercept + Σ weight · fraction(class)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    /// Constant term.
    pub intercept: f64,
    /// Per-class slope.
    pub weights: BTreeMap<String, f64>,
}

impl Measure {
    /// The measure for a single class.
    pub fn class(name: &str) -> Self {
        Self {
            intercept: 0.0,
            weights: BTreeMap::from([(name.to_owned(), 1.0)]),
        }
    }

    /// Evaluate for a set of fractions. Classes missing from the fractions count as 0.
    pub fn compute(&self, fractions: &Fractions) -> f64 {
        self.weights
            .iter()
            .fold(self.intercept, |measure, (class, slope)| {
                fractions
                    .get(class)
                    .map_or(measure, |fraction| slope.mul_add(*fraction, measure))
            })
    }

    /// Name used in map keys. A single class is just its name.
    pub fn name(&self) -> String {
        if self.intercept.abs() < f64::EPSILON
            && self.weights.len() == 1
            && let Some((class, slope)) = self.weights.iter().next()
            && (*slope - 1.0).abs() < f64::EPSILON
        {
            return class.clone();
        }

        let mut parts: Vec<String> = self
            .weights
            .iter()
            .map(|(class, slope)| format!("{class}{slope}"))
            .collect();
        parts.push(self.intercept.to_string());
        parts.join("_")
    }
}

impl std::str::FromStr for Measure {
    type Err = color_eyre::Report;

    /// Either a bare class name, or `class=weight,...` with an optional trailing intercept.
    fn from_str(string: &str) -> Result<Self> {
        if !string.contains('=') && !string.contains(',') {
            if string.is_empty() {
                color_eyre::eyre::bail!("Empty measure");
            }
            return Ok(Self::class(string));
        }

        let mut measure = Self {
            intercept: 0.0,
            weights: BTreeMap::new(),
        };
        for part in string.split(',').map(str::trim) {
            match part.split_once('=') {
                Some((class, slope)) => {
                    measure
                        .weights
                        .insert(class.trim().to_owned(), slope.trim().parse()?);
                }
                None => measure.intercept = part.parse()?,
            }
        }
        if measure.weights.is_empty() {
            color_eyre::eyre::bail!("Measure needs at least one class: {string}");
        }

        Ok(measure)
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
    use crate::{
        panorama::Projection,
        segmentation::{FakeSegmenter, ModelId},
    };

    fn segmentation(rows: Vec<Vec<u16>>) -> SegmentationResult {
        SegmentationResult::from_rows(rows, FakeSegmenter::palette()).unwrap()
    }

    fn striped(height: usize, width: usize) -> SegmentationResult {
        let rows = (0..height)
            .map(|row| (0..width).map(|column| ((row + column) % 3) as u16).collect())
            .collect();
        segmentation(rows)
    }

    fn assert_sums_to_one(fractions: &Fractions) {
        let total: f64 = fractions.values().sum();
        assert!((total - 1.0).abs() < 1e-9, "{total}");
    }

    #[test]
    fn fractions_sum_to_one_for_every_scheme() {
        for weighting in [Weighting::Uniform, Weighting::Projected] {
            let model = GreeneryModel::new(weighting);
            assert_sums_to_one(&model.face_fractions(Face::Panorama, &striped(16, 32)));
            assert_sums_to_one(&model.face_fractions(Face::Front, &striped(17, 17)));
        }
    }

    #[test]
    fn uniform_fractions_are_pixel_counts() {
        let model = GreeneryModel::new(Weighting::Uniform);
        let fractions = model.face_fractions(Face::Front, &segmentation(vec![vec![1, 1, 1, 0]]));
        assert!((fractions["vegetation"] - 0.75).abs() < 1e-12);
        assert!((fractions["road"] - 0.25).abs() < 1e-12);
        assert!(fractions["sky"].abs() < 1e-12);
    }

    #[test]
    fn equirectangular_weights_favour_the_horizon() {
        let model = GreeneryModel::new(Weighting::Projected);
        // Top and bottom rows are sky, the middle row vegetation.
        let fractions = model.face_fractions(
            Face::Panorama,
            &segmentation(vec![vec![2, 2], vec![1, 1], vec![2, 2]]),
        );
        assert!(fractions["vegetation"] > 1.0 / 3.0);
    }

    #[test]
    fn cube_face_weights_favour_the_centre() {
        let model = GreeneryModel::new(Weighting::Projected);
        let mut rows = vec![vec![2_u16; 9]; 9];
        rows[4][4] = 1;
        let fractions = model.face_fractions(Face::Front, &segmentation(rows));
        assert!(fractions["vegetation"] > 1.0 / 81.0);
    }

    #[test]
    fn faces_are_averaged_not_pooled() {
        let model = GreeneryModel::new(Weighting::Uniform);
        let mut faces = BTreeMap::new();
        faces.insert(Face::Front, segmentation(vec![vec![1, 1]]));
        faces.insert(Face::Back, segmentation(vec![vec![0, 0, 0, 0, 0, 0]]));
        let file = SegmentationFile {
            projection: Projection::CubicFaces,
            model: ModelId::default(),
            faces,
        };
        let fractions = model.fractions(&file);
        assert!((fractions["vegetation"] - 0.5).abs() < 1e-12);
        assert_sums_to_one(&fractions);
    }

    #[test]
    fn weight_tables_are_cached_per_shape() {
        let model = GreeneryModel::new(Weighting::Projected);
        model.face_fractions(Face::Front, &striped(4, 4));
        model.face_fractions(Face::Back, &striped(4, 4));
        model.face_fractions(Face::Front, &striped(4, 5));
        model.face_fractions(Face::Panorama, &striped(4, 4));
        assert_eq!(model.cached_tables(), 3);
    }

    #[test]
    fn measures() {
        let fractions = Fractions::from([("vegetation".to_owned(), 0.4), ("sky".to_owned(), 0.2)]);

        let simple: Measure = "vegetation".parse().unwrap();
        assert_eq!(simple.name(), "vegetation");
        assert!((simple.compute(&fractions) - 0.4).abs() < 1e-12);

        let linear: Measure = "vegetation=2,sky=-1,0.5".parse().unwrap();
        assert_eq!(linear.name(), "sky-1_vegetation2_0.5");
        assert!((linear.compute(&fractions) - 1.1).abs() < 1e-12);

        assert!("=,".parse::<Measure>().is_err());
    }
}
