//! Choose an evenly spread subset of a tile's panoramas.
//!
//! The tile is split into a `2^level × 2^level` grid of cells, and each occupied cell contributes
//! the panorama nearest to its south-west corner. In historical mode a cell also contributes, for
//! every other capture year, the panorama of that year nearest to the cell's primary pick.

use std::collections::{BTreeMap, HashSet};

use color_eyre::Result;

use crate::{
    bbox::BoundingBox,
    meta::{PanoramaMeta, TileMeta},
    projector::LatLonCoord,
};

/// The finest grid a tile can be sampled on. Level 12 cells are about 25cm across on a 1km
/// tile, far below the spacing of panoramas.
pub const MAX_LEVEL: u32 = 12;

/// Occupied cells by `(row, column)`, each with its candidates in id order.
type Cells<'meta> = BTreeMap<(usize, usize), Vec<&'meta PanoramaMeta>>;

/// Settings for also sampling older and newer captures of the same place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct History {
    /// Maximum distance in meters from the primary pick.
    pub max_range: f64,
}

/// Grid sampling of one bounding box.
#[derive(Debug, Clone, PartialEq)]
pub struct GridQuery {
    /// The area to sample.
    pub bbox: BoundingBox,
    /// The grid has `2^level` cells per side.
    pub level: u32,
    /// Whether to add one panorama per other year.
    pub history: Option<History>,
}

/// What is persisted for a query.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct QueryFile {
    /// Always "grid".
    query_type: String,
    /// The bounding box as an API parameter.
    param: String,
    /// The grid level.
    grid_level: u32,
    /// The historical search radius, if any.
    max_range: Option<f64>,
    /// The selected panoramas.
    pano_ids: Vec<String>,
}

impl GridQuery {
    /// Number of cells along each axis.
    pub fn cells_per_axis(&self) -> usize {
        1_usize.checked_shl(self.level).unwrap_or(usize::MAX)
    }

    /// Cell size in degrees of longitude and latitude.
    #[expect(
        clippy::as_conversions,
        clippy::cast_precision_loss,
        reason = "The number of cells is small"
    )]
    fn cell_size(&self) -> (f64, f64) {
        let cells = self.cells_per_axis() as f64;
        (self.bbox.width() / cells, self.bbox.height() / cells)
    }

    /// The cell containing the coordinate, if any.
    #[expect(
        clippy::as_conversions,
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        reason = "Values are checked to be in range before casting"
    )]
    fn cell_of(&self, coordinate: LatLonCoord) -> Option<(usize, usize)> {
        let (dx, dy) = self.cell_size();
        let cells = self.cells_per_axis() as f64;
        let x = ((coordinate.longitude() - self.bbox.south_west.longitude()) / dx).floor();
        let y = ((coordinate.latitude() - self.bbox.south_west.latitude()) / dy).floor();
        let valid = 0.0..cells;
        if valid.contains(&x) && valid.contains(&y) {
            Some((x as usize, y as usize))
        } else {
            None
        }
    }

    /// The south-west corner of a cell.
    #[expect(
        clippy::as_conversions,
        clippy::cast_precision_loss,
        reason = "The number of cells is small"
    )]
    fn corner(&self, x: usize, y: usize) -> LatLonCoord {
        let (dx, dy) = self.cell_size();
        LatLonCoord::new(
            (y as f64).mul_add(dy, self.bbox.south_west.latitude()),
            (x as f64).mul_add(dx, self.bbox.south_west.longitude()),
        )
    }

    /// Select panoramas. The result only depends on the set of panoramas, not their order, and
    /// contains no duplicates. Only occupied cells are visited, so the cost doesn't grow with the
    /// level.
    pub fn sample(&self, panoramas: &[PanoramaMeta]) -> Vec<String> {
        let (dx, dy) = self.cell_size();
        if !(dx > 0.0 && dy > 0.0) {
            tracing::warn!("Degenerate bounding box, nothing to sample: {:?}", self.bbox);
            return Vec::new();
        }

        let size = self.cells_per_axis();
        let mut candidates: Vec<&PanoramaMeta> = panoramas.iter().collect();
        candidates.sort_by(|left, right| left.pano_id.cmp(&right.pano_id));

        let mut cells: Cells<'_> = BTreeMap::new();
        for candidate in candidates {
            let Some((x, y)) = self.cell_of(candidate.coordinate) else {
                tracing::trace!("{} is outside the grid", candidate.pano_id);
                continue;
            };
            cells.entry((y, x)).or_default().push(candidate);
        }

        let mut selected = Vec::new();
        let mut seen = HashSet::new();
        for (&(y, x), cell) in &cells {
            let corner = self.corner(x, y);
            let Some(primary) = nearest(cell.iter().copied(), corner, corner.latitude()) else {
                continue;
            };
            if seen.insert(primary.pano_id.as_str()) {
                selected.push(primary.pano_id.clone());
            }

            let Some(history) = self.history else {
                continue;
            };
            let reference_latitude = corner.latitude();
            for other in other_years(&cells, size, (x, y), primary, reference_latitude, history) {
                if seen.insert(other.pano_id.as_str()) {
                    selected.push(other.pano_id.clone());
                }
            }
        }

        selected
    }

    /// File name of the cached sample, unique per level and historical radius.
    pub fn file_name(&self) -> String {
        match self.history {
            None => format!("grid_lvl_{}.json", self.level),
            Some(history) => format!(
                "grid_lvl_{}_historical_{}m.json",
                self.level, history.max_range
            ),
        }
    }

    /// The cached sample in `directory`, if there is one.
    pub fn load_cached(&self, directory: &std::path::Path) -> Result<Option<Vec<String>>> {
        let path = directory.join(self.file_name());
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)?;
        let cached: QueryFile = serde_json::from_str(&json)?;
        Ok(Some(cached.pano_ids))
    }

    /// The cached sample in `directory`, computing and caching it if there is none. A cached
    /// sample is trusted even if the metadata has since changed.
    pub fn load_or_sample(
        &self,
        directory: &std::path::Path,
        meta: &TileMeta,
    ) -> Result<Vec<String>> {
        if let Some(cached) = self.load_cached(directory)? {
            return Ok(cached);
        }

        let path = directory.join(self.file_name());
        let pano_ids = self.sample(&meta.panoramas);
        let file = QueryFile {
            query_type: "grid".to_owned(),
            param: self.bbox.api_param(),
            grid_level: self.level,
            max_range: self.history.map(|history| history.max_range),
            pano_ids,
        };
        crate::store::write_atomically(&path, serde_json::to_string(&file)?.as_bytes())?;

        Ok(file.pano_ids)
    }
}

/// The candidate nearest to `target`. Ties go to the first candidate.
fn nearest<'meta>(
    candidates: impl Iterator<Item = &'meta PanoramaMeta>,
    target: LatLonCoord,
    reference_latitude: f64,
) -> Option<&'meta PanoramaMeta> {
    let mut best: Option<(&PanoramaMeta, f64)> = None;
    for candidate in candidates {
        let distance =
            crate::projector::squared_distance(candidate.coordinate, target, reference_latitude);
        if best.is_none_or(|(_, best_distance)| distance < best_distance) {
            best = Some((candidate, distance));
        }
    }
    best.map(|(candidate, _)| candidate)
}

/// For each year other than the primary's, the candidate of that year in the surrounding 3×3
/// cells nearest to the primary, if within range. Ordered by year.
fn other_years<'meta>(
    cells: &Cells<'meta>,
    size: usize,
    (x, y): (usize, usize),
    primary: &PanoramaMeta,
    reference_latitude: f64,
    history: History,
) -> Vec<&'meta PanoramaMeta> {
    let max_squared = history.max_range * history.max_range;
    let mut by_year: BTreeMap<i32, (&PanoramaMeta, f64)> = BTreeMap::new();

    for neighbour_y in y.saturating_sub(1)..=(y + 1).min(size - 1) {
        for neighbour_x in x.saturating_sub(1)..=(x + 1).min(size - 1) {
            let Some(cell) = cells.get(&(neighbour_y, neighbour_x)) else {
                continue;
            };
            for candidate in cell {
                let year = candidate.year();
                if year == primary.year() {
                    continue;
                }
                let distance = crate::projector::squared_distance(
                    candidate.coordinate,
                    primary.coordinate,
                    reference_latitude,
                );
                if distance > max_squared {
                    continue;
                }
                match by_year.get(&year) {
                    Some((_, best)) if *best <= distance => {}
                    _ => {
                        by_year.insert(year, (candidate, distance));
                    }
                }
            }
        }
    }

    by_year.into_values().map(|(candidate, _)| candidate).collect()
}

#[expect(
    clippy::default_numeric_fallback,
    clippy::unwrap_used,
    reason = "These are just tests"
)]
