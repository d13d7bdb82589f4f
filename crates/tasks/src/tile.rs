//! Tiles: fixed-size rectangles on a grid anchored to the Netherlands, so that a tile's name and
//! bounds never depend on the region being processed.

use color_eyre::Result;

use crate::{bbox::BoundingBox, projector::LatLonCoord};

/// The grid origin and extent: the bounding box of the Netherlands.
const GRID_BOUNDS: [f64; 4] = [
    50.803_721_015,
    3.314_971_144_23,
    53.510_403_347_4,
    7.092_053_256_87,
];

/// A single tile.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    /// Stable name, eg `NL_tile_1024m_120_78`.
    pub name: String,
    /// The tile's bounds.
    pub bbox: BoundingBox,
    /// Position relative to the region being processed, `(x, y)`.
    pub local: (usize, usize),
    /// Where everything about this tile is cached.
    pub directory: std::path::PathBuf,
}

impl Tile {
    /// The tile's cached provider metadata.
    pub fn meta_path(&self) -> std::path::PathBuf {
        self.directory.join("meta.json")
    }

    /// Holds one sub-directory per sampled panorama.
    pub fn panoramas_directory(&self) -> std::path::PathBuf {
        self.directory.join("pics")
    }

    /// Cached sampling results.
    pub fn queries_directory(&self) -> std::path::PathBuf {
        self.directory.join("queries")
    }

    /// Aggregated measurements for one result key.
    pub fn results_path(&self, key: &str) -> std::path::PathBuf {
        self.directory.join("results").join(format!("{key}.json"))
    }

    /// Lon/lat polygon of the tile.
    pub fn to_polygon(&self) -> geo::Polygon {
        self.bbox.to_polygon()
    }
}

/// All the tiles covering a region.
#[derive(Debug, Clone)]
pub struct TileGrid {
    /// Row-major: all tiles of the southernmost row first.
    pub tiles: Vec<Tile>,
    /// Number of tiles west to east.
    pub columns: usize,
    /// Number of tiles south to north.
    pub rows: usize,
    /// Tile size in meters.
    pub resolution: u32,
}

impl TileGrid {
    /// Cover `bbox` with tiles of roughly `resolution` meters on each side. Tiles whose cells
    /// only partially overlap the box are included.
    #[expect(
        clippy::as_conversions,
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        reason = "Grid indices are small and the divisions are finite"
    )]
    pub fn new(
        bbox: &BoundingBox,
        resolution: u32,
        tiles_directory: &std::path::Path,
    ) -> Result<Self> {
        if resolution == 0 {
            color_eyre::eyre::bail!("Tile resolution must be positive");
        }

        let bounds = BoundingBox::from_array(GRID_BOUNDS);
        let x_start = bounds.south_west.longitude();
        let y_start = bounds.south_west.latitude();

        let dy_target = 180.0 * f64::from(resolution)
            / (crate::projector::EARTH_RADIUS * std::f64::consts::PI);
        let dx_target = dy_target / bounds.centre().latitude().to_radians().cos();
        let nx = (bounds.width() / dx_target).ceil();
        let ny = (bounds.height() / dy_target).ceil();
        let dx = bounds.width() / nx;
        let dy = bounds.height() / ny;

        let min_x = ((bbox.south_west.longitude() - x_start) / dx).floor() as i64;
        let max_x = ((bbox.north_east.longitude() - x_start) / dx).ceil() as i64;
        let min_y = ((bbox.south_west.latitude() - y_start) / dy).floor() as i64;
        let max_y = ((bbox.north_east.latitude() - y_start) / dy).ceil() as i64;
        let columns = (max_x - min_x).max(1) as usize;
        let rows = (max_y - min_y).max(1) as usize;

        let mut tiles = Vec::with_capacity(columns * rows);
        for local_y in 0..rows {
            for local_x in 0..columns {
                let global_x = min_x + local_x as i64;
                let global_y = min_y + local_y as i64;
                let name = format!("NL_tile_{resolution}m_{global_y}_{global_x}");
                let south_west = LatLonCoord::new(
                    (global_y as f64).mul_add(dy, y_start),
                    (global_x as f64).mul_add(dx, x_start),
                );
                let north_east = LatLonCoord::new(
                    ((global_y + 1) as f64).mul_add(dy, y_start),
                    ((global_x + 1) as f64).mul_add(dx, x_start),
                );
                tiles.push(Tile {
                    directory: tiles_directory.join(&name),
                    name,
                    bbox: BoundingBox::new(south_west, north_east),
                    local: (local_x, local_y),
                });
            }
        }

        tracing::debug!("Region covered by {columns}x{rows} tiles of {resolution}m");
        Ok(Self {
            tiles,
            columns,
            rows,
            resolution,
        })
    }

    /// The tile at a local position.
    pub fn get(&self, x: usize, y: usize) -> Option<&Tile> {
        if x >= self.columns || y >= self.rows {
            return None;
        }
        self.tiles.get(y * self.columns + x)
    }

    /// Position of a tile in `tiles`, used to split work between jobs.
    pub const fn linear_index(&self, tile: &Tile) -> usize {
        tile.local.1 * self.columns + tile.local.0
    }

    /// The tile and all tiles within `radius` grid steps of it in both directions.
    pub fn neighbourhood(&self, tile: &Tile, radius: usize) -> Vec<&Tile> {
        let (x, y) = tile.local;
        let mut neighbours = Vec::new();
        for neighbour_y in y.saturating_sub(radius)..=y.saturating_add(radius) {
            for neighbour_x in x.saturating_sub(radius)..=x.saturating_add(radius) {
                if let Some(neighbour) = self.get(neighbour_x, neighbour_y) {
                    neighbours.push(neighbour);
                }
            }
        }
        neighbours
    }

    /// The bounds of the whole grid, which may be larger than the region it was made for.
    pub fn extent(&self) -> BoundingBox {
        match (self.tiles.first(), self.tiles.last()) {
            (Some(first), Some(last)) => {
                BoundingBox::new(first.bbox.south_west, last.bbox.north_east)
            }
            _ => BoundingBox::new(LatLonCoord::default(), LatLonCoord::default()),
        }
    }
}
