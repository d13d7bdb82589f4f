//! Stitch kriged tiles into one raster for the whole region, and export what went into it.

use std::collections::BTreeMap;

use color_eyre::Result;

use crate::{
    bbox::BoundingBox,
    kriging::{KrigedTile, Sample},
    projector::LatLonCoord,
    tile::{Tile, TileGrid},
};

/// The interpolated measure over a whole region. Pixels are row-major, southernmost row first.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GreenMap {
    /// The map key this was made for.
    pub name: String,
    /// The area covered: the extent of all tiles, not just the requested region.
    pub bbox: BoundingBox,
    /// Pixels west to east.
    pub width: usize,
    /// Pixels south to north.
    pub height: usize,
    /// The measure per pixel, never negative.
    pub values: Vec<f32>,
    /// How much each pixel can be trusted. 0 means it was extrapolated or not kriged at all.
    pub alpha: Vec<f32>,
    /// Latitude of each row.
    pub latitudes: Vec<f64>,
    /// Longitude of each column.
    pub longitudes: Vec<f64>,
    /// The smallest and largest trusted values.
    pub value_range: (f32, f32),
}

impl GreenMap {
    /// Put every tile's raster in place. Tiles without a raster are left fully transparent.
    #[expect(
        clippy::as_conversions,
        clippy::cast_precision_loss,
        reason = "Pixel counts are small"
    )]
    pub fn assemble(
        name: &str,
        grid: &TileGrid,
        resolution: usize,
        rasters: &BTreeMap<(usize, usize), KrigedTile>,
    ) -> Self {
        let width = grid.columns * resolution;
        let height = grid.rows * resolution;
        let mut values = vec![0.0; width * height];
        let mut alpha = vec![0.0; width * height];

        for ((tile_x, tile_y), raster) in rasters {
            if raster.resolution != resolution {
                tracing::warn!(
                    "Ignoring tile ({tile_x}, {tile_y}) at {}px, expected {resolution}px",
                    raster.resolution
                );
                continue;
            }
            for row in 0..resolution {
                for column in 0..resolution {
                    let Some(cell) = raster.get(row, column) else {
                        continue;
                    };
                    let index =
                        (tile_y * resolution + row) * width + tile_x * resolution + column;
                    if let Some(value) = values.get_mut(index) {
                        *value = cell.value.max(0.0);
                    }
                    if let Some(trust) = alpha.get_mut(index) {
                        *trust = cell.alpha;
                    }
                }
            }
        }

        let bbox = grid.extent();
        let latitudes = (0..height)
            .map(|row| {
                (row as f64 / height as f64).mul_add(bbox.height(), bbox.south_west.latitude())
            })
            .collect();
        let longitudes = (0..width)
            .map(|column| {
                (column as f64 / width as f64).mul_add(bbox.width(), bbox.south_west.longitude())
            })
            .collect();

        let value_range = values
            .iter()
            .zip(&alpha)
            .filter(|(_, trust)| **trust > 0.0)
            .fold(None, |range: Option<(f32, f32)>, (value, _)| {
                Some(range.map_or((*value, *value), |(low, high)| {
                    (low.min(*value), high.max(*value))
                }))
            })
            .unwrap_or_default();

        tracing::info!(
            "Assembled {width}x{height} map from {} tiles, values {value_range:?}",
            rasters.len()
        );
        Self {
            name: name.to_owned(),
            bbox,
            width,
            height,
            values,
            alpha,
            latitudes,
            longitudes,
            value_range,
        }
    }

    /// The measure at a coordinate. `None` outside the map and wherever alpha is 0.
    #[expect(
        clippy::as_conversions,
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        reason = "Checked to be within the map before casting"
    )]
    pub fn get(&self, coordinate: LatLonCoord) -> Option<f32> {
        let column = ((coordinate.longitude() - self.bbox.south_west.longitude())
            / self.bbox.width()
            * self.width as f64)
            .floor();
        let row = ((coordinate.latitude() - self.bbox.south_west.latitude()) / self.bbox.height()
            * self.height as f64)
            .floor();
        if !(0.0..self.width as f64).contains(&column) || !(0.0..self.height as f64).contains(&row)
        {
            return None;
        }

        let index = row as usize * self.width + column as usize;
        match (self.values.get(index), self.alpha.get(index)) {
            (Some(value), Some(trust)) if *trust > 0.0 => Some(*value),
            _ => None,
        }
    }

    /// Load from disk.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Save to disk.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let json = serde_json::to_string(self)?;
        crate::store::write_atomically(path, json.as_bytes())?;
        tracing::info!("Map saved to {path:?}");
        Ok(())
    }
}

/// The outlines of tiles, for checking coverage in a GIS viewer.
pub fn tiles_geojson(tiles: &[&Tile]) -> String {
    let mut features: Vec<geo::Geometry> = Vec::new();
    for tile in tiles {
        features.push(tile.to_polygon().into());
    }

    let feature_collection = geojson::FeatureCollection::from(&features.into());
    geojson::GeoJson::from(feature_collection).to_string()
}

/// The measured points, each carrying its value.
pub fn samples_geojson(samples: &[Sample]) -> String {
    let features = samples
        .iter()
        .map(|sample| {
            let point = geo::Point::from(sample.coordinate.0);
            let mut properties = geojson::JsonObject::new();
            properties.insert("value".to_owned(), serde_json::json!(sample.value));
            geojson::Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&point))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    geojson::GeoJson::from(geojson::FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    })
    .to_string()
}

#[expect(
    clippy::default_numeric_fallback,
    clippy::unwrap_used,
    reason = "These are just tests"
)]
