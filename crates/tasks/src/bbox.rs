//! Geographic bounding boxes, always normalised to south-west/north-east corners.

use color_eyre::Result;

use crate::projector::LatLonCoord;

/// Areas that can be referred to by name on the command line.
const NAMED_AREAS: &[(&str, [f64; 4])] = &[
    ("amsterdam", [52.263, 4.686, 52.451, 5.041]),
    ("amsterdam_almere", [52.240, 4.686, 52.445, 5.374]),
    ("almere", [52.299, 5.079, 52.445, 5.374]),
    ("oosterpark", [52.3588, 4.9145, 52.363, 4.931]),
    ("ouderkerk", [52.284, 4.885, 52.306, 4.930]),
    ("gaasperdam", [52.292, 4.960, 52.305, 5.000]),
];

/// A rectangle in lon/lat space.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BoundingBox {
    /// The south-west corner.
    pub south_west: LatLonCoord,
    /// The north-east corner.
    pub north_east: LatLonCoord,
}

impl BoundingBox {
    /// Instantiate from any two opposite corners.
    pub fn new(first: LatLonCoord, second: LatLonCoord) -> Self {
        Self {
            south_west: LatLonCoord::new(
                first.latitude().min(second.latitude()),
                first.longitude().min(second.longitude()),
            ),
            north_east: LatLonCoord::new(
                first.latitude().max(second.latitude()),
                first.longitude().max(second.longitude()),
            ),
        }
    }

    /// Instantiate from a `[lat, lon, lat, lon]` array.
    pub fn from_array(corners: [f64; 4]) -> Self {
        let [lat_a, lon_a, lat_b, lon_b] = corners;
        Self::new(LatLonCoord::new(lat_a, lon_a), LatLonCoord::new(lat_b, lon_b))
    }

    /// Look up one of the predefined areas.
    pub fn named(name: &str) -> Option<Self> {
        NAMED_AREAS
            .iter()
            .find(|(area, _)| *area == name)
            .map(|(_, corners)| Self::from_array(*corners))
    }

    /// Parse either a named area or a `lat_sw,lon_sw,lat_ne,lon_ne` string.
    pub fn parse(string: &str) -> Result<Self> {
        if let Some(named) = Self::named(string) {
            return Ok(named);
        }

        let mut numbers = Vec::new();
        for part in string.split(',') {
            numbers.push(part.trim().parse::<f64>()?);
        }
        let Ok(corners) = <[f64; 4]>::try_from(numbers) else {
            color_eyre::eyre::bail!(
                "Bounding box must be a named area or 4 numbers: lat_sw,lon_sw,lat_ne,lon_ne"
            );
        };

        Ok(Self::from_array(corners))
    }

    /// Width in degrees of longitude.
    pub fn width(&self) -> f64 {
        self.north_east.longitude() - self.south_west.longitude()
    }

    /// Height in degrees of latitude.
    pub fn height(&self) -> f64 {
        self.north_east.latitude() - self.south_west.latitude()
    }

    /// The centre of the box.
    pub fn centre(&self) -> LatLonCoord {
        LatLonCoord::new(
            f64::midpoint(self.south_west.latitude(), self.north_east.latitude()),
            f64::midpoint(self.south_west.longitude(), self.north_east.longitude()),
        )
    }

    /// Whether the coordinate lies inside the box, edges included.
    pub fn contains(&self, coord: LatLonCoord) -> bool {
        (self.south_west.latitude()..=self.north_east.latitude()).contains(&coord.latitude())
            && (self.south_west.longitude()..=self.north_east.longitude())
                .contains(&coord.longitude())
    }

    /// The `bbox` query parameter understood by the panorama API: `lon_w,lat_n,lon_e,lat_s`.
    pub fn api_param(&self) -> String {
        format!(
            "{},{},{},{}",
            self.south_west.longitude(),
            self.north_east.latitude(),
            self.north_east.longitude(),
            self.south_west.latitude()
        )
    }

    /// Names the box in directory names: the corners to about 10cm.
    pub fn tag(&self) -> String {
        format!(
            "{:.6}_{:.6}_{:.6}_{:.6}",
            self.south_west.latitude(),
            self.south_west.longitude(),
            self.north_east.latitude(),
            self.north_east.longitude()
        )
    }

    /// Lon/lat polygon of the box.
    pub fn to_polygon(&self) -> geo::Polygon {
        geo::Rect::new(self.south_west.0, self.north_east.0).to_polygon()
    }
}

#[expect(
    clippy::default_numeric_fallback,
    clippy::unwrap_used,
    reason = "These are just tests"
)]
