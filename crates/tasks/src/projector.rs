//! Project coordinates between lon/lat degrees and a local metric plane.
//!
//! Everything in this crate happens at city scale, so a flat-earth approximation is plenty: a
//! degree of latitude is always the same number of meters, and a degree of longitude shrinks with
//! the cosine of the latitude. Raw degree differences must never be compared as distances.

/// The radius of the Earth in meters.
pub const EARTH_RADIUS: f64 = 6_356_000.0;

/// A latitude/longtitude coordinate. Like `geo`, `x` is the longitude and `y` the latitude.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Default)]
pub struct LatLonCoord(pub geo::Coord);

impl LatLonCoord {
    /// Instantiate from latitude and longitude, in that order.
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self(geo::Coord {
            x: longitude,
            y: latitude,
        })
    }

    /// Latitude in degrees.
    pub const fn latitude(self) -> f64 {
        self.0.y
    }

    /// Longitude in degrees.
    pub const fn longitude(self) -> f64 {
        self.0.x
    }
}

/// The number of meters in one degree of latitude and one degree of longitude, in that order, at
/// the given latitude.
pub fn meters_per_degree(latitude: f64) -> (f64, f64) {
    let per_degree_latitude = std::f64::consts::PI * EARTH_RADIUS / 180.0;
    let per_degree_longitude = per_degree_latitude * latitude.to_radians().cos();
    (per_degree_latitude, per_degree_longitude)
}

/// Convert between degrees and a flat metric plane. The scale is fixed by the latitude of the
/// base coordinate, which is also the plane's origin.
#[derive(Debug, Clone, Copy)]
pub struct Convert {
    /// The origin of the metric plane.
    pub base: LatLonCoord,
}

impl Convert {
    /// Meters per degree of latitude and longitude at the base.
    fn scale(&self) -> (f64, f64) {
        meters_per_degree(self.base.latitude())
    }

    /// Convert from degrees to meters relative to the base.
    pub fn to_meters(&self, source: LatLonCoord) -> geo::Coord {
        let (latitude_scale, longitude_scale) = self.scale();
        geo::coord! {
            x: (source.longitude() - self.base.longitude()) * longitude_scale,
            y: (source.latitude() - self.base.latitude()) * latitude_scale,
        }
    }

    /// The metric plane coordinate as an `rstar`-compatible point.
    pub fn to_point(&self, source: LatLonCoord) -> [f64; 2] {
        let coord = self.to_meters(source);
        [coord.x, coord.y]
    }
}

/// Squared metric distance between two coordinates, using the scale at `reference_latitude`.
pub fn squared_distance(a: LatLonCoord, b: LatLonCoord, reference_latitude: f64) -> f64 {
    let (latitude_scale, longitude_scale) = meters_per_degree(reference_latitude);
    let dx = (a.longitude() - b.longitude()) * longitude_scale;
    let dy = (a.latitude() - b.latitude()) * latitude_scale;
    dx.mul_add(dx, dy * dy)
}

#[expect(
    clippy::default_numeric_fallback,
    clippy::unreadable_literal,
    reason = "These are just tests"
)]
