//! Panorama metadata: what a provider tells us about each capture point, and the adapter for the
//! Amsterdam panorama API.

use color_eyre::{Result, eyre::ContextCompat as _};

use crate::{bbox::BoundingBox, projector::LatLonCoord};

/// The endpoint listing panoramas.
const AMSTERDAM_API_URL: &str = "https://api.data.amsterdam.nl/panorama/panoramas/";

/// Number of records per page requested from the API.
const PAGE_SIZE: u32 = 2000;

/// Timestamp formats seen in the API and in older caches.
const TIMESTAMP_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%d %H:%M:%S%.f",
];

/// One panorama capture as reported by a metadata provider.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PanoramaMeta {
    /// Provider-assigned identifier.
    pub pano_id: String,
    /// Capture time.
    pub timestamp: chrono::NaiveDateTime,
    /// Where the panorama was captured.
    pub coordinate: LatLonCoord,
    /// URL of the single equirectangular image, if the provider has one.
    pub equirectangular_url: Option<String>,
    /// Base URL under which the cube faces live, if the provider has them.
    pub cubic_base_url: Option<String>,
}

impl PanoramaMeta {
    /// The capture year.
    pub fn year(&self) -> i32 {
        chrono::Datelike::year(&self.timestamp)
    }
}

/// Parse any of the known timestamp formats.
pub fn parse_timestamp(string: &str) -> Result<chrono::NaiveDateTime> {
    for format in TIMESTAMP_FORMATS {
        if let Ok(timestamp) = chrono::NaiveDateTime::parse_from_str(string, format) {
            return Ok(timestamp);
        }
    }

    color_eyre::eyre::bail!("Unrecognised timestamp: {string}")
}

/// Everything a provider knows about the panoramas inside one tile.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TileMeta {
    /// The provider the data came from.
    pub source: String,
    /// The area query that produced it.
    pub param: String,
    /// When it was fetched.
    pub fetched_at: chrono::DateTime<chrono::Utc>,
    /// All panoramas, sorted by `pano_id`.
    pub panoramas: Vec<PanoramaMeta>,
}

impl TileMeta {
    /// Instantiate, keeping only panoramas inside the bounding box.
    pub fn new(source: &str, bbox: &BoundingBox, mut panoramas: Vec<PanoramaMeta>) -> Self {
        panoramas.retain(|panorama| bbox.contains(panorama.coordinate));
        panoramas.sort_by(|left, right| left.pano_id.cmp(&right.pano_id));
        panoramas.dedup_by(|left, right| left.pano_id == right.pano_id);

        Self {
            source: source.to_owned(),
            param: bbox.api_param(),
            fetched_at: chrono::Utc::now(),
            panoramas,
        }
    }

    /// Read the tile's cached metadata, or fetch and cache it if it doesn't exist yet. A cached
    /// file is never refreshed.
    pub fn load_or_fetch(
        path: &std::path::Path,
        source: &dyn MetadataSource,
        bbox: &BoundingBox,
    ) -> Result<Self> {
        if path.exists() {
            tracing::trace!("Using cached metadata: {path:?}");
            return Self::load(path);
        }

        let panoramas = source.fetch(bbox)?;
        let meta = Self::new(source.name(), bbox, panoramas);
        tracing::debug!(
            "Fetched {} panoramas from {} for {}",
            meta.panoramas.len(),
            meta.source,
            meta.param
        );
        meta.save(path)?;

        Ok(meta)
    }

    /// Load from disk.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Save to disk.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        crate::store::write_atomically(path, serde_json::to_string(self)?.as_bytes())?;
        Ok(())
    }

    /// Find a panorama by its id.
    pub fn get(&self, pano_id: &str) -> Option<&PanoramaMeta> {
        self.panoramas
            .binary_search_by(|panorama| panorama.pano_id.as_str().cmp(pano_id))
            .ok()
            .and_then(|index| self.panoramas.get(index))
    }

    /// Whether the provider had nothing for this tile.
    pub const fn is_empty(&self) -> bool {
        self.panoramas.is_empty()
    }
}

/// Anything that can list the panoramas inside an area.
pub trait MetadataSource: Sync {
    /// Short name used in cache keys and map names.
    fn name(&self) -> &'static str;

    /// All panoramas inside the bounding box. Must follow pagination and retry on transient
    /// failures itself.
    fn fetch(&self, bbox: &BoundingBox) -> Result<Vec<PanoramaMeta>>;
}

/// Client for `api.data.amsterdam.nl`.
pub struct AmsterdamApi {
    /// The blocking HTTP client.
    client: reqwest::blocking::Client,
    /// How many times to try each page.
    max_tries: u32,
    /// How long to wait between tries.
    retry_sleep: std::time::Duration,
}

impl AmsterdamApi {
    /// Instantiate.
    pub fn new(retry_sleep: std::time::Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            max_tries: 10,
            retry_sleep,
        })
    }

    /// Get a single page, retrying until the server gives a good answer.
    fn fetch_page(&self, url: &str, query: &[(&str, String)]) -> Result<Page> {
        for attempt in 1..=self.max_tries {
            let failure = match self.client.get(url).query(query).send() {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.json::<Page>()?);
                }
                Ok(response) => format!("HTTP status {}", response.status()),
                Err(error) => format!("request error: {error}"),
            };

            tracing::warn!(
                "Metadata request failed ({attempt}/{}): {failure}",
                self.max_tries
            );
            if attempt < self.max_tries {
                std::thread::sleep(self.retry_sleep);
            }
        }

        color_eyre::eyre::bail!("Couldn't retrieve metadata from {url}")
    }
}

impl MetadataSource for AmsterdamApi {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn fetch(&self, bbox: &BoundingBox) -> Result<Vec<PanoramaMeta>> {
        let query = [
            ("srid", "4326".to_owned()),
            ("page_size", PAGE_SIZE.to_string()),
            ("bbox", bbox.api_param()),
        ];

        let first = self.fetch_page(AMSTERDAM_API_URL, &query)?;
        follow_pages(first, |next| self.fetch_page(next, &[]))
    }
}

/// Collect the records of `first` and every page its `next` links lead to.
fn follow_pages(
    first: Page,
    mut fetch_next: impl FnMut(&str) -> Result<Page>,
) -> Result<Vec<PanoramaMeta>> {
    let mut panoramas = Vec::new();
    let mut page = first;
    loop {
        for record in page.embedded.panoramas {
            panoramas.push(PanoramaMeta::try_from(record)?);
        }

        let Some(next) = page.links.next.href else {
            break;
        };
        tracing::trace!("Following next page: {next}");
        page = fetch_next(&next)?;
    }

    Ok(panoramas)
}

/// One page of API results.
#[derive(serde::Deserialize)]
struct Page {
    /// The records.
    #[serde(rename = "_embedded")]
    embedded: Embedded,
    /// Pagination.
    #[serde(rename = "_links")]
    links: PageLinks,
}

/// Wrapper around the records.
#[derive(serde::Deserialize)]
struct Embedded {
    /// The panorama records.
    panoramas: Vec<ApiPanorama>,
}

/// Pagination links.
#[derive(serde::Deserialize)]
struct PageLinks {
    /// The next page, `null` on the last one.
    next: Link,
}

/// A HAL-style link.
#[derive(serde::Deserialize)]
struct Link {
    /// The target.
    href: Option<String>,
}

/// A single record as the API returns it.
#[derive(serde::Deserialize)]
struct ApiPanorama {
    /// Identifier.
    pano_id: String,
    /// Capture time as a string.
    timestamp: String,
    /// GeoJSON point.
    geometry: ApiGeometry,
    /// Base URL of the cube faces.
    cubic_img_baseurl: Option<String>,
    /// Image links.
    #[serde(rename = "_links")]
    links: ApiPanoramaLinks,
}

/// GeoJSON point geometry.
#[derive(serde::Deserialize)]
struct ApiGeometry {
    /// Longitude, latitude and possibly height.
    coordinates: Vec<f64>,
}

/// Per-record image links.
#[derive(serde::Deserialize)]
struct ApiPanoramaLinks {
    /// The small equirectangular image.
    equirectangular_small: Option<Link>,
}

impl TryFrom<ApiPanorama> for PanoramaMeta {
    type Error = color_eyre::Report;

    fn try_from(record: ApiPanorama) -> Result<Self> {
        let longitude = *record
            .geometry
            .coordinates
            .first()
            .context(format!("No longitude for {}", record.pano_id))?;
        let latitude = *record
            .geometry
            .coordinates
            .get(1)
            .context(format!("No latitude for {}", record.pano_id))?;

        Ok(Self {
            timestamp: parse_timestamp(&record.timestamp)?,
            coordinate: LatLonCoord::new(latitude, longitude),
            equirectangular_url: record
                .links
                .equirectangular_small
                .and_then(|link| link.href),
            cubic_base_url: record.cubic_img_baseurl,
            pano_id: record.pano_id,
        })
    }
}

/// A metadata source serving a fixed list, counting how often it's asked.
#[cfg(test)]
pub struct FixedSource {
    /// What to return.
    pub panoramas: Vec<PanoramaMeta>,
    /// Number of `fetch()` calls so far.
    pub calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FixedSource {
    /// Instantiate.
    pub const fn new(panoramas: Vec<PanoramaMeta>) -> Self {
        Self {
            panoramas,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[cfg(test)]
impl MetadataSource for FixedSource {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn fetch(&self, _bbox: &BoundingBox) -> Result<Vec<PanoramaMeta>> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.panoramas.clone())
    }
}

/// Make a panorama for tests.
#[cfg(test)]
pub fn fake_panorama(pano_id: &str, latitude: f64, longitude: f64, year: i32) -> PanoramaMeta {
    PanoramaMeta {
        pano_id: pano_id.to_owned(),
        timestamp: chrono::NaiveDate::from_ymd_opt(year, 6, 1)
            .and_then(|date| date.and_hms_opt(12, 0, 0))
            .unwrap_or_default(),
        coordinate: LatLonCoord::new(latitude, longitude),
        equirectangular_url: Some(format!("https://example.com/{pano_id}.jpg")),
        cubic_base_url: Some(format!("https://example.com/{pano_id}/")),
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

    const PAGE: &str = r#"{
        "_links": {"next": {"href": null}},
        "_embedded": {"panoramas": [
            {
                "pano_id": "TMX7316010203-000050_pano_0000_000000",
                "timestamp": "2016-05-09T12:21:04.123456Z",
                "geometry": {"type": "Point", "coordinates": [4.91, 52.36, 43.2]},
                "cubic_img_baseurl": "https://acc.example/cubic/",
                "_links": {"equirectangular_small": {"href": "https://acc.example/small.jpg"}}
            }
        ]}
    }"#;

    #[test]
    fn parses_all_timestamp_formats() {
        let with_fraction = parse_timestamp("2016-05-09T12:21:04.5Z").unwrap();
        let without = parse_timestamp("2016-05-09T12:21:04Z").unwrap();
        let spaced = parse_timestamp("2016-05-09 12:21:04.5").unwrap();
        assert_eq!(with_fraction, spaced);
        assert_eq!(chrono::Timelike::second(&without), 4);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn converts_api_page() {
        let page: Page = serde_json::from_str(PAGE).unwrap();
        assert!(page.links.next.href.is_none());
        let record = page.embedded.panoramas.into_iter().next().unwrap();
        let meta = PanoramaMeta::try_from(record).unwrap();
        assert_eq!(meta.coordinate, LatLonCoord::new(52.36, 4.91));
        assert_eq!(meta.year(), 2016);
        assert_eq!(
            meta.equirectangular_url.as_deref(),
            Some("https://acc.example/small.jpg")
        );
        assert_eq!(meta.cubic_base_url.as_deref(), Some("https://acc.example/cubic/"));
    }

    fn page(next: Option<&str>, ids: &[&str]) -> Page {
        let records: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "pano_id": id,
                    "timestamp": "2019-06-01T10:00:00Z",
                    "geometry": {"type": "Point", "coordinates": [4.91, 52.36]},
                    "cubic_img_baseurl": null,
                    "_links": {"equirectangular_small": {"href": null}}
                })
            })
            .collect();
        serde_json::from_value(serde_json::json!({
            "_links": {"next": {"href": next}},
            "_embedded": {"panoramas": records}
        }))
        .unwrap()
    }

    #[test]
    fn pages_are_followed_until_the_last() {
        let mut requested = Vec::new();
        let panoramas = follow_pages(page(Some("https://api/?page=2"), &["a", "b"]), |url| {
            requested.push(url.to_owned());
            Ok(match url {
                "https://api/?page=2" => page(Some("https://api/?page=3"), &["c"]),
                _ => page(None, &["d"]),
            })
        })
        .unwrap();

        let ids: Vec<_> = panoramas.iter().map(|p| p.pano_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert_eq!(requested, vec!["https://api/?page=2", "https://api/?page=3"]);
    }

    #[test]
    fn last_page_needs_no_more_requests() {
        let panoramas = follow_pages(page(None, &["a"]), |url| {
            unreachable!("there is no page after the last, asked for {url}")
        })
        .unwrap();
        assert_eq!(panoramas.len(), 1);
    }

    #[test]
    fn failed_pages_fail_the_fetch() {
        let result = follow_pages(page(Some("https://api/?page=2"), &["a"]), |_| {
            Err(color_eyre::eyre::eyre!("gateway timeout"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn tile_meta_keeps_only_contained_and_sorts() {
        let bbox = BoundingBox::from_array([0.0, 0.0, 1.0, 1.0]);
        let meta = TileMeta::new(
            "fixed",
            &bbox,
            vec![
                fake_panorama("b", 0.5, 0.5, 2020),
                fake_panorama("outside", 1.5, 0.5, 2020),
                fake_panorama("a", 0.2, 0.2, 2020),
            ],
        );
        let ids: Vec<_> = meta.panoramas.iter().map(|p| p.pano_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(meta.get("b").is_some());
        assert!(meta.get("outside").is_none());
    }

    #[test]
    fn tile_meta_is_fetched_once() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("meta.json");
        let bbox = BoundingBox::from_array([0.0, 0.0, 1.0, 1.0]);
        let source = FixedSource::new(vec![fake_panorama("a", 0.5, 0.5, 2019)]);

        let first = TileMeta::load_or_fetch(&path, &source, &bbox).unwrap();
        let second = TileMeta::load_or_fetch(&path, &source, &bbox).unwrap();

        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(first.panoramas, second.panoramas);
    }
}
