//! Durable bookkeeping of what has been done: per-panorama stage records and the region-wide
//! indexes of broken panoramas and empty tiles.
//!
//! Every panorama's records live in its own directory, so concurrent jobs never share those
//! files. The region indexes are shared between workers and only ever rewritten while holding an
//! exclusive lock on `cache/index.lock`.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::Write as _,
};

use color_eyre::Result;

use crate::{
    greenery::{Fractions, Weighting},
    panorama::Projection,
    segmentation::ModelId,
};

/// Write a file so that readers only ever see the old or the complete new contents.
pub fn write_atomically(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = std::path::PathBuf::from(partial);
    {
        let mut file = std::fs::File::create(&partial)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&partial, path)
}

/// The three stages every panorama goes through.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Fetch the images.
    Download,
    /// Segment the images.
    Segment,
    /// Compute class fractions from the segmentation.
    Measure,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Self; 3] = [Self::Download, Self::Segment, Self::Measure];

    /// Lower case name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Segment => "segment",
            Self::Measure => "measure",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.name())
    }
}

/// Identifies one stage result. Only the settings that influence a stage are part of its key: a
/// download doesn't care about the model, a segmentation doesn't care about the weighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageKey {
    /// The stage.
    pub stage: Stage,
    /// The image layout.
    pub projection: Projection,
    /// The segmentation model.
    pub model: ModelId,
    /// The greenery weighting.
    pub weighting: Weighting,
}

impl std::fmt::Display for StageKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.stage {
            Stage::Download => write!(formatter, "download-{}", self.projection),
            Stage::Segment => write!(formatter, "segment-{}-{}", self.projection, self.model),
            Stage::Measure => write!(
                formatter,
                "measure-{}-{}-{}",
                self.projection,
                self.model,
                self.weighting.tag()
            ),
        }
    }
}

/// Outcome of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The stage's artifact exists.
    Ok,
    /// The stage failed and shouldn't be attempted again automatically.
    Fail,
}

/// The persisted result of one stage for one panorama.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JobRecord {
    /// Success or failure.
    pub status: JobStatus,
    /// Why it failed.
    pub message: Option<String>,
    /// Class fractions, for the measure stage.
    pub fractions: Option<Fractions>,
    /// When this was recorded.
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

impl JobRecord {
    /// A successful stage.
    pub fn ok() -> Self {
        Self {
            status: JobStatus::Ok,
            message: None,
            fractions: None,
            recorded_at: chrono::Utc::now(),
        }
    }

    /// A successful measure stage.
    pub fn measured(fractions: Fractions) -> Self {
        Self {
            fractions: Some(fractions),
            ..Self::ok()
        }
    }

    /// A failed stage.
    pub fn failed(message: String) -> Self {
        Self {
            status: JobStatus::Fail,
            message: Some(message),
            fractions: None,
            recorded_at: chrono::Utc::now(),
        }
    }

    /// Whether the stage succeeded.
    pub fn is_ok(&self) -> bool {
        self.status == JobStatus::Ok
    }
}

/// Where stage results and the broken set are kept.
pub trait ResultStore: Sync {
    /// The record for a panorama's stage, if there is one.
    fn get(&self, pano_id: &str, key: &StageKey) -> Result<Option<JobRecord>>;

    /// Record a stage result. An existing `Ok` record is never replaced.
    fn put(&self, pano_id: &str, key: &StageKey, record: JobRecord) -> Result<()>;

    /// All panoramas whose pipelines have failed.
    fn broken(&self) -> Result<BTreeSet<String>>;

    /// Add a panorama to the broken set.
    fn mark_broken(&self, pano_id: &str) -> Result<()>;
}

/// Region-wide shared indexes, stored as JSON sets.
#[derive(Debug, Clone)]
pub struct RegionIndex {
    /// The region's cache directory.
    directory: std::path::PathBuf,
}

impl RegionIndex {
    /// File with the broken panorama ids.
    const BROKEN: &'static str = "broken.json";
    /// File with the names of tiles without any panoramas.
    const EMPTY_TILES: &'static str = "empty_tiles.json";
    /// The advisory lock guarding both.
    const LOCK: &'static str = "index.lock";

    /// Instantiate.
    pub fn new(directory: std::path::PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    /// Read one of the sets. Missing files are empty sets.
    fn read(&self, name: &str) -> Result<BTreeSet<String>> {
        let path = self.directory.join(name);
        if !path.exists() {
            return Ok(BTreeSet::new());
        }
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Add a member to one of the sets, holding the lock across the read and the write.
    fn insert(&self, name: &str, member: &str) -> Result<()> {
        let lock = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.directory.join(Self::LOCK))?;
        lock.lock()?;

        let mut set = self.read(name)?;
        if set.insert(member.to_owned()) {
            let json = serde_json::to_string_pretty(&set)?;
            write_atomically(&self.directory.join(name), json.as_bytes())?;
        }

        lock.unlock()?;
        Ok(())
    }

    /// The broken panoramas.
    pub fn broken(&self) -> Result<BTreeSet<String>> {
        self.read(Self::BROKEN)
    }

    /// Mark a panorama as broken.
    pub fn mark_broken(&self, pano_id: &str) -> Result<()> {
        self.insert(Self::BROKEN, pano_id)
    }

    /// Tiles known to have no panoramas.
    pub fn empty_tiles(&self) -> Result<BTreeSet<String>> {
        self.read(Self::EMPTY_TILES)
    }

    /// Mark a tile as having no panoramas.
    pub fn mark_empty(&self, tile: &str) -> Result<()> {
        self.insert(Self::EMPTY_TILES, tile)
    }
}

/// Stage records kept as `records.json` in each panorama's directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    /// Directory holding one sub-directory per panorama.
    panoramas: std::path::PathBuf,
    /// The shared region indexes.
    index: RegionIndex,
}

impl FsStore {
    /// Instantiate.
    pub const fn new(panoramas: std::path::PathBuf, index: RegionIndex) -> Self {
        Self { panoramas, index }
    }

    /// The directory for one panorama.
    pub fn panorama_directory(&self, pano_id: &str) -> std::path::PathBuf {
        self.panoramas.join(pano_id)
    }

    /// The records file of a panorama.
    fn records_path(&self, pano_id: &str) -> std::path::PathBuf {
        self.panorama_directory(pano_id).join("records.json")
    }

    /// All records of a panorama.
    fn records(&self, pano_id: &str) -> Result<BTreeMap<String, JobRecord>> {
        let path = self.records_path(pano_id);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl ResultStore for FsStore {
    fn get(&self, pano_id: &str, key: &StageKey) -> Result<Option<JobRecord>> {
        Ok(self.records(pano_id)?.remove(&key.to_string()))
    }

    fn put(&self, pano_id: &str, key: &StageKey, record: JobRecord) -> Result<()> {
        let mut records = self.records(pano_id)?;
        let name = key.to_string();
        if records.get(&name).is_some_and(JobRecord::is_ok) {
            tracing::trace!("Keeping existing {name} record for {pano_id}");
            return Ok(());
        }
        records.insert(name, record);

        let json = serde_json::to_string_pretty(&records)?;
        write_atomically(&self.records_path(pano_id), json.as_bytes())?;
        Ok(())
    }

    fn broken(&self) -> Result<BTreeSet<String>> {
        self.index.broken()
    }

    fn mark_broken(&self, pano_id: &str) -> Result<()> {
        self.index.mark_broken(pano_id)
    }
}

/// An in-memory store for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    /// Records by panorama and key.
    records: parking_lot::Mutex<std::collections::HashMap<(String, String), JobRecord>>,
    /// The broken set.
    broken: parking_lot::Mutex<BTreeSet<String>>,
}

#[cfg(test)]
impl ResultStore for MemoryStore {
    fn get(&self, pano_id: &str, key: &StageKey) -> Result<Option<JobRecord>> {
        Ok(self
            .records
            .lock()
            .get(&(pano_id.to_owned(), key.to_string()))
            .cloned())
    }

    fn put(&self, pano_id: &str, key: &StageKey, record: JobRecord) -> Result<()> {
        let mut records = self.records.lock();
        let entry = records
            .entry((pano_id.to_owned(), key.to_string()))
            .or_insert_with(|| record.clone());
        if !entry.is_ok() {
            *entry = record;
        }
        Ok(())
    }

    fn broken(&self) -> Result<BTreeSet<String>> {
        Ok(self.broken.lock().clone())
    }

    fn mark_broken(&self, pano_id: &str) -> Result<()> {
        self.broken.lock().insert(pano_id.to_owned());
        Ok(())
    }
}
