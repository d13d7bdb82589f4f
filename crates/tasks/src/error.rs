//! The ways a single panorama's pipeline stage can fail.

/// A stage failure. Pipelines never propagate these: they end up recorded against the panorama.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// A network problem that may well go away if we try again.
    #[error("transient network error fetching {url}: {reason}")]
    TransientNetwork {
        /// What we were fetching.
        url: String,
        /// What went wrong.
        reason: String,
    },
    /// Retries were exhausted, or the server said the resource doesn't exist.
    #[error("failed to fetch {url} after {attempts} attempt(s): {reason}")]
    PermanentFetchFailure {
        /// What we were fetching.
        url: String,
        /// How many times we tried.
        attempts: u32,
        /// The last failure.
        reason: String,
    },
    /// A stage ran before the stage it depends on produced its artifact.
    #[error("missing {artifact} for {pano_id}")]
    MissingDependency {
        /// The panorama.
        pano_id: String,
        /// The artifact that should have been there.
        artifact: String,
    },
    /// A cached artifact was made with a different model or projection than requested.
    #[error("stale result for {pano_id}: expected {expected}, found {found}")]
    StaleResultMismatch {
        /// The panorama.
        pano_id: String,
        /// The tag we wanted.
        expected: String,
        /// The tag on disk.
        found: String,
    },
    /// The provider metadata doesn't allow building an image URL.
    #[error("no image URL for {pano_id} in its metadata")]
    NoImageUrl {
        /// The panorama.
        pano_id: String,
    },
    /// The segmentation model failed.
    #[error("segmentation of {image} failed: {reason}")]
    Segmenter {
        /// The image being segmented.
        image: String,
        /// What went wrong.
        reason: String,
    },
    /// The result store couldn't be read or written.
    #[error("result store: {0}")]
    Store(String),
    /// Local storage.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A cached file couldn't be understood.
    #[error(transparent)]
    Decode(#[from] serde_json::Error),
}

impl StageError {
    /// Whether trying the same thing again could help.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }
}
