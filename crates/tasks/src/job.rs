//! Takes each sampled panorama through download, segmentation and measurement.
//!
//! What still needs doing is worked out from the result store alone, starting from the last
//! stage: the latest successful stage decides where the pipeline picks up, so rerunning over the
//! same panoramas does nothing once they're done. A failing panorama is recorded as broken and
//! never stops the others.

use std::collections::{BTreeMap, BTreeSet};

use color_eyre::Result;
use rayon::iter::{IntoParallelIterator as _, ParallelIterator as _};

use crate::{
    error::StageError,
    fetch::{Fetcher, RetryPolicy},
    greenery::GreeneryModel,
    meta::PanoramaMeta,
    panorama::Projection,
    segmentation::{SegmentationFile, Segmenter},
    store::{JobRecord, ResultStore, Stage, StageKey},
};

/// What needs to happen for one panorama.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Every stage already succeeded.
    Done,
    /// The panorama is broken, or one of its stages already failed.
    Skip,
    /// Run these stages, in order.
    Run(Vec<Stage>),
}

/// How a panorama's pipeline ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatus {
    /// All stages have succeeded, now or earlier.
    Done,
    /// Nothing was attempted because of an earlier failure.
    Skipped,
    /// A stage failed.
    Failed {
        /// The stage that failed.
        stage: Stage,
        /// Why.
        reason: String,
    },
}

/// The result of running one panorama's pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// The panorama.
    pub pano_id: String,
    /// How it went.
    pub status: PipelineStatus,
}

/// Everything the stages need. Borrowed, so that one set of collaborators can serve many
/// pipelines.
pub struct JobPipeline<'deps> {
    /// Stage records and the broken set.
    pub store: &'deps dyn ResultStore,
    /// Downloads images.
    pub fetcher: &'deps dyn Fetcher,
    /// Segments images.
    pub segmenter: &'deps dyn Segmenter,
    /// Turns segmentations into class fractions.
    pub greenery: &'deps GreeneryModel,
    /// Which images to work with.
    pub projection: Projection,
    /// Download retries.
    pub retry: RetryPolicy,
    /// Holds one directory per panorama.
    pub pictures: std::path::PathBuf,
}

impl JobPipeline<'_> {
    /// The record key of a stage under the current settings.
    pub fn key(&self, stage: Stage) -> StageKey {
        StageKey {
            stage,
            projection: self.projection,
            model: self.segmenter.model(),
            weighting: self.greenery.weighting,
        }
    }

    /// The directory of one panorama.
    fn directory(&self, pano_id: &str) -> std::path::PathBuf {
        self.pictures.join(pano_id)
    }

    /// Where the segmentations of a panorama are kept.
    fn segmentation_path(&self, pano_id: &str) -> std::path::PathBuf {
        self.directory(pano_id)
            .join(format!("segmentation_{}.json", self.projection.tag()))
    }

    /// Work out what a panorama still needs, checking the last stage first.
    pub fn plan(&self, pano_id: &str, broken: &BTreeSet<String>) -> Result<Plan> {
        if broken.contains(pano_id) {
            return Ok(Plan::Skip);
        }

        for (index, stage) in Stage::ALL.iter().enumerate().rev() {
            match self.store.get(pano_id, &self.key(*stage))? {
                Some(record) if record.is_ok() => {
                    let remaining = Stage::ALL.get(index + 1..).unwrap_or_default();
                    if remaining.is_empty() {
                        return Ok(Plan::Done);
                    }
                    return Ok(Plan::Run(remaining.to_vec()));
                }
                Some(_) => return Ok(Plan::Skip),
                None => {}
            }
        }

        Ok(Plan::Run(Stage::ALL.to_vec()))
    }

    /// Run the planned stages. Never fails: any error is recorded against the panorama and
    /// reported in the outcome.
    pub fn execute(&self, meta: &PanoramaMeta, plan: &Plan) -> Outcome {
        let pano_id = meta.pano_id.clone();
        let stages = match plan {
            Plan::Done => {
                return Outcome {
                    pano_id,
                    status: PipelineStatus::Done,
                };
            }
            Plan::Skip => {
                return Outcome {
                    pano_id,
                    status: PipelineStatus::Skipped,
                };
            }
            Plan::Run(stages) => stages,
        };

        for stage in stages {
            let mut result = if *stage == Stage::Download {
                self.snapshot(meta).and_then(|()| self.run_stage(*stage, &pano_id))
            } else {
                self.run_stage(*stage, &pano_id)
            };

            if *stage == Stage::Measure
                && let Err(StageError::StaleResultMismatch { found, .. }) = &result
            {
                tracing::warn!("Resegmenting {pano_id}: cached segmentation was made by {found}");
                result = self
                    .segment(&pano_id)
                    .and_then(|()| self.run_stage(Stage::Measure, &pano_id));
            }

            if let Err(error) = result {
                return self.fail(&pano_id, *stage, &error);
            }
        }

        Outcome {
            pano_id,
            status: PipelineStatus::Done,
        }
    }

    /// Plan and execute every panorama in parallel. Only a failure to read the broken set stops
    /// the batch.
    pub fn execute_all(&self, panoramas: &[&PanoramaMeta]) -> Result<Vec<Outcome>> {
        let broken = self.store.broken()?;
        let outcomes = panoramas
            .into_par_iter()
            .map(|meta| match self.plan(&meta.pano_id, &broken) {
                Ok(plan) => self.execute(meta, &plan),
                Err(error) => {
                    tracing::warn!("Couldn't plan {}: {error}", meta.pano_id);
                    Outcome {
                        pano_id: meta.pano_id.clone(),
                        status: PipelineStatus::Skipped,
                    }
                }
            })
            .collect();
        Ok(outcomes)
    }

    /// Record a failure, and remember the panorama as broken.
    fn fail(&self, pano_id: &str, stage: Stage, error: &StageError) -> Outcome {
        tracing::warn!("{pano_id} failed at {stage}: {error}");
        let reason = error.to_string();
        if let Err(store_error) =
            self.store
                .put(pano_id, &self.key(stage), JobRecord::failed(reason.clone()))
        {
            tracing::error!("Couldn't record failure of {pano_id}: {store_error}");
        }
        if let Err(store_error) = self.store.mark_broken(pano_id) {
            tracing::error!("Couldn't mark {pano_id} as broken: {store_error}");
        }

        Outcome {
            pano_id: pano_id.to_owned(),
            status: PipelineStatus::Failed { stage, reason },
        }
    }

    /// Run one stage and record its success.
    fn run_stage(&self, stage: Stage, pano_id: &str) -> Result<(), StageError> {
        tracing::trace!("Running {stage} for {pano_id}");
        match stage {
            Stage::Download => self.download(pano_id),
            Stage::Segment => self.segment(pano_id),
            Stage::Measure => self.measure(pano_id),
        }
    }

    /// Put a record in the store.
    fn record(&self, pano_id: &str, stage: Stage, record: JobRecord) -> Result<(), StageError> {
        self.store
            .put(pano_id, &self.key(stage), record)
            .map_err(|error| StageError::Store(error.to_string()))
    }

    /// Keep a copy of the panorama's metadata next to its images.
    fn snapshot(&self, meta: &PanoramaMeta) -> Result<(), StageError> {
        let path = self.directory(&meta.pano_id).join("meta.json");
        if path.exists() {
            return Ok(());
        }
        let json = serde_json::to_string(meta)?;
        crate::store::write_atomically(&path, json.as_bytes())?;
        Ok(())
    }

    /// Fetch every face of the panorama, as described by its metadata snapshot.
    fn download(&self, pano_id: &str) -> Result<(), StageError> {
        let directory = self.directory(pano_id);
        let snapshot = directory.join("meta.json");
        if !snapshot.exists() {
            return Err(StageError::MissingDependency {
                pano_id: pano_id.to_owned(),
                artifact: "metadata snapshot".to_owned(),
            });
        }
        let meta: PanoramaMeta = serde_json::from_str(&std::fs::read_to_string(snapshot)?)?;

        for (face, url) in self.projection.image_urls(&meta)? {
            let destination = self.projection.image_path(&directory, face);
            crate::fetch::fetch_with_retries(self.fetcher, self.retry, &url, &destination)?;
        }

        self.record(pano_id, Stage::Download, JobRecord::ok())
    }

    /// Segment every downloaded face.
    fn segment(&self, pano_id: &str) -> Result<(), StageError> {
        let directory = self.directory(pano_id);
        let mut faces = BTreeMap::new();
        for face in self.projection.faces() {
            let image = self.projection.image_path(&directory, *face);
            if !image.exists() {
                return Err(StageError::MissingDependency {
                    pano_id: pano_id.to_owned(),
                    artifact: format!("{} image", face.abbreviation()),
                });
            }
            faces.insert(*face, self.segmenter.run(&image)?);
        }

        SegmentationFile {
            projection: self.projection,
            model: self.segmenter.model(),
            faces,
        }
        .save(&self.segmentation_path(pano_id))?;

        self.record(pano_id, Stage::Segment, JobRecord::ok())
    }

    /// Compute class fractions from the cached segmentation, after checking it was made the way
    /// we expect.
    fn measure(&self, pano_id: &str) -> Result<(), StageError> {
        let path = self.segmentation_path(pano_id);
        if !path.exists() {
            return Err(StageError::MissingDependency {
                pano_id: pano_id.to_owned(),
                artifact: "segmentation".to_owned(),
            });
        }
        let segmentations = SegmentationFile::load(&path)?;

        let model = self.segmenter.model();
        if segmentations.projection != self.projection || segmentations.model != model {
            return Err(StageError::StaleResultMismatch {
                pano_id: pano_id.to_owned(),
                expected: format!("{}-{model}", self.projection),
                found: format!("{}-{}", segmentations.projection, segmentations.model),
            });
        }

        let fractions = self.greenery.fractions(&segmentations);
        self.record(pano_id, Stage::Measure, JobRecord::measured(fractions))
    }
}

#[expect(clippy::unwrap_used, reason = "These are just tests")]
#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        fetch::FakeFetcher,
        greenery::Weighting,
        meta::fake_panorama,
        segmentation::{DeepLabVariant, FakeSegmenter, ModelFamily, ModelId},
        store::MemoryStore,
    };

    struct Fixture {
        directory: tempfile::TempDir,
        store: MemoryStore,
        fetcher: FakeFetcher,
        segmenter: FakeSegmenter,
        greenery: GreeneryModel,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                directory: tempfile::tempdir().unwrap(),
                store: MemoryStore::default(),
                fetcher: FakeFetcher::new(),
                segmenter: FakeSegmenter::new(vec![vec![0, 1, 1], vec![1, 2, 2]]),
                greenery: GreeneryModel::new(Weighting::Projected),
            }
        }

        fn pipeline(&self) -> JobPipeline<'_> {
            JobPipeline {
                store: &self.store,
                fetcher: &self.fetcher,
                segmenter: &self.segmenter,
                greenery: &self.greenery,
                projection: Projection::CubicFaces,
                retry: RetryPolicy {
                    attempts: 2,
                    backoff: std::time::Duration::ZERO,
                },
                pictures: self.directory.path().join("pics"),
            }
        }

        fn segmenter_calls(&self) -> usize {
            self.segmenter.calls.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn fresh_panoramas_run_every_stage() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline();
        assert_eq!(
            pipeline.plan("a", &BTreeSet::new()).unwrap(),
            Plan::Run(Stage::ALL.to_vec())
        );

        let meta = fake_panorama("a", 52.36, 4.91, 2019);
        let outcome = pipeline.execute(&meta, &Plan::Run(Stage::ALL.to_vec()));
        assert_eq!(outcome.status, PipelineStatus::Done);
        assert_eq!(fixture.fetcher.calls(), 4);
        assert_eq!(fixture.segmenter_calls(), 4);

        let record = fixture
            .store
            .get("a", &pipeline.key(Stage::Measure))
            .unwrap()
            .unwrap();
        let total: f64 = record.fractions.unwrap().values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(
            fixture
                .directory
                .path()
                .join("pics")
                .join("a")
                .join("meta.json")
                .exists()
        );
    }

    #[test]
    fn second_run_does_nothing() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline();
        let first = fake_panorama("a", 52.36, 4.91, 2019);
        let second = fake_panorama("b", 52.37, 4.92, 2020);
        let panoramas = vec![&first, &second];

        let outcomes = pipeline.execute_all(&panoramas).unwrap();
        assert!(outcomes.iter().all(|outcome| outcome.status == PipelineStatus::Done));
        let fetches = fixture.fetcher.calls();
        let segmentations = fixture.segmenter_calls();

        assert_eq!(
            pipeline.plan("a", &BTreeSet::new()).unwrap(),
            Plan::Done
        );
        let again = pipeline.execute_all(&panoramas).unwrap();
        assert!(again.iter().all(|outcome| outcome.status == PipelineStatus::Done));
        assert_eq!(fixture.fetcher.calls(), fetches);
        assert_eq!(fixture.segmenter_calls(), segmentations);
    }

    #[test]
    fn picks_up_after_the_last_successful_stage() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline();
        fixture
            .store
            .put("a", &pipeline.key(Stage::Segment), JobRecord::ok())
            .unwrap();
        assert_eq!(
            pipeline.plan("a", &BTreeSet::new()).unwrap(),
            Plan::Run(vec![Stage::Measure])
        );

        fixture
            .store
            .put("b", &pipeline.key(Stage::Download), JobRecord::ok())
            .unwrap();
        assert_eq!(
            pipeline.plan("b", &BTreeSet::new()).unwrap(),
            Plan::Run(vec![Stage::Segment, Stage::Measure])
        );
    }

    #[test]
    fn failures_are_isolated_and_remembered() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline();
        let good = fake_panorama("good", 52.36, 4.91, 2019);
        let mut bad = fake_panorama("bad", 52.37, 4.92, 2019);
        bad.cubic_base_url = None;

        let outcomes = pipeline.execute_all(&[&bad, &good]).unwrap();
        assert!(matches!(
            outcomes[0].status,
            PipelineStatus::Failed {
                stage: Stage::Download,
                ..
            }
        ));
        assert_eq!(outcomes[1].status, PipelineStatus::Done);
        assert!(fixture.store.broken().unwrap().contains("bad"));

        let broken = fixture.store.broken().unwrap();
        assert_eq!(pipeline.plan("bad", &broken).unwrap(), Plan::Skip);
        let again = pipeline.execute_all(&[&bad]).unwrap();
        assert_eq!(again[0].status, PipelineStatus::Skipped);
    }

    #[test]
    fn failed_records_are_skipped() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline();
        fixture
            .store
            .put(
                "a",
                &pipeline.key(Stage::Download),
                JobRecord::failed("gone".to_owned()),
            )
            .unwrap();
        assert_eq!(pipeline.plan("a", &BTreeSet::new()).unwrap(), Plan::Skip);
    }

    #[test]
    fn segmenting_without_images_is_a_missing_dependency() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline();
        let meta = fake_panorama("a", 52.36, 4.91, 2019);
        let outcome = pipeline.execute(&meta, &Plan::Run(vec![Stage::Segment, Stage::Measure]));
        assert!(matches!(
            &outcome.status,
            PipelineStatus::Failed { stage: Stage::Segment, reason } if reason.contains("missing")
        ));
        assert_eq!(fixture.segmenter_calls(), 0);
    }

    #[test]
    fn stale_segmentations_are_recomputed() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline();
        let meta = fake_panorama("a", 52.36, 4.91, 2019);
        pipeline.execute(&meta, &Plan::Run(vec![Stage::Download]));

        let stale = SegmentationFile {
            projection: Projection::CubicFaces,
            model: ModelId {
                family: ModelFamily::DeepLab,
                variant: DeepLabVariant::Xception65,
            },
            faces: BTreeMap::new(),
        };
        stale.save(&pipeline.segmentation_path("a")).unwrap();
        assert!(matches!(
            pipeline.measure("a"),
            Err(StageError::StaleResultMismatch { .. })
        ));

        let outcome = pipeline.execute(&meta, &Plan::Run(vec![Stage::Measure]));
        assert_eq!(outcome.status, PipelineStatus::Done);
        assert_eq!(fixture.segmenter_calls(), 4);
        let refreshed = SegmentationFile::load(&pipeline.segmentation_path("a")).unwrap();
        assert_eq!(refreshed.model, ModelId::default());
    }
}
