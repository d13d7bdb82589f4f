//! Semantic segmentation of panorama images. The neural network itself lives outside this crate:
//! we only know how to call it and how to keep what it tells us.

use std::collections::BTreeMap;

use color_eyre::Result;

use crate::{
    error::StageError,
    panorama::{Face, Projection},
};

/// The family of segmentation networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    /// DeepLab v3 trained on Cityscapes.
    DeepLab,
}

/// The pre-trained DeepLab backbones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeepLabVariant {
    /// Fast and rough.
    MobileNet,
    /// Xception 65.
    Xception65,
    /// Xception 71, trained on the fine annotations.
    Xception71,
    /// Xception 71, trained on the fine annotations including the validation set.
    Xception71Slow,
}

impl DeepLabVariant {
    /// All variants, for parsing.
    const ALL: [Self; 4] = [
        Self::MobileNet,
        Self::Xception65,
        Self::Xception71,
        Self::Xception71Slow,
    ];

    /// The name the model runner knows the variant by.
    pub const fn name(self) -> &'static str {
        match self {
            Self::MobileNet => "mobilenet",
            Self::Xception65 => "xception_65",
            Self::Xception71 => "xception_71",
            Self::Xception71Slow => "xception_71_slow",
        }
    }
}

/// Identity of a segmentation model. Displays as eg `deeplab-mobilenet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ModelId {
    /// The network family.
    pub family: ModelFamily,
    /// The pre-trained variant.
    pub variant: DeepLabVariant,
}

impl Default for ModelId {
    fn default() -> Self {
        Self {
            family: ModelFamily::DeepLab,
            variant: DeepLabVariant::MobileNet,
        }
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.family {
            ModelFamily::DeepLab => write!(formatter, "deeplab-{}", self.variant.name()),
        }
    }
}

impl std::str::FromStr for ModelId {
    type Err = color_eyre::Report;

    fn from_str(string: &str) -> Result<Self> {
        let Some(("deeplab", variant_name)) = string.split_once('-') else {
            color_eyre::eyre::bail!("Unknown model family: {string}");
        };
        let Some(variant) = DeepLabVariant::ALL
            .into_iter()
            .find(|variant| variant.name() == variant_name)
        else {
            color_eyre::eyre::bail!("Unknown DeepLab variant: {variant_name}");
        };

        Ok(Self {
            family: ModelFamily::DeepLab,
            variant,
        })
    }
}

impl From<ModelId> for String {
    fn from(model: ModelId) -> Self {
        model.to_string()
    }
}

impl TryFrom<String> for ModelId {
    type Error = color_eyre::Report;

    fn try_from(string: String) -> Result<Self> {
        string.parse()
    }
}

/// Class names and their display colours, indexed by class id.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Palette {
    /// Class names.
    pub names: Vec<String>,
    /// RGB colours.
    pub colors: Vec<[u8; 3]>,
}

/// The class of every pixel of one image.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SegmentationResult {
    /// Image height in pixels.
    pub height: usize,
    /// Image width in pixels.
    pub width: usize,
    /// Row-major class ids.
    #[serde(with = "run_length")]
    pub classes: Vec<u16>,
    /// What the class ids mean.
    pub palette: Palette,
}

impl SegmentationResult {
    /// Instantiate from rows of class ids, checking the map is rectangular and every id has a
    /// name.
    pub fn from_rows(rows: Vec<Vec<u16>>, palette: Palette) -> Result<Self> {
        let height = rows.len();
        let width = rows.first().map_or(0, Vec::len);
        if height == 0 || width == 0 {
            color_eyre::eyre::bail!("Empty class map");
        }
        if rows.iter().any(|row| row.len() != width) {
            color_eyre::eyre::bail!("Class map rows have different lengths");
        }

        let classes: Vec<u16> = rows.into_iter().flatten().collect();
        if let Some(unknown) = classes
            .iter()
            .find(|class| usize::from(**class) >= palette.names.len())
        {
            color_eyre::eyre::bail!("Class id {unknown} has no name in the palette");
        }

        Ok(Self {
            height,
            width,
            classes,
            palette,
        })
    }
}

/// Compact on-disk form of class maps: `[class, run length]` pairs.
mod run_length {
    use serde::{Deserialize as _, Serialize as _};

    /// Serialise.
    pub fn serialize<S: serde::Serializer>(
        classes: &[u16],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut runs: Vec<(u16, u32)> = Vec::new();
        for class in classes {
            match runs.last_mut() {
                Some((last, count)) if *last == *class => *count += 1,
                _ => runs.push((*class, 1)),
            }
        }
        runs.serialize(serializer)
    }

    /// Deserialise.
    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u16>, D::Error> {
        let runs = Vec::<(u16, u32)>::deserialize(deserializer)?;
        let mut classes = Vec::new();
        for (class, count) in runs {
            let length = usize::try_from(count).map_err(serde::de::Error::custom)?;
            classes.extend(std::iter::repeat_n(class, length));
        }
        Ok(classes)
    }
}

/// Anything that can segment an image.
pub trait Segmenter: Sync {
    /// The model doing the work.
    fn model(&self) -> ModelId;

    /// Segment one image.
    fn run(&self, image: &std::path::Path) -> Result<SegmentationResult, StageError>;
}

/// What the external segmentation program prints.
#[derive(serde::Deserialize)]
struct CommandOutput {
    /// Rows of class ids.
    class_map: Vec<Vec<u16>>,
    /// Class names.
    names: Vec<String>,
    /// Class colours.
    colors: Vec<[u8; 3]>,
}

/// Runs an external program as `<executable> --model <variant> <image>` and reads its JSON
/// output from stdout.
pub struct CommandSegmenter {
    /// The program.
    pub executable: std::path::PathBuf,
    /// Which model to ask it for.
    pub model: ModelId,
}

impl Segmenter for CommandSegmenter {
    fn model(&self) -> ModelId {
        self.model
    }

    fn run(&self, image: &std::path::Path) -> Result<SegmentationResult, StageError> {
        let failed = |reason: String| StageError::Segmenter {
            image: image.display().to_string(),
            reason,
        };

        tracing::debug!("Segmenting {image:?} with {}", self.model);
        let output = std::process::Command::new(&self.executable)
            .arg("--model")
            .arg(self.model.variant.name())
            .arg(image)
            .output()?;
        if !output.status.success() {
            return Err(failed(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let parsed: CommandOutput = serde_json::from_slice(&output.stdout)?;
        SegmentationResult::from_rows(
            parsed.class_map,
            Palette {
                names: parsed.names,
                colors: parsed.colors,
            },
        )
        .map_err(|error| failed(error.to_string()))
    }
}

/// All the segmentations of one panorama, tagged with how they were made.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SegmentationFile {
    /// The image layout that was segmented.
    pub projection: Projection,
    /// The model that did it.
    pub model: ModelId,
    /// One result per face.
    pub faces: BTreeMap<Face, SegmentationResult>,
}

impl SegmentationFile {
    /// Load from disk.
    pub fn load(path: &std::path::Path) -> Result<Self, StageError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Save to disk.
    pub fn save(&self, path: &std::path::Path) -> Result<(), StageError> {
        let json = serde_json::to_string(self)?;
        Ok(crate::store::write_atomically(path, json.as_bytes())?)
    }
}

/// A segmenter that paints a fixed class map, counting calls.
#[cfg(test)]
pub struct FakeSegmenter {
    /// The rows every image gets.
    pub rows: Vec<Vec<u16>>,
    /// Number of `run()` calls so far.
    pub calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FakeSegmenter {
    /// Instantiate.
    pub const fn new(rows: Vec<Vec<u16>>) -> Self {
        Self {
            rows,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// A palette with a few Cityscapes classes.
    pub fn palette() -> Palette {
        Palette {
            names: vec!["road".to_owned(), "vegetation".to_owned(), "sky".to_owned()],
            colors: vec![[128, 64, 128], [107, 142, 35], [70, 130, 180]],
        }
    }
}

#[cfg(test)]
impl Segmenter for FakeSegmenter {
    fn model(&self) -> ModelId {
        ModelId::default()
    }

    fn run(&self, image: &std::path::Path) -> Result<SegmentationResult, StageError> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if !image.exists() {
            return Err(StageError::MissingDependency {
                pano_id: image.display().to_string(),
                artifact: "image".to_owned(),
            });
        }
        SegmentationResult::from_rows(self.rows.clone(), Self::palette()).map_err(|error| {
            StageError::Segmenter {
                image: image.display().to_string(),
                reason: error.to_string(),
            }
        })
    }
}
