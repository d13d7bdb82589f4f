//! How a panorama is captured as images: one wide equirectangular image, or four cube faces.

use crate::{error::StageError, meta::PanoramaMeta};

/// The image layout of a panorama.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    /// A single 360° equirectangular image.
    Equirectangular,
    /// The four horizontal faces of a cube.
    CubicFaces,
}

/// One image of a panorama.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Face {
    /// The whole equirectangular image.
    Panorama,
    /// Cube face looking forward.
    Front,
    /// Cube face looking back.
    Back,
    /// Cube face looking left.
    Left,
    /// Cube face looking right.
    Right,
}

impl Face {
    /// The short name providers use in URLs and we use in file names.
    pub const fn abbreviation(self) -> &'static str {
        match self {
            Self::Panorama => "panorama",
            Self::Front => "f",
            Self::Back => "b",
            Self::Left => "l",
            Self::Right => "r",
        }
    }

    /// Whether pixels on this face are laid out as flat cube projections.
    pub const fn is_cubic(self) -> bool {
        !matches!(self, Self::Panorama)
    }
}

impl Projection {
    /// The images making up a panorama in this projection.
    pub const fn faces(self) -> &'static [Face] {
        match self {
            Self::Equirectangular => &[Face::Panorama],
            Self::CubicFaces => &[Face::Front, Face::Back, Face::Left, Face::Right],
        }
    }

    /// Name used in file names and map keys.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Equirectangular => "panorama",
            Self::CubicFaces => "cubic",
        }
    }

    /// Where to download each face of the panorama from.
    pub fn image_urls(self, meta: &PanoramaMeta) -> Result<Vec<(Face, String)>, StageError> {
        let missing = || StageError::NoImageUrl {
            pano_id: meta.pano_id.clone(),
        };

        match self {
            Self::Equirectangular => {
                let url = meta.equirectangular_url.clone().ok_or_else(missing)?;
                Ok(vec![(Face::Panorama, url)])
            }
            Self::CubicFaces => {
                let base = meta.cubic_base_url.as_ref().ok_or_else(missing)?;
                Ok(self
                    .faces()
                    .iter()
                    .map(|face| (*face, format!("{base}1/{}/0/0.jpg", face.abbreviation())))
                    .collect())
            }
        }
    }

    /// Where a downloaded face lives inside a panorama's picture directory.
    pub fn image_path(self, pictures: &std::path::Path, face: Face) -> std::path::PathBuf {
        pictures.join(format!("{}_{}.jpg", self.tag(), face.abbreviation()))
    }
}

impl std::fmt::Display for Projection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.tag())
    }
}
