use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

pub const MIN_COUNT: u32 = 1;
pub const MAX_COUNT: u32 = 100;

/// Closed set of aspect ratios accepted by every adapter.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    #[strum(serialize = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    #[strum(serialize = "16:9")]
    Wide,
    #[serde(rename = "9:16")]
    #[strum(serialize = "9:16")]
    Tall,
    #[serde(rename = "4:3")]
    #[strum(serialize = "4:3")]
    Landscape,
    #[serde(rename = "3:4")]
    #[strum(serialize = "3:4")]
    Portrait,
    #[serde(rename = "2:3")]
    #[strum(serialize = "2:3")]
    Photo,
}

impl AspectRatio {
    /// Width and height proportions, not pixels.
    pub fn proportions(&self) -> (u32, u32) {
        match self {
            AspectRatio::Square => (1, 1),
            AspectRatio::Wide => (16, 9),
            AspectRatio::Tall => (9, 16),
            AspectRatio::Landscape => (4, 3),
            AspectRatio::Portrait => (3, 4),
            AspectRatio::Photo => (2, 3),
        }
    }
}

impl Default for AspectRatio {
    fn default() -> Self {
        AspectRatio::Square
    }
}

/// Resolution class resolved by the adapter into concrete pixel dimensions.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
pub enum ImageSize {
    #[serde(rename = "1K")]
    #[strum(serialize = "1K")]
    OneK,
    #[serde(rename = "2K")]
    #[strum(serialize = "2K")]
    TwoK,
    #[serde(rename = "4K")]
    #[strum(serialize = "4K")]
    FourK,
}

impl ImageSize {
    /// Length of the longer edge before ratio scaling.
    pub fn long_edge(&self) -> u32 {
        match self {
            ImageSize::OneK => 1024,
            ImageSize::TwoK => 2048,
            ImageSize::FourK => 4096,
        }
    }
}

impl Default for ImageSize {
    fn default() -> Self {
        ImageSize::OneK
    }
}

/// One reference image handed to the adapter, already resolved to bytes.
#[derive(Clone, Serialize, Deserialize)]
pub struct RefImage {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub mime: String,
    /// Where the bytes came from, kept for the frozen config snapshot.
    pub origin: String,
}

impl std::fmt::Debug for RefImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefImage")
            .field("mime", &self.mime)
            .field("origin", &self.origin)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// Parameters the core passes to `Adapter::generate`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateParams {
    pub prompt: String,
    pub model_id: String,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default)]
    pub image_size: ImageSize,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ref_images: Vec<RefImage>,
}

fn default_count() -> u32 {
    MIN_COUNT
}

impl GenerateParams {
    /// Clamps `count` into the accepted range without failing the request.
    pub fn clamp_count(mut self) -> Self {
        self.count = self.count.clamp(MIN_COUNT, MAX_COUNT);
        self
    }

    /// Same request narrowed to a single output image.
    pub fn single(&self) -> GenerateParams {
        let mut params = self.clone();
        params.count = 1;
        params
    }
}
