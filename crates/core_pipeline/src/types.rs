//! Core types for the room design pipeline
//!
//! This module defines the values that flow through one submission:
//! the caller's raw photo, the normalized payload derived from it,
//! the immutable design request, and the validated design result.

use crate::normalize::NormalizeError;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use uuid::Uuid;

/// Unique identifier for one user submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionId(pub Uuid);

impl SubmissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Input formats accepted from the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    fn from_image_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Png => Some(Self::Png),
            image::ImageFormat::Jpeg => Some(Self::Jpeg),
            image::ImageFormat::WebP => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }
}

/// A photo exactly as the caller supplied it
///
/// The bytes are never modified by the pipeline, so the caller can keep
/// displaying the original while a normalized copy is submitted.
#[derive(Debug, Clone)]
pub struct RawImage {
    bytes: Vec<u8>,
    width: u32,
    height: u32,
    format: ImageFormat,
}

impl RawImage {
    /// Wrap encoded image bytes, sniffing the format and reading the
    /// dimensions from the header.
    ///
    /// # Errors
    /// * `NormalizeError::EmptyInput` for zero-length data
    /// * `NormalizeError::ImageDecode` if the data is not PNG, JPEG or WEBP
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, NormalizeError> {
        if bytes.is_empty() {
            return Err(NormalizeError::EmptyInput);
        }

        let guessed = image::guess_format(&bytes)?;
        let format = ImageFormat::from_image_format(guessed).ok_or_else(|| {
            NormalizeError::UnsupportedFormat(format!("{:?}", guessed).to_lowercase())
        })?;

        let (width, height) = image::ImageReader::with_format(Cursor::new(&bytes), guessed)
            .into_dimensions()?;

        Ok(Self {
            bytes,
            width,
            height,
            format,
        })
    }

    /// Read an image file from disk
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, NormalizeError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| NormalizeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }
}

/// Bounded-size JPEG payload derived from a `RawImage`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    /// Encoded bytes submitted to the endpoint
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// JPEG quality used; `None` when the source encoding was kept as-is
    pub quality: Option<u8>,
    /// SHA-256 of `bytes`, lowercase hex
    pub content_hash: String,
    /// True when the byte budget could not be met before hitting the
    /// quality and resolution floors
    pub floor_reached: bool,
}

impl NormalizedImage {
    pub fn byte_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn mime_type(&self) -> &'static str {
        ImageFormat::Jpeg.mime_type()
    }

    pub fn longer_edge(&self) -> u32 {
        self.width.max(self.height)
    }
}

/// One user submission: the three free-text parameters plus the photo
///
/// Immutable once constructed.
#[derive(Debug, Clone)]
pub struct DesignRequest {
    id: SubmissionId,
    area: String,
    furniture: String,
    mood: String,
    image: NormalizedImage,
}

impl DesignRequest {
    pub fn new(
        area: impl Into<String>,
        furniture: impl Into<String>,
        mood: impl Into<String>,
        image: NormalizedImage,
    ) -> Self {
        Self {
            id: SubmissionId::new(),
            area: area.into(),
            furniture: furniture.into(),
            mood: mood.into(),
            image,
        }
    }

    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Room area / size description, e.g. "3m x 3.5m"
    pub fn area(&self) -> &str {
        &self.area
    }

    /// Furniture the user wants placed, e.g. "bed, desk"
    pub fn furniture(&self) -> &str {
        &self.furniture
    }

    /// Desired mood or style, e.g. "minimal, warm wood"
    pub fn mood(&self) -> &str {
        &self.mood
    }

    pub fn image(&self) -> &NormalizedImage {
        &self.image
    }
}

/// One recommended color
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorRecommendation {
    /// `#RRGGBB`
    pub hex: String,
    pub name: String,
    pub rationale: String,
}

/// One recommended furniture piece
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FurnitureRecommendation {
    pub name: String,
    pub style: String,
    pub rationale: String,
}

/// Validated design proposal returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignResult {
    /// Free-text analysis of the space
    pub analysis: String,
    /// Palette in the order the endpoint proposed it
    pub colors: Vec<ColorRecommendation>,
    /// Free-text furniture layout guide
    pub layout: String,
    pub items: Vec<FurnitureRecommendation>,
}
