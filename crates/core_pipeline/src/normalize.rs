//! Image normalization module
//!
//! Bounds a caller's photo to a resolution and byte budget before it is
//! submitted to the inference endpoint:
//! - EXIF orientation is applied so phone photos arrive upright
//! - The longer edge is scaled down to `max_edge` (aspect ratio kept, no crop)
//! - Transparent pixels are flattened onto white
//! - JPEG quality is stepped down, then resolution, until the payload fits

use crate::types::{NormalizedImage, RawImage};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// Resampling filter for every resize step
const RESIZE_FILTER: FilterType = FilterType::CatmullRom;

/// Errors raised while reading or normalizing an image
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("input image data is empty")]
    EmptyInput,

    #[error("unsupported image format: {0} (expected png, jpeg or webp)")]
    UnsupportedFormat(String),

    #[error("failed to read image {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode image as JPEG: {0}")]
    Encode(#[source] image::ImageError),

    #[error("invalid normalization options: {0}")]
    InvalidOptions(String),
}

/// Size and quality budgets for normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeOptions {
    /// Maximum length of the longer edge, in pixels
    pub max_edge: u32,
    /// Maximum encoded size, in bytes
    pub byte_budget: usize,
    /// JPEG quality of the first encoding attempt (1-100)
    pub initial_quality: u8,
    /// Lowest JPEG quality tried before reducing resolution
    pub min_quality: u8,
    /// Quality decrement between attempts
    pub quality_step: u8,
    /// Resolution floor for the longer edge when shrinking further
    pub min_edge: u32,
    /// Scale applied to both edges per resolution-reduction step
    pub downscale_factor: f32,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            max_edge: 1024,
            byte_budget: 256 * 1024,
            initial_quality: 85,
            min_quality: 40,
            quality_step: 10,
            min_edge: 256,
            downscale_factor: 0.75,
        }
    }
}

impl NormalizeOptions {
    pub fn validate(&self) -> Result<(), NormalizeError> {
        if self.max_edge == 0 {
            return Err(NormalizeError::InvalidOptions(
                "max_edge must be greater than zero".to_string(),
            ));
        }
        if self.byte_budget == 0 {
            return Err(NormalizeError::InvalidOptions(
                "byte_budget must be greater than zero".to_string(),
            ));
        }
        if !(1..=100).contains(&self.min_quality) || !(1..=100).contains(&self.initial_quality) {
            return Err(NormalizeError::InvalidOptions(
                "JPEG qualities must be within 1..=100".to_string(),
            ));
        }
        if self.min_quality > self.initial_quality {
            return Err(NormalizeError::InvalidOptions(format!(
                "min_quality ({}) exceeds initial_quality ({})",
                self.min_quality, self.initial_quality
            )));
        }
        if self.quality_step == 0 {
            return Err(NormalizeError::InvalidOptions(
                "quality_step must be greater than zero".to_string(),
            ));
        }
        if self.min_edge == 0 {
            return Err(NormalizeError::InvalidOptions(
                "min_edge must be greater than zero".to_string(),
            ));
        }
        if self.min_edge > self.max_edge {
            return Err(NormalizeError::InvalidOptions(format!(
                "min_edge ({}) exceeds max_edge ({})",
                self.min_edge, self.max_edge
            )));
        }
        if !(self.downscale_factor > 0.0 && self.downscale_factor < 1.0) {
            return Err(NormalizeError::InvalidOptions(format!(
                "downscale_factor must be within (0, 1), got {}",
                self.downscale_factor
            )));
        }
        Ok(())
    }
}

/// Normalize a raw image into a bounded JPEG payload
///
/// The returned image never exceeds `max_edge` on either axis. Its byte
/// size is within `byte_budget` unless both the quality and resolution
/// floors were reached, in which case `floor_reached` is set.
///
/// A JPEG that already satisfies both budgets is returned byte-for-byte,
/// so normalizing a normalized image is a no-op.
///
/// # Errors
/// * `NormalizeError::ImageDecode` if the pixel data cannot be decoded
/// * `NormalizeError::InvalidOptions` for inconsistent budgets
pub fn normalize(
    raw: &RawImage,
    options: &NormalizeOptions,
) -> Result<NormalizedImage, NormalizeError> {
    options.validate()?;

    if is_within_budget(raw, options) {
        debug!(
            width = raw.width(),
            height = raw.height(),
            bytes = raw.bytes().len(),
            "image already within budget; keeping source encoding"
        );
        return Ok(finish(raw.bytes().to_vec(), raw.width(), raw.height(), None, false));
    }

    let decoded = decode_upright(raw)?;
    let (width, height) = fit_within(decoded.width(), decoded.height(), options.max_edge);
    let mut current = if (width, height) != (decoded.width(), decoded.height()) {
        flatten_to_rgb(&decoded.resize_exact(width, height, RESIZE_FILTER))
    } else {
        flatten_to_rgb(&decoded)
    };

    let mut quality = options.initial_quality;
    loop {
        let bytes = encode_jpeg(&current, quality)?;
        debug!(
            width = current.width(),
            height = current.height(),
            quality,
            bytes = bytes.len(),
            budget = options.byte_budget,
            "encoded candidate"
        );

        if bytes.len() <= options.byte_budget {
            return Ok(finish(bytes, current.width(), current.height(), Some(quality), false));
        }

        if quality > options.min_quality {
            quality = quality
                .saturating_sub(options.quality_step)
                .max(options.min_quality);
            continue;
        }

        let longer = current.width().max(current.height());
        if longer <= options.min_edge {
            warn!(
                bytes = bytes.len(),
                budget = options.byte_budget,
                quality,
                longer_edge = longer,
                "byte budget not met at quality and resolution floors"
            );
            return Ok(finish(bytes, current.width(), current.height(), Some(quality), true));
        }

        let target_edge = ((longer as f32 * options.downscale_factor).round() as u32)
            .max(options.min_edge)
            .min(longer - 1);
        let (next_w, next_h) = fit_within(current.width(), current.height(), target_edge);
        current = image::imageops::resize(&current, next_w, next_h, RESIZE_FILTER);
    }
}

/// Scale `(width, height)` so the longer edge is at most `max_edge`.
///
/// Dimensions already within bounds are returned unchanged; the shorter
/// edge is rounded to the nearest pixel and never drops below one.
pub fn fit_within(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let longer = width.max(height);
    if longer <= max_edge {
        return (width, height);
    }

    let scale = |edge: u32| -> u32 {
        let scaled = (edge as u64 * max_edge as u64 + longer as u64 / 2) / longer as u64;
        (scaled as u32).max(1)
    };

    if width >= height {
        (max_edge, scale(height))
    } else {
        (scale(width), max_edge)
    }
}

fn is_within_budget(raw: &RawImage, options: &NormalizeOptions) -> bool {
    raw.format() == crate::types::ImageFormat::Jpeg
        && raw.width().max(raw.height()) <= options.max_edge
        && raw.bytes().len() <= options.byte_budget
}

fn decode_upright(raw: &RawImage) -> Result<DynamicImage, NormalizeError> {
    let mut decoder = image::ImageReader::new(Cursor::new(raw.bytes()))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut decoded = DynamicImage::from_decoder(decoder)?;
    decoded.apply_orientation(orientation);
    Ok(decoded)
}

fn flatten_to_rgb(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| -> u8 {
            let alpha = a as u16;
            ((c as u16 * alpha + 255 * (255 - alpha) + 127) / 255) as u8
        };
        Rgb([blend(r), blend(g), blend(b)])
    })
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, NormalizeError> {
    let mut bytes = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
    image
        .write_with_encoder(encoder)
        .map_err(NormalizeError::Encode)?;
    Ok(bytes)
}

fn finish(
    bytes: Vec<u8>,
    width: u32,
    height: u32,
    quality: Option<u8>,
    floor_reached: bool,
) -> NormalizedImage {
    let content_hash = format!("{:x}", Sha256::digest(&bytes));
    NormalizedImage {
        bytes,
        width,
        height,
        quality,
        content_hash,
        floor_reached,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    fn encode(image: DynamicImage, format: image::ImageFormat) -> RawImage {
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
        RawImage::from_bytes(bytes).unwrap()
    }

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128u8])
        }))
    }

    /// Deterministic noise; compresses badly, which is the point.
    fn noise(width: u32, height: u32) -> DynamicImage {
        let mut state = 0x2545_F491_u32;
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let [r, g, b, _] = state.to_le_bytes();
            Rgb([r, g, b])
        }))
    }

    #[test]
    fn test_fit_within_landscape() {
        assert_eq!(fit_within(4000, 3000, 600), (600, 450));
    }

    #[test]
    fn test_fit_within_portrait_rounds_shorter_edge() {
        assert_eq!(fit_within(1000, 3001, 600), (200, 600));
        assert_eq!(fit_within(3, 5000, 100), (1, 100));
    }

    #[test]
    fn test_fit_within_leaves_small_images_alone() {
        assert_eq!(fit_within(320, 240, 600), (320, 240));
    }

    #[test]
    fn test_normalize_scales_longer_edge_to_max() {
        let raw = encode(gradient(1200, 900), image::ImageFormat::Png);
        let options = NormalizeOptions {
            max_edge: 600,
            byte_budget: 1024 * 1024,
            ..Default::default()
        };

        let normalized = normalize(&raw, &options).unwrap();
        assert_eq!(normalized.longer_edge(), 600);
        assert_eq!((normalized.width, normalized.height), (600, 450));
        assert_eq!(normalized.quality, Some(options.initial_quality));
        assert!(!normalized.floor_reached);

        let decoded = image::load_from_memory(&normalized.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (600, 450));
    }

    #[test]
    fn test_normalize_preserves_portrait_aspect_ratio() {
        let raw = encode(gradient(300, 1000), image::ImageFormat::Png);
        let options = NormalizeOptions {
            max_edge: 500,
            ..Default::default()
        };

        let normalized = normalize(&raw, &options).unwrap();
        assert_eq!(normalized.height, 500);
        let expected_width = 300.0 * 500.0 / 1000.0;
        assert!((normalized.width as f64 - expected_width).abs() <= 1.0);
    }

    #[test]
    fn test_normalize_does_not_upscale() {
        let raw = encode(gradient(200, 100), image::ImageFormat::Png);
        let normalized = normalize(&raw, &NormalizeOptions::default()).unwrap();
        assert_eq!((normalized.width, normalized.height), (200, 100));
    }

    #[test]
    fn test_normalize_meets_budget_by_lowering_quality() {
        let raw = encode(noise(400, 300), image::ImageFormat::Png);
        let options = NormalizeOptions {
            max_edge: 400,
            byte_budget: 40 * 1024,
            min_edge: 64,
            ..Default::default()
        };

        let normalized = normalize(&raw, &options).unwrap();
        assert!(normalized.byte_size() <= options.byte_budget || normalized.floor_reached);
        assert!(normalized.longer_edge() <= options.max_edge);
    }

    #[test]
    fn test_normalize_stops_at_floors_for_impossible_budget() {
        let raw = encode(noise(500, 500), image::ImageFormat::Png);
        let options = NormalizeOptions {
            max_edge: 500,
            byte_budget: 16,
            min_edge: 64,
            ..Default::default()
        };

        let normalized = normalize(&raw, &options).unwrap();
        assert!(normalized.floor_reached);
        assert_eq!(normalized.quality, Some(options.min_quality));
        assert_eq!(normalized.longer_edge(), options.min_edge);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let raw = encode(gradient(1600, 1200), image::ImageFormat::Png);
        let options = NormalizeOptions {
            max_edge: 600,
            byte_budget: 51_200,
            ..Default::default()
        };

        let first = normalize(&raw, &options).unwrap();
        let again = RawImage::from_bytes(first.bytes.clone()).unwrap();
        let second = normalize(&again, &options).unwrap();

        assert_eq!(second.bytes, first.bytes);
        assert_eq!(second.content_hash, first.content_hash);
        assert_eq!((second.width, second.height), (first.width, first.height));
        assert_eq!(second.quality, None);
    }

    #[test]
    fn test_normalize_leaves_raw_image_untouched() {
        let raw = encode(gradient(800, 600), image::ImageFormat::Png);
        let before = raw.bytes().to_vec();
        let _ = normalize(&raw, &NormalizeOptions::default()).unwrap();
        assert_eq!(raw.bytes(), before.as_slice());
    }

    #[test]
    fn test_normalize_flattens_transparency_onto_white() {
        let transparent = ImageBuffer::from_pixel(32, 32, Rgba([0u8, 0u8, 0u8, 0u8]));
        let raw = encode(DynamicImage::ImageRgba8(transparent), image::ImageFormat::Png);

        let normalized = normalize(&raw, &NormalizeOptions::default()).unwrap();
        let decoded = image::load_from_memory(&normalized.bytes).unwrap().to_rgb8();
        let Rgb([r, g, b]) = *decoded.get_pixel(16, 16);
        assert!(r > 240 && g > 240 && b > 240);
    }

    #[test]
    fn test_normalize_reports_truncated_image() {
        let mut bytes = Vec::new();
        gradient(64, 64)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes.truncate(bytes.len() / 2);

        let result = RawImage::from_bytes(bytes)
            .and_then(|raw| normalize(&raw, &NormalizeOptions::default()));
        assert!(matches!(result, Err(NormalizeError::ImageDecode(_))));
    }

    #[test]
    fn test_invalid_options_rejected() {
        let raw = encode(gradient(10, 10), image::ImageFormat::Png);
        let options = NormalizeOptions {
            max_edge: 0,
            ..Default::default()
        };
        let err = normalize(&raw, &options).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidOptions(_)));

        let options = NormalizeOptions {
            min_quality: 90,
            initial_quality: 80,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_resolution_floor_must_be_positive_and_within_max_edge() {
        let options = NormalizeOptions {
            byte_budget: 1,
            min_edge: 0,
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(NormalizeError::InvalidOptions(_))
        ));
        let raw = encode(gradient(4, 4), image::ImageFormat::Png);
        assert!(matches!(
            normalize(&raw, &options),
            Err(NormalizeError::InvalidOptions(_))
        ));

        let options = NormalizeOptions {
            max_edge: 200,
            min_edge: 256,
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(NormalizeError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_tiny_image_over_budget_stops_at_floor() {
        let raw = encode(gradient(4, 4), image::ImageFormat::Png);
        let options = NormalizeOptions {
            byte_budget: 1,
            min_edge: 1,
            ..Default::default()
        };
        let normalized = normalize(&raw, &options).unwrap();
        assert!(normalized.floor_reached);
        assert_eq!(normalized.longer_edge(), 1);
        assert_eq!(normalized.quality, Some(options.min_quality));
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        let raw = encode(gradient(50, 50), image::ImageFormat::Png);
        let normalized = normalize(&raw, &NormalizeOptions::default()).unwrap();
        assert_eq!(normalized.content_hash.len(), 64);
        assert!(normalized.content_hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
