use std::io::Cursor;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ExtractError;

/// Upload ceiling of the vision service.
pub const MAX_UPLOAD_BYTES: usize = 4 * 1024 * 1024;
/// Longest side after downscaling an oversized upload.
pub const MAX_DIMENSION: u32 = 2048;
/// The vision service rejects anything smaller on either side.
pub const MIN_DIMENSION: u32 = 50;
pub const ALLOWED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// Re-encode qualities, tried in order until the upload fits.
const JPEG_QUALITIES: [u8; 3] = [85, 65, 45];

#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub digest: String,
    pub width: u32,
    pub height: u32,
    pub resized: bool,
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let lowered = ext.to_ascii_lowercase();
            ALLOWED_EXTENSIONS.contains(&lowered.as_str())
        })
        .unwrap_or(false)
}

pub fn image_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Reads an image and makes it acceptable to the vision service: too-small
/// images are rejected, oversized files are downscaled and re-encoded as
/// JPEG.
pub fn prepare_image(path: &Path) -> Result<PreparedImage, ExtractError> {
    let bytes = std::fs::read(path).map_err(|source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reject = |reason: String| ExtractError::Image {
        path: path.to_path_buf(),
        reason,
    };

    let (width, height) = ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .map_err(|err| reject(format!("unreadable image header: {err}")))?
        .into_dimensions()
        .map_err(|err| reject(format!("unsupported image format: {err}")))?;
    if width < MIN_DIMENSION || height < MIN_DIMENSION {
        return Err(reject(format!(
            "{width}x{height} is smaller than {MIN_DIMENSION}x{MIN_DIMENSION}"
        )));
    }

    if bytes.len() <= MAX_UPLOAD_BYTES {
        let digest = image_digest(&bytes);
        return Ok(PreparedImage {
            bytes,
            digest,
            width,
            height,
            resized: false,
        });
    }

    let decoded = image::load_from_memory(&bytes)
        .map_err(|err| reject(format!("failed to decode oversized image: {err}")))?;
    let resized = decoded
        .resize(MAX_DIMENSION, MAX_DIMENSION, FilterType::Triangle)
        .to_rgb8();
    let (width, height) = resized.dimensions();
    let resized = DynamicImage::ImageRgb8(resized);
    let mut smallest = usize::MAX;
    for quality in JPEG_QUALITIES {
        let mut encoded = Vec::new();
        JpegEncoder::new_with_quality(&mut encoded, quality)
            .encode_image(&resized)
            .map_err(|err| reject(format!("failed to re-encode image: {err}")))?;
        if encoded.len() > MAX_UPLOAD_BYTES {
            debug!(quality, bytes = encoded.len(), "re-encoded image still too large");
            smallest = smallest.min(encoded.len());
            continue;
        }
        return Ok(PreparedImage {
            digest: image_digest(&encoded),
            bytes: encoded,
            width,
            height,
            resized: true,
        });
    }
    Err(reject(format!(
        "still {smallest} bytes after downscaling (limit {MAX_UPLOAD_BYTES})"
    )))
}

#[cfg(test)]
pub(crate) fn write_test_png(path: &Path, width: u32, height: u32) -> anyhow::Result<()> {
    let image = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 120])
    });
    image.save(path)?;
    Ok(())
}
