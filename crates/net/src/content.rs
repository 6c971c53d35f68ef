//! Image payload preparation
//!
//! Outgoing images are downscaled so the longer edge fits within
//! [`MAX_IMAGE_EDGE`], re-encoded as JPEG at [`JPEG_QUALITY`] and
//! Base64-encoded. Incoming images only reverse the Base64 step.

use std::io;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView};
use tracing::debug;

/// Longest allowed edge of a transmitted image, in pixels
pub const MAX_IMAGE_EDGE: u32 = 1024;

/// JPEG quality used for transmitted images
pub const JPEG_QUALITY: u8 = 80;

/// Image pipeline errors
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("cannot read image source: {0}")]
    Read(#[from] io::Error),

    #[error("cannot decode image: {0}")]
    Decode(image::ImageError),

    #[error("cannot encode image: {0}")]
    Encode(image::ImageError),

    #[error("invalid Base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Downscale, compress and Base64-encode raw image bytes
pub fn prepare_outgoing(raw: &[u8]) -> Result<String, ContentError> {
    let source = image::load_from_memory(raw).map_err(ContentError::Decode)?;
    let (width, height) = source.dimensions();

    let scaled = fit_within(source, MAX_IMAGE_EDGE);
    let rgb = scaled.to_rgb8();

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(ContentError::Encode)?;

    debug!(
        from_w = width,
        from_h = height,
        to_w = rgb.width(),
        to_h = rgb.height(),
        bytes = jpeg.len(),
        "Prepared outgoing image"
    );

    Ok(STANDARD.encode(jpeg))
}

/// Read an image file and prepare it for sending
///
/// Decoding and compression run on the blocking pool.
pub async fn prepare_outgoing_file(path: impl AsRef<Path>) -> Result<String, ContentError> {
    let raw = tokio::fs::read(path.as_ref()).await?;
    tokio::task::spawn_blocking(move || prepare_outgoing(&raw))
        .await
        .map_err(|e| ContentError::Read(io::Error::new(io::ErrorKind::Other, e)))?
}

/// Decode the Base64 content of a received image
///
/// ASCII whitespace is ignored; some producers wrap Base64 output.
pub fn materialize_incoming(base64: &str) -> Result<Vec<u8>, ContentError> {
    let compact: String = base64
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    Ok(STANDARD.decode(compact)?)
}

/// Shrink so the longer edge is at most `max_edge`, keeping aspect ratio
fn fit_within(img: DynamicImage, max_edge: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    if width.max(height) <= max_edge {
        return img;
    }
    // resize() fits inside the box and preserves the aspect ratio
    img.resize(max_edge, max_edge, FilterType::Triangle)
}
