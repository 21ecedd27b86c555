//! Image encoding: scratch PNG → base64 [`EncodedImage`].
//!
//! Vision APIs accept images as base64 payloads inside the JSON request body.
//! The rasteriser already wrote a lossless PNG, so encoding is a file read
//! plus base64; JPEG artefacts on small print would hurt extraction more than
//! the larger payload costs.

use crate::error::PdfScanError;
use crate::pipeline::render::PageImage;
use crate::service::EncodedImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

/// Read a rendered page from the scratch area and base64-encode it.
pub async fn encode_page(image: &PageImage) -> Result<EncodedImage, PdfScanError> {
    let bytes = tokio::fs::read(image.path())
        .await
        .map_err(|e| PdfScanError::RasterisationFailed {
            page: image.page_number,
            detail: format!("reading scratch image: {e}"),
        })?;
    Ok(encode_png(&bytes, image.width, image.height))
}

/// Wrap PNG bytes for the request body.
pub fn encode_png(bytes: &[u8], width: u32, height: u32) -> EncodedImage {
    let data = STANDARD.encode(bytes);
    debug!("Encoded image → {} bytes base64", data.len());
    EncodedImage {
        data,
        mime_type: "image/png".to_string(),
        width,
        height,
    }
}
