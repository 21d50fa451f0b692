use std::io::Cursor;

use crate::{Result, StoreError};

/// Longest edge of derived thumbnails.
pub const THUMB_EDGE: u32 = 256;

const JPEG_QUALITY: u8 = 80;

/// Decodes `bytes`, scales to the thumbnail edge and re-encodes as JPEG.
pub fn derive(bytes: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    let thumb = img.thumbnail(THUMB_EDGE, THUMB_EDGE);

    let mut out = Cursor::new(Vec::new());
    // JPEG has no alpha channel; flatten before encoding.
    image::DynamicImage::ImageRgb8(thumb.to_rgb8())
        .write_to(&mut out, image::ImageOutputFormat::Jpeg(JPEG_QUALITY))
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(out.into_inner())
}
