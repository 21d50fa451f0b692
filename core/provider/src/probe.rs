use image::{GenericImageView, ImageFormat};

use crate::error::ProviderError;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub mime: &'static str,
    pub ext: &'static str,
}

/// Sniffs upstream bytes as one of the supported pixel formats and
/// extracts dimensions. Anything else is a per-image failure.
pub fn probe(bytes: &[u8]) -> Result<ImageInfo> {
    let format = image::guess_format(bytes)
        .map_err(|e| ProviderError::Malformed(format!("unrecognized image payload: {}", e)))?;

    let (mime, ext) = match format {
        ImageFormat::Png => ("image/png", "png"),
        ImageFormat::Jpeg => ("image/jpeg", "jpg"),
        ImageFormat::WebP => ("image/webp", "webp"),
        other => {
            return Err(ProviderError::Malformed(format!(
                "unsupported pixel format: {:?}",
                other
            )))
        }
    };

    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ProviderError::Malformed(format!("undecodable {} payload: {}", mime, e)))?;
    let (width, height) = decoded.dimensions();

    Ok(ImageInfo {
        width,
        height,
        mime,
        ext,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    pub(crate) fn encoded(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([7, 7, 7]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageOutputFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn png_dimensions_extracted() {
        let info = probe(&encoded(64, 48)).unwrap();
        assert_eq!(info.width, 64);
        assert_eq!(info.height, 48);
        assert_eq!(info.mime, "image/png");
        assert_eq!(info.ext, "png");
    }

    #[test]
    fn garbage_is_classified_malformed() {
        assert!(matches!(
            probe(b"definitely not pixels"),
            Err(ProviderError::Malformed(_))
        ));
    }
}
