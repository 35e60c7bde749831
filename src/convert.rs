//! Output re-encoding helpers.

use std::io::Cursor;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::ImageFormat;

use crate::error::Result;

/// Re-encode a PNG as a JPEG of the given quality.
pub fn png_to_jpeg(png: &[u8], quality: u8) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory_with_format(png, ImageFormat::Png)?;
    let rgb = decoded.to_rgb8();

    let mut out = Cursor::new(Vec::new());
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
        encoder.encode_image(&rgb)?;
    }
    Ok(out.into_inner())
}

/// Re-encode every image in place. Stops at the first failure.
pub fn convert_all_to_jpeg(images: &mut [Vec<u8>], quality: u8) -> Result<()> {
    for img in images.iter_mut() {
        *img = png_to_jpeg(img, quality)?;
    }
    Ok(())
}

/// Filename without its extension; `""` stays `""`.
pub fn filename_stem(filename: &str) -> &str {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
}
