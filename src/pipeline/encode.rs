//! Image encoding for vision prompts.
//!
//! Page images are kept as PNG bytes inside [`crate::pipeline::content::PageImage`]
//! so extraction results stay `Send` and cheap to clone. They are only
//! base64-wrapped into `ImageData` when a vision or hybrid prompt is built.
//! PNG keeps rendered text crisp; `detail: "high"` lets GPT-4-class models
//! tile the page instead of reading a single downscaled overview.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// PNG-encode a rendered page.
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Wrap PNG bytes as a base64 image attachment for the chat API.
pub fn image_data(png: &[u8]) -> ImageData {
    let b64 = STANDARD.encode(png);
    debug!("Encoded image → {} bytes base64", b64.len());
    ImageData::new(b64, "image/png").with_detail("high")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let png = png_bytes(&img).expect("encode should succeed");
        assert_eq!(&png[1..4], b"PNG");

        let data = image_data(&png);
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(decoded, png);
    }
}
