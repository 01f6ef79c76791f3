// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Image preparation for vision models

use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, GenericImageView};

use crate::Result;

/// Longest side sent to the vision model
const MAX_SIDE: u32 = 1024;

/// Downscale and re-encode as JPEG
pub fn prepare_image(bytes: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes)?;

    let img = if img.width() > MAX_SIDE || img.height() > MAX_SIDE {
        img.resize(MAX_SIDE, MAX_SIDE, image::imageops::FilterType::Triangle)
    } else {
        img
    };

    // JPEG has no alpha channel
    let img = DynamicImage::ImageRgb8(img.to_rgb8());

    let mut buffer = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut buffer), image::ImageFormat::Jpeg)?;
    Ok(buffer)
}

/// Base64 payload for the vision model, raw bytes when decoding fails
pub fn encode_for_vision(bytes: &[u8]) -> String {
    match prepare_image(bytes) {
        Ok(jpeg) => general_purpose::STANDARD.encode(jpeg),
        Err(e) => {
            tracing::debug!(error = %e, "Image decode failed, sending raw bytes");
            general_purpose::STANDARD.encode(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_pixel(width, height, Rgba([10u8, 20, 30, 255]));
        let mut buffer = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut buffer), image::ImageFormat::Png)
            .unwrap();
        buffer
    }

    #[test]
    fn large_images_are_downscaled() {
        let jpeg = prepare_image(&png(2048, 512)).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (1024, 256));
    }

    #[test]
    fn undecodable_bytes_pass_through() {
        let encoded = encode_for_vision(b"abc");
        assert_eq!(encoded, "YWJj");
    }
}
