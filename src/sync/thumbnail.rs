use crate::error::{Error, Result};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

/// Whether thumbnails are generated for archived files of this type
pub fn is_thumbnailable(content_type: &str) -> bool {
    content_type.starts_with("image/")
}

/// Decode an image and re-encode it as a JPEG no larger than
/// `max_dimension` on its longest edge, keeping the aspect ratio.
pub fn render_thumbnail(data: &[u8], max_dimension: u32) -> Result<Vec<u8>> {
    let img = image::load_from_memory(data)
        .map_err(|e| Error::Internal(format!("Failed to load image: {}", e)))?;

    let thumb = if img.width() > max_dimension || img.height() > max_dimension {
        img.thumbnail(max_dimension, max_dimension)
    } else {
        img
    };

    // The JPEG encoder rejects alpha channels
    let rgb = DynamicImage::ImageRgb8(thumb.to_rgb8());

    let mut buffer = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)
        .map_err(|e| Error::Internal(format!("Failed to encode thumbnail: {}", e)))?;

    Ok(buffer)
}

/// Render off the async runtime
pub async fn generate_thumbnail(data: Vec<u8>, max_dimension: u32) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || render_thumbnail(&data, max_dimension))
        .await
        .map_err(|e| Error::Internal(format!("Thumbnail task failed: {}", e)))?
}

#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
        width,
        height,
        image::Rgba([0, 128, 255, 255]),
    ));
    let mut buffer = Vec::new();
    img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .unwrap();
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_images_are_scaled_down() {
        let jpeg = render_thumbnail(&sample_png(800, 400), 320).unwrap();
        let thumb = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(thumb.width(), 320);
        assert_eq!(thumb.height(), 160);
    }

    #[test]
    fn small_images_keep_their_size() {
        let jpeg = render_thumbnail(&sample_png(40, 30), 320).unwrap();
        let thumb = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (40, 30));
    }

    #[tokio::test]
    async fn garbage_is_an_error() {
        assert!(generate_thumbnail(b"not an image".to_vec(), 64).await.is_err());
    }

    #[test]
    fn only_images_get_thumbnails() {
        assert!(is_thumbnailable("image/jpeg"));
        assert!(!is_thumbnailable("video/mp4"));
    }
}
