//! Hybrid image processing: SIMD resize with a pure-software fallback
//!
//! Decoder intermediates (JPEG thumbnails, 16-bit TIFF, PPM) all come through
//! here on their way to the final JPEG.

use std::io::Cursor;

use fast_image_resize as fr;
use fr::images::Image as FrImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, RgbImage};
use tracing::{debug, warn};

use crate::error::{RawError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    /// EXIF orientation 1..=8, 1 when absent
    pub orientation: u16,
}

/// Image operations the conversion pipeline relies on
pub trait ImageProcessor: Send + Sync {
    fn read_metadata(&self, bytes: &[u8]) -> Result<ImageMetadata>;

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage>;

    /// Fit inside `max_dimension` preserving aspect ratio, never enlarging
    fn resize(&self, image: DynamicImage, max_dimension: u32) -> Result<DynamicImage>;

    /// Apply an EXIF orientation so the pixels display upright
    fn rotate(&self, image: DynamicImage, orientation: u16) -> DynamicImage;

    fn encode_jpeg(&self, image: &DynamicImage, quality: u8) -> Result<Vec<u8>>;

    /// Packed RGB8 pixels
    fn to_bytes(&self, image: &DynamicImage) -> Vec<u8> {
        image.to_rgb8().into_raw()
    }

    /// Decode, auto-rotate, resize and encode in one pass
    fn reencode(&self, bytes: &[u8], max_dimension: u32, quality: u8) -> Result<Vec<u8>> {
        let metadata = self.read_metadata(bytes)?;
        let image = self.decode(bytes)?;
        let image = self.rotate(image, metadata.orientation);
        let image = self.resize(image, max_dimension)?;
        self.encode_jpeg(&image, quality)
    }
}

pub struct HybridImageProcessor {
    force_software: bool,
}

impl HybridImageProcessor {
    pub fn new(force_software: bool) -> Self {
        Self { force_software }
    }

    fn resize_simd(&self, image: &DynamicImage, width: u32, height: u32) -> Result<DynamicImage> {
        let rgb = image.to_rgb8();
        let (src_w, src_h) = rgb.dimensions();

        let src = FrImage::from_vec_u8(src_w, src_h, rgb.into_raw(), fr::PixelType::U8x3)
            .map_err(|e| RawError::Processing(format!("Failed to create source image: {:?}", e)))?;
        let mut dst = FrImage::new(width, height, src.pixel_type());

        let mut resizer = fr::Resizer::new();
        resizer
            .resize(&src, &mut dst, None)
            .map_err(|e| RawError::Processing(format!("Resize failed: {:?}", e)))?;

        let resized = RgbImage::from_raw(width, height, dst.buffer().to_vec())
            .ok_or_else(|| RawError::Processing("Resized buffer has wrong length".to_string()))?;
        Ok(DynamicImage::ImageRgb8(resized))
    }
}

impl Default for HybridImageProcessor {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ImageProcessor for HybridImageProcessor {
    fn read_metadata(&self, bytes: &[u8]) -> Result<ImageMetadata> {
        let (width, height) = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()?
            .into_dimensions()?;

        Ok(ImageMetadata {
            width,
            height,
            orientation: read_orientation(bytes),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage> {
        Ok(image::load_from_memory(bytes)?)
    }

    fn resize(&self, image: DynamicImage, max_dimension: u32) -> Result<DynamicImage> {
        let Some((width, height)) = fit_within(image.width(), image.height(), max_dimension) else {
            return Ok(image);
        };

        if !self.force_software {
            match self.resize_simd(&image, width, height) {
                Ok(resized) => return Ok(resized),
                Err(e) => warn!("SIMD resize failed, using software path: {}", e),
            }
        }

        debug!("Software resize {}x{} -> {}x{}", image.width(), image.height(), width, height);
        Ok(image.resize_exact(width, height, FilterType::Lanczos3))
    }

    fn rotate(&self, image: DynamicImage, orientation: u16) -> DynamicImage {
        match orientation {
            2 => image.fliph(),
            3 => image.rotate180(),
            4 => image.flipv(),
            5 => image.rotate90().fliph(),
            6 => image.rotate90(),
            7 => image.rotate270().fliph(),
            8 => image.rotate270(),
            _ => image,
        }
    }

    fn encode_jpeg(&self, image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
        DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
        Ok(buf)
    }
}

/// Target size inside `max_dimension`, or `None` when no resize is needed
pub fn fit_within(width: u32, height: u32, max_dimension: u32) -> Option<(u32, u32)> {
    if max_dimension == 0 || width == 0 || height == 0 {
        return None;
    }
    let longest = width.max(height);
    if longest <= max_dimension {
        return None;
    }

    let scale = max_dimension as f64 / longest as f64;
    let w = ((width as f64 * scale).round() as u32).clamp(1, max_dimension);
    let h = ((height as f64 * scale).round() as u32).clamp(1, max_dimension);
    Some((w, h))
}

/// EXIF orientation from any container kamadak-exif understands, 1 otherwise
fn read_orientation(bytes: &[u8]) -> u16 {
    let Ok(exif) = exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) else {
        return 1;
    };
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .and_then(|v| u16::try_from(v).ok())
        .filter(|v| (1..=8).contains(v))
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn jpeg_of(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        HybridImageProcessor::default()
            .encode_jpeg(&DynamicImage::ImageRgb8(img), 90)
            .unwrap()
    }

    /// JPEG with an APP1 Exif segment carrying only an Orientation tag
    fn jpeg_with_orientation(width: u32, height: u32, orientation: u16) -> Vec<u8> {
        let plain = jpeg_of(width, height);

        let mut tiff = b"MM\x00\x2A\x00\x00\x00\x08".to_vec();
        tiff.extend_from_slice(&1u16.to_be_bytes());
        tiff.extend_from_slice(&0x0112u16.to_be_bytes());
        tiff.extend_from_slice(&3u16.to_be_bytes());
        tiff.extend_from_slice(&1u32.to_be_bytes());
        tiff.extend_from_slice(&orientation.to_be_bytes());
        tiff.extend_from_slice(&[0, 0]);
        tiff.extend_from_slice(&0u32.to_be_bytes());

        let mut app1 = b"Exif\x00\x00".to_vec();
        app1.extend_from_slice(&tiff);

        let mut out = plain[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&((app1.len() + 2) as u16).to_be_bytes());
        out.extend_from_slice(&app1);
        out.extend_from_slice(&plain[2..]);
        out
    }

    #[test]
    fn test_fit_within() {
        assert_eq!(fit_within(4000, 3000, 1920), Some((1920, 1440)));
        assert_eq!(fit_within(3000, 4000, 512), Some((384, 512)));
        assert_eq!(fit_within(800, 600, 1920), None, "never enlarge");
        assert_eq!(fit_within(10_000, 1, 100), Some((100, 1)));
        assert_eq!(fit_within(800, 600, 0), None);
    }

    #[test]
    fn test_resize_paths_agree_on_dimensions() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(400, 200));

        for force_software in [false, true] {
            let processor = HybridImageProcessor::new(force_software);
            let resized = processor.resize(image.clone(), 100).unwrap();
            assert_eq!((resized.width(), resized.height()), (100, 50));
        }
    }

    #[test]
    fn test_rotate_orientations() {
        let processor = HybridImageProcessor::default();
        let image = DynamicImage::ImageRgb8(RgbImage::new(40, 20));

        for (orientation, expected) in [(1, (40, 20)), (3, (40, 20)), (6, (20, 40)), (8, (20, 40)), (5, (20, 40)), (9, (40, 20))] {
            let rotated = processor.rotate(image.clone(), orientation);
            assert_eq!((rotated.width(), rotated.height()), expected, "orientation {orientation}");
        }
    }

    #[test]
    fn test_to_bytes_is_packed_rgb() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([1, 2, 3])));
        let bytes = HybridImageProcessor::default().to_bytes(&image);
        assert_eq!(bytes.len(), 3 * 2 * 3);
        assert_eq!(&bytes[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_read_metadata_orientation() {
        let processor = HybridImageProcessor::default();

        let plain = processor.read_metadata(&jpeg_of(64, 32)).unwrap();
        assert_eq!((plain.width, plain.height, plain.orientation), (64, 32, 1));

        let rotated = processor.read_metadata(&jpeg_with_orientation(64, 32, 6)).unwrap();
        assert_eq!(rotated.orientation, 6);
    }

    #[test]
    fn test_reencode_rotates_then_fits() {
        let processor = HybridImageProcessor::default();
        let jpeg = processor.reencode(&jpeg_with_orientation(200, 100, 6), 50, 85).unwrap();

        let out = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((out.width(), out.height()), (25, 50));
        assert!(infer::image::is_jpeg(&jpeg));
    }

    #[test]
    fn test_reencode_accepts_ppm_intermediate() {
        let mut ppm = b"P6\n4 2\n255\n".to_vec();
        ppm.extend(std::iter::repeat(200u8).take(4 * 2 * 3));

        let jpeg = HybridImageProcessor::new(true).reencode(&ppm, 1920, 80).unwrap();
        let out = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((out.width(), out.height()), (4, 2));
    }

    #[test]
    fn test_decode_garbage_is_image_error() {
        let err = HybridImageProcessor::default().decode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, RawError::Image(_)));
    }
}
