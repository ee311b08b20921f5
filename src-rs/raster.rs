use image::imageops::FilterType;
use image::{GenericImageView, RgbaImage};
use tracing::debug;

use crate::error::{Result, VisionError};

/// An RGBA raster flowing through the pipeline.
///
/// There is no mutable access to the pixels: a stage that changes the image builds a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pixels: RgbaImage,
}

impl Image {
    pub fn from_rgba(pixels: RgbaImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn into_rgba(self) -> RgbaImage {
        self.pixels
    }
}

/// Decode `raw` (PNG, JPEG or GIF) into an RGBA image no wider than `max_width`.
///
/// Wider images are scaled down to exactly `max_width` with the height rounded to keep the
/// aspect ratio. `None` leaves the resolution alone.
pub fn normalize(raw: &[u8], max_width: Option<u32>) -> Result<Image> {
    if max_width == Some(0) {
        return Err(VisionError::InvalidDimension { max_width: 0 });
    }

    let decoded =
        image::load_from_memory(raw).map_err(|err| VisionError::Decode(err.to_string()))?;
    let (src_w, src_h) = decoded.dimensions();

    let resized = match max_width {
        Some(max_w) if src_w > max_w => {
            let (new_w, new_h) = scaled_dimensions(src_w, src_h, max_w);
            debug!(src_w, src_h, new_w, new_h, "downscaling input image");
            decoded.resize_exact(new_w, new_h, FilterType::CatmullRom)
        }
        _ => decoded,
    };

    let image = Image::from_rgba(resized.to_rgba8());
    debug!(
        width = image.width(),
        height = image.height(),
        "normalized image"
    );
    Ok(image)
}

fn scaled_dimensions(src_w: u32, src_h: u32, max_w: u32) -> (u32, u32) {
    let height = (f64::from(src_h) * f64::from(max_w) / f64::from(src_w)).round();
    (max_w, (height as u32).max(1))
}
