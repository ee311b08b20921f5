use image::imageops;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, VisionError};
use crate::raster::Image;

/// Shape kinds a drawing canvas can emit. Only rectangles select a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeKind {
    Rectangle,
    Other(String),
}

impl ShapeKind {
    fn from_type_name(name: Option<&str>) -> Self {
        match name.map(|s| s.trim().to_ascii_lowercase()) {
            None => ShapeKind::Rectangle,
            Some(name) if name == "rect" || name == "rectangle" => ShapeKind::Rectangle,
            Some(name) => ShapeKind::Other(name),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ShapeKind::Rectangle => "rect",
            ShapeKind::Other(name) => name,
        }
    }
}

/// One drawn shape in image-pixel coordinates.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawShape")]
pub struct AnnotationEvent {
    pub kind: ShapeKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl AnnotationEvent {
    pub fn rect(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            kind: ShapeKind::Rectangle,
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_rectangle(&self) -> bool {
        self.kind == ShapeKind::Rectangle
    }
}

// Canvas objects keep their unscaled size in width/height and record resizes in scaleX/scaleY.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawShape {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(alias = "x", default)]
    left: f64,
    #[serde(alias = "y", default)]
    top: f64,
    #[serde(alias = "w", default)]
    width: f64,
    #[serde(alias = "h", default)]
    height: f64,
    #[serde(default = "unit_scale")]
    scale_x: f64,
    #[serde(default = "unit_scale")]
    scale_y: f64,
}

fn unit_scale() -> f64 {
    1.0
}

impl From<RawShape> for AnnotationEvent {
    fn from(raw: RawShape) -> Self {
        Self {
            kind: ShapeKind::from_type_name(raw.kind.as_deref()),
            x: raw.left,
            y: raw.top,
            width: raw.width * raw.scale_x,
            height: raw.height * raw.scale_y,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AnnotationDocument {
    List(Vec<AnnotationEvent>),
    Canvas { objects: Vec<AnnotationEvent> },
    Document { annotations: Vec<AnnotationEvent> },
}

/// Parse drawing data: a canvas export (`{"objects": [...]}`), `{"annotations": [...]}`, or a
/// bare array of shapes. Order is preserved.
pub fn parse_annotations(raw: &str) -> serde_json::Result<Vec<AnnotationEvent>> {
    let doc: AnnotationDocument = serde_json::from_str(raw)?;
    Ok(match doc {
        AnnotationDocument::List(events)
        | AnnotationDocument::Canvas { objects: events }
        | AnnotationDocument::Document {
            annotations: events,
        } => events,
    })
}

/// A non-empty rectangle inside the image, `left < right <= width`, `top < bottom <= height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CropRegion {
    left: u32,
    top: u32,
    right: u32,
    bottom: u32,
}

impl CropRegion {
    /// Resolve a shape against image bounds. Edges are rounded to whole pixels, then left/top are
    /// floored at 0 and right/bottom capped at the image size.
    pub fn clamp(event: &AnnotationEvent, img_w: u32, img_h: u32) -> Result<Self> {
        let left = (event.x.round() as i64).max(0);
        let top = (event.y.round() as i64).max(0);
        let right = ((event.x + event.width).round() as i64).min(i64::from(img_w));
        let bottom = ((event.y + event.height).round() as i64).min(i64::from(img_h));

        if left >= right || top >= bottom {
            return Err(VisionError::EmptyRegion {
                left,
                top,
                right,
                bottom,
            });
        }

        Ok(Self {
            left: left as u32,
            top: top as u32,
            right: right as u32,
            bottom: bottom as u32,
        })
    }

    pub fn left(&self) -> u32 {
        self.left
    }

    pub fn top(&self) -> u32 {
        self.top
    }

    pub fn right(&self) -> u32 {
        self.right
    }

    pub fn bottom(&self) -> u32 {
        self.bottom
    }

    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

/// The region selected by the most recent rectangle, or `None` when nothing was drawn.
/// Shapes drawn without any rectangle among them are an error.
pub fn resolve_region(image: &Image, annotations: &[AnnotationEvent]) -> Result<Option<CropRegion>> {
    if annotations.is_empty() {
        return Ok(None);
    }

    let Some(last) = annotations.iter().rev().find(|event| event.is_rectangle()) else {
        let kinds: Vec<String> = annotations
            .iter()
            .map(|event| event.kind.name().to_string())
            .collect();
        warn!(count = annotations.len(), "annotations contain no rectangle");
        return Err(VisionError::NoRectangle { kinds });
    };

    let region = CropRegion::clamp(last, image.width(), image.height())?;
    debug!(
        left = region.left,
        top = region.top,
        right = region.right,
        bottom = region.bottom,
        shapes = annotations.len(),
        "resolved crop region"
    );
    Ok(Some(region))
}

/// Crop `image` to the last drawn rectangle. Without annotations the image passes through as is.
pub fn select_region(image: Image, annotations: &[AnnotationEvent]) -> Result<Image> {
    match resolve_region(&image, annotations)? {
        Some(region) => Ok(crop(&image, region)),
        None => Ok(image),
    }
}

pub fn crop(image: &Image, region: CropRegion) -> Image {
    let cropped = imageops::crop_imm(
        image.pixels(),
        region.left,
        region.top,
        region.width(),
        region.height(),
    )
    .to_image();
    Image::from_rgba(cropped)
}
