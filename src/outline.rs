use std::{borrow::Cow, fmt, io::Cursor, str::FromStr};

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deepstack::Outline;

#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error("could not decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("could not encode image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("annotation task failed: {0}")]
    Task(String),
}

/// An RGB colour written as `#rrggbb` or `#rgb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OutlineColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl OutlineColor {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_rgba(self) -> Rgba<u8> {
        Rgba([self.r, self.g, self.b, 255])
    }
}

impl JsonSchema for OutlineColor {
    fn schema_name() -> Cow<'static, str> {
        "OutlineColor".into()
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        json_schema!({
            "type": "string",
            "pattern": "^#?([0-9a-fA-F]{3}|[0-9a-fA-F]{6})$"
        })
    }
}

impl Default for OutlineColor {
    fn default() -> Self {
        Self::rgb(255, 0, 0)
    }
}

impl FromStr for OutlineColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim().trim_start_matches('#');
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("invalid colour `{s}`"));
        }
        let channel = |h: &str| u8::from_str_radix(h, 16).map_err(|_| format!("invalid colour `{s}`"));
        match hex.len() {
            6 => Ok(Self::rgb(
                channel(&hex[0..2])?,
                channel(&hex[2..4])?,
                channel(&hex[4..6])?,
            )),
            3 => {
                // #abc is shorthand for #aabbcc
                let r = channel(&hex[0..1])?;
                let g = channel(&hex[1..2])?;
                let b = channel(&hex[2..3])?;
                Ok(Self::rgb(r * 17, g * 17, b * 17))
            }
            _ => Err(format!("invalid colour `{s}`")),
        }
    }
}

impl TryFrom<String> for OutlineColor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OutlineColor> for String {
    fn from(c: OutlineColor) -> Self {
        c.to_string()
    }
}

impl fmt::Display for OutlineColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Draws outlines onto an encoded image and returns the re-encoded result.
#[async_trait]
pub trait Annotator: Send + Sync {
    async fn outline(
        &self,
        image: &[u8],
        outlines: &[Outline],
        color: OutlineColor,
    ) -> Result<Vec<u8>, AnnotateError>;
}

/// `Annotator` backed by `image` and `imageproc`.
#[derive(Debug, Clone, Copy)]
pub struct ImageOutliner {
    line_width: u32,
}

impl Default for ImageOutliner {
    fn default() -> Self {
        Self { line_width: 3 }
    }
}

impl ImageOutliner {
    pub fn new(line_width: u32) -> Self {
        Self {
            line_width: line_width.max(1),
        }
    }

    /// Decode, draw and re-encode. PNG input stays PNG, anything else becomes JPEG.
    pub fn outline_blocking(
        &self,
        image: &[u8],
        outlines: &[Outline],
        color: OutlineColor,
    ) -> Result<Vec<u8>, AnnotateError> {
        let format = image::guess_format(image).unwrap_or(ImageFormat::Jpeg);
        let mut canvas = image::load_from_memory(image)
            .map_err(AnnotateError::Decode)?
            .to_rgba8();

        for outline in outlines {
            self.draw(&mut canvas, outline, color.to_rgba());
        }

        let mut out = Cursor::new(Vec::new());
        let drawn = DynamicImage::ImageRgba8(canvas);
        match format {
            ImageFormat::Png => drawn.write_to(&mut out, ImageFormat::Png),
            _ => DynamicImage::ImageRgb8(drawn.to_rgb8()).write_to(&mut out, ImageFormat::Jpeg),
        }
        .map_err(AnnotateError::Encode)?;
        Ok(out.into_inner())
    }

    fn draw(&self, canvas: &mut RgbaImage, outline: &Outline, color: Rgba<u8>) {
        let (w, h) = (canvas.width() as i32, canvas.height() as i32);
        if outline.x_max < 0 || outline.y_max < 0 || outline.x_min >= w || outline.y_min >= h {
            return;
        }
        // clamp into the image, boxes may overhang the frame edge
        let x0 = outline.x_min.clamp(0, w - 1);
        let y0 = outline.y_min.clamp(0, h - 1);
        let x1 = outline.x_max.clamp(0, w - 1);
        let y1 = outline.y_max.clamp(0, h - 1);

        for inset in 0..self.line_width as i32 {
            let width = x1 - x0 + 1 - 2 * inset;
            let height = y1 - y0 + 1 - 2 * inset;
            if width <= 0 || height <= 0 {
                break;
            }
            let rect = Rect::at(x0 + inset, y0 + inset).of_size(width as u32, height as u32);
            draw_hollow_rect_mut(canvas, rect, color);
        }
    }
}

#[async_trait]
impl Annotator for ImageOutliner {
    async fn outline(
        &self,
        image: &[u8],
        outlines: &[Outline],
        color: OutlineColor,
    ) -> Result<Vec<u8>, AnnotateError> {
        let outliner = *self;
        let image = image.to_vec();
        let outlines = outlines.to_vec();
        tokio::task::spawn_blocking(move || outliner.outline_blocking(&image, &outlines, color))
            .await
            .map_err(|e| AnnotateError::Task(e.to_string()))?
    }
}
