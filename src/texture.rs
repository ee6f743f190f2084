//! Immutable source textures: decoded stills or single video frames.

use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, RgbaImage};
use tracing::debug;

use crate::color::Rgb;
use crate::error::HalftoneError;

/// Longest edge a source is downscaled to before upload.
pub const DEFAULT_MAX_EDGE: u32 = 600;

/// Anything the per-pixel kernel can read source color from.
pub trait TextureSampler {
    /// Bilinear, clamp-to-edge color at normalized `uv` (origin top-left).
    fn sample(&self, uv: [f32; 2]) -> Rgb;

    /// Size of one texel in normalized coordinates.
    fn texel_size(&self) -> [f32; 2];
}

/// A grid of RGBA8 texels, normalized to `[0, 1]` when sampled.
#[derive(Debug, Clone, PartialEq)]
pub struct Texture {
    image: RgbaImage,
}

impl Texture {
    pub fn from_image(image: RgbaImage) -> Result<Self, HalftoneError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(HalftoneError::MediaLoad(format!(
                "source has empty dimensions {}x{}",
                image.width(),
                image.height()
            )));
        }
        Ok(Self { image })
    }

    /// Wrap raw RGBA bytes handed over by a host.
    pub fn from_rgba8(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, HalftoneError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| HalftoneError::MediaLoad("frame dimensions overflowed".into()))?;
        if rgba.len() != expected {
            return Err(HalftoneError::MediaLoad(format!(
                "RGBA buffer length mismatch: expected {expected} bytes, got {}",
                rgba.len()
            )));
        }
        let image = RgbaImage::from_raw(width, height, rgba)
            .ok_or_else(|| HalftoneError::MediaLoad("invalid RGBA buffer".into()))?;
        Self::from_image(image)
    }

    /// Uniformly colored texture.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self, HalftoneError> {
        Self::from_image(RgbaImage::from_pixel(width, height, image::Rgba(rgba)))
    }

    /// Decode an image file and cap its longer edge at `max_edge`.
    pub fn load(path: &Path, max_edge: u32) -> Result<Self, HalftoneError> {
        let decoded = ImageReader::open(path)
            .map_err(|e| HalftoneError::MediaLoad(format!("failed opening {}: {e}", path.display())))?
            .with_guessed_format()
            .map_err(|e| HalftoneError::MediaLoad(format!("failed reading {}: {e}", path.display())))?
            .decode()
            .map_err(|e| {
                HalftoneError::MediaLoad(format!("failed decoding {}: {e}", path.display()))
            })?;
        debug!(
            path = %path.display(),
            width = decoded.width(),
            height = decoded.height(),
            "decoded source image"
        );
        Self::from_dynamic(decoded, max_edge)
    }

    /// Decode an in-memory encoded image (PNG, JPEG, WebP).
    pub fn decode(bytes: &[u8], max_edge: u32) -> Result<Self, HalftoneError> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| HalftoneError::MediaLoad(format!("failed decoding image bytes: {e}")))?;
        Self::from_dynamic(decoded, max_edge)
    }

    fn from_dynamic(decoded: DynamicImage, max_edge: u32) -> Result<Self, HalftoneError> {
        Self::from_image(decoded.to_rgba8()).map(|texture| texture.capped(max_edge))
    }

    /// Downscale so the longer edge is at most `max_edge`, keeping aspect.
    pub fn capped(self, max_edge: u32) -> Self {
        let (width, height) = capped_dimensions(self.width(), self.height(), max_edge);
        if (width, height) == self.image.dimensions() {
            return self;
        }
        debug!(width, height, "downscaling source to edge cap");
        Self {
            image: image::imageops::resize(&self.image, width, height, FilterType::Triangle),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    fn texel(&self, x: i64, y: i64) -> [f32; 4] {
        let x = x.clamp(0, i64::from(self.width()) - 1) as u32;
        let y = y.clamp(0, i64::from(self.height()) - 1) as u32;
        let p = self.image.get_pixel(x, y).0;
        [
            f32::from(p[0]) / 255.0,
            f32::from(p[1]) / 255.0,
            f32::from(p[2]) / 255.0,
            f32::from(p[3]) / 255.0,
        ]
    }
}

impl TextureSampler for Texture {
    fn sample(&self, uv: [f32; 2]) -> Rgb {
        let u = if uv[0].is_finite() { uv[0] } else { 0.0 };
        let v = if uv[1].is_finite() { uv[1] } else { 0.0 };
        let x = u * self.width() as f32 - 0.5;
        let y = v * self.height() as f32 - 0.5;
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);

        let a = self.texel(x0, y0);
        let b = self.texel(x0 + 1, y0);
        let c = self.texel(x0, y0 + 1);
        let d = self.texel(x0 + 1, y0 + 1);
        let lerp = |i: usize| {
            let top = a[i] + (b[i] - a[i]) * fx;
            let bottom = c[i] + (d[i] - c[i]) * fx;
            top + (bottom - top) * fy
        };
        Rgb::new(lerp(0), lerp(1), lerp(2))
    }

    fn texel_size(&self) -> [f32; 2] {
        [1.0 / self.width() as f32, 1.0 / self.height() as f32]
    }
}

/// Dimensions after capping the longer edge at `max_edge`; never below 1x1.
pub fn capped_dimensions(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let longest = width.max(height);
    if max_edge == 0 || longest <= max_edge {
        return (width, height);
    }
    let scale = max_edge as f64 / longest as f64;
    let scaled = |v: u32| ((v as f64 * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}
