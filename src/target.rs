//! Render targets and rendered rasters.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use sha2::{Digest, Sha256};

use crate::texture::Texture;

/// Destination raster size in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub width: u32,
    pub height: u32,
}

impl RenderTarget {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }

    /// Same size as the source texture.
    pub fn for_texture(texture: &Texture) -> Self {
        Self::new(texture.width(), texture.height())
    }

    /// Letterbox a `source` aspect into a `container` measured in layout
    /// units, then scale by the display `pixel_ratio`.
    pub fn fit(source: (u32, u32), container: (u32, u32), pixel_ratio: f32) -> Self {
        let (sw, sh) = (source.0.max(1) as f32, source.1.max(1) as f32);
        let (cw, ch) = (container.0.max(1) as f32, container.1.max(1) as f32);
        let scale = (cw / sw).min(ch / sh);
        let ratio = if pixel_ratio.is_finite() && pixel_ratio > 0.0 {
            pixel_ratio
        } else {
            1.0
        };
        Self::new(
            (sw * scale * ratio).round() as u32,
            (sh * scale * ratio).round() as u32,
        )
    }

    pub fn resolution(&self) -> [f32; 2] {
        [self.width as f32, self.height as f32]
    }

    /// RGBA8 buffer size, or `None` when it does not fit in `usize`.
    pub fn byte_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(4)
    }
}

/// An opaque RGBA8 frame, row-major, no row padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl RenderedFrame {
    pub fn into_image(self) -> Result<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.rgba)
            .ok_or_else(|| anyhow!("rendered buffer does not match its dimensions"))
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        image::save_buffer_with_format(
            path,
            &self.rgba,
            self.width,
            self.height,
            image::ExtendedColorType::Rgba8,
            image::ImageFormat::Png,
        )
        .with_context(|| format!("failed writing {}", path.display()))
    }

    /// Hex SHA-256 of the pixel bytes.
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(&self.rgba);
        hash.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.rgba[i],
            self.rgba[i + 1],
            self.rgba[i + 2],
            self.rgba[i + 3],
        ]
    }
}
