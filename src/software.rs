//! CPU rasterizer for the halftone kernel.
//!
//! Useful for headless export, golden digests and tests. It is selected
//! explicitly (`--backend cpu`); a missing GPU is still reported as
//! unsupported rather than silently falling back here.

use rayon::prelude::*;
use tracing::debug;

use crate::error::HalftoneError;
use crate::kernel::{pixel_uv, shade_pixel, Derivatives};
use crate::params::HalftoneParameters;
use crate::session::RenderBackend;
use crate::target::{RenderTarget, RenderedFrame};
use crate::texture::{Texture, TextureSampler};

/// Largest output edge the CPU rasterizer accepts. Matches wgpu's default
/// `max_texture_dimension_2d`, so both backends reject the same targets.
pub const MAX_TARGET_DIMENSION: u32 = 8192;

fn target_bytes(target: RenderTarget) -> Result<usize, HalftoneError> {
    let exhausted = HalftoneError::ResourceExhausted {
        width: target.width,
        height: target.height,
        limit: MAX_TARGET_DIMENSION,
    };
    if target.width > MAX_TARGET_DIMENSION || target.height > MAX_TARGET_DIMENSION {
        return Err(exhausted);
    }
    target.byte_len().ok_or(exhausted)
}

/// Shade every pixel of `target` from `sampler`.
///
/// Targets larger than [`MAX_TARGET_DIMENSION`] on either edge fail with
/// `E_RESOURCE_EXHAUSTED` before anything is allocated.
pub fn render_frame<S: TextureSampler + Sync + ?Sized>(
    sampler: &S,
    params: &HalftoneParameters,
    target: RenderTarget,
) -> Result<RenderedFrame, HalftoneError> {
    let len = target_bytes(target)?;
    let params = params.sanitized();
    let resolution = target.resolution();
    let derivatives = Derivatives::for_output(&params, target.height);
    let row_bytes = target.width as usize * 4;
    let mut rgba = vec![0u8; len];

    rgba.par_chunks_mut(row_bytes)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let uv = pixel_uv(x as u32, y as u32, target.width, target.height);
                let color = shade_pixel(uv, resolution, &params, sampler, derivatives);
                px.copy_from_slice(&color.to_rgba8());
            }
        });

    Ok(RenderedFrame {
        width: target.width,
        height: target.height,
        rgba,
    })
}

/// [`RenderBackend`] over the CPU rasterizer.
#[derive(Debug, Default)]
pub struct SoftwareRenderer {
    texture: Option<Texture>,
}

impl SoftwareRenderer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RenderBackend for SoftwareRenderer {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn upload(&mut self, texture: &Texture) -> Result<(), HalftoneError> {
        debug!(
            width = texture.width(),
            height = texture.height(),
            "binding source texture on cpu backend"
        );
        self.texture = Some(texture.clone());
        Ok(())
    }

    fn release(&mut self) {
        self.texture = None;
    }

    fn render(
        &mut self,
        params: &HalftoneParameters,
        target: RenderTarget,
    ) -> Result<RenderedFrame, HalftoneError> {
        let texture = self.texture.as_ref().ok_or(HalftoneError::InvalidState {
            action: "render",
            state: "no texture bound",
        })?;
        render_frame(texture, params, target)
    }
}
