//! The per-pixel halftone function.
//!
//! [`shade_pixel`] is a pure function of (texture coordinate, parameters,
//! sampler, derivative availability). The software renderer calls it
//! directly; `shaders/wgsl/halftone.wgsl` is the same algorithm for the GPU.

use crate::color::{adjust_tone, rgb_to_cmyk, Cmyk, Ink, Rgb};
use crate::composite::{blend, ink_alpha, paper_base};
use crate::dot::{
    aa_width, aspect_corrected, cell_center_screen, coverage_in_cell, locate_cell,
    uv_from_screen, DotScreen,
};
use crate::moire::moire_fallback;
use crate::noise::paper_noise;
use crate::params::HalftoneParameters;
use crate::prefilter::{blurred_sample, SampleMode};
use crate::texture::TextureSampler;

/// Paper noise lattice cells per canvas height at the lowest octave.
pub const PAPER_NOISE_SCALE: f32 = 40.0;

/// Whether the execution context can measure how far coordinates move per pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Derivatives {
    /// Aspect-corrected screen units covered by one output pixel.
    Available { st_per_pixel: f32 },
    Unavailable,
}

impl Derivatives {
    /// Derivatives for an output `height` pixels tall, honoring `antiAlias`.
    pub fn for_output(params: &HalftoneParameters, height: u32) -> Self {
        if params.anti_alias && height > 0 {
            Self::Available {
                st_per_pixel: 1.0 / height as f32,
            }
        } else {
            Self::Unavailable
        }
    }

    pub fn st_per_pixel(self) -> Option<f32> {
        match self {
            Self::Available { st_per_pixel } => Some(st_per_pixel),
            Self::Unavailable => None,
        }
    }
}

/// Contrast-adjusted (and optionally pre-blurred) source color.
pub fn source_color<S: TextureSampler + ?Sized>(
    sampler: &S,
    uv: [f32; 2],
    params: &HalftoneParameters,
) -> Rgb {
    let raw = blurred_sample(sampler, uv, params.blur);
    adjust_tone(raw, params.contrast, params.lightness)
}

/// Final opaque color for one output pixel.
///
/// `params` is expected to be [`HalftoneParameters::sanitized`] already;
/// renderers sanitize once per frame rather than once per pixel.
pub fn shade_pixel<S: TextureSampler + ?Sized>(
    uv: [f32; 2],
    resolution: [f32; 2],
    params: &HalftoneParameters,
    sampler: &S,
    derivatives: Derivatives,
) -> Rgb {
    let st = aspect_corrected(uv, resolution);
    let noise = paper_noise(st[0] * PAPER_NOISE_SCALE, st[1] * PAPER_NOISE_SCALE);
    let screen = DotScreen::from(params);
    let st_per_pixel = derivatives.st_per_pixel();
    let aa = aa_width(st_per_pixel.map(|step| step * params.frequency * 2.0));

    let source = source_color(sampler, uv, params);
    let direct = rgb_to_cmyk(source);
    let mut canvas = paper_base(params.paper_color, params.paper_noise, noise);

    for ink in Ink::ORDER {
        let channel = params.ink(ink);
        if !channel.visible {
            continue;
        }
        let angle = channel.angle.to_radians();
        let cell = locate_cell(st, angle, params.frequency, params.randomness);
        let tone = match params.sample_mode {
            SampleMode::Direct => direct.channel(ink),
            SampleMode::CellCenter => {
                let center = cell_center_screen(&cell, angle, params.frequency);
                let center_uv = uv_from_screen(center, resolution);
                rgb_to_cmyk(source_color(sampler, center_uv, params)).channel(ink)
            }
        };

        let coverage = coverage_in_cell(&cell, tone, &screen, noise, aa);
        if coverage <= 0.0 {
            continue;
        }
        let alpha = ink_alpha(
            channel.color.a,
            coverage,
            params.ink_density,
            params.ink_noise,
            noise,
        );
        canvas = blend(canvas, channel.color.rgb(), alpha, params.blend_mode);
    }

    let fallback = moire_fallback(params.frequency, st_per_pixel);
    canvas.mix(source, fallback).clamped()
}

/// Normalized texture coordinate of a pixel center.
#[inline]
pub fn pixel_uv(x: u32, y: u32, width: u32, height: u32) -> [f32; 2] {
    [
        (x as f32 + 0.5) / width as f32,
        (y as f32 + 0.5) / height as f32,
    ]
}

/// The CMYK tone field that drives dot generation (direct sampling), row-major.
pub fn tone_field<S: TextureSampler + ?Sized>(
    sampler: &S,
    params: &HalftoneParameters,
    width: u32,
    height: u32,
) -> Vec<Cmyk> {
    let params = params.sanitized();
    let mut field = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        for x in 0..width {
            let uv = pixel_uv(x, y, width, height);
            field.push(rgb_to_cmyk(source_color(sampler, uv, &params)));
        }
    }
    field
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Rgba;
    use crate::composite::BlendMode;
    use crate::texture::Texture;

    fn quiet_params() -> HalftoneParameters {
        HalftoneParameters {
            paper_noise: 0.0,
            ink_noise: 0.0,
            roughness: 0.0,
            ink_density: 1.0,
            ..HalftoneParameters::default()
        }
    }

    fn grey(v: u8) -> Texture {
        Texture::solid(64, 64, [v, v, v, 255]).expect("solid texture")
    }

    fn only(ink: Ink, params: &mut HalftoneParameters) {
        for other in Ink::ORDER {
            params.ink_mut(other).visible = other == ink;
        }
    }

    #[test]
    fn white_source_shows_bare_paper() {
        let params = quiet_params();
        let texture = grey(255);
        let out = shade_pixel(
            [0.3, 0.7],
            [640.0, 640.0],
            &params,
            &texture,
            Derivatives::for_output(&params, 640),
        );
        assert_eq!(out, params.paper_color);
    }

    #[test]
    fn full_black_dot_center_blends_by_mode() {
        // A black source at the exact center of a black-channel dot.
        let texture = grey(0);
        let mut params = quiet_params();
        only(Ink::Black, &mut params);
        params.black.angle = 0.0;
        params.black.color = Rgba::new(0.2, 0.4, 0.6, 1.0);
        params.frequency = 8.0;
        let uv = [0.5 / 8.0, 0.5 / 8.0];
        let ink = params.black.color.rgb();
        let paper = params.paper_color;

        for (mode, expected) in [
            (BlendMode::Subtractive, paper * ink),
            (BlendMode::Normal, ink),
            (BlendMode::Additive, (paper + ink).clamped()),
        ] {
            params.blend_mode = mode;
            let out = shade_pixel(uv, [64.0, 64.0], &params, &texture, Derivatives::Unavailable);
            assert!((out.r - expected.r).abs() < 1e-5, "{mode:?}: {out:?} vs {expected:?}");
            assert!((out.g - expected.g).abs() < 1e-5, "{mode:?}: {out:?} vs {expected:?}");
            assert!((out.b - expected.b).abs() < 1e-5, "{mode:?}: {out:?} vs {expected:?}");
        }
    }

    #[test]
    fn hidden_channel_parameters_do_not_matter() {
        let texture = Texture::solid(32, 32, [40, 160, 90, 255]).expect("solid texture");
        let mut a = quiet_params();
        a.cyan.visible = false;
        let mut b = a;
        b.cyan.angle = 33.0;
        b.cyan.color = Rgba::new(1.0, 0.0, 0.0, 1.0);

        for y in 0..32 {
            for x in 0..32 {
                let uv = pixel_uv(x, y, 32, 32);
                let d = Derivatives::for_output(&a, 512);
                assert_eq!(
                    shade_pixel(uv, [512.0, 512.0], &a, &texture, d),
                    shade_pixel(uv, [512.0, 512.0], &b, &texture, d)
                );
            }
        }
    }

    #[test]
    fn dense_screen_falls_back_to_source() {
        let texture = Texture::solid(16, 16, [200, 60, 20, 255]).expect("solid texture");
        let params = HalftoneParameters {
            frequency: 400.0,
            ..quiet_params()
        };
        let out = shade_pixel(
            [0.5, 0.5],
            [16.0, 16.0],
            &params,
            &texture,
            Derivatives::for_output(&params, 16),
        );
        let source = source_color(&texture, [0.5, 0.5], &params);
        assert!((out.r - source.r).abs() < 1e-5);
        assert!((out.g - source.g).abs() < 1e-5);
    }

    #[test]
    fn anti_alias_off_disables_derivatives() {
        let params = HalftoneParameters {
            anti_alias: false,
            ..HalftoneParameters::default()
        };
        assert_eq!(Derivatives::for_output(&params, 600), Derivatives::Unavailable);
    }

    /// 800 px wide ramp that restarts every 20 px, one period per dot cell
    /// at frequency 20 on an 800x400 target.
    fn sawtooth() -> Texture {
        let image = image::RgbaImage::from_fn(800, 4, |x, _| {
            let v = ((x % 20) * 12) as u8;
            image::Rgba([v, v, v, 255])
        });
        Texture::from_image(image).expect("sawtooth texture")
    }

    #[test]
    fn cell_center_mode_samples_once_per_dot() {
        let texture = sawtooth();
        let mut params = quiet_params();
        params.fuzz = 0.0;
        params.dot_size = 1.0;
        params.frequency = 20.0;
        params.black.angle = 0.0;
        only(Ink::Black, &mut params);
        let mut centered = params;
        centered.sample_mode = SampleMode::CellCenter;

        let resolution = [800.0, 400.0];
        let derivatives = Derivatives::for_output(&params, 400);
        let shade = |params: &HalftoneParameters, x: u32| {
            let uv = pixel_uv(x, 210, 800, 400);
            shade_pixel(uv, resolution, params, &texture, derivatives).to_rgba8()[0]
        };

        // The dot of cell (20, 10) is centered on x = 410, so pixels 409 - d
        // and 410 + d are mirror images across it.
        let mut direct_gap = 0;
        for d in 0..10 {
            let (left, right) = (409 - d, 410 + d);
            let (a, b) = (shade(&centered, left), shade(&centered, right));
            assert!(a.abs_diff(b) <= 1, "offset {d}: {a} left vs {b} right");
            direct_gap = direct_gap.max(shade(&params, left).abs_diff(shade(&params, right)));
        }
        assert!(direct_gap > 64, "direct sampling ignored the ramp: {direct_gap}");
        assert!(
            u16::from(shade(&centered, 410)) + 64 < u16::from(shade(&centered, 419)),
            "cell-center dot should be inked at its center only"
        );
    }

    #[test]
    fn cell_center_maps_back_to_its_texture_coordinate() {
        let resolution = [800.0, 400.0];
        let st = aspect_corrected(pixel_uv(415, 210, 800, 400), resolution);
        let cell = locate_cell(st, 0.0, 20.0, 0.0);
        assert_eq!(cell.cell, [20.0, 10.0]);
        let uv = uv_from_screen(cell_center_screen(&cell, 0.0, 20.0), resolution);
        assert!((uv[0] - 410.0 / 800.0).abs() < 1e-6, "{uv:?}");
        assert!((uv[1] - 210.0 / 400.0).abs() < 1e-6, "{uv:?}");

        // Rotated and jittered screens land back on the dot center.
        let angle = 30f32.to_radians();
        for x in [37, 401, 777] {
            let st = aspect_corrected(pixel_uv(x, 133, 800, 400), resolution);
            let cell = locate_cell(st, angle, 20.0, 0.3);
            let uv = uv_from_screen(cell_center_screen(&cell, angle, 20.0), resolution);
            let back = locate_cell(aspect_corrected(uv, resolution), angle, 20.0, 0.3);
            assert_eq!(back.cell, cell.cell);
            assert!(back.local[0].abs() < 1e-3 && back.local[1].abs() < 1e-3, "{back:?}");
        }
    }
}
