//! Source sampling ahead of dot generation: optional Gaussian pre-blur and
//! the per-channel rotated-grid cell-center sampling variant.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::color::Rgb;
use crate::texture::TextureSampler;

/// Offsets on each axis run from `-BLUR_TAPS` to `BLUR_TAPS`.
pub const BLUR_TAPS: i32 = 4;
/// Blur radii at or below this (in texels) sample the source directly.
pub const BLUR_MIN_RADIUS: f32 = 0.1;
/// Taps whose Gaussian weight falls below this are skipped.
pub const BLUR_MIN_WEIGHT: f32 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SampleMode {
    /// One source sample per pixel, shared by all four channels.
    #[default]
    Direct,
    /// Each channel samples the source at its own dot center, so the tone is
    /// constant across a whole dot cell.
    CellCenter,
}

impl SampleMode {
    pub fn as_u32(self) -> u32 {
        match self {
            SampleMode::Direct => 0,
            SampleMode::CellCenter => 1,
        }
    }
}

impl FromStr for SampleMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "direct" | "0" => Ok(Self::Direct),
            "cellcenter" | "cell_center" | "cell-center" | "1" => Ok(Self::CellCenter),
            other => Err(format!(
                "unknown sample mode '{other}' (expected direct or cellCenter)"
            )),
        }
    }
}

/// Gaussian weight for a tap `distance` texels from the center.
#[inline]
pub fn gaussian_weight(distance_sq: f32, sigma: f32) -> f32 {
    (-distance_sq / (2.0 * sigma * sigma)).exp()
}

/// Source color at `uv`, averaged over a 9x9 Gaussian neighborhood when
/// `blur` (in texels) is meaningful.
pub fn blurred_sample<S: TextureSampler + ?Sized>(sampler: &S, uv: [f32; 2], blur: f32) -> Rgb {
    if blur.is_nan() || blur <= BLUR_MIN_RADIUS {
        return sampler.sample(uv);
    }

    let texel = sampler.texel_size();
    let step = blur / BLUR_TAPS as f32;
    let sigma = blur / 3.0;
    let mut acc = Rgb::BLACK;
    let mut total = 0.0;

    for j in -BLUR_TAPS..=BLUR_TAPS {
        for i in -BLUR_TAPS..=BLUR_TAPS {
            let ox = i as f32 * step;
            let oy = j as f32 * step;
            let weight = gaussian_weight(ox * ox + oy * oy, sigma);
            if weight < BLUR_MIN_WEIGHT {
                continue;
            }
            let tap = sampler.sample([uv[0] + ox * texel[0], uv[1] + oy * texel[1]]);
            acc = acc + tap.scale(weight);
            total += weight;
        }
    }

    // The center tap always has weight 1, so `total` is never zero.
    acc.scale(1.0 / total)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Edge {
        width: f32,
    }

    impl TextureSampler for Edge {
        fn sample(&self, uv: [f32; 2]) -> Rgb {
            if uv[0] < 0.5 {
                Rgb::BLACK
            } else {
                Rgb::WHITE
            }
        }

        fn texel_size(&self) -> [f32; 2] {
            [1.0 / self.width, 1.0 / self.width]
        }
    }

    #[test]
    fn tiny_blur_is_a_plain_sample() {
        let edge = Edge { width: 100.0 };
        assert_eq!(blurred_sample(&edge, [0.49, 0.5], 0.05), Rgb::BLACK);
        assert_eq!(blurred_sample(&edge, [0.49, 0.5], f32::NAN), Rgb::BLACK);
    }

    #[test]
    fn blur_softens_an_edge() {
        let edge = Edge { width: 100.0 };
        let left = blurred_sample(&edge, [0.49, 0.5], 8.0);
        assert!(left.r > 0.05 && left.r < 0.5, "blurred edge value {left:?}");
        let far = blurred_sample(&edge, [0.2, 0.5], 8.0);
        assert_eq!(far, Rgb::BLACK);
    }

    #[test]
    fn blur_preserves_flat_regions() {
        struct Flat;
        impl TextureSampler for Flat {
            fn sample(&self, _uv: [f32; 2]) -> Rgb {
                Rgb::new(0.2, 0.4, 0.6)
            }
            fn texel_size(&self) -> [f32; 2] {
                [0.01, 0.01]
            }
        }
        let out = blurred_sample(&Flat, [0.5, 0.5], 20.0);
        assert!((out.r - 0.2).abs() < 1e-5);
        assert!((out.g - 0.4).abs() < 1e-5);
        assert!((out.b - 0.6).abs() < 1e-5);
    }

    #[test]
    fn corner_taps_are_skipped() {
        let sigma = 30.0 / 3.0;
        let corner = 30.0f32 * 30.0 * 2.0;
        assert!(gaussian_weight(corner, sigma) < BLUR_MIN_WEIGHT);
        assert!(gaussian_weight(30.0 * 30.0, sigma) > BLUR_MIN_WEIGHT);
    }

    #[test]
    fn sample_mode_parses() {
        assert_eq!("cellCenter".parse::<SampleMode>(), Ok(SampleMode::CellCenter));
        assert_eq!("direct".parse::<SampleMode>(), Ok(SampleMode::Direct));
        assert!("pixelate".parse::<SampleMode>().is_err());
    }
}
