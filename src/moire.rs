//! Fallback toward the plain source when the screen is denser than the display.

use crate::dot::smoothstep;

/// Screen density (cells per output pixel) where the fallback starts.
pub const MOIRE_START: f32 = 0.7;
/// Density at which the output is entirely the unscreened source.
pub const MOIRE_END: f32 = 1.4;

/// Halftone cells covered by one output pixel.
#[inline]
pub fn cells_per_pixel(frequency: f32, st_per_pixel: f32) -> f32 {
    frequency * st_per_pixel
}

/// Blend factor toward the unscreened source color.
///
/// Without derivative information no density estimate is trusted and the
/// factor stays at zero.
pub fn moire_fallback(frequency: f32, st_per_pixel: Option<f32>) -> f32 {
    match st_per_pixel {
        Some(step) if step.is_finite() && step > 0.0 => {
            smoothstep(MOIRE_START, MOIRE_END, cells_per_pixel(frequency, step))
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_screens_keep_full_halftone() {
        // 85 cells across a 600 px tall canvas.
        assert_eq!(moire_fallback(85.0, Some(1.0 / 600.0)), 0.0);
    }

    #[test]
    fn dense_screens_fall_back_to_source() {
        // 200 cells across a 100 px tall thumbnail.
        assert_eq!(moire_fallback(200.0, Some(1.0 / 100.0)), 1.0);
    }

    #[test]
    fn ramp_is_smooth_and_monotone() {
        let mut last = 0.0;
        for h in (40..=200).rev() {
            let f = moire_fallback(100.0, Some(1.0 / h as f32));
            assert!(f >= last - 1e-6, "fallback must not decrease as density grows");
            assert!((0.0..=1.0).contains(&f));
            last = f;
        }
        let mid = moire_fallback(100.0, Some(1.05 / 100.0));
        assert!(mid > 0.3 && mid < 0.7, "mid-ramp factor {mid}");
    }

    #[test]
    fn disabled_without_derivatives() {
        assert_eq!(moire_fallback(1000.0, None), 0.0);
        assert_eq!(moire_fallback(1000.0, Some(f32::NAN)), 0.0);
    }
}
