//! Per-channel screened dot coverage.
//!
//! A channel's screen is a square grid rotated by the channel angle and
//! scaled by `frequency`. Each cell holds one dot whose radius grows with the
//! square of the tone. Coordinates passed in here are aspect corrected
//! (`st`, see [`aspect_corrected`]) so one unit is the canvas height on both
//! axes and dots stay round on any canvas shape.

use std::f32::consts::TAU;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::color::unit;
use crate::noise::hash2;
use crate::params::HalftoneParameters;

/// Edge width used when screen-space derivatives are unavailable.
pub const FIXED_AA_WIDTH: f32 = 0.05;
/// Fraction of one pixel's footprint used as the anti-aliasing half width.
pub const AA_PIXEL_FRACTION: f32 = 0.7;
/// Roughness noise only perturbs dots above this tone.
pub const ROUGHNESS_TONE_FLOOR: f32 = 0.1;

const JITTER_AXIS_OFFSET: [f32; 2] = [127.0, 311.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoughnessStyle {
    /// Radius perturbed by the paper noise field.
    #[default]
    Smooth,
    /// Per-cell polygonal dots with punched-out elliptical cracks.
    Cracked,
}

impl RoughnessStyle {
    pub fn as_u32(self) -> u32 {
        match self {
            RoughnessStyle::Smooth => 0,
            RoughnessStyle::Cracked => 1,
        }
    }
}

impl FromStr for RoughnessStyle {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "smooth" | "0" => Ok(Self::Smooth),
            "cracked" | "1" => Ok(Self::Cracked),
            other => Err(format!(
                "unknown roughness style '{other}' (expected smooth or cracked)"
            )),
        }
    }
}

/// The global screen settings shared by all four channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DotScreen {
    pub frequency: f32,
    pub dot_size: f32,
    pub roughness: f32,
    pub fuzz: f32,
    pub randomness: f32,
    pub threshold: f32,
    pub style: RoughnessStyle,
}

impl From<&HalftoneParameters> for DotScreen {
    fn from(params: &HalftoneParameters) -> Self {
        Self {
            frequency: params.frequency,
            dot_size: params.dot_size,
            roughness: params.roughness,
            fuzz: params.fuzz,
            randomness: params.randomness,
            threshold: params.threshold,
            style: params.roughness_style,
        }
    }
}

/// Location of a sample inside its (possibly jittered) screen cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenCell {
    /// Integer cell index on the rotated grid.
    pub cell: [f32; 2],
    /// Dot-center displacement in cell units.
    pub jitter: [f32; 2],
    /// Sample position relative to the dot center, about `[-1, 1]`.
    pub local: [f32; 2],
}

/// Map a texture coordinate to aspect-corrected screen space.
#[inline]
pub fn aspect_corrected(uv: [f32; 2], resolution: [f32; 2]) -> [f32; 2] {
    let aspect = if resolution[1] > 0.0 {
        resolution[0] / resolution[1]
    } else {
        1.0
    };
    [uv[0] * aspect, uv[1]]
}

/// Inverse of [`aspect_corrected`].
#[inline]
pub fn uv_from_screen(st: [f32; 2], resolution: [f32; 2]) -> [f32; 2] {
    let aspect = if resolution[1] > 0.0 {
        resolution[0] / resolution[1]
    } else {
        1.0
    };
    [st[0] / aspect, st[1]]
}

#[inline]
pub fn rotate(p: [f32; 2], angle: f32) -> [f32; 2] {
    let (s, c) = angle.sin_cos();
    [c * p[0] - s * p[1], s * p[0] + c * p[1]]
}

/// Find the rotated screen cell for `st` and the sample's offset from its dot center.
pub fn locate_cell(st: [f32; 2], angle: f32, frequency: f32, randomness: f32) -> ScreenCell {
    let r = rotate(st, angle);
    let grid = [r[0] * frequency, r[1] * frequency];
    let cell = [grid[0].floor(), grid[1].floor()];
    let jitter = cell_jitter(cell, randomness);
    let local = [
        (grid[0] - cell[0] - 0.5 - jitter[0]) * 2.0,
        (grid[1] - cell[1] - 0.5 - jitter[1]) * 2.0,
    ];
    ScreenCell {
        cell,
        jitter,
        local,
    }
}

/// Hash-derived dot-center offset for a cell, up to `randomness` cells per axis.
#[inline]
pub fn cell_jitter(cell: [f32; 2], randomness: f32) -> [f32; 2] {
    if randomness <= 0.0 {
        return [0.0, 0.0];
    }
    let jx = hash2(cell[0], cell[1]) - 0.5;
    let jy = hash2(cell[0] + JITTER_AXIS_OFFSET[0], cell[1] + JITTER_AXIS_OFFSET[1]) - 0.5;
    [jx * 2.0 * randomness, jy * 2.0 * randomness]
}

/// Screen-space position of the (jittered) dot center that owns `cell`.
pub fn cell_center_screen(cell: &ScreenCell, angle: f32, frequency: f32) -> [f32; 2] {
    let grid = [
        cell.cell[0] + 0.5 + cell.jitter[0],
        cell.cell[1] + 0.5 + cell.jitter[1],
    ];
    let scaled = [grid[0] / frequency, grid[1] / frequency];
    rotate(scaled, -angle)
}

/// Anti-aliasing half width for a sample whose local coordinate moves
/// `local_step` per pixel.
#[inline]
pub fn aa_width(local_step: Option<f32>) -> f32 {
    match local_step {
        Some(step) if step.is_finite() && step > 0.0 => AA_PIXEL_FRACTION * step,
        _ => FIXED_AA_WIDTH,
    }
}

#[inline]
pub fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = unit((x - edge0) / (edge1 - edge0));
    t * t * (3.0 - 2.0 * t)
}

/// Dot coverage in `[0, 1]` for one channel at one sample.
///
/// `noise` is the paper noise value at the sample and `aa` the edge half
/// width from [`aa_width`]. Tones below the threshold produce no dot at all.
pub fn dot_coverage(
    st: [f32; 2],
    tone: f32,
    angle: f32,
    screen: &DotScreen,
    noise: f32,
    aa: f32,
) -> f32 {
    if tone.is_nan() || tone < screen.threshold {
        return 0.0;
    }
    let tone = unit(tone);
    let cell = locate_cell(st, angle, screen.frequency, screen.randomness);
    coverage_in_cell(&cell, tone, screen, noise, aa)
}

/// Coverage for an already located cell. Split out so callers that need the
/// cell (cell-center sampling) do not locate it twice.
pub fn coverage_in_cell(
    cell: &ScreenCell,
    tone: f32,
    screen: &DotScreen,
    noise: f32,
    aa: f32,
) -> f32 {
    if tone.is_nan() || tone < screen.threshold {
        return 0.0;
    }
    let tone = unit(tone);
    let mut radius = tone * tone * screen.dot_size;
    let dist = length(cell.local);

    let dist = match screen.style {
        RoughnessStyle::Smooth => {
            if tone > ROUGHNESS_TONE_FLOOR {
                radius += screen.roughness * noise * tone;
            }
            dist
        }
        RoughnessStyle::Cracked => polygon_distance(cell, dist, screen.roughness),
    };

    if radius.is_nan() || radius <= 0.0 {
        return 0.0;
    }

    let aa = aa.max(1e-4);
    let edge = radius - dist;
    let crisp = smoothstep(-aa, aa, edge);
    let mut coverage = if screen.fuzz > 0.0 {
        let soft = smoothstep(-screen.fuzz, 0.0, edge);
        let weight = screen.fuzz / (screen.fuzz + aa);
        crisp + (soft - crisp) * weight
    } else {
        crisp
    };

    if screen.style == RoughnessStyle::Cracked {
        coverage *= 1.0 - crack_hole(cell, radius, screen.roughness);
    }

    unit(coverage)
}

#[inline]
fn length(p: [f32; 2]) -> f32 {
    (p[0] * p[0] + p[1] * p[1]).sqrt()
}

/// Distance measured against a per-cell regular polygon (5 to 8 sides)
/// whose circumradius matches the circle, blended in by roughness.
fn polygon_distance(cell: &ScreenCell, dist: f32, roughness: f32) -> f32 {
    if dist < 1e-6 || roughness <= 0.0 {
        return dist;
    }
    let [cx, cy] = cell.cell;
    let sides = 5.0 + (hash2(cx + 53.0, cy + 17.0) * 4.0).floor();
    let spin = hash2(cx + 7.0, cy + 91.0) * TAU;
    let segment = TAU / sides;
    let angle = cell.local[1].atan2(cell.local[0]) + spin;
    let phi = angle.rem_euclid(segment) - segment * 0.5;
    let poly = dist * phi.cos() / (segment * 0.5).cos();
    dist + (poly - dist) * roughness.min(1.0)
}

/// Opacity of an elliptical hole punched into the dot, 0 when the cell has none.
fn crack_hole(cell: &ScreenCell, radius: f32, roughness: f32) -> f32 {
    let [cx, cy] = cell.cell;
    if hash2(cx + 211.0, cy + 59.0) >= (roughness * 0.5).min(1.0) {
        return 0.0;
    }
    let orientation = hash2(cx + 3.0, cy + 233.0) * TAU;
    let offset = [
        (hash2(cx + 41.0, cy + 11.0) - 0.5) * radius,
        (hash2(cx + 13.0, cy + 97.0) - 0.5) * radius,
    ];
    let p = rotate(
        [cell.local[0] - offset[0], cell.local[1] - offset[1]],
        -orientation,
    );
    let major = 0.45 * radius + 1e-4;
    let minor = 0.12 * radius + 1e-4;
    let e = ((p[0] / major).powi(2) + (p[1] / minor).powi(2)).sqrt();
    1.0 - smoothstep(0.85, 1.0, e)
}
