//! Hash and coherent noise used for paper grain and dot jitter.
//!
//! Every function here is a pure function of its coordinates. The WGSL
//! kernel in `shaders/wgsl/halftone.wgsl` carries bit-identical integer
//! hashing so CPU and GPU renders pick the same jitter for the same cell.

pub const PAPER_OCTAVES: usize = 4;
pub const PAPER_GAIN: f32 = 0.55;
pub const PAPER_LACUNARITY: f32 = 2.2;

/// Offsets applied per octave so successive octaves do not share a lattice origin.
const OCTAVE_SHIFT: [f32; 2] = [19.19, 7.31];

// Skew/unskew factors for the 2D simplex lattice.
const F2: f32 = 0.366_025_42;
const G2: f32 = 0.211_324_87;

const GRADIENTS: [[f32; 2]; 8] = [
    [1.0, 0.0],
    [-1.0, 0.0],
    [0.0, 1.0],
    [0.0, -1.0],
    [0.707_106_8, 0.707_106_8],
    [-0.707_106_8, 0.707_106_8],
    [0.707_106_8, -0.707_106_8],
    [-0.707_106_8, -0.707_106_8],
];

#[inline]
fn mix_u32(mut x: u32) -> u32 {
    x = x.wrapping_mul(0x045d_9f3b);
    x ^= x >> 16;
    x = x.wrapping_mul(0x045d_9f3b);
    x ^= x >> 16;
    x
}

#[inline]
fn lattice_hash(ix: i32, iy: i32) -> u32 {
    mix_u32(
        (ix as u32)
            .wrapping_mul(374_761_393)
            .wrapping_add((iy as u32).wrapping_mul(668_265_263)),
    )
}

/// Pseudo-random scalar in `[0, 1)` for the lattice cell containing `(x, y)`.
///
/// Callers jittering both axes should hash with different coordinate offsets
/// per axis so the X and Y displacements are uncorrelated.
#[inline]
pub fn hash2(x: f32, y: f32) -> f32 {
    let h = lattice_hash(x.floor() as i32, y.floor() as i32);
    (h >> 8) as f32 / 16_777_216.0
}

/// 2D simplex noise, roughly in `[-1, 1]` and continuous everywhere.
pub fn coherent_noise2(x: f32, y: f32) -> f32 {
    let s = (x + y) * F2;
    let i = (x + s).floor();
    let j = (y + s).floor();
    let t = (i + j) * G2;
    let x0 = x - (i - t);
    let y0 = y - (j - t);

    let (i1, j1) = if x0 > y0 { (1, 0) } else { (0, 1) };
    let x1 = x0 - i1 as f32 + G2;
    let y1 = y0 - j1 as f32 + G2;
    let x2 = x0 - 1.0 + 2.0 * G2;
    let y2 = y0 - 1.0 + 2.0 * G2;

    let ii = i as i32;
    let jj = j as i32;
    let n0 = corner(ii, jj, x0, y0);
    let n1 = corner(ii.wrapping_add(i1), jj.wrapping_add(j1), x1, y1);
    let n2 = corner(ii.wrapping_add(1), jj.wrapping_add(1), x2, y2);

    (70.0 * (n0 + n1 + n2)).clamp(-1.0, 1.0)
}

#[inline]
fn corner(ix: i32, iy: i32, x: f32, y: f32) -> f32 {
    let t = 0.5 - x * x - y * y;
    if t <= 0.0 {
        return 0.0;
    }
    let g = GRADIENTS[(lattice_hash(ix, iy) & 7) as usize];
    let t2 = t * t;
    t2 * t2 * (g[0] * x + g[1] * y)
}

/// Four-octave fractal sum of [`coherent_noise2`], normalized to `[-1, 1]`.
///
/// This is the single noise field shared by paper mottling, ink density and
/// the smooth roughness model, so grain in the paper and the ink correlate.
pub fn paper_noise(x: f32, y: f32) -> f32 {
    let mut sum = 0.0;
    let mut amplitude = 1.0;
    let mut frequency = 1.0;
    let mut norm = 0.0;

    for octave in 0..PAPER_OCTAVES {
        let shift = octave as f32;
        sum += amplitude
            * coherent_noise2(
                x * frequency + shift * OCTAVE_SHIFT[0],
                y * frequency + shift * OCTAVE_SHIFT[1],
            );
        norm += amplitude;
        amplitude *= PAPER_GAIN;
        frequency *= PAPER_LACUNARITY;
    }

    sum / norm
}
