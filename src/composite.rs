//! Ink-over-paper compositing.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::color::{unit, Rgb};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlendMode {
    /// Ink multiplies the light already on the page.
    #[default]
    #[serde(alias = "multiply")]
    Subtractive,
    /// Ink adds luminance, for light inks on dark stock.
    Additive,
    /// Straight alpha over.
    Normal,
}

impl BlendMode {
    pub fn as_u32(self) -> u32 {
        match self {
            BlendMode::Subtractive => 0,
            BlendMode::Additive => 1,
            BlendMode::Normal => 2,
        }
    }
}

impl FromStr for BlendMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "subtractive" | "multiply" | "0" => Ok(Self::Subtractive),
            "additive" | "add" | "1" => Ok(Self::Additive),
            "normal" | "2" => Ok(Self::Normal),
            other => Err(format!(
                "unknown blend mode '{other}' (expected subtractive, additive or normal)"
            )),
        }
    }
}

/// Lay one ink over the running composite.
#[inline]
pub fn blend(screen: Rgb, ink: Rgb, alpha: f32, mode: BlendMode) -> Rgb {
    let alpha = unit(alpha);
    match mode {
        BlendMode::Subtractive => screen.mix(screen * ink, alpha),
        BlendMode::Additive => (screen + ink.scale(alpha)).clamped(),
        BlendMode::Normal => screen.mix(ink, alpha),
    }
}

/// Paper color mottled by the shared noise field.
#[inline]
pub fn paper_base(paper: Rgb, paper_noise: f32, noise: f32) -> Rgb {
    let shift = paper_noise * noise;
    Rgb::new(paper.r - shift, paper.g - shift, paper.b - shift).clamped()
}

/// Effective opacity of one ink sample: ink alpha × dot coverage × grain-modulated density.
#[inline]
pub fn ink_alpha(ink_opacity: f32, coverage: f32, ink_density: f32, ink_noise: f32, noise: f32) -> f32 {
    let amount = ink_density - ink_noise * noise;
    unit(ink_opacity * coverage * amount)
}
