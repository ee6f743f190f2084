//! Color value types and the RGB → CMYK decomposition.

use std::ops::{Add, Mul};

use serde::{Deserialize, Serialize};

/// Clamp to `[0, 1]`, mapping NaN to zero so it never reaches the framebuffer.
#[inline]
pub fn unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ColorRepr")]
pub struct Rgb {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Rgb {
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0);
    pub const BLACK: Self = Self::new(0.0, 0.0, 0.0);

    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    pub fn splat(v: f32) -> Self {
        Self::new(v, v, v)
    }

    pub fn clamped(self) -> Self {
        Self::new(unit(self.r), unit(self.g), unit(self.b))
    }

    pub fn scale(self, s: f32) -> Self {
        Self::new(self.r * s, self.g * s, self.b * s)
    }

    pub fn mix(self, other: Self, t: f32) -> Self {
        Self::new(
            self.r + (other.r - self.r) * t,
            self.g + (other.g - self.g) * t,
            self.b + (other.b - self.b) * t,
        )
    }

    pub fn to_rgba8(self) -> [u8; 4] {
        let c = self.clamped();
        [to_u8(c.r), to_u8(c.g), to_u8(c.b), 255]
    }
}

/// Channel-wise product, as when ink filters the paper beneath it.
impl Mul for Rgb {
    type Output = Rgb;

    fn mul(self, other: Rgb) -> Rgb {
        Rgb::new(self.r * other.r, self.g * other.g, self.b * other.b)
    }
}

impl Add for Rgb {
    type Output = Rgb;

    fn add(self, other: Rgb) -> Rgb {
        Rgb::new(self.r + other.r, self.g + other.g, self.b + other.b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ColorRepr")]
pub struct Rgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Rgba {
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn rgb(self) -> Rgb {
        Rgb::new(self.r, self.g, self.b)
    }

    pub fn as_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// Parse `#RRGGBB` or `#RRGGBBAA` (leading `#` optional).
    pub fn parse_hex(raw: &str) -> Result<Self, String> {
        let hex = raw.trim().trim_start_matches('#');
        if hex.len() != 6 && hex.len() != 8 {
            return Err(format!("expected #RRGGBB or #RRGGBBAA, got '{raw}'"));
        }
        let byte = |index: usize| {
            u8::from_str_radix(&hex[index..index + 2], 16)
                .map(|v| f32::from(v) / 255.0)
                .map_err(|_| format!("invalid hex digits in '{raw}'"))
        };
        let a = if hex.len() == 8 { byte(6)? } else { 1.0 };
        Ok(Self::new(byte(0)?, byte(2)?, byte(4)?, a))
    }
}

/// Wire representation accepted for colors in parameter files.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ColorRepr {
    Hex(String),
    Components {
        r: f32,
        g: f32,
        b: f32,
        #[serde(default = "opaque")]
        a: f32,
    },
}

fn opaque() -> f32 {
    1.0
}

impl TryFrom<ColorRepr> for Rgba {
    type Error = String;

    fn try_from(repr: ColorRepr) -> Result<Self, Self::Error> {
        match repr {
            ColorRepr::Hex(hex) => Rgba::parse_hex(&hex),
            ColorRepr::Components { r, g, b, a } => Ok(Rgba::new(r, g, b, a)),
        }
    }
}

impl TryFrom<ColorRepr> for Rgb {
    type Error = String;

    fn try_from(repr: ColorRepr) -> Result<Self, Self::Error> {
        Rgba::try_from(repr).map(Rgba::rgb)
    }
}

#[inline]
fn to_u8(v: f32) -> u8 {
    (v * 255.0 + 0.5).floor() as u8
}

/// Process inks, always composited in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Ink {
    Cyan,
    Magenta,
    Yellow,
    Black,
}

impl Ink {
    pub const ORDER: [Ink; 4] = [Ink::Cyan, Ink::Magenta, Ink::Yellow, Ink::Black];

    pub fn index(self) -> usize {
        match self {
            Ink::Cyan => 0,
            Ink::Magenta => 1,
            Ink::Yellow => 2,
            Ink::Black => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Ink::Cyan => "cyan",
            Ink::Magenta => "magenta",
            Ink::Yellow => "yellow",
            Ink::Black => "black",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Cmyk {
    pub c: f32,
    pub m: f32,
    pub y: f32,
    pub k: f32,
}

impl Cmyk {
    pub fn channel(&self, ink: Ink) -> f32 {
        match ink {
            Ink::Cyan => self.c,
            Ink::Magenta => self.m,
            Ink::Yellow => self.y,
            Ink::Black => self.k,
        }
    }

    pub fn as_array(&self) -> [f32; 4] {
        [self.c, self.m, self.y, self.k]
    }
}

/// Grey-component-replacement CMYK: shared darkness goes to K.
pub fn rgb_to_cmyk(rgb: Rgb) -> Cmyk {
    let Rgb { r, g, b } = rgb.clamped();
    let k = 1.0 - r.max(g).max(b);
    if k >= 1.0 {
        return Cmyk {
            c: 0.0,
            m: 0.0,
            y: 0.0,
            k: 1.0,
        };
    }
    let inv = 1.0 - k;
    Cmyk {
        c: unit((1.0 - r - k) / inv),
        m: unit((1.0 - g - k) / inv),
        y: unit((1.0 - b - k) / inv),
        k: unit(k),
    }
}

/// Contrast gain around mid-grey followed by an additive lightness bias.
pub fn adjust_tone(rgb: Rgb, contrast: f32, lightness: f32) -> Rgb {
    let curve = |v: f32| (v - 0.5) * contrast + 0.5 + lightness;
    Rgb::new(curve(rgb.r), curve(rgb.g), curve(rgb.b)).clamped()
}
