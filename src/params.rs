//! The halftone parameter snapshot and its file/override surface.
//!
//! A [`HalftoneParameters`] value is read-only once handed to a renderer.
//! Hosts edit their own copy (usually through [`HalftoneParameters::set_named`])
//! and publish a fresh snapshot for the next render.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::color::{unit, Ink, Rgb, Rgba};
use crate::composite::BlendMode;
use crate::dot::RoughnessStyle;
use crate::error::HalftoneError;
use crate::prefilter::SampleMode;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InkChannel {
    /// Screen rotation in degrees.
    pub angle: f32,
    /// Ink color; alpha is ink opacity.
    pub color: Rgba,
    pub visible: bool,
}

impl InkChannel {
    pub const fn new(angle: f32, color: Rgba) -> Self {
        Self {
            angle,
            color,
            visible: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct HalftoneParameters {
    pub frequency: f32,
    pub dot_size: f32,
    pub roughness: f32,
    pub fuzz: f32,
    pub paper_noise: f32,
    pub ink_noise: f32,
    pub randomness: f32,
    pub contrast: f32,
    pub lightness: f32,
    pub blur: f32,
    pub threshold: f32,
    pub ink_density: f32,
    pub blend_mode: BlendMode,
    pub sample_mode: SampleMode,
    pub roughness_style: RoughnessStyle,
    pub anti_alias: bool,
    pub paper_color: Rgb,
    pub cyan: InkChannel,
    pub magenta: InkChannel,
    pub yellow: InkChannel,
    pub black: InkChannel,
}

impl Default for HalftoneParameters {
    fn default() -> Self {
        Self {
            frequency: 85.0,
            dot_size: 0.85,
            roughness: 0.15,
            fuzz: 0.1,
            paper_noise: 0.05,
            ink_noise: 0.1,
            randomness: 0.0,
            contrast: 1.0,
            lightness: 0.0,
            blur: 0.0,
            threshold: 0.05,
            ink_density: 0.9,
            blend_mode: BlendMode::Subtractive,
            sample_mode: SampleMode::Direct,
            roughness_style: RoughnessStyle::Smooth,
            anti_alias: true,
            paper_color: Rgb::new(0.97, 0.95, 0.9),
            cyan: InkChannel::new(15.0, Rgba::new(0.0, 0.682, 0.937, 1.0)),
            magenta: InkChannel::new(75.0, Rgba::new(0.925, 0.0, 0.549, 1.0)),
            yellow: InkChannel::new(0.0, Rgba::new(1.0, 0.949, 0.0, 1.0)),
            black: InkChannel::new(45.0, Rgba::new(0.137, 0.122, 0.125, 1.0)),
        }
    }
}

/// Documented range for a scalar parameter.
#[derive(Debug, Clone, Copy)]
pub struct ParamRange {
    pub name: &'static str,
    pub min: f32,
    pub max: f32,
}

pub const SCALAR_RANGES: [ParamRange; 12] = [
    ParamRange {
        name: "frequency",
        min: 1.0,
        max: 1000.0,
    },
    ParamRange {
        name: "dotSize",
        min: 0.1,
        max: 1.0,
    },
    ParamRange {
        name: "roughness",
        min: 0.0,
        max: 2.0,
    },
    ParamRange {
        name: "fuzz",
        min: 0.0,
        max: 0.5,
    },
    ParamRange {
        name: "paperNoise",
        min: 0.0,
        max: 1.0,
    },
    ParamRange {
        name: "inkNoise",
        min: 0.0,
        max: 1.0,
    },
    ParamRange {
        name: "randomness",
        min: 0.0,
        max: 0.4,
    },
    ParamRange {
        name: "contrast",
        min: 0.3,
        max: 2.0,
    },
    ParamRange {
        name: "lightness",
        min: -1.0,
        max: 1.0,
    },
    ParamRange {
        name: "blur",
        min: 0.0,
        max: 30.0,
    },
    ParamRange {
        name: "threshold",
        min: 0.0,
        max: 0.5,
    },
    ParamRange {
        name: "inkDensity",
        min: 0.0,
        max: 1.0,
    },
];

fn range_of(name: &str) -> ParamRange {
    SCALAR_RANGES
        .iter()
        .copied()
        .find(|range| range.name == name)
        .unwrap_or(ParamRange {
            name: "",
            min: f32::MIN,
            max: f32::MAX,
        })
}

fn clamp_or(value: f32, fallback: f32, name: &str) -> f32 {
    let range = range_of(name);
    if value.is_finite() {
        value.clamp(range.min, range.max)
    } else {
        fallback
    }
}

fn sanitize_color(color: Rgba) -> Rgba {
    Rgba::new(unit(color.r), unit(color.g), unit(color.b), unit(color.a))
}

fn sanitize_angle(angle: f32, fallback: f32) -> f32 {
    if angle.is_finite() {
        angle.rem_euclid(360.0)
    } else {
        fallback
    }
}

impl HalftoneParameters {
    pub fn ink(&self, ink: Ink) -> &InkChannel {
        match ink {
            Ink::Cyan => &self.cyan,
            Ink::Magenta => &self.magenta,
            Ink::Yellow => &self.yellow,
            Ink::Black => &self.black,
        }
    }

    pub fn ink_mut(&mut self, ink: Ink) -> &mut InkChannel {
        match ink {
            Ink::Cyan => &mut self.cyan,
            Ink::Magenta => &mut self.magenta,
            Ink::Yellow => &mut self.yellow,
            Ink::Black => &mut self.black,
        }
    }

    /// Screen angle of a channel in radians.
    pub fn angle_radians(&self, ink: Ink) -> f32 {
        self.ink(ink).angle.to_radians()
    }

    /// Copy with every value pulled into its documented range; non-finite
    /// values fall back to the defaults.
    pub fn sanitized(&self) -> Self {
        let d = Self::default();
        let mut out = Self {
            frequency: clamp_or(self.frequency, d.frequency, "frequency"),
            dot_size: clamp_or(self.dot_size, d.dot_size, "dotSize"),
            roughness: clamp_or(self.roughness, d.roughness, "roughness"),
            fuzz: clamp_or(self.fuzz, d.fuzz, "fuzz"),
            paper_noise: clamp_or(self.paper_noise, d.paper_noise, "paperNoise"),
            ink_noise: clamp_or(self.ink_noise, d.ink_noise, "inkNoise"),
            randomness: clamp_or(self.randomness, d.randomness, "randomness"),
            contrast: clamp_or(self.contrast, d.contrast, "contrast"),
            lightness: clamp_or(self.lightness, d.lightness, "lightness"),
            blur: clamp_or(self.blur, d.blur, "blur"),
            threshold: clamp_or(self.threshold, d.threshold, "threshold"),
            ink_density: clamp_or(self.ink_density, d.ink_density, "inkDensity"),
            paper_color: Rgb::new(
                unit(self.paper_color.r),
                unit(self.paper_color.g),
                unit(self.paper_color.b),
            ),
            ..*self
        };
        for ink in Ink::ORDER {
            let fallback = d.ink(ink).angle;
            let channel = out.ink_mut(ink);
            channel.angle = sanitize_angle(channel.angle, fallback);
            channel.color = sanitize_color(channel.color);
        }
        out
    }

    /// Set one parameter by its public name, e.g. `dotSize`, `cyanAngle`,
    /// `showBlack` or `paperColor`. Snake case names are accepted too.
    pub fn set_named(&mut self, name: &str, raw: &str) -> Result<(), HalftoneError> {
        let key = normalize_key(name);
        let value = raw.trim();

        if let Some((ink, field)) = split_ink_key(&key) {
            let channel = self.ink_mut(ink);
            match field {
                "angle" => channel.angle = parse_f32(name, value)?,
                "color" => {
                    channel.color = Rgba::parse_hex(value)
                        .map_err(|reason| HalftoneError::invalid_parameter(name, reason))?
                }
                "visible" => channel.visible = parse_bool(name, value)?,
                _ => return Err(HalftoneError::invalid_parameter(name, "unknown ink field")),
            }
            return Ok(());
        }

        match key.as_str() {
            "frequency" => self.frequency = parse_f32(name, value)?,
            "dotsize" => self.dot_size = parse_f32(name, value)?,
            "roughness" => self.roughness = parse_f32(name, value)?,
            "fuzz" => self.fuzz = parse_f32(name, value)?,
            "papernoise" => self.paper_noise = parse_f32(name, value)?,
            "inknoise" => self.ink_noise = parse_f32(name, value)?,
            "randomness" => self.randomness = parse_f32(name, value)?,
            "contrast" => self.contrast = parse_f32(name, value)?,
            "lightness" => self.lightness = parse_f32(name, value)?,
            "blur" => self.blur = parse_f32(name, value)?,
            "threshold" => self.threshold = parse_f32(name, value)?,
            "inkdensity" => self.ink_density = parse_f32(name, value)?,
            "antialias" => self.anti_alias = parse_bool(name, value)?,
            "blendmode" => {
                self.blend_mode = value
                    .parse()
                    .map_err(|reason: String| HalftoneError::invalid_parameter(name, reason))?
            }
            "samplemode" => {
                self.sample_mode = value
                    .parse()
                    .map_err(|reason: String| HalftoneError::invalid_parameter(name, reason))?
            }
            "roughnessstyle" => {
                self.roughness_style = value
                    .parse()
                    .map_err(|reason: String| HalftoneError::invalid_parameter(name, reason))?
            }
            "papercolor" => {
                self.paper_color = Rgba::parse_hex(value)
                    .map(Rgba::rgb)
                    .map_err(|reason| HalftoneError::invalid_parameter(name, reason))?
            }
            _ => return Err(HalftoneError::invalid_parameter(name, "unknown parameter")),
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &[ParamOverride]) -> Result<(), HalftoneError> {
        for item in overrides {
            self.set_named(&item.name, &item.value)?;
        }
        Ok(())
    }
}

fn normalize_key(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-' && *c != '.')
        .flat_map(char::to_lowercase)
        .collect()
}

/// `cyanAngle`, `cyan.angle`, `cyan_visible`, `showCyan` → (ink, field).
fn split_ink_key(key: &str) -> Option<(Ink, &str)> {
    for ink in Ink::ORDER {
        let name = ink.name();
        if key == format!("show{name}") {
            return Some((ink, "visible"));
        }
        if let Some(field) = key.strip_prefix(name) {
            if !field.is_empty() {
                return Some((ink, field));
            }
        }
    }
    None
}

fn parse_f32(name: &str, raw: &str) -> Result<f32, HalftoneError> {
    let value: f32 = raw
        .parse()
        .map_err(|_| HalftoneError::invalid_parameter(name, format!("'{raw}' is not a number")))?;
    if !value.is_finite() {
        return Err(HalftoneError::invalid_parameter(
            name,
            format!("'{raw}' is not finite"),
        ));
    }
    Ok(value)
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, HalftoneError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(HalftoneError::invalid_parameter(
            name,
            format!("'{raw}' is not a boolean"),
        )),
    }
}

/// A `name=value` assignment from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamOverride {
    pub name: String,
    pub value: String,
}

impl ParamOverride {
    pub fn parse(raw: &str) -> Result<Self> {
        let (name, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("override '{raw}' must look like name=value"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("override '{raw}' has an empty parameter name"));
        }
        Ok(Self {
            name: name.to_owned(),
            value: value.trim().to_owned(),
        })
    }
}

/// Load a parameter file. `.json` files are read as JSON, everything else as YAML.
pub fn load_parameters(path: &Path) -> Result<HalftoneParameters> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read parameters {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        return serde_json::from_str(&contents).map_err(|error| {
            anyhow!(
                "failed to parse json in {} at line {}, column {}: {}",
                path.display(),
                error.line(),
                error.column(),
                error
            )
        });
    }

    serde_yaml::from_str(&contents).map_err(|error| {
        let location = error
            .location()
            .map(|location| format!("line {}, column {}", location.line(), location.column()))
            .unwrap_or_else(|| "unknown location".to_owned());
        anyhow!(
            "failed to parse yaml in {} at {}: {}",
            path.display(),
            location,
            error
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_offset_screen_angles() {
        let p = HalftoneParameters::default();
        let angles: Vec<f32> = Ink::ORDER.iter().map(|ink| p.ink(*ink).angle).collect();
        assert_eq!(angles, vec![15.0, 75.0, 0.0, 45.0]);
        assert_eq!(p.blend_mode, BlendMode::Subtractive);
    }

    #[test]
    fn sanitized_clamps_and_replaces_non_finite() {
        let p = HalftoneParameters {
            frequency: f32::NAN,
            dot_size: 4.0,
            threshold: -1.0,
            blur: f32::INFINITY,
            paper_color: Rgb::new(2.0, -1.0, 0.5),
            cyan: InkChannel::new(-30.0, Rgba::new(1.5, 0.0, 0.0, 2.0)),
            ..HalftoneParameters::default()
        }
        .sanitized();
        assert_eq!(p.frequency, 85.0);
        assert_eq!(p.dot_size, 1.0);
        assert_eq!(p.threshold, 0.0);
        assert_eq!(p.blur, 0.0);
        assert_eq!(p.paper_color, Rgb::new(1.0, 0.0, 0.5));
        assert_eq!(p.cyan.angle, 330.0);
        assert_eq!(p.cyan.color.a, 1.0);
    }

    #[test]
    fn scalar_ranges_bound_every_named_parameter() {
        let bounds: [(f32, fn(&ParamRange) -> f32); 2] =
            [(1000.0, |r| r.max), (-1000.0, |r| r.min)];
        for (overshoot, pick) in bounds {
            let mut p = HalftoneParameters::default();
            for range in &SCALAR_RANGES {
                assert!(range.min < range.max, "{} has an empty range", range.name);
                let raw = (pick(range) + overshoot).to_string();
                p.set_named(range.name, &raw)
                    .unwrap_or_else(|e| panic!("{} should be settable: {e}", range.name));
            }
            let json = serde_json::to_value(p.sanitized()).expect("serialize");
            for range in &SCALAR_RANGES {
                let value = json[range.name].as_f64().expect("numeric field");
                assert!(
                    (value - f64::from(pick(range))).abs() < 1e-4,
                    "{} clamped to {value}",
                    range.name
                );
            }
        }
    }

    #[test]
    fn every_parameter_is_settable_by_name() {
        let mut p = HalftoneParameters::default();
        let assignments = [
            ("frequency", "120"),
            ("dotSize", "0.5"),
            ("roughness", "1.2"),
            ("fuzz", "0.3"),
            ("paperNoise", "0.4"),
            ("inkNoise", "0.6"),
            ("randomness", "0.2"),
            ("contrast", "1.5"),
            ("lightness", "-0.1"),
            ("blur", "6"),
            ("threshold", "0.2"),
            ("inkDensity", "1"),
            ("blendMode", "normal"),
            ("sampleMode", "cellCenter"),
            ("roughnessStyle", "cracked"),
            ("antiAlias", "false"),
            ("paperColor", "#000000"),
            ("cyanAngle", "20"),
            ("magenta_color", "#FF00FF80"),
            ("yellow.visible", "no"),
            ("showBlack", "0"),
        ];
        for (name, value) in assignments {
            p.set_named(name, value)
                .unwrap_or_else(|e| panic!("{name} should be settable: {e}"));
        }
        assert_eq!(p.frequency, 120.0);
        assert_eq!(p.dot_size, 0.5);
        assert_eq!(p.blend_mode, BlendMode::Normal);
        assert_eq!(p.sample_mode, SampleMode::CellCenter);
        assert_eq!(p.roughness_style, RoughnessStyle::Cracked);
        assert!(!p.anti_alias);
        assert_eq!(p.paper_color, Rgb::BLACK);
        assert_eq!(p.cyan.angle, 20.0);
        assert!((p.magenta.color.a - 128.0 / 255.0).abs() < 1e-6);
        assert!(!p.yellow.visible);
        assert!(!p.black.visible);
    }

    #[test]
    fn set_named_rejects_unknown_and_garbage() {
        let mut p = HalftoneParameters::default();
        assert!(p.set_named("gamma", "1").is_err());
        assert!(p.set_named("frequency", "lots").is_err());
        assert!(p.set_named("frequency", "NaN").is_err());
        assert!(p.set_named("cyanVisible", "maybe").is_err());
        assert!(p.set_named("blendMode", "screen").is_err());
        assert_eq!(p, HalftoneParameters::default());
    }

    #[test]
    fn override_parsing_splits_on_first_equals() {
        let item = ParamOverride::parse("paperColor=#FFEEDD").expect("valid override");
        assert_eq!(item.name, "paperColor");
        assert_eq!(item.value, "#FFEEDD");
        assert!(ParamOverride::parse("frequency").is_err());
        assert!(ParamOverride::parse("=3").is_err());
    }

    #[test]
    fn yaml_round_trip_preserves_snapshot() {
        let mut p = HalftoneParameters::default();
        p.set_named("blendMode", "additive").expect("valid");
        p.set_named("cyanAngle", "22.5").expect("valid");
        let yaml = serde_yaml::to_string(&p).expect("serialize");
        let back: HalftoneParameters = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(back, p);
    }

    #[test]
    fn partial_yaml_fills_defaults_and_rejects_unknown_keys() {
        let p: HalftoneParameters = serde_yaml::from_str(
            "frequency: 150\nblack: { angle: 30, color: '#000000', visible: false }\n",
        )
        .expect("partial file parses");
        assert_eq!(p.frequency, 150.0);
        assert!(!p.black.visible);
        assert_eq!(p.dot_size, HalftoneParameters::default().dot_size);

        let err = serde_yaml::from_str::<HalftoneParameters>("frequncy: 150\n");
        assert!(err.is_err());
    }
}
