//! Fade curve implementations for crossfade and resume ramps
//!
//! Each curve maps a normalized position (0.0..=1.0) to a volume
//! multiplier. Crossfades use the linear pair so the mixed overlap is an
//! exact complementary ramp; the shaped curves serve the resume fade-in.

use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_PI_2;

/// Fade curve types
///
/// - Linear: constant rate of change, exact complementary crossfade pair
/// - Exponential: slow start, fast finish (fade-in flavored)
/// - Logarithmic: fast start, slow finish (fade-out flavored)
/// - SCurve: smooth acceleration and deceleration
/// - EqualPower: constant perceived loudness across a crossfade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    /// v(t) = t
    Linear,
    /// v(t) = t²
    Exponential,
    /// v(t) = √t for fade-in, (1-t)² for fade-out
    Logarithmic,
    /// v(t) = 0.5 × (1 − cos(π·t))
    SCurve,
    /// v(t) = sin(t·π/2)
    EqualPower,
}

impl FadeCurve {
    /// Fade-in multiplier at a normalized position (0.0 = silent start,
    /// 1.0 = full volume).
    pub fn fade_in(&self, position: f32) -> f32 {
        let t = position.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => t,
            FadeCurve::Exponential => t * t,
            FadeCurve::Logarithmic => t.sqrt(),
            FadeCurve::SCurve => 0.5 * (1.0 - (std::f32::consts::PI * t).cos()),
            FadeCurve::EqualPower => (t * FRAC_PI_2).sin(),
        }
    }

    /// Fade-out multiplier at a normalized position (0.0 = full volume,
    /// 1.0 = silent end).
    pub fn fade_out(&self, position: f32) -> f32 {
        let t = position.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => 1.0 - t,
            FadeCurve::Exponential => {
                let inv = 1.0 - t;
                inv * inv
            }
            FadeCurve::Logarithmic => {
                let inv = 1.0 - t;
                inv * inv
            }
            FadeCurve::SCurve => 0.5 * (1.0 + (std::f32::consts::PI * t).cos()),
            FadeCurve::EqualPower => (t * FRAC_PI_2).cos(),
        }
    }

    /// All curve variants, for validation and tests.
    pub fn all_variants() -> &'static [FadeCurve] {
        &[
            FadeCurve::Linear,
            FadeCurve::Exponential,
            FadeCurve::Logarithmic,
            FadeCurve::SCurve,
            FadeCurve::EqualPower,
        ]
    }
}

impl Default for FadeCurve {
    fn default() -> Self {
        FadeCurve::Linear
    }
}

impl std::fmt::Display for FadeCurve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FadeCurve::Linear => "Linear",
            FadeCurve::Exponential => "Exponential",
            FadeCurve::Logarithmic => "Logarithmic",
            FadeCurve::SCurve => "S-Curve",
            FadeCurve::EqualPower => "Equal Power",
        };
        write!(f, "{}", name)
    }
}
