//! Bitmap tonemap operators for preview and PNG output.

// others
use strum_macros::{Display, EnumString};
// wavert
use crate::core::quantity::{clamp_t, Float};
use crate::scene::expr::Expr;

/// Value-domain tonemap operator.
#[derive(Debug, Clone)]
pub enum TonemapOperator {
    Linear,
    Gamma(Float),
    Srgb,
    /// Decibel mapping of `min..max` dB onto [0, 1].
    Db { min: Float, max: Float },
    /// User expression over the scalar value `x`.
    Function(Expr),
}

/// How mapped channels turn into display colours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TonemapMode {
    /// Select a single channel.
    Select(usize),
    /// Channels map to RGB directly.
    Normal,
    Colourmap(Colourmap),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Colourmap {
    Grey,
    Viridis,
}

#[derive(Debug, Clone)]
pub struct Tonemap {
    pub operator: TonemapOperator,
    pub mode: TonemapMode,
}

impl Tonemap {
    /// The default mode: colourmap for monochromatic films, normal for
    /// polychromatic ones.
    pub fn default_for_channels(channels: usize) -> Tonemap {
        Tonemap {
            operator: TonemapOperator::Srgb,
            mode: if channels == 1 {
                TonemapMode::Colourmap(Colourmap::Viridis)
            } else {
                TonemapMode::Normal
            },
        }
    }

    fn map_value(&self, v: Float) -> Float {
        match &self.operator {
            TonemapOperator::Linear => v,
            TonemapOperator::Gamma(g) => v.max(0.0).powf(1.0 as Float / g.max(1e-6)),
            TonemapOperator::Srgb => {
                let v = v.max(0.0);
                if v <= 0.003_130_8 {
                    12.92 * v
                } else {
                    1.055 * v.powf(1.0 / 2.4) - 0.055
                }
            }
            TonemapOperator::Db { min, max } => {
                let db = 10.0 as Float * v.max(1e-30).log10();
                (db - min) / (max - min)
            }
            TonemapOperator::Function(e) => e.eval(v),
        }
    }

    /// Maps one pixel's channels to display RGB in [0, 1].
    pub fn map_pixel(&self, channels: &[Float]) -> [Float; 3] {
        let mapped: Vec<Float> = channels
            .iter()
            .map(|&v| clamp_t(self.map_value(v), 0.0, 1.0))
            .collect();
        match &self.mode {
            TonemapMode::Select(c) => {
                let v = mapped.get(*c).copied().unwrap_or(0.0);
                [v, v, v]
            }
            TonemapMode::Normal => [
                mapped.first().copied().unwrap_or(0.0),
                mapped.get(1).copied().unwrap_or_else(|| mapped[0]),
                mapped.get(2).copied().unwrap_or_else(|| mapped[0]),
            ],
            TonemapMode::Colourmap(map) => {
                let v = mapped.first().copied().unwrap_or(0.0);
                match map {
                    Colourmap::Grey => [v, v, v],
                    Colourmap::Viridis => viridis(v),
                }
            }
        }
    }
}

/// Polynomial fit of the viridis colourmap.
fn viridis(t: Float) -> [Float; 3] {
    let t = clamp_t(t, 0.0, 1.0);
    let c0 = [0.2777, 0.0054, 0.3340];
    let c1 = [0.1050, 1.4046, 1.3845];
    let c2 = [-0.3308, 0.2148, 0.0950];
    let c3 = [-4.6342, -5.7991, -19.3324];
    let c4 = [6.2282, 14.1799, 56.6905];
    let c5 = [4.7763, -13.7451, -65.3530];
    let c6 = [-5.4354, 4.6456, 26.3124];
    let mut rgb = [0.0 as Float; 3];
    for i in 0..3 {
        rgb[i] = c0[i]
            + t * (c1[i] + t * (c2[i] + t * (c3[i] + t * (c4[i] + t * (c5[i] + t * c6[i])))));
        rgb[i] = clamp_t(rgb[i], 0.0, 1.0);
    }
    rgb
}
