//! Emission and sensitivity spectra over wavenumbers.

// others
use serde::{Deserialize, Serialize};
// wavert
use crate::core::quantity::{Float, Length, Wavenumber, WavenumberRange, TWO_PI};
use crate::core::sampling::PiecewiseLinearDistribution;

/// Probability of a spectral sample: a continuous density over wavenumber,
/// or a discrete mass for line spectra.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum SpectralPd {
    /// Density per unit wavenumber (units of metres).
    Density(Float),
    /// Probability mass of a discrete line.
    Mass(Float),
}

impl SpectralPd {
    pub fn is_discrete(&self) -> bool {
        matches!(self, SpectralPd::Mass(_))
    }
    pub fn value(&self) -> Float {
        match self {
            SpectralPd::Density(d) => *d,
            SpectralPd::Mass(m) => *m,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct SpectralSample {
    pub k: Wavenumber,
    pub pd: SpectralPd,
}

/// A real-valued spectrum. Piecewise-linear knots live in wavenumber space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Spectrum {
    /// Constant spectral value over a wavenumber range.
    Uniform {
        value: Float,
        min: Float,
        max: Float,
    },
    /// Piecewise-linear spectral values over wavenumber knots.
    PiecewiseLinear(PiecewiseLinearDistribution),
    /// Discrete emission lines: wavenumbers and their masses.
    Lines { ks: Vec<Float>, masses: Vec<Float> },
}

impl Spectrum {
    pub fn uniform(value: Float, range: WavenumberRange) -> Spectrum {
        Spectrum::Uniform {
            value,
            min: range.min.0,
            max: range.max.0,
        }
    }

    /// Builds a piecewise-linear spectrum from (wavelength, value) pairs.
    /// Wavelength knots are converted to (ascending) wavenumbers.
    pub fn from_wavelength_knots(mut pairs: Vec<(Length, Float)>) -> Spectrum {
        pairs.sort_by(|a, b| (b.0).0.partial_cmp(&(a.0).0).unwrap());
        let knots: Vec<Float> = pairs.iter().map(|(l, _)| TWO_PI / l.0).collect();
        let values: Vec<Float> = pairs.iter().map(|(_, v)| *v).collect();
        Spectrum::PiecewiseLinear(PiecewiseLinearDistribution::new(knots, values))
    }

    /// A single emission line at the given wavelength.
    pub fn line(lambda: Length, mass: Float) -> Spectrum {
        Spectrum::Lines {
            ks: vec![TWO_PI / lambda.0],
            masses: vec![mass],
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Spectrum::Uniform { .. })
    }

    pub fn wavenumber_range(&self) -> WavenumberRange {
        match self {
            Spectrum::Uniform { min, max, .. } => {
                WavenumberRange::new(Wavenumber(*min), Wavenumber(*max))
            }
            Spectrum::PiecewiseLinear(d) => {
                let (a, b) = d.domain();
                WavenumberRange::new(Wavenumber(a), Wavenumber(b))
            }
            Spectrum::Lines { ks, .. } => {
                let mut lo = std::f32::INFINITY;
                let mut hi = 0.0 as Float;
                for k in ks {
                    lo = lo.min(*k);
                    hi = hi.max(*k);
                }
                WavenumberRange::new(Wavenumber(lo), Wavenumber(hi))
            }
        }
    }

    /// Spectral value at `k` (for line spectra: 0, lines carry mass).
    pub fn value(&self, k: Wavenumber) -> Float {
        match self {
            Spectrum::Uniform { value, min, max } => {
                if k.0 >= *min && k.0 <= *max {
                    *value
                } else {
                    0.0
                }
            }
            Spectrum::PiecewiseLinear(d) => d.value(k.0),
            Spectrum::Lines { .. } => 0.0,
        }
    }

    /// Mean spectral value over the support.
    pub fn mean_value(&self) -> Float {
        match self {
            Spectrum::Uniform { value, .. } => *value,
            Spectrum::PiecewiseLinear(d) => {
                let (a, b) = d.domain();
                if b > a {
                    d.integral() / (b - a)
                } else {
                    0.0
                }
            }
            Spectrum::Lines { masses, .. } => {
                masses.iter().sum::<Float>() / masses.len().max(1) as Float
            }
        }
    }

    /// Integrated power over a wavenumber range.
    pub fn power(&self, range: WavenumberRange) -> Float {
        match self {
            Spectrum::Uniform { value, min, max } => {
                let lo = range.min.0.max(*min);
                let hi = range.max.0.min(*max);
                value * (hi - lo).max(0.0)
            }
            Spectrum::PiecewiseLinear(d) => d.integrate_range(range.min.0, range.max.0),
            Spectrum::Lines { ks, masses } => ks
                .iter()
                .zip(masses.iter())
                .filter(|(k, _)| range.contains(Wavenumber(**k)))
                .map(|(_, m)| *m)
                .sum(),
        }
    }

    pub fn total_power(&self) -> Float {
        self.power(self.wavenumber_range())
    }

    /// Continuous sampling density at `k` (0 for line spectra).
    pub fn pdf(&self, k: Wavenumber) -> Float {
        match self {
            Spectrum::Uniform { min, max, .. } => {
                if k.0 >= *min && k.0 <= *max && max > min {
                    1.0 as Float / (max - min)
                } else {
                    0.0
                }
            }
            Spectrum::PiecewiseLinear(d) => d.pdf(k.0),
            Spectrum::Lines { .. } => 0.0,
        }
    }

    /// Samples a wavenumber proportionally to the spectral value.
    pub fn sample(&self, u: Float) -> SpectralSample {
        match self {
            Spectrum::Uniform { min, max, .. } => {
                let k = min + u * (max - min);
                SpectralSample {
                    k: Wavenumber(k),
                    pd: SpectralPd::Density(1.0 as Float / (max - min)),
                }
            }
            Spectrum::PiecewiseLinear(d) => {
                let (k, pdf) = d.sample(u);
                SpectralSample {
                    k: Wavenumber(k),
                    pd: SpectralPd::Density(pdf),
                }
            }
            Spectrum::Lines { ks, masses } => {
                let total: Float = masses.iter().sum();
                let mut acc: Float = 0.0;
                let target = u * total;
                for (k, m) in ks.iter().zip(masses.iter()) {
                    acc += m;
                    if target < acc {
                        return SpectralSample {
                            k: Wavenumber(*k),
                            pd: SpectralPd::Mass(m / total),
                        };
                    }
                }
                SpectralSample {
                    k: Wavenumber(*ks.last().unwrap()),
                    pd: SpectralPd::Mass(masses.last().unwrap() / total),
                }
            }
        }
    }

    /// The spectrum as a piecewise-linear distribution over `range`
    /// (uniform spectra are discretized; line spectra have none).
    pub fn distribution(&self, range: WavenumberRange) -> Option<PiecewiseLinearDistribution> {
        match self {
            Spectrum::Uniform { value, min, max } => {
                let lo = range.min.0.max(*min);
                let hi = range.max.0.min(*max);
                if hi <= lo {
                    return None;
                }
                Some(PiecewiseLinearDistribution::new(
                    vec![lo, hi],
                    vec![*value, *value],
                ))
            }
            Spectrum::PiecewiseLinear(d) => Some(d.clone()),
            Spectrum::Lines { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visible() -> WavenumberRange {
        WavenumberRange::new(
            Wavenumber::from_wavelength(Length(780e-9)),
            Wavenumber::from_wavelength(Length(380e-9)),
        )
    }

    #[test]
    fn uniform_power_is_value_times_width() {
        let r = visible();
        let s = Spectrum::uniform(2.0, r);
        let p = s.power(r);
        assert!((p - 2.0 * r.length().0).abs() / p < 1e-6);
        // half range has half power
        let half = WavenumberRange::new(r.min, r.centre());
        assert!((s.power(half) - 0.5 * p).abs() / p < 1e-5);
    }

    #[test]
    fn wavelength_knots_sort_ascending_in_k() {
        let s = Spectrum::from_wavelength_knots(vec![
            (Length(400e-9), 1.0),
            (Length(700e-9), 3.0),
            (Length(550e-9), 2.0),
        ]);
        let k550 = Wavenumber::from_wavelength(Length(550e-9));
        assert!((s.value(k550) - 2.0).abs() < 1e-2);
        let r = s.wavenumber_range();
        assert!(r.min < k550 && k550 < r.max);
    }

    #[test]
    fn line_spectrum_samples_its_line() {
        let s = Spectrum::line(Length(633e-9), 1.0);
        let sample = s.sample(0.5);
        assert!(sample.pd.is_discrete());
        assert!((sample.k.wavelength().0 - 633e-9).abs() < 1e-12);
        assert_eq!(s.pdf(sample.k), 0.0);
    }
}
