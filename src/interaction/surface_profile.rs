//! Micro-rough surface profiles: PSD-driven scatter lobes.

// wavert
use crate::core::geometry::{Dir3, Vector2f, Vector3f};
use crate::core::quantity::{clamp_t, Float, Length, Wavenumber, INV_2_PI, PI};
use crate::samplers::Sampler;

/// Truncated Box-Muller transform: samples a 2-D Gaussian restricted to the
/// unit disk of valid scatter directions. Returns (point, pdf).
fn sample_boxmueller_truncated(
    sample: (Float, Float),
    mean: Vector2f,
    sigma2: Float,
) -> (Vector2f, Float) {
    let eps = std::f32::EPSILON;

    let l = mean.length_squared().min(1.0).sqrt();
    let coso = (1.0 as Float - mean.length_squared()).max(0.0).sqrt();
    let phi_i = if mean.x != 0.0 || mean.y != 0.0 {
        mean.y.atan2(mean.x)
    } else {
        0.0
    };

    let s = (-0.5 as Float * (1.0 + l) * (1.0 + l) / sigma2).exp();
    let x = (1.0 as Float - s) * sample.0.max(eps) + s;
    let r = (-2.0 as Float * sigma2 * x.ln()).sqrt();

    let max_phi = if r < eps || l < eps {
        PI
    } else {
        (1e-2 as Float).max(clamp_t((r * r + l * l - 1.0) / (2.0 * r * l), -1.0, 1.0).acos())
    };

    let phi = phi_i + PI + max_phi * (2.0 as Float * sample.1 - 1.0);
    let p = Vector2f {
        x: r * phi.cos(),
        y: r * phi.sin(),
    };

    let pdf = 0.5 as Float * x / (max_phi * sigma2) * coso;
    (p + mean, pdf)
}

fn boxmueller_truncated_pdf(wo: Vector2f, mean: Vector2f, sigma2: Float) -> Float {
    let eps = std::f32::EPSILON;

    let l = mean.length_squared().min(1.0).sqrt();
    let coso = (1.0 as Float - mean.length_squared()).max(0.0).sqrt();

    let d = wo - mean;
    let r2 = d.length_squared();
    let x = (-0.5 as Float * r2 / sigma2).exp();

    let r = r2.sqrt();
    let max_phi = if r < eps || l < eps {
        PI
    } else {
        (1e-2 as Float).max(clamp_t((r2 + l * l - 1.0) / (2.0 * r * l), -1.0, 1.0).acos())
    };

    0.5 as Float * x / (max_phi * sigma2) * coso
}

#[derive(Debug, Copy, Clone)]
pub struct ProfileSample {
    /// Scattered direction, local shading frame.
    pub wo: Dir3,
    pub pdf: Float,
    pub psd: Float,
    pub weight: Float,
}

/// Statistical surface profile. `Dirac` is a polished surface; `Gaussian`
/// carries an rms height and a spectral width of the roughness PSD.
#[derive(Debug, Copy, Clone)]
pub enum SurfaceProfile {
    Dirac,
    Gaussian {
        /// rms roughness height.
        sigma_h: Length,
        /// Spectral width of the PSD (inverse metres).
        sigma_f: Float,
    },
}

impl SurfaceProfile {
    pub fn is_delta_only(&self) -> bool {
        match self {
            SurfaceProfile::Dirac => true,
            SurfaceProfile::Gaussian { sigma_h, .. } => sigma_h.0 == 0.0,
        }
    }

    pub fn rms_roughness(&self) -> Length {
        match self {
            SurfaceProfile::Dirac => Length::ZERO,
            SurfaceProfile::Gaussian { sigma_h, .. } => *sigma_h,
        }
    }

    /// Fraction of scatter contained in the specular term.
    pub fn alpha(&self, wi: &Vector3f, wo: &Vector3f, k: Wavenumber) -> Float {
        match self {
            SurfaceProfile::Dirac => 1.0,
            SurfaceProfile::Gaussian { sigma_h, .. } => {
                let g = (wi.z.abs() + wo.z.abs()) * (k * *sigma_h);
                (-g * g).exp()
            }
        }
    }

    fn sigma2_norm(sigma_f: Float, k: Wavenumber) -> Float {
        1.0 as Float / (1.0 as Float - (-k.0 * k.0 / (2.0 as Float * sigma_f * sigma_f)).exp())
    }

    /// Evaluates the scattered-lobe power spectral density at the spatial
    /// frequency `z = k (wi_xy + wo_xy)`.
    pub fn psd(&self, wi: &Vector3f, wo: &Vector3f, k: Wavenumber) -> Float {
        match self {
            SurfaceProfile::Dirac => 0.0,
            SurfaceProfile::Gaussian { sigma_f, .. } => {
                let z = Vector2f {
                    x: k.0 * (wi.x + wo.x),
                    y: k.0 * (wi.y + wo.y),
                };
                let s2 = sigma_f * sigma_f;
                let e = (-z.length_squared() / (2.0 as Float * s2)).exp();
                if e <= std::f32::EPSILON {
                    0.0
                } else {
                    Self::sigma2_norm(*sigma_f, k) * INV_2_PI / s2 * k.0 * k.0 * e
                }
            }
        }
    }

    /// Samples a scattered direction about the specular lobe.
    pub fn sample(
        &self,
        wi: &Vector3f,
        k: Wavenumber,
        sampler: &mut dyn Sampler,
    ) -> Option<ProfileSample> {
        match self {
            SurfaceProfile::Dirac => None,
            SurfaceProfile::Gaussian { sigma_f, .. } => {
                let s2 = sigma_f * sigma_f / (k.0 * k.0);
                let mean = Vector2f { x: -wi.x, y: -wi.y };
                let u = sampler.r2();
                let (wo2, pdf) = sample_boxmueller_truncated((u.x, u.y), mean, s2);
                if pdf <= 0.0 {
                    return None;
                }
                let wo_full = Vector3f::new(wo2.x, wo2.y, 0.0);
                let psd = self.psd(wi, &wo_full, k);
                let z = (1.0 as Float - wo2.length_squared()).max(0.0).sqrt();
                let z = if wi.z >= 0.0 { z } else { -z };
                Some(ProfileSample {
                    wo: Dir3::new(Vector3f::new(wo2.x, wo2.y, z)),
                    pdf,
                    psd,
                    weight: psd / pdf,
                })
            }
        }
    }

    /// Sampling density of `sample`.
    pub fn pdf(&self, wi: &Vector3f, wo: &Vector3f, k: Wavenumber) -> Float {
        match self {
            SurfaceProfile::Dirac => 0.0,
            SurfaceProfile::Gaussian { sigma_f, .. } => {
                let s2 = sigma_f * sigma_f / (k.0 * k.0);
                let mean = Vector2f { x: -wi.x, y: -wi.y };
                boxmueller_truncated_pdf(Vector2f { x: wo.x, y: wo.y }, mean, s2)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samplers::UniformSampler;

    fn rough() -> SurfaceProfile {
        SurfaceProfile::Gaussian {
            sigma_h: Length(200e-9),
            sigma_f: 5e6,
        }
    }

    #[test]
    fn dirac_profile_is_specular_only() {
        let p = SurfaceProfile::Dirac;
        assert!(p.is_delta_only());
        let wi = Vector3f::new(0.1, 0.0, -0.99);
        assert_eq!(p.alpha(&wi, &wi, Wavenumber(1e7)), 1.0);
        let mut s = UniformSampler::new(1);
        assert!(p.sample(&wi, Wavenumber(1e7), &mut s).is_none());
    }

    #[test]
    fn specular_fraction_decreases_with_roughness_and_k() {
        let wi = Vector3f::new(0.0, 0.0, -1.0);
        let wo = Vector3f::new(0.0, 0.0, 1.0);
        let a_smooth = SurfaceProfile::Gaussian {
            sigma_h: Length(10e-9),
            sigma_f: 5e6,
        }
        .alpha(&wi, &wo, Wavenumber(1.2e7));
        let a_rough = rough().alpha(&wi, &wo, Wavenumber(1.2e7));
        assert!(a_smooth > a_rough);
        let a_long = rough().alpha(&wi, &wo, Wavenumber(0.8e7));
        assert!(a_long > a_rough);
        assert!(a_rough > 0.0 && a_smooth < 1.0);
    }

    #[test]
    fn sampled_lobe_pdf_matches_pdf_query() {
        let p = rough();
        let k = Wavenumber(1.2e7);
        let wi = Vector3f::new(0.3, -0.1, -0.95).normalize();
        let mut sampler = UniformSampler::new(5);
        for _ in 0..32 {
            if let Some(s) = p.sample(&wi, k, &mut sampler) {
                let q = p.pdf(&wi, &s.wo.v(), k);
                assert!(q > 0.0);
                assert!((q - s.pdf).abs() <= 0.02 * q.max(s.pdf));
                // scattered into the transmission side of a downward ray
                assert!(s.wo.z() < 0.0);
                assert!(s.psd >= 0.0 && s.weight >= 0.0);
            }
        }
    }

    #[test]
    fn psd_peaks_at_the_specular_direction() {
        let p = rough();
        let k = Wavenumber(1.2e7);
        let wi = Vector3f::new(0.2, 0.0, -0.98).normalize();
        let spec = Vector3f::new(-wi.x, -wi.y, -wi.z);
        let off = Vector3f::new(-wi.x + 0.3, -wi.y, 0.9).normalize();
        assert!(p.psd(&wi, &spec, k) > p.psd(&wi, &off, k));
    }
}
