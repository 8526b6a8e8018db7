//! BSDFs: polarimetric scattering operators at surfaces.

// others
use num::complex::Complex;
// wavert
use crate::core::frame::Frame;
use crate::core::geometry::{Dir3, Vector3f};
use crate::core::quantity::{Float, Wavenumber, INV_PI};
use crate::core::sampling::{cosine_hemisphere_pdf, cosine_sample_hemisphere};
use crate::core::spectrum::Spectrum;
use crate::interaction::intersection::IntersectionSurface;
use crate::interaction::polarimetric::Mueller;
use crate::interaction::surface_profile::SurfaceProfile;
use crate::samplers::Sampler;

type C = Complex<Float>;

// lobe kinds
pub const LOBE_SPECULAR: u8 = 1 << 0;
pub const LOBE_SCATTERED: u8 = 1 << 1;
pub const LOBE_DIFFRACTION_EDGE: u8 = 1 << 2;
pub const LOBE_DIFFRACTION_APERTURE: u8 = 1 << 3;

/// A BSDF evaluation: a Mueller operator mapping Stokes state expressed in
/// the incident frame `fi` to Stokes state in the outgoing frame `fo`.
#[derive(Debug, Copy, Clone)]
pub struct BsdfEval {
    pub m: Mueller,
    pub fi: Frame,
    pub fo: Frame,
}

#[derive(Debug, Copy, Clone)]
pub struct BsdfSample {
    /// Sampled outgoing direction (world space, away from the surface).
    pub wo: Dir3,
    /// Solid-angle density, or the discrete mass for delta lobes.
    pub pdf: Float,
    pub eval: BsdfEval,
    pub lobe: u8,
    pub delta: bool,
    /// Scalar throughput estimate (mean transmittance x cos / pdf).
    pub weight: Float,
}

/// Fresnel s/p amplitude coefficients for a (possibly absorbing) interface
/// with complex index eta = n + i kappa.
pub fn fresnel_sp(cos_i: Float, n: Float, kappa: Float) -> (C, C) {
    let cos_i = cos_i.abs().min(1.0);
    let sin2_i = 1.0 as Float - cos_i * cos_i;
    let eta = C::new(n, kappa);
    let eta2 = eta * eta;
    let ct = (eta2 - C::new(sin2_i, 0.0)).sqrt();
    let rs = (C::new(cos_i, 0.0) - ct) / (C::new(cos_i, 0.0) + ct);
    let rp = (eta2 * cos_i - ct) / (eta2 * cos_i + ct);
    (rs, rp)
}

/// A closed set of BSDF variants.
#[derive(Debug, Clone)]
pub enum Bsdf {
    /// Depolarizing diffuse reflector.
    Lambertian { reflectance: Spectrum },
    /// Specular + PSD-driven scatter over a micro-rough surface profile.
    SurfaceSpm {
        n: Float,
        kappa: Float,
        profile: SurfaceProfile,
    },
}

fn mirror_local(wi: &Vector3f) -> Vector3f {
    Vector3f::new(-wi.x, -wi.y, wi.z)
}

impl Bsdf {
    pub fn lobe_mask(&self) -> u8 {
        match self {
            Bsdf::Lambertian { .. } => LOBE_SCATTERED,
            Bsdf::SurfaceSpm { profile, .. } => {
                if profile.is_delta_only() {
                    LOBE_SPECULAR
                } else {
                    LOBE_SPECULAR | LOBE_SCATTERED
                }
            }
        }
    }

    pub fn ior(&self) -> Float {
        match self {
            Bsdf::Lambertian { .. } => 1.0,
            Bsdf::SurfaceSpm { n, .. } => *n,
        }
    }

    /// True for BSDFs whose evaluation depends on the beam footprint.
    pub fn needs_interaction_footprint(&self) -> bool {
        matches!(self, Bsdf::SurfaceSpm { .. })
    }

    pub fn has_delta_lobe(&self) -> bool {
        self.lobe_mask() & LOBE_SPECULAR != 0
    }
    pub fn is_delta_only(&self) -> bool {
        self.lobe_mask() == LOBE_SPECULAR
    }

    /// Evaluates the non-delta part of the BSDF; `wi` points toward the
    /// source of the incident beam, `wo` toward the scattered beam, both
    /// away from the surface.
    pub fn f(
        &self,
        surface: &IntersectionSurface,
        wi: &Dir3,
        wo: &Dir3,
        k: Wavenumber,
    ) -> Option<BsdfEval> {
        let wi_l = surface.shading.to_local(&wi.v());
        let wo_l = surface.shading.to_local(&wo.v());
        if wi_l.z * wo_l.z <= 0.0 {
            // transmission is not carried by these variants
            return None;
        }
        match self {
            Bsdf::Lambertian { reflectance } => {
                let rho = reflectance.mean_value();
                Some(BsdfEval {
                    m: Mueller::depolarizer(rho * INV_PI),
                    fi: surface.sp_frame(wi),
                    fo: surface.sp_frame(wo),
                })
            }
            Bsdf::SurfaceSpm { n, kappa, profile } => {
                let psd = profile.psd(&wi_l, &wo_l, k);
                if psd <= 0.0 {
                    return None;
                }
                let (rs, rp) = fresnel_sp(wi_l.z, *n, *kappa);
                Some(BsdfEval {
                    m: Mueller::from_sp_amplitudes(rs, rp) * psd,
                    fi: surface.sp_frame(wi),
                    fo: surface.sp_frame(wo),
                })
            }
        }
    }

    /// Samples a scattered direction for the incident direction `wi`
    /// (toward the source).
    pub fn sample(
        &self,
        surface: &IntersectionSurface,
        wi: &Dir3,
        k: Wavenumber,
        sampler: &mut dyn Sampler,
    ) -> Option<BsdfSample> {
        let wi_l = surface.shading.to_local(&wi.v());
        if wi_l.z == 0.0 {
            return None;
        }
        match self {
            Bsdf::Lambertian { reflectance } => {
                let rho = reflectance.mean_value();
                let u = sampler.r2();
                let mut d = cosine_sample_hemisphere(&u);
                if wi_l.z < 0.0 {
                    d.z = -d.z;
                }
                let pdf = cosine_hemisphere_pdf(d.z.abs());
                if pdf <= 0.0 {
                    return None;
                }
                let wo = Dir3::new(surface.shading.to_world(&d));
                Some(BsdfSample {
                    wo,
                    pdf,
                    eval: BsdfEval {
                        m: Mueller::depolarizer(rho * INV_PI),
                        fi: surface.sp_frame(wi),
                        fo: surface.sp_frame(&wo),
                    },
                    lobe: LOBE_SCATTERED,
                    delta: false,
                    weight: rho,
                })
            }
            Bsdf::SurfaceSpm { n, kappa, profile } => {
                let spec_l = mirror_local(&wi_l);
                let alpha = profile.alpha(&wi_l, &spec_l, k);
                let (rs, rp) = fresnel_sp(wi_l.z, *n, *kappa);
                if sampler.r() < alpha {
                    // specular lobe
                    let wo = Dir3::new(surface.shading.to_world(&spec_l));
                    let m = Mueller::from_sp_amplitudes(rs, rp) * alpha;
                    Some(BsdfSample {
                        wo,
                        pdf: alpha,
                        eval: BsdfEval {
                            m,
                            fi: surface.sp_frame(wi),
                            fo: surface.sp_frame(&wo),
                        },
                        lobe: LOBE_SPECULAR,
                        delta: true,
                        weight: m.mean_transmittance() / alpha.max(1e-9),
                    })
                } else {
                    // PSD-driven scattered lobe
                    let ps = profile.sample(&wi_l, k, sampler)?;
                    let pdf = (1.0 as Float - alpha) * ps.pdf;
                    if pdf <= 0.0 {
                        return None;
                    }
                    let wo = Dir3::new(surface.shading.to_world(&ps.wo.v()));
                    let m = Mueller::from_sp_amplitudes(rs, rp) * ps.psd;
                    Some(BsdfSample {
                        wo,
                        pdf,
                        eval: BsdfEval {
                            m,
                            fi: surface.sp_frame(wi),
                            fo: surface.sp_frame(&wo),
                        },
                        lobe: LOBE_SCATTERED,
                        delta: false,
                        weight: m.mean_transmittance() * ps.wo.z().abs() / pdf,
                    })
                }
            }
        }
    }

    /// Solid-angle sampling density of the non-delta lobes.
    pub fn pdf(
        &self,
        surface: &IntersectionSurface,
        wi: &Dir3,
        wo: &Dir3,
        k: Wavenumber,
    ) -> Float {
        let wi_l = surface.shading.to_local(&wi.v());
        let wo_l = surface.shading.to_local(&wo.v());
        if wi_l.z * wo_l.z <= 0.0 {
            return 0.0;
        }
        match self {
            Bsdf::Lambertian { .. } => cosine_hemisphere_pdf(wo_l.z.abs()),
            Bsdf::SurfaceSpm { profile, .. } => {
                let spec_l = mirror_local(&wi_l);
                let alpha = profile.alpha(&wi_l, &spec_l, k);
                (1.0 as Float - alpha) * profile.pdf(&wi_l, &wo_l, k)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::{Point2f, Point3f};
    use crate::core::quantity::{Length, WavenumberRange, Wavenumber};
    use crate::interaction::intersection::IntersectionFootprint;
    use crate::samplers::UniformSampler;

    fn surface() -> IntersectionSurface {
        let n = Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0));
        IntersectionSurface {
            wp: Point3f::default(),
            uv: Point2f::default(),
            b1: 0.3,
            b2: 0.3,
            footprint: IntersectionFootprint::default(),
            shape_idx: 0,
            mesh_tri_idx: 0,
            geo: Frame::build_orthogonal(n),
            shading: Frame::build_orthogonal(n),
        }
    }

    fn k0() -> Wavenumber {
        Wavenumber::from_wavelength(Length(550e-9))
    }

    #[test]
    fn lambertian_samples_cover_the_upper_hemisphere() {
        let bsdf = Bsdf::Lambertian {
            reflectance: Spectrum::uniform(0.8, WavenumberRange::all()),
        };
        let s = surface();
        let wi = Dir3::new(Vector3f::new(0.2, 0.1, 0.97));
        let mut sampler = UniformSampler::new(2);
        for _ in 0..64 {
            let smp = bsdf.sample(&s, &wi, k0(), &mut sampler).unwrap();
            assert!(smp.wo.z() > 0.0);
            assert!(!smp.delta);
            let pdf = bsdf.pdf(&s, &wi, &smp.wo, k0());
            assert!((pdf - smp.pdf).abs() < 1e-5);
            assert!((smp.weight - 0.8).abs() < 1e-5);
        }
    }

    #[test]
    fn fresnel_normal_incidence_reflectance() {
        let (rs, rp) = fresnel_sp(1.0, 1.5, 0.0);
        // R = ((n-1)/(n+1))^2 = 0.04
        assert!((rs.norm_sqr() - 0.04).abs() < 1e-4);
        assert!((rp.norm_sqr() - 0.04).abs() < 1e-4);
    }

    #[test]
    fn polished_spm_is_delta_only() {
        let bsdf = Bsdf::SurfaceSpm {
            n: 1.5,
            kappa: 0.0,
            profile: SurfaceProfile::Dirac,
        };
        assert!(bsdf.is_delta_only());
        let s = surface();
        let wi = Dir3::new(Vector3f::new(0.3, 0.0, 0.95));
        let mut sampler = UniformSampler::new(4);
        let smp = bsdf.sample(&s, &wi, k0(), &mut sampler).unwrap();
        assert!(smp.delta);
        // mirror direction
        let spec = Vector3f::new(-wi.v().x, -wi.v().y, wi.v().z);
        assert!((smp.wo.v() - spec).length() < 1e-5);
        // evaluation of the non-delta part is empty
        assert!(bsdf.pdf(&s, &wi, &smp.wo, k0()) == 0.0);
    }

    #[test]
    fn rough_spm_polarizes_obliquely() {
        let bsdf = Bsdf::SurfaceSpm {
            n: 1.5,
            kappa: 0.0,
            profile: SurfaceProfile::Gaussian {
                sigma_h: Length(300e-9),
                sigma_f: 5e6,
            },
        };
        let s = surface();
        let wi = Dir3::new(Vector3f::new(0.8, 0.0, 0.6));
        let wo = Dir3::new(Vector3f::new(-0.8, 0.0, 0.6));
        let eval = bsdf.f(&s, &wi, &wo, k0()).unwrap();
        // oblique Fresnel reflection is a diattenuator: Q couples to I
        assert!(eval.m.m[0][1].abs() > 0.0);
        // physical: output intensity bounds polarized intensity
        let s_in = crate::interaction::polarimetric::Stokes::unpolarized(1.0);
        let out = eval.m * s_in;
        assert!(out.intensity() >= out.polarized_intensity() - 1e-6);
    }
}
