//! Beams: elliptic-cone envelopes carrying Gaussian wavefronts.

// wavert
use crate::core::elliptic_cone::EllipticCone;
use crate::core::frame::Frame;
use crate::core::gaussian2d::Gaussian2d;
use crate::core::geometry::{Dir3, Point3f, Ray, Vector2f, Vector3f};
use crate::core::quantity::{Float, Length, Wavenumber, PI};
use crate::interaction::intersection::IntersectionSurface;

/// The beam cross-section envelope, in standard deviations: the envelope
/// ellipse sits at this many sigmas of the transverse Gaussian profile.
pub const BEAM_CROSS_SECTION_ENVELOPE: Float = 3.0;

/// Scaling factor for the beam footprint along the propagation axis as a
/// function of the major axis.
pub const fn major_axis_to_z_scale() -> Float {
    2.0
}

/// Phase-space extent of a sourced beam: initial waist and half-opening.
#[derive(Debug, Copy, Clone)]
pub struct PhaseSpaceExtent {
    pub x0: Length,
    pub tan_alpha: Float,
}

impl PhaseSpaceExtent {
    /// Diffraction-limited extent of a beam with waist `x0`.
    pub fn for_wavenumber(k: Wavenumber, x0: Length) -> PhaseSpaceExtent {
        // Gaussian-beam divergence: tan(theta) = lambda / (pi w0)
        let lambda = k.wavelength();
        PhaseSpaceExtent {
            x0,
            tan_alpha: lambda.0 / (PI * x0.0.max(1e-12)),
        }
    }

    /// Applies a requested extent scale: the half-opening is multiplied
    /// directly, with no re-validation.
    pub fn enlarge(self, scale: Float) -> PhaseSpaceExtent {
        PhaseSpaceExtent {
            x0: self.x0,
            tan_alpha: self.tan_alpha * scale,
        }
    }
}

/// The transverse Gaussian profile of a beam cross-section.
#[derive(Debug, Copy, Clone)]
pub struct GaussianWavefront {
    gaussian: Gaussian2d,
    envelope: Vector2f,
}

impl GaussianWavefront {
    pub fn new(sigma: Vector2f, envelope: Vector2f) -> Self {
        GaussianWavefront {
            gaussian: Gaussian2d::new(sigma, Vector2f { x: 1.0, y: 0.0 }, Vector2f::default()),
            envelope,
        }
    }

    pub fn gaussian(&self) -> &Gaussian2d {
        &self.gaussian
    }

    /// The envelope ellipse radii (metres, beam local frame).
    pub fn envelope(&self) -> Vector2f {
        self.envelope
    }

    /// Field amplitude magnitude at a local cross-section point; the
    /// intensity profile is the squared amplitude.
    pub fn amplitude_magnitude(&self, p: Vector2f) -> Float {
        if self.gaussian.is_dirac() {
            return if p == Vector2f::default() { 1.0 } else { 0.0 };
        }
        let u = self.gaussian.to_canonical(p);
        (-u.length_squared() / 4.0 as Float).exp()
    }
}

/// Handles the geometric aspects of beams: the envelope cone, the wavefront
/// profile and footprints.
#[derive(Debug, Copy, Clone)]
pub struct Beam {
    envelope: EllipticCone,
    k: Wavenumber,
    /// Initial ballistic length over which the beam may intersect its own
    /// sourcing geometry.
    self_intersection_distance: Length,
}

impl Beam {
    /// A degenerate ray beam.
    pub fn from_ray(ray: Ray, k: Wavenumber) -> Beam {
        Beam {
            envelope: EllipticCone::from_ray(ray),
            k,
            self_intersection_distance: Length::ZERO,
        }
    }

    /// A beam sourced with the given phase-space extent.
    pub fn from_phase_space(ray: Ray, k: Wavenumber, extent: PhaseSpaceExtent) -> Beam {
        Beam {
            envelope: EllipticCone::new(ray, extent.tan_alpha, extent.x0),
            k,
            self_intersection_distance: Length::ZERO,
        }
    }

    /// A beam scattered off a surface: the envelope passes through the
    /// intersection footprint ellipse.
    pub fn from_surface(
        surface: &IntersectionSurface,
        ray: Ray,
        k: Wavenumber,
        tan_alpha: Float,
    ) -> Beam {
        let wa = surface.footprint.world_a(&surface.geo);
        let wb = surface.footprint.world_b(&surface.geo);
        let (envelope, self_isect) = EllipticCone::through_ellipse(wa, wb, &ray, tan_alpha);
        Beam {
            envelope,
            k,
            self_intersection_distance: self_isect,
        }
    }

    pub fn from_envelope(envelope: EllipticCone, k: Wavenumber) -> Beam {
        Beam {
            envelope,
            k,
            self_intersection_distance: Length::ZERO,
        }
    }

    pub fn k(&self) -> Wavenumber {
        self.k
    }
    pub fn wavelength(&self) -> Length {
        self.k.wavelength()
    }
    pub fn envelope(&self) -> &EllipticCone {
        &self.envelope
    }
    pub fn dir(&self) -> Dir3 {
        self.envelope.d()
    }
    pub fn origin(&self) -> Point3f {
        self.envelope.o()
    }
    pub fn mean_ray(&self) -> &Ray {
        self.envelope.ray()
    }
    pub fn frame(&self) -> Frame {
        self.envelope.frame()
    }
    pub fn is_ray(&self) -> bool {
        self.envelope.is_ray()
    }
    pub fn self_intersection_distance(&self) -> Length {
        self.self_intersection_distance
    }
    pub fn set_origin(&mut self, o: Point3f) {
        self.envelope.set_o(o);
    }

    /// Spatial three-dimensional footprint at propagation distance `dist`
    /// (beam local frame, metres).
    pub fn footprint(&self, dist: Length) -> Vector3f {
        let a = self.envelope.axes(dist);
        Vector3f::new(a.x.0, a.y.0, major_axis_to_z_scale() * a.x.0)
    }

    /// Spatial standard deviations over the local axes at `dist`.
    pub fn std_dev(&self, dist: Length) -> Vector3f {
        self.footprint(dist) / BEAM_CROSS_SECTION_ENVELOPE
    }

    /// The wavefront profile at propagation distance `dist`.
    pub fn wavefront(&self, dist: Length) -> GaussianWavefront {
        let sigmas = self.std_dev(dist);
        let axes = self.envelope.axes(dist);
        GaussianWavefront::new(
            Vector2f {
                x: sigmas.x,
                y: sigmas.y,
            },
            Vector2f {
                x: axes.x.0,
                y: axes.y.0,
            },
        )
    }

    /// Projects `p` onto the beam cross-section at distance `dist`.
    pub fn project(&self, p: Point3f, dist: Length) -> Vector2f {
        self.envelope.project(p, dist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_z_ray() -> Ray {
        Ray::new(
            Point3f::default(),
            Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
        )
    }

    #[test]
    fn ray_beam_is_degenerate() {
        let b = Beam::from_ray(unit_z_ray(), Wavenumber::from_wavelength(Length(500e-9)));
        assert!(b.is_ray());
        assert_eq!(b.footprint(Length(10.0)), Vector3f::default());
    }

    #[test]
    fn phase_space_beam_spreads() {
        let k = Wavenumber::from_wavelength(Length(500e-9));
        let ext = PhaseSpaceExtent::for_wavenumber(k, Length(1e-3));
        let b = Beam::from_phase_space(unit_z_ray(), k, ext);
        assert!(!b.is_ray());
        let f0 = b.footprint(Length::ZERO);
        let f1 = b.footprint(Length(100.0));
        assert!((f0.x - 1e-3).abs() < 1e-9);
        assert!(f1.x > f0.x);
        assert!((f1.z - major_axis_to_z_scale() * f1.x).abs() < 1e-9);
    }

    #[test]
    fn extent_scale_multiplies_tan_alpha() {
        let k = Wavenumber::from_wavelength(Length(500e-9));
        let ext = PhaseSpaceExtent::for_wavenumber(k, Length(1e-3));
        let scaled = ext.enlarge(3.0);
        assert!((scaled.tan_alpha - 3.0 * ext.tan_alpha).abs() < 1e-12);
        assert_eq!(scaled.x0, ext.x0);
    }

    #[test]
    fn wavefront_amplitude_decays_with_radius() {
        let k = Wavenumber::from_wavelength(Length(500e-9));
        let ext = PhaseSpaceExtent::for_wavenumber(k, Length(1e-3));
        let b = Beam::from_phase_space(unit_z_ray(), k, ext);
        let wf = b.wavefront(Length(10.0));
        let a0 = wf.amplitude_magnitude(Vector2f::default());
        let a1 = wf.amplitude_magnitude(Vector2f {
            x: wf.envelope().x,
            y: 0.0,
        });
        assert!((a0 - 1.0).abs() < 1e-6);
        assert!(a1 < a0 && a1 > 0.0);
    }
}
