//! Emitters: light sources of polarimetric beams.

// std
use std::f32::consts::PI;
// wavert
use crate::beam::PhaseSpaceExtent;
use crate::core::frame::Frame;
use crate::core::geometry::{Dir3, Point2f, Point3f, Ray, Vector3f};
use crate::core::quantity::{Float, Length, Wavenumber, WavenumberRange};
use crate::core::sampling::{
    concentric_sample_disk, cosine_hemisphere_pdf, cosine_sample_hemisphere, uniform_sphere_pdf,
    uniform_sample_sphere,
};
use crate::core::spectrum::Spectrum;
use crate::interaction::intersection::IntersectionSurface;
use crate::interaction::polarimetric::Stokes;
use crate::mesh::Mesh;
use crate::samplers::Sampler;

/// A sampled emission: a phase-space position with spectral flux weight.
#[derive(Debug, Clone)]
pub struct EmitterSample {
    pub ray: Ray,
    pub n: Dir3,
    /// Spectral radiant flux carried by the sampled beam.
    pub flux: Stokes,
    /// Position density (per area; discrete mass 1 for delta positions).
    pub pdf_pos: Float,
    /// Direction density (per solid angle; discrete mass 1 for delta
    /// directions).
    pub pdf_dir: Float,
    pub beam_extent: PhaseSpaceExtent,
    /// Surface record for emitters seated on scene geometry.
    pub surface: Option<(u32, usize, Float, Float)>,
}

/// A sampled direct connection toward an emitter.
#[derive(Debug, Clone)]
pub struct EmitterDirectSample {
    /// Point on the emitter (at infinity for directional emitters).
    pub p: Point3f,
    /// Direction from the receiver toward the emitter.
    pub dir: Dir3,
    pub dist: Length,
    /// Emitted radiance-like weight toward the receiver.
    pub radiance: Stokes,
    /// Solid-angle density (discrete mass for delta emitters).
    pub pdf: Float,
    pub delta: bool,
    pub n: Dir3,
}

/// A closed set of emitter variants.
#[derive(Debug, Clone)]
pub enum Emitter {
    /// Lambertian area emitter bound to a scene shape.
    Area {
        spectrum: Spectrum,
        scale: Float,
        /// Bound via `bind_shape` after construction.
        shape_idx: Option<u32>,
        phase_space_extent_scale: Float,
        beam_waist: Length,
    },
    /// Isotropic point emitter.
    Point {
        spectrum: Spectrum,
        scale: Float,
        position: Point3f,
        phase_space_extent_scale: Float,
        beam_waist: Length,
    },
    /// Directional emitter covering the scene from infinity.
    Directional {
        spectrum: Spectrum,
        scale: Float,
        direction: Dir3,
        phase_space_extent_scale: Float,
        beam_waist: Length,
        /// Set when bound to the scene world bounds.
        world_centre: Point3f,
        world_radius: Length,
    },
}

impl Emitter {
    /// Binds an area emitter to its shape; reproduces the post-hoc
    /// `set_shape` step of scene construction.
    pub fn bind_shape(&mut self, idx: u32) {
        if let Emitter::Area { shape_idx, .. } = self {
            *shape_idx = Some(idx);
        }
    }

    /// Binds a directional emitter to the scene bounding sphere.
    pub fn bind_world(&mut self, centre: Point3f, radius: Length) {
        if let Emitter::Directional {
            world_centre,
            world_radius,
            ..
        } = self
        {
            *world_centre = centre;
            *world_radius = radius;
        }
    }

    pub fn is_area_emitter(&self) -> bool {
        matches!(self, Emitter::Area { .. })
    }
    pub fn is_infinite_emitter(&self) -> bool {
        matches!(self, Emitter::Directional { .. })
    }
    pub fn is_delta_position(&self) -> bool {
        matches!(self, Emitter::Point { .. })
    }
    pub fn is_delta_direction(&self) -> bool {
        matches!(self, Emitter::Directional { .. })
    }
    pub fn shape_idx(&self) -> Option<u32> {
        match self {
            Emitter::Area { shape_idx, .. } => *shape_idx,
            _ => None,
        }
    }

    pub fn emission_spectrum(&self) -> &Spectrum {
        match self {
            Emitter::Area { spectrum, .. } => spectrum,
            Emitter::Point { spectrum, .. } => spectrum,
            Emitter::Directional { spectrum, .. } => spectrum,
        }
    }

    pub fn phase_space_extent_scale(&self) -> Float {
        match self {
            Emitter::Area {
                phase_space_extent_scale,
                ..
            }
            | Emitter::Point {
                phase_space_extent_scale,
                ..
            }
            | Emitter::Directional {
                phase_space_extent_scale,
                ..
            } => *phase_space_extent_scale,
        }
    }

    fn beam_waist(&self) -> Length {
        match self {
            Emitter::Area { beam_waist, .. }
            | Emitter::Point { beam_waist, .. }
            | Emitter::Directional { beam_waist, .. } => *beam_waist,
        }
    }

    /// Beam phase-space extent for emissions at wavenumber `k`.
    pub fn sourcing_beam_extent(&self, k: Wavenumber) -> PhaseSpaceExtent {
        PhaseSpaceExtent::for_wavenumber(k, self.beam_waist())
            .enlarge(self.phase_space_extent_scale())
    }

    /// Spectral emitted power at `k` (per unit wavenumber).
    pub fn power_spectral(&self, k: Wavenumber, mesh: Option<&Mesh>) -> Float {
        let s = self.emission_spectrum().value(k);
        self.power_scale(mesh) * s
    }

    /// Total emitted power over a wavenumber range.
    pub fn power(&self, range: WavenumberRange, mesh: Option<&Mesh>) -> Float {
        self.power_scale(mesh) * self.emission_spectrum().power(range)
    }

    fn power_scale(&self, mesh: Option<&Mesh>) -> Float {
        match self {
            Emitter::Area { scale, .. } => {
                // Lambertian: power = pi * A * L
                let area = mesh.map(|m| m.area().0).unwrap_or(0.0);
                scale * PI * area
            }
            Emitter::Point { scale, .. } => scale * 4.0 as Float * PI,
            Emitter::Directional {
                scale,
                world_radius,
                ..
            } => scale * PI * world_radius.0 * world_radius.0,
        }
    }

    /// Samples an emission phase-space position (ray) on the light source.
    pub fn sample(
        &self,
        sampler: &mut dyn Sampler,
        k: Wavenumber,
        mesh: Option<&Mesh>,
    ) -> Option<EmitterSample> {
        let extent = self.sourcing_beam_extent(k);
        match self {
            Emitter::Area {
                spectrum,
                scale,
                shape_idx,
                ..
            } => {
                let mesh = mesh?;
                let (tri, b1, b2, pdf_pos) = mesh.sample_position(sampler.r(), sampler.r2());
                if pdf_pos <= 0.0 {
                    return None;
                }
                let (a, b, c) = mesh.tri_positions(tri);
                let p = Point3f::new(
                    (1.0 - b1 - b2) * a.x + b1 * b.x + b2 * c.x,
                    (1.0 - b1 - b2) * a.y + b1 * b.y + b2 * c.y,
                    (1.0 - b1 - b2) * a.z + b1 * b.z + b2 * c.z,
                );
                let n = mesh.frames[tri].geo_n;
                let frame = Frame::build_orthogonal(n);
                let d_local = cosine_sample_hemisphere(&sampler.r2());
                let pdf_dir = cosine_hemisphere_pdf(d_local.z);
                if pdf_dir <= 0.0 {
                    return None;
                }
                let d = Dir3::new(frame.to_world(&d_local));
                let le = scale * spectrum.value(k);
                Some(EmitterSample {
                    ray: Ray::new(p + n.v() * 1e-6, d),
                    n,
                    flux: Stokes::unpolarized(le),
                    pdf_pos,
                    pdf_dir,
                    beam_extent: extent,
                    surface: Some((shape_idx.unwrap_or(0), tri, b1, b2)),
                })
            }
            Emitter::Point {
                spectrum,
                scale,
                position,
                ..
            } => {
                let d = Dir3::from_normalized(uniform_sample_sphere(sampler.r2()));
                let intensity = scale * spectrum.value(k);
                Some(EmitterSample {
                    ray: Ray::new(*position, d),
                    n: d,
                    flux: Stokes::unpolarized(intensity),
                    pdf_pos: 1.0,
                    pdf_dir: uniform_sphere_pdf(),
                    beam_extent: extent,
                    surface: None,
                })
            }
            Emitter::Directional {
                spectrum,
                scale,
                direction,
                world_centre,
                world_radius,
                ..
            } => {
                // position on the world-bounding disk facing the scene
                let frame = Frame::build_orthogonal(*direction);
                let disk = concentric_sample_disk(&sampler.r2());
                let offset = frame.to_world(&Vector3f::new(
                    disk.x * world_radius.0,
                    disk.y * world_radius.0,
                    0.0,
                ));
                let o = *world_centre + offset - direction.v() * world_radius.0;
                let le = scale * spectrum.value(k);
                Some(EmitterSample {
                    ray: Ray::new(o, *direction),
                    n: *direction,
                    flux: Stokes::unpolarized(le),
                    pdf_pos: 1.0 as Float / (PI * world_radius.0 * world_radius.0),
                    pdf_dir: 1.0,
                    beam_extent: extent,
                    surface: None,
                })
            }
        }
    }

    /// Samples a direct connection from the world position `wp`.
    pub fn sample_direct(
        &self,
        sampler: &mut dyn Sampler,
        wp: &Point3f,
        k: Wavenumber,
        mesh: Option<&Mesh>,
    ) -> Option<EmitterDirectSample> {
        match self {
            Emitter::Area {
                spectrum, scale, ..
            } => {
                let mesh = mesh?;
                let (tri, b1, b2, pdf_area) = mesh.sample_position(sampler.r(), sampler.r2());
                if pdf_area <= 0.0 {
                    return None;
                }
                let (a, b, c) = mesh.tri_positions(tri);
                let p = Point3f::new(
                    (1.0 - b1 - b2) * a.x + b1 * b.x + b2 * c.x,
                    (1.0 - b1 - b2) * a.y + b1 * b.y + b2 * c.y,
                    (1.0 - b1 - b2) * a.z + b1 * b.z + b2 * c.z,
                );
                let n = mesh.frames[tri].geo_n;
                let to_p = p - *wp;
                let dist2 = to_p.length_squared();
                if dist2 <= 0.0 {
                    return None;
                }
                let dist = dist2.sqrt();
                let dir = Dir3::from_normalized(to_p / dist);
                let cos_l = (-dir.v()).dot(&n.v());
                if cos_l <= 0.0 {
                    return None;
                }
                // solid-angle density of the area sample
                let pdf = pdf_area * dist2 / cos_l;
                Some(EmitterDirectSample {
                    p,
                    dir,
                    dist: Length(dist),
                    radiance: Stokes::unpolarized(scale * spectrum.value(k)),
                    pdf,
                    delta: false,
                    n,
                })
            }
            Emitter::Point {
                spectrum,
                scale,
                position,
                ..
            } => {
                let to_p = *position - *wp;
                let dist2 = to_p.length_squared();
                if dist2 <= 0.0 {
                    return None;
                }
                let dist = dist2.sqrt();
                let _ = sampler;
                Some(EmitterDirectSample {
                    p: *position,
                    dir: Dir3::from_normalized(to_p / dist),
                    dist: Length(dist),
                    radiance: Stokes::unpolarized(scale * spectrum.value(k) / dist2),
                    pdf: 1.0,
                    delta: true,
                    n: Dir3::from_normalized(-to_p / dist),
                })
            }
            Emitter::Directional {
                spectrum,
                scale,
                direction,
                ..
            } => Some(EmitterDirectSample {
                p: *wp + (-direction.v()) * 1e7,
                dir: Dir3::from_normalized(-direction.v()),
                dist: Length::INFINITY,
                radiance: Stokes::unpolarized(scale * spectrum.value(k)),
                pdf: 1.0,
                delta: true,
                n: *direction,
            }),
        }
    }

    /// Position sampling density at a point on the emitter.
    pub fn pdf_position(&self, mesh: Option<&Mesh>) -> Float {
        match self {
            Emitter::Area { .. } => mesh.map(|m| m.pdf_position()).unwrap_or(0.0),
            Emitter::Point { .. } => 1.0,
            Emitter::Directional { world_radius, .. } => {
                1.0 as Float / (PI * world_radius.0 * world_radius.0)
            }
        }
    }

    /// Direction sampling density of an emission from `n` toward `dir`.
    pub fn pdf_direction(&self, n: &Dir3, dir: &Dir3) -> Float {
        match self {
            Emitter::Area { .. } => {
                let cos = n.dot(&dir.v());
                if cos <= 0.0 {
                    0.0
                } else {
                    cosine_hemisphere_pdf(cos)
                }
            }
            Emitter::Point { .. } => uniform_sphere_pdf(),
            Emitter::Directional { .. } => 1.0,
        }
    }

    /// Solid-angle density of `sample_direct` from `wp` toward the sampled
    /// emitter point.
    pub fn pdf_direct(
        &self,
        wp: &Point3f,
        p: &Point3f,
        n: &Dir3,
        mesh: Option<&Mesh>,
    ) -> Float {
        match self {
            Emitter::Area { .. } => {
                let to_p = *p - *wp;
                let dist2 = to_p.length_squared();
                if dist2 <= 0.0 {
                    return 0.0;
                }
                let cos_l = (-(to_p / dist2.sqrt())).dot(&n.v());
                if cos_l <= 0.0 {
                    return 0.0;
                }
                self.pdf_position(mesh) * dist2 / cos_l
            }
            // delta emitters cannot be hit by independent sampling
            Emitter::Point { .. } | Emitter::Directional { .. } => 0.0,
        }
    }

    /// Emitted radiance toward a detection beam hitting the emitter surface.
    pub fn li(&self, toward: &Dir3, k: Wavenumber, surface: Option<&IntersectionSurface>) -> Stokes {
        match self {
            Emitter::Area {
                spectrum, scale, ..
            } => {
                // one-sided Lambertian emission
                if let Some(s) = surface {
                    if toward.dot(&s.geo.n.v()) >= 0.0 {
                        return Stokes::zero();
                    }
                }
                Stokes::unpolarized(scale * spectrum.value(k))
            }
            // delta emitters are never hit by a beam
            Emitter::Point { .. } | Emitter::Directional { .. } => Stokes::zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samplers::UniformSampler;

    fn quad_mesh() -> Mesh {
        Mesh::new(
            vec![
                Point3f::new(0.0, 0.0, 0.0),
                Point3f::new(1.0, 0.0, 0.0),
                Point3f::new(1.0, 1.0, 0.0),
                Point3f::new(0.0, 0.0, 0.0),
                Point3f::new(1.0, 1.0, 0.0),
                Point3f::new(0.0, 1.0, 0.0),
            ],
            vec![],
            vec![],
        )
    }

    fn area_emitter() -> Emitter {
        let mut e = Emitter::Area {
            spectrum: Spectrum::uniform(2.0, WavenumberRange::all()),
            scale: 1.0,
            shape_idx: None,
            phase_space_extent_scale: 1.0,
            beam_waist: Length(1e-3),
        };
        e.bind_shape(3);
        e
    }

    #[test]
    fn bind_shape_registers_the_back_reference() {
        let e = area_emitter();
        assert_eq!(e.shape_idx(), Some(3));
        assert!(e.is_area_emitter());
    }

    #[test]
    fn area_power_is_pi_a_l() {
        let e = area_emitter();
        let mesh = quad_mesh();
        let k = Wavenumber::from_wavelength(Length(550e-9));
        let p = e.power_spectral(k, Some(&mesh));
        assert!((p - PI * 1.0 * 2.0).abs() < 1e-4);
    }

    #[test]
    fn emission_samples_have_consistent_densities() {
        let e = area_emitter();
        let mesh = quad_mesh();
        let k = Wavenumber::from_wavelength(Length(550e-9));
        let mut sampler = UniformSampler::new(7);
        for _ in 0..32 {
            let s = e.sample(&mut sampler, k, Some(&mesh)).unwrap();
            assert!((s.pdf_pos - 1.0).abs() < 1e-5);
            // emitted into the hemisphere around the normal
            let cos = s.n.dot(&s.ray.d.v());
            assert!(cos > 0.0);
            assert!((s.pdf_dir - e.pdf_direction(&s.n, &s.ray.d)).abs() < 1e-5);
            assert!(s.flux.intensity() > 0.0);
        }
    }

    #[test]
    fn direct_samples_see_only_the_lit_side() {
        let e = area_emitter();
        let mesh = quad_mesh();
        let k = Wavenumber::from_wavelength(Length(550e-9));
        let mut sampler = UniformSampler::new(13);
        // above the quad: valid connections
        let above = Point3f::new(0.5, 0.5, 2.0);
        let s = e.sample_direct(&mut sampler, &above, k, Some(&mesh)).unwrap();
        assert!(s.pdf > 0.0 && !s.delta);
        let pdf = e.pdf_direct(&above, &s.p, &s.n, Some(&mesh));
        assert!((pdf - s.pdf).abs() <= 1e-3 * pdf.max(s.pdf));
        // below the quad: the back side emits nothing
        let below = Point3f::new(0.5, 0.5, -2.0);
        assert!(e.sample_direct(&mut sampler, &below, k, Some(&mesh)).is_none());
    }

    #[test]
    fn point_emitter_is_delta() {
        let e = Emitter::Point {
            spectrum: Spectrum::uniform(1.0, WavenumberRange::all()),
            scale: 2.0,
            position: Point3f::new(0.0, 0.0, 5.0),
            phase_space_extent_scale: 1.0,
            beam_waist: Length(1e-4),
        };
        assert!(e.is_delta_position());
        let k = Wavenumber::from_wavelength(Length(550e-9));
        let mut sampler = UniformSampler::new(3);
        let s = e
            .sample_direct(&mut sampler, &Point3f::default(), k, None)
            .unwrap();
        assert!(s.delta);
        // inverse-square falloff
        assert!((s.radiance.intensity() - 2.0 / 25.0).abs() < 1e-5);
        assert_eq!(e.pdf_direct(&Point3f::default(), &s.p, &s.n, None), 0.0);
    }
}
