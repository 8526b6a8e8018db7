//! Sensors: film-backed imaging detectors.

pub mod block;
pub mod film;
pub mod response;
pub mod tonemap;

// wavert
use crate::beam::PhaseSpaceExtent;
use crate::core::frame::Frame;
use crate::core::geometry::{Bounds2i, Dir3, Point3f, Ray, Vector3f};
use crate::core::quantity::{Float, Length, Wavenumber};
use crate::core::spectrum::Spectrum;
use crate::interaction::polarimetric::Stokes;
use crate::samplers::Sampler;
use crate::sensors::block::spiral_blocks;
use crate::sensors::film::Film;
use crate::sensors::response::Response;

/// A time-reversed beam ("importance") sampled from a sensor element.
#[derive(Debug, Clone)]
pub struct SensorSample {
    pub ray: Ray,
    pub importance: Stokes,
    /// Position density (discrete mass 1 for the pinhole).
    pub pdf_pos: Float,
    /// Solid-angle density of the sampled direction.
    pub pdf_dir: Float,
    pub beam_extent: PhaseSpaceExtent,
    pub element: (u32, u32),
}

/// A direct connection toward the sensor.
#[derive(Debug, Clone)]
pub struct SensorDirectSample {
    pub p: Point3f,
    /// Direction from the connecting vertex toward the sensor.
    pub dir: Dir3,
    pub dist: Length,
    /// Importance per solid angle toward the connecting vertex.
    pub importance: Stokes,
    /// Discrete mass (the pinhole position is a delta).
    pub pdf: Float,
    pub element: (u32, u32),
    pub n: Dir3,
}

/// A perspective pixel-array sensor with film-backed storage.
#[derive(Debug, Clone)]
pub struct PerspectiveSensor {
    pub id: String,
    width: u32,
    height: u32,
    fov_y: Float,
    position: Point3f,
    frame: Frame,
    sensitivity: Spectrum,
    response: Response,
    pub samples_per_element: u32,
    pub block_size: u32,
    pub polarimetric: bool,
    pub phase_space_extent_scale: Float,
    pub beam_waist: Length,
    pub ray_trace_only: bool,
}

impl PerspectiveSensor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        width: u32,
        height: u32,
        fov_y: Float,
        position: Point3f,
        target: Point3f,
        up: Vector3f,
        sensitivity: Spectrum,
        response: Response,
    ) -> PerspectiveSensor {
        let forward = Dir3::new(target - position);
        let right = Dir3::new(up.cross(&forward.v()));
        let down_up = Dir3::new(forward.cross(&right));
        PerspectiveSensor {
            id,
            width,
            height,
            fov_y,
            position,
            frame: Frame {
                t: right,
                b: down_up,
                n: forward,
            },
            sensitivity,
            response,
            samples_per_element: 16,
            block_size: 32,
            polarimetric: false,
            phase_space_extent_scale: 1.0,
            beam_waist: Length(1e-3),
            ray_trace_only: false,
        }
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
    pub fn position(&self) -> Point3f {
        self.position
    }
    pub fn sensitivity_spectrum(&self) -> &Spectrum {
        &self.sensitivity
    }
    pub fn sensor_response(&self) -> Response {
        self.response
    }
    pub fn is_delta_position(&self) -> bool {
        true
    }
    pub fn is_delta_direction(&self) -> bool {
        false
    }

    fn tan_half(&self) -> (Float, Float) {
        let ty = (self.fov_y / 2.0 as Float).tan();
        let tx = ty * self.width as Float / self.height as Float;
        (tx, ty)
    }

    /// Area of the image plane at unit distance.
    fn image_plane_area(&self) -> Float {
        let (tx, ty) = self.tan_half();
        4.0 as Float * tx * ty
    }

    pub fn sourcing_beam_extent(&self, k: Wavenumber) -> PhaseSpaceExtent {
        PhaseSpaceExtent::for_wavenumber(k, self.beam_waist)
            .enlarge(self.phase_space_extent_scale)
    }

    pub fn create_sensor_film(&self) -> Film {
        Film::new(self.width, self.height, self.response, self.polarimetric)
    }

    pub fn sensor_blocks(&self) -> Vec<Bounds2i> {
        spiral_blocks(self.width, self.height, self.block_size)
    }
    pub fn total_sensor_blocks(&self) -> usize {
        self.sensor_blocks().len()
    }

    /// Solid-angle density of a direction through the image plane.
    pub fn pdf_direction(&self, dir: &Dir3) -> Float {
        let local = self.frame.to_local(&dir.v());
        if local.z <= 0.0 {
            return 0.0;
        }
        let (tx, ty) = self.tan_half();
        if (local.x / local.z).abs() > tx || (local.y / local.z).abs() > ty {
            return 0.0;
        }
        let cos = local.z;
        1.0 as Float / (self.image_plane_area() * cos * cos * cos)
    }

    /// Samples a time-reversed beam from the given element.
    pub fn sample(
        &self,
        sampler: &mut dyn Sampler,
        element: (u32, u32),
        k: Wavenumber,
    ) -> SensorSample {
        let u = sampler.r2();
        let (tx, ty) = self.tan_half();
        let ndc_x = ((element.0 as Float + u.x) / self.width as Float) * 2.0 as Float - 1.0;
        let ndc_y = ((element.1 as Float + u.y) / self.height as Float) * 2.0 as Float - 1.0;
        let local = Vector3f::new(ndc_x * tx, -ndc_y * ty, 1.0);
        let d = Dir3::new(self.frame.to_world(&local));
        let pdf_dir = self.pdf_direction(&d).max(1e-12);
        SensorSample {
            ray: Ray::new(self.position, d),
            importance: Stokes::unpolarized(self.sensitivity.value(k)),
            pdf_pos: 1.0,
            pdf_dir,
            beam_extent: self.sourcing_beam_extent(k),
            element,
        }
    }

    /// Samples a direct connection from `wp` to the sensor; fails when `wp`
    /// is outside the frustum.
    pub fn sample_direct(
        &self,
        _sampler: &mut dyn Sampler,
        wp: &Point3f,
        k: Wavenumber,
    ) -> Option<SensorDirectSample> {
        let to_wp = *wp - self.position;
        let local = self.frame.to_local(&to_wp);
        if local.z <= 0.0 {
            return None;
        }
        let (tx, ty) = self.tan_half();
        let px = local.x / local.z;
        let py = local.y / local.z;
        if px.abs() > tx || py.abs() > ty {
            return None;
        }
        let ndc_x = px / tx;
        let ndc_y = -py / ty;
        let ex = (((ndc_x + 1.0) / 2.0 as Float) * self.width as Float) as u32;
        let ey = (((ndc_y + 1.0) / 2.0 as Float) * self.height as Float) as u32;
        let element = (ex.min(self.width - 1), ey.min(self.height - 1));

        let dist = to_wp.length();
        let dir = Dir3::from_normalized(to_wp * (-1.0 as Float / dist));
        let cos = local.z / dist;
        let importance = self.sensitivity.value(k)
            / (self.image_plane_area() * cos * cos * cos);
        Some(SensorDirectSample {
            p: self.position,
            dir,
            dist: Length(dist),
            importance: Stokes::unpolarized(importance),
            pdf: 1.0,
            element,
            n: self.frame.n,
        })
    }

    /// Splats an integrator sample onto an owned block (not thread safe
    /// across blocks; the element must lie in the handle's bounds).
    pub fn splat(
        &self,
        handle: &block::BlockHandle,
        element: (u32, u32),
        sample: &Stokes,
        k: Wavenumber,
    ) {
        debug_assert!(handle.bounds.contains(crate::core::geometry::Point2i {
            x: element.0 as i32,
            y: element.1 as i32,
        }));
        handle
            .film()
            .splat(element.0, element.1, sample, self.response.weights(k));
    }

    /// Thread-safe splat for direct (t = 1) sensor connections.
    pub fn splat_direct(&self, film: &Film, element: (u32, u32), sample: &Stokes, k: Wavenumber) {
        film.splat_direct(element.0, element.1, sample, self.response.weights(k));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::quantity::WavenumberRange;
    use crate::samplers::UniformSampler;

    fn sensor() -> PerspectiveSensor {
        PerspectiveSensor::new(
            "cam".into(),
            64,
            48,
            1.0,
            Point3f::default(),
            Point3f::new(0.0, 0.0, 1.0),
            Vector3f::new(0.0, 1.0, 0.0),
            Spectrum::uniform(1.0, WavenumberRange::all()),
            Response::Scalar,
        )
    }

    #[test]
    fn central_pixel_looks_forward() {
        let s = sensor();
        let mut sampler = UniformSampler::new(1);
        let smp = s.sample(&mut sampler, (32, 24), Wavenumber(1e7));
        let cos = smp.ray.d.dot(&Vector3f::new(0.0, 0.0, 1.0));
        assert!(cos > 0.99);
        assert!(smp.pdf_dir > 0.0);
    }

    #[test]
    fn direct_sampling_inverts_ray_generation() {
        let s = sensor();
        let mut sampler = UniformSampler::new(2);
        let smp = s.sample(&mut sampler, (10, 40), Wavenumber(1e7));
        // a point along the sampled ray maps back to the same element
        let wp = smp.ray.propagate(Length(3.0));
        let d = s.sample_direct(&mut sampler, &wp, Wavenumber(1e7)).unwrap();
        assert!((d.element.0 as i32 - 10).abs() <= 1);
        assert!((d.element.1 as i32 - 40).abs() <= 1);
        // connection direction points back at the pinhole
        assert!(d.dir.dot(&smp.ray.d.v()) < -0.99);
        // behind the camera: no connection
        assert!(s
            .sample_direct(&mut sampler, &Point3f::new(0.0, 0.0, -1.0), Wavenumber(1e7))
            .is_none());
    }

    #[test]
    fn block_partition_counts() {
        let s = sensor();
        assert_eq!(s.total_sensor_blocks(), 2 * 2);
        let film = s.create_sensor_film();
        assert_eq!(film.width(), 64);
    }
}
