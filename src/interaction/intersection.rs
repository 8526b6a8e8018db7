//! Beam-surface and beam-edge intersection geometry.

// wavert
use crate::accelerators::Idx;
use crate::core::frame::Frame;
use crate::core::geometry::{Dir3, Point2f, Point3f, Ray, Vector2f, Vector3f};
use crate::core::quantity::{Float, Length};

/// Elliptical beam footprint spanned in a surface tangent frame.
#[derive(Debug, Copy, Clone)]
pub struct IntersectionFootprint {
    /// Unit major-axis direction in the tangent plane.
    pub x: Vector2f,
    pub la: Length,
    pub lb: Length,
}

impl Default for IntersectionFootprint {
    fn default() -> Self {
        IntersectionFootprint {
            x: Vector2f { x: 1.0, y: 0.0 },
            la: Length::ZERO,
            lb: Length::ZERO,
        }
    }
}

impl IntersectionFootprint {
    /// Footprint major axis as a world vector.
    pub fn world_a(&self, geo: &Frame) -> Vector3f {
        geo.to_world_2d(&(self.x * self.la.0))
    }
    /// Footprint minor axis as a world vector.
    pub fn world_b(&self, geo: &Frame) -> Vector3f {
        let y = Vector2f {
            x: -self.x.y,
            y: self.x.x,
        };
        geo.to_world_2d(&(y * self.lb.0))
    }
}

/// Describes a beam-surface intersection.
#[derive(Debug, Copy, Clone)]
pub struct IntersectionSurface {
    /// Centre world position of the beam-surface intersection.
    pub wp: Point3f,
    pub uv: Point2f,
    pub b1: Float,
    pub b2: Float,
    pub footprint: IntersectionFootprint,
    pub shape_idx: u32,
    pub mesh_tri_idx: u32,
    /// Geometric frame.
    pub geo: Frame,
    /// Shading frame (interpolated vertex normals).
    pub shading: Frame,
}

impl IntersectionSurface {
    pub fn ng(&self) -> Dir3 {
        self.geo.n
    }
    pub fn ns(&self) -> Dir3 {
        self.shading.n
    }

    /// The s-polarization direction (normal to the incidence plane) for an
    /// incident or outgoing direction `w`. The frame is identical whether
    /// `w` points into or out of the surface.
    pub fn s_direction(&self, w: &Dir3) -> Dir3 {
        let crs = w.cross(&self.shading.n);
        let l2 = crs.length_squared();
        let ret = if l2 < 1e-14 {
            self.shading.t
        } else {
            Dir3::from_normalized(crs / l2.sqrt())
        };
        if w.dot(&self.shading.n.v()) < 0.0 {
            -ret
        } else {
            ret
        }
    }

    /// The sp frame: `t` is the s-polarization direction, `b` the
    /// p-polarization direction, `n` the propagation direction `w`.
    pub fn sp_frame(&self, w: &Dir3) -> Frame {
        let s = self.s_direction(w);
        let p = Dir3::from_normalized(s.cross(w));
        let p = if w.dot(&self.shading.n.v()) < 0.0 {
            -p
        } else {
            p
        };
        Frame { t: s, b: p, n: *w }
    }

    /// An offseted origin that avoids self-intersection with this surface.
    pub fn offseted_ray_origin(&self, ray: &Ray) -> Point3f {
        let scale = 1e-4 as Float * self.wp.to_vec().abs().max_component().max(1.0);
        let side = if ray.d.dot(&self.geo.n.v()) >= 0.0 {
            1.0
        } else {
            -1.0
        };
        self.wp + self.geo.n.v() * (scale * side)
    }
}

/// Describes a beam-edge (diffraction) intersection.
#[derive(Debug, Copy, Clone)]
pub struct IntersectionEdge {
    pub edge_idx: Idx,
    /// Unit edge tangent.
    pub e: Dir3,
    /// Point of edge intersection.
    pub wp: Point3f,
}

impl IntersectionEdge {
    /// The sh frame of UTD: `t` is the "soft" direction (in the plane
    /// containing the edge and `w`), `b` the "hard" direction.
    pub fn sh_frame(&self, w: &Dir3) -> Frame {
        let phi = Dir3::new(w.cross(&self.e));
        let beta = Dir3::from_normalized(phi.cross(w));
        Frame {
            t: beta,
            b: phi,
            n: *w,
        }
    }

    pub fn offseted_ray_origin(&self, ray: &Ray) -> Point3f {
        self.wp + ray.d.v() * 1e-5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn sp_frame_is_shared_for_in_and_out_directions() {
        let s = surface();
        let w = Dir3::new(Vector3f::new(0.3, 0.1, 0.8));
        let f_out = s.sp_frame(&w);
        let f_in = s.sp_frame(&Dir3::new(-w.v()));
        // the s direction is shared
        assert!((f_out.t.v() - f_in.t.v()).length() < 1e-5);
    }

    #[test]
    fn offseted_origin_leaves_the_surface() {
        let s = surface();
        let ray = Ray::new(s.wp, Dir3::new(Vector3f::new(0.2, 0.0, -1.0)));
        let o = s.offseted_ray_origin(&ray);
        // offset is below the surface, matching the ray direction side
        assert!(o.z < 0.0);
    }
}
