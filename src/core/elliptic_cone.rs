//! Elliptic propagation cones.

// wavert
use crate::core::frame::Frame;
use crate::core::geometry::{Dir3, Point3f, Ray, Vector2f, Vector3f};
use crate::core::quantity::{Float, Length, LengthRange};
use crate::core::simd::{Float8, Mask8, Vec3x8};

/// Major/minor axis lengths of a cone cross-section.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct ConeAxes {
    pub x: Length,
    pub y: Length,
}

/// Quantifies the geometry of an elliptical cone.
///
/// Supports the degenerate cases where the cone collapses into an elliptical
/// frustum (`tan_alpha = 0`) or a ray (`tan_alpha = 0` and `x0 = 0`).
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct EllipticCone {
    r: Ray,
    tangent: Dir3,
    initial_x_length: Length,
    one_over_e: Float,
    e: Float,
    tan_alpha: Float,
    z_apex: Length,
}

fn apex_z(initial_x: Length, tan_alpha: Float) -> Length {
    if initial_x != Length::ZERO || tan_alpha != 0.0 {
        Length(-initial_x.0 / tan_alpha)
    } else {
        // degenerate ray
        Length(-std::f32::INFINITY)
    }
}

impl EllipticCone {
    /// An isotropic cone around `r` with half-opening `tan_alpha` and initial
    /// major axis `initial_x`.
    pub fn new(r: Ray, tan_alpha: Float, initial_x: Length) -> Self {
        let t = Frame::build_orthogonal(r.d).t;
        EllipticCone::with_tangent(r, t, tan_alpha, 0.0, initial_x)
    }

    /// `x` is the major-axis direction and must be tangent to `r.d`;
    /// eccentricity is in [0, 1).
    pub fn with_tangent(
        r: Ray,
        x: Dir3,
        tan_alpha: Float,
        eccentricity: Float,
        initial_x: Length,
    ) -> Self {
        debug_assert!(tan_alpha >= 0.0 && initial_x >= Length::ZERO);
        debug_assert!((0.0..1.0).contains(&eccentricity));
        debug_assert!(r.d.dot(&x.v()).abs() < 1e-4);
        let one_over_e = (1.0 as Float - eccentricity * eccentricity).max(0.0).sqrt();
        EllipticCone {
            r,
            tangent: x,
            initial_x_length: initial_x,
            one_over_e,
            e: 1.0 as Float / one_over_e,
            tan_alpha,
            z_apex: apex_z(initial_x, tan_alpha),
        }
    }

    /// The degenerate ray case.
    pub fn from_ray(r: Ray) -> Self {
        EllipticCone::new(r, 0.0, Length::ZERO)
    }

    pub fn is_ray(&self) -> bool {
        self.tan_alpha == 0.0 && self.initial_x_length == Length::ZERO
    }
    pub fn is_elliptical_frustum(&self) -> bool {
        self.tan_alpha == 0.0
    }

    pub fn ray(&self) -> &Ray {
        &self.r
    }
    pub fn o(&self) -> Point3f {
        self.r.o
    }
    pub fn d(&self) -> Dir3 {
        self.r.d
    }
    /// Tangent (local x) direction.
    pub fn x(&self) -> Dir3 {
        self.tangent
    }
    /// Bi-tangent (local y) direction.
    pub fn y(&self) -> Dir3 {
        Dir3::from_normalized(self.r.d.cross(&self.tangent))
    }
    pub fn x0(&self) -> Length {
        self.initial_x_length
    }
    pub fn tan_alpha(&self) -> Float {
        self.tan_alpha
    }
    /// major/minor axis ratio, can be +inf.
    pub fn e(&self) -> Float {
        self.e
    }
    pub fn one_over_e(&self) -> Float {
        self.one_over_e
    }
    /// Precomputed z position of the apex, -inf for the degenerate ray.
    pub fn z_apex(&self) -> Length {
        self.z_apex
    }

    pub fn set_o(&mut self, o: Point3f) {
        self.r.o = o;
    }
    pub fn set_x0(&mut self, x0: Length) {
        self.initial_x_length = x0;
        self.z_apex = apex_z(x0, self.tan_alpha);
    }
    pub fn offset_o(&mut self, offset: Vector3f) {
        self.r.o += offset;
    }

    /// Local frame: x is the tangent, z the propagation direction.
    pub fn frame(&self) -> Frame {
        Frame {
            t: self.x(),
            b: self.y(),
            n: self.r.d,
        }
    }

    /// Major and minor cross-section axes after propagating a distance `z`.
    pub fn axes(&self, z: Length) -> ConeAxes {
        let r = Length(self.tan_alpha * z.0) + self.initial_x_length;
        ConeAxes {
            x: r,
            y: r * self.one_over_e,
        }
    }

    /// Cross-section radius in local direction `r2` (unit) at distance `z`.
    pub fn radius(&self, z: Length, r2: Vector2f) -> Length {
        let axes = self.axes(z);
        let (a, b) = (axes.x, axes.y);
        if a == Length::ZERO || b == Length::ZERO {
            return Length::ZERO;
        }
        let cos2 = r2.x * r2.x;
        Length(a.0 * b.0 / (a.0 * a.0 * (1.0 - cos2) + b.0 * b.0 * cos2).sqrt())
    }

    pub fn contains(&self, p: Point3f, range: &LengthRange) -> bool {
        self.contains_local(self.frame().to_local(&(p - self.r.o)), range)
    }

    /// Containment test in the cone's local frame (coordinates in metres).
    pub fn contains_local(&self, p: Vector3f, range: &LengthRange) -> bool {
        let ztx = p.z * self.tan_alpha + self.initial_x_length.0;
        range.contains(Length(p.z))
            && self.z_apex.0 <= p.z
            && p.x * p.x + (self.e * p.y) * (self.e * p.y) <= ztx * ztx
    }

    /// Wide containment test for 8 local-frame points.
    pub fn contains_local8(&self, p: &Vec3x8, range: &LengthRange) -> Mask8 {
        let x2 = p.x * p.x;
        let ey = p.y * self.e;
        let ztx = p.z.mul_add(&Float8::splat(self.tan_alpha), &Float8::splat(self.initial_x_length.0));
        let cond1 = Float8::splat(self.z_apex.0).le(&p.z);
        let cond2 = Float8::splat(range.min.0)
            .le(&p.z)
            .and(p.z.le(&Float8::splat(range.max.0)));
        let cond3 = (x2 + ey * ey).le(&(ztx * ztx));
        cond1.and(cond2).and(cond3)
    }

    /// Projects the local-frame point `p` onto the cross section at
    /// propagation distance `z`.
    pub fn project_local(&self, p: Vector3f, z: Length) -> Vector2f {
        let xy = Vector2f { x: p.x, y: p.y };
        if self.is_ray() {
            return xy;
        }
        let z0 = p.z;
        let scale = (self.tan_alpha * z.0 + self.initial_x_length.0)
            / (self.tan_alpha * z0 + self.initial_x_length.0).abs();
        xy * scale
    }

    pub fn project(&self, p: Point3f, z: Length) -> Vector2f {
        let u = self.frame().to_local(&(p - self.r.o));
        self.project_local(u, z)
    }

    /// A cone with direction `ray.d` and half-opening `tan_alpha` that passes
    /// through the ellipse spanned by world-space axes `wa`, `wb` centred at
    /// `ray.o`. Also reports the distance past the origin over which the cone
    /// keeps intersecting its sourcing ellipse.
    pub fn through_ellipse(
        wa: Vector3f,
        wb: Vector3f,
        ray: &Ray,
        tan_alpha: Float,
    ) -> (EllipticCone, Length) {
        let la = wa.length();
        let lb = wb.length();
        if la == 0.0 && lb == 0.0 {
            return (EllipticCone::new(*ray, tan_alpha, Length::ZERO), Length::ZERO);
        }

        // project the ellipse axes onto the cross-section plane
        let d = ray.d;
        let pa = wa - d.v() * d.dot(&wa);
        let pb = wb - d.v() * d.dot(&wb);
        let ra = pa.length();
        let rb = pb.length();

        let (x, x_len, minor) = if ra >= rb {
            (pa, ra, rb)
        } else {
            (pb, rb, ra)
        };
        let tangent = if x_len > 0.0 {
            Dir3::new(x - d.v() * d.dot(&x))
        } else {
            Frame::build_orthogonal(d).t
        };
        let x0 = Length(x_len.max(minor).max(1e-12));
        let ecc = if x_len > 0.0 && minor > 0.0 && minor < x_len {
            (1.0 as Float - (minor / x_len) * (minor / x_len)).max(0.0).sqrt()
        } else {
            0.0
        };
        let cone = EllipticCone::with_tangent(*ray, tangent, tan_alpha, ecc, x0);

        // distance over which the sourcing ellipse stays inside the cone
        let f = cone.frame();
        let mut self_isect = Length::ZERO;
        for p in &[wa, -wa, wb, -wb] {
            let l = f.to_local(p);
            self_isect = self_isect.max(Length(-l.z));
            if tan_alpha > 0.0 {
                let radial = (l.x * l.x + (cone.e * l.y) * (cone.e * l.y)).sqrt();
                let excess = radial - (x0.0 + l.z * tan_alpha);
                if excess > 0.0 {
                    self_isect = self_isect.max(Length(excess / tan_alpha));
                }
            }
        }
        (cone, self_isect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::quantity::Length;

    fn test_cone() -> EllipticCone {
        let r = Ray::new(
            Point3f::new(0.0, 0.0, 0.0),
            Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
        );
        EllipticCone::with_tangent(
            r,
            Dir3::from_normalized(Vector3f::new(1.0, 0.0, 0.0)),
            0.1,
            0.5,
            Length(0.25),
        )
    }

    #[test]
    fn contains_mean_ray() {
        let cone = test_cone();
        for i in 0..64 {
            let d = Length(i as Float * 0.5);
            assert!(cone.contains(cone.ray().propagate(d), &LengthRange::positive()));
        }
    }

    #[test]
    fn degenerate_ray_contains_only_axis() {
        let r = Ray::new(
            Point3f::new(1.0, 2.0, 3.0),
            Dir3::from_normalized(Vector3f::new(1.0, 0.0, 0.0)),
        );
        let cone = EllipticCone::from_ray(r);
        assert!(cone.is_ray());
        assert!(cone.contains(r.propagate(Length(5.0)), &LengthRange::positive()));
        assert!(!cone.contains(Point3f::new(2.0, 2.5, 3.0), &LengthRange::positive()));
    }

    #[test]
    fn axes_grow_linearly() {
        let cone = test_cone();
        let a0 = cone.axes(Length(0.0));
        let a10 = cone.axes(Length(10.0));
        assert_eq!(a0.x, Length(0.25));
        assert!((a10.x.0 - 1.25).abs() < 1e-6);
        // minor axis shortened by sqrt(1 - ecc^2)
        assert!((a10.y.0 / a10.x.0 - cone.one_over_e()).abs() < 1e-6);
    }

    #[test]
    fn wide_contains_matches_scalar() {
        let cone = test_cone();
        let range = LengthRange::positive();
        let pts: Vec<Vector3f> = (0..8)
            .map(|i| Vector3f::new(0.1 * i as Float, -0.05 * i as Float, i as Float))
            .collect();
        let wide = Vec3x8 {
            x: Float8::from_fn(|i| pts[i].x),
            y: Float8::from_fn(|i| pts[i].y),
            z: Float8::from_fn(|i| pts[i].z),
        };
        let m = cone.contains_local8(&wide, &range);
        for (i, p) in pts.iter().enumerate() {
            assert_eq!(m.get(i), cone.contains_local(*p, &range));
        }
    }

    #[test]
    fn through_ellipse_contains_rim() {
        let ray = Ray::new(
            Point3f::new(0.0, 0.0, 0.0),
            Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
        );
        let wa = Vector3f::new(0.2, 0.0, 0.0);
        let wb = Vector3f::new(0.0, 0.1, 0.0);
        let (cone, self_isect) = EllipticCone::through_ellipse(wa, wb, &ray, 0.05);
        assert!(cone.x0() >= Length(0.2));
        assert!(self_isect >= Length::ZERO);
        for p in &[wa, -wa, wb, -wb] {
            assert!(cone.contains(ray.o + *p, &LengthRange::positive()));
        }
    }
}
