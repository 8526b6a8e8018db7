//! Geometric intersection kernels: wide ray tests and cone overlap tests.

// wavert
use crate::core::elliptic_cone::EllipticCone;
use crate::core::geometry::{Point3f, Ray, Vector2f, Vector3f};
use crate::core::quantity::{Float, Length, LengthRange};
use crate::core::simd::{Float8, Mask8, Vec3x8, WIDTH};

const RAY_TRI_EPSILON: Float = 1e-9;

/// Result of an 8-wide ray-AABB slab test.
#[derive(Debug, Default, Copy, Clone)]
pub struct RayAabb8 {
    pub mask: Mask8,
    pub entry: Float8,
}

/// Slab test of one ray against 8 AABBs.
///
/// `o` and `inv_d` are the ray origin and reciprocal direction splatted
/// across the lanes.
pub fn intersect_ray_aabb8(
    b_min: &Vec3x8,
    b_max: &Vec3x8,
    o: &Vec3x8,
    inv_d: &Vec3x8,
    t_min: Float,
    t_max: Float,
) -> RayAabb8 {
    let tx0 = (b_min.x - o.x) * inv_d.x;
    let tx1 = (b_max.x - o.x) * inv_d.x;
    let ty0 = (b_min.y - o.y) * inv_d.y;
    let ty1 = (b_max.y - o.y) * inv_d.y;
    let tz0 = (b_min.z - o.z) * inv_d.z;
    let tz1 = (b_max.z - o.z) * inv_d.z;

    let near = tx0
        .min(&tx1)
        .max(&ty0.min(&ty1))
        .max(&tz0.min(&tz1))
        .max(&Float8::splat(t_min));
    let far = tx0
        .max(&tx1)
        .min(&ty0.max(&ty1))
        .min(&tz0.max(&tz1))
        .min(&Float8::splat(t_max));

    RayAabb8 {
        mask: near.le(&far),
        entry: near,
    }
}

/// Result of an 8-wide ray-triangle test.
#[derive(Debug, Default, Copy, Clone)]
pub struct RayTri8 {
    pub mask: Mask8,
    pub t: Float8,
    pub b1: Float8,
    pub b2: Float8,
    /// Per lane: determinant positive, i.e. the front face was hit.
    pub front: Mask8,
}

/// Moller-Trumbore test of one ray against 8 triangles.
pub fn intersect_ray_tri8(
    o: &Vec3x8,
    d: &Vec3x8,
    a: &Vec3x8,
    b: &Vec3x8,
    c: &Vec3x8,
    t_min: Float,
    t_max: Float,
) -> RayTri8 {
    let e1 = *b - *a;
    let e2 = *c - *a;
    let pvec = d.cross(&e2);
    let det = e1.dot(&pvec);
    let valid = det.abs().gt(&Float8::splat(RAY_TRI_EPSILON));

    let inv_det = Float8::splat(1.0) / det;
    let tvec = *o - *a;
    let b1 = tvec.dot(&pvec) * inv_det;
    let qvec = tvec.cross(&e1);
    let b2 = d.dot(&qvec) * inv_det;
    let t = e2.dot(&qvec) * inv_det;

    let zero = Float8::splat(0.0);
    let one = Float8::splat(1.0);
    let mask = valid
        .and(b1.ge(&zero))
        .and(b2.ge(&zero))
        .and((b1 + b2).le(&one))
        .and(t.ge(&Float8::splat(t_min)))
        .and(t.le(&Float8::splat(t_max)));

    RayTri8 {
        mask,
        t,
        b1,
        b2,
        front: det.gt(&zero),
    }
}

/// Single ray-triangle intersection.
#[derive(Debug, Copy, Clone)]
pub struct RayTriIsect {
    pub dist: Length,
    pub b1: Float,
    pub b2: Float,
    pub front_face: bool,
}

pub fn intersect_ray_tri(
    ray: &Ray,
    a: Point3f,
    b: Point3f,
    c: Point3f,
    range: &LengthRange,
) -> Option<RayTriIsect> {
    let e1 = b - a;
    let e2 = c - a;
    let d = ray.d.v();
    let pvec = d.cross(&e2);
    let det = e1.dot(&pvec);
    if det.abs() <= RAY_TRI_EPSILON {
        return None;
    }
    let inv_det = 1.0 as Float / det;
    let tvec = ray.o - a;
    let b1 = tvec.dot(&pvec) * inv_det;
    if !(0.0..=1.0).contains(&b1) {
        return None;
    }
    let qvec = tvec.cross(&e1);
    let b2 = d.dot(&qvec) * inv_det;
    if b2 < 0.0 || b1 + b2 > 1.0 {
        return None;
    }
    let t = Length(e2.dot(&qvec) * inv_det);
    if !range.contains(t) {
        return None;
    }
    Some(RayTriIsect {
        dist: t,
        b1,
        b2,
        front_face: det > 0.0,
    })
}

/// Fate of a BVH child AABB under a cone query.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConeAabbFate {
    Disjoint,
    Partial,
    Contained,
}

/// Classifies one AABB against a cone: fully contained subtrees are
/// harvested whole, disjoint ones skipped, the rest descended into.
/// Containment is exact (the cone is convex, so all eight corners inside
/// suffices); disjointness is conservative via a bounding-sphere test.
pub fn classify_cone_aabb(
    cone: &EllipticCone,
    p_min: Point3f,
    p_max: Point3f,
    range: &LengthRange,
) -> ConeAabbFate {
    let frame = cone.frame();
    let o = cone.o();
    // all 8 corners in one wide transform
    let corners = Vec3x8 {
        x: Float8::from_fn(|i| if i & 1 == 0 { p_min.x } else { p_max.x } - o.x),
        y: Float8::from_fn(|i| if i & 2 == 0 { p_min.y } else { p_max.y } - o.y),
        z: Float8::from_fn(|i| if i & 4 == 0 { p_min.z } else { p_max.z } - o.z),
    };
    let d = Vec3x8::splat(frame.n.v());
    let t = Vec3x8::splat(frame.t.v());
    let b = Vec3x8::splat(frame.b.v());
    let local = Vec3x8 {
        x: corners.dot(&t),
        y: corners.dot(&b),
        z: corners.dot(&d),
    };

    let mut z_min = std::f32::INFINITY;
    let mut z_max = -std::f32::INFINITY;
    for i in 0..WIDTH {
        z_min = z_min.min(local.z.get(i));
        z_max = z_max.max(local.z.get(i));
    }
    if z_max < range.min.0 || z_min > range.max.0 {
        return ConeAabbFate::Disjoint;
    }

    if cone.contains_local8(&local, range).all() {
        return ConeAabbFate::Contained;
    }

    // conservative disjoint test with the box bounding sphere against the
    // circumscribing circular cone
    let centre = (p_min.to_vec() + p_max.to_vec()) * 0.5;
    let half_diag = ((p_max - p_min) * 0.5).length();
    let lc = frame.to_local(&(centre - o.to_vec()));
    if lc.z + half_diag < cone.z_apex().0 {
        return ConeAabbFate::Disjoint;
    }
    let axis_dist = (lc.x * lc.x + lc.y * lc.y).sqrt();
    let max_radius = (cone.tan_alpha() * (lc.z + half_diag) + cone.x0().0).max(0.0);
    if axis_dist - half_diag > max_radius {
        return ConeAabbFate::Disjoint;
    }
    ConeAabbFate::Partial
}

/// Cone-triangle intersection: the nearest axial distance of a triangle
/// point inside the cone, if the closed triangle overlaps the cone in range.
#[derive(Debug, Copy, Clone)]
pub struct ConeTriIsect {
    pub dist: Length,
    pub front_face: bool,
}

pub fn intersect_cone_tri(
    cone: &EllipticCone,
    a: Point3f,
    b: Point3f,
    c: Point3f,
    n: Vector3f,
    range: &LengthRange,
) -> Option<ConeTriIsect> {
    let frame = cone.frame();
    let o = cone.o().to_vec();
    let la = frame.to_local(&(a.to_vec() - o));
    let lb = frame.to_local(&(b.to_vec() - o));
    let lc = frame.to_local(&(c.to_vec() - o));

    let mut best: Float = std::f32::INFINITY;

    // vertices inside the cone
    for v in &[la, lb, lc] {
        if cone.contains_local(*v, range) {
            best = best.min(v.z);
        }
    }

    // triangle edges crossing the cone boundary surface
    let e = cone.e();
    let tan = cone.tan_alpha();
    let x0 = cone.x0().0;
    for (p, q) in &[(la, lb), (lb, lc), (lc, la)] {
        let dv = *q - *p;
        let w = x0 + tan * p.z;
        let wd = tan * dv.z;
        let qa = dv.x * dv.x + e * e * dv.y * dv.y - wd * wd;
        let qb = 2.0 as Float * (p.x * dv.x + e * e * p.y * dv.y - w * wd);
        let qc = p.x * p.x + e * e * p.y * p.y - w * w;
        let mut roots: [Option<Float>; 2] = [None, None];
        if qa.abs() < 1e-12 {
            if qb.abs() > 1e-12 {
                roots[0] = Some(-qc / qb);
            }
        } else {
            let disc = qb * qb - 4.0 as Float * qa * qc;
            if disc >= 0.0 {
                let sq = disc.sqrt();
                roots[0] = Some((-qb - sq) / (2.0 as Float * qa));
                roots[1] = Some((-qb + sq) / (2.0 as Float * qa));
            }
        }
        for r in roots.iter().flatten() {
            if !(0.0..=1.0).contains(r) {
                continue;
            }
            let z = p.z + r * dv.z;
            if z < cone.z_apex().0 || !range.contains(Length(z)) {
                continue;
            }
            // reject mirror-sheet roots
            if w + r * wd < 0.0 {
                continue;
            }
            best = best.min(z);
        }
    }

    // mean ray through the triangle interior
    {
        let axis = Ray::new(
            Point3f::default(),
            crate::core::geometry::Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
        );
        let pa = Point3f::new(la.x, la.y, la.z);
        let pb = Point3f::new(lb.x, lb.y, lb.z);
        let pc = Point3f::new(lc.x, lc.y, lc.z);
        if let Some(hit) = intersect_ray_tri(&axis, pa, pb, pc, range) {
            if hit.dist.0 >= cone.z_apex().0 {
                best = best.min(hit.dist.0);
            }
        }
    }

    if best.is_finite() {
        Some(ConeTriIsect {
            dist: Length(best),
            front_face: cone.d().dot(&n) < 0.0,
        })
    } else {
        None
    }
}

pub fn test_cone_tri(
    cone: &EllipticCone,
    a: Point3f,
    b: Point3f,
    c: Point3f,
    n: Vector3f,
    range: &LengthRange,
) -> bool {
    intersect_cone_tri(cone, a, b, c, n, range).is_some()
}

pub fn is_point_in_ellipse(p: Vector2f, axes: Vector2f) -> bool {
    if axes.x <= 0.0 || axes.y <= 0.0 {
        return false;
    }
    let u = p.x / axes.x;
    let v = p.y / axes.y;
    u * u + v * v <= 1.0
}

/// Clips the segment `u1..u2` against an origin-centred axis-aligned
/// ellipse; returns the inside parameter range, if any.
pub fn intersect_edge_ellipse(
    u1: Vector2f,
    u2: Vector2f,
    rx: Float,
    ry: Float,
) -> Option<(Float, Float)> {
    if rx <= 0.0 || ry <= 0.0 {
        return None;
    }
    // scale to the unit circle
    let p = Vector2f {
        x: u1.x / rx,
        y: u1.y / ry,
    };
    let d = Vector2f {
        x: (u2.x - u1.x) / rx,
        y: (u2.y - u1.y) / ry,
    };
    let a = d.length_squared();
    let b = 2.0 as Float * p.dot(&d);
    let c = p.length_squared() - 1.0 as Float;
    if a <= 1e-16 {
        return if c <= 0.0 { Some((0.0, 1.0)) } else { None };
    }
    let disc = b * b - 4.0 as Float * a * c;
    if disc < 0.0 {
        return None;
    }
    let sq = disc.sqrt();
    let t1 = (-b - sq) / (2.0 as Float * a);
    let t2 = (-b + sq) / (2.0 as Float * a);
    if t2 < 0.0 || t1 > 1.0 {
        return None;
    }
    Some((t1, t2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::Dir3;

    fn tri8(a: Point3f, b: Point3f, c: Point3f) -> (Vec3x8, Vec3x8, Vec3x8) {
        (
            Vec3x8::splat_point(a),
            Vec3x8::splat_point(b),
            Vec3x8::splat_point(c),
        )
    }

    #[test]
    fn wide_ray_tri_hits_center() {
        let (a, b, c) = tri8(
            Point3f::new(-1.0, -1.0, 5.0),
            Point3f::new(1.0, -1.0, 5.0),
            Point3f::new(0.0, 1.0, 5.0),
        );
        let o = Vec3x8::splat(Vector3f::default());
        let d = Vec3x8::splat(Vector3f::new(0.0, 0.0, 1.0));
        let hit = intersect_ray_tri8(&o, &d, &a, &b, &c, 0.0, std::f32::INFINITY);
        assert!(hit.mask.all());
        for i in 0..WIDTH {
            assert!((hit.t.get(i) - 5.0).abs() < 1e-5);
        }
    }

    #[test]
    fn scalar_ray_tri_barycentrics_and_face() {
        let ray = Ray::new(
            Point3f::new(0.25, 0.25, -1.0),
            Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
        );
        let a = Point3f::new(0.0, 0.0, 0.0);
        let b = Point3f::new(1.0, 0.0, 0.0);
        let c = Point3f::new(0.0, 1.0, 0.0);
        let hit = intersect_ray_tri(&ray, a, b, c, &LengthRange::positive()).unwrap();
        assert!((hit.dist.0 - 1.0).abs() < 1e-6);
        assert!((hit.b1 - 0.25).abs() < 1e-6 && (hit.b2 - 0.25).abs() < 1e-6);
        // winding a->b->c has normal +z; the ray travels +z: back face
        assert!(!hit.front_face);
    }

    #[test]
    fn wide_aabb_orders_by_entry() {
        let b_min = Vec3x8 {
            x: Float8::from_fn(|i| i as Float * 10.0),
            y: Float8::splat(-1.0),
            z: Float8::splat(-1.0),
        };
        let b_max = Vec3x8 {
            x: Float8::from_fn(|i| i as Float * 10.0 + 1.0),
            y: Float8::splat(1.0),
            z: Float8::splat(1.0),
        };
        let o = Vec3x8::splat(Vector3f::new(-5.0, 0.0, 0.0));
        let inv_d = Vec3x8::splat(Vector3f::new(1.0, 1.0 / 1e-12, 1.0 / 1e-12));
        let hit = intersect_ray_aabb8(&b_min, &b_max, &o, &inv_d, 0.0, 1e9);
        assert!(hit.mask.all());
        for i in 1..WIDTH {
            assert!(hit.entry.get(i) > hit.entry.get(i - 1));
        }
    }

    #[test]
    fn cone_aabb_three_fates() {
        let cone = EllipticCone::new(
            Ray::new(
                Point3f::default(),
                Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
            ),
            0.2,
            Length(0.1),
        );
        let range = LengthRange::positive();
        // tiny box on the axis, well inside
        let fate = classify_cone_aabb(
            &cone,
            Point3f::new(-0.01, -0.01, 4.9),
            Point3f::new(0.01, 0.01, 5.1),
            &range,
        );
        assert_eq!(fate, ConeAabbFate::Contained);
        // box far off axis
        let fate = classify_cone_aabb(
            &cone,
            Point3f::new(50.0, 50.0, 4.9),
            Point3f::new(51.0, 51.0, 5.1),
            &range,
        );
        assert_eq!(fate, ConeAabbFate::Disjoint);
        // box straddling the cone boundary
        let fate = classify_cone_aabb(
            &cone,
            Point3f::new(0.9, -0.5, 4.5),
            Point3f::new(2.0, 0.5, 5.5),
            &range,
        );
        assert_eq!(fate, ConeAabbFate::Partial);
        // box behind the query range
        let fate = classify_cone_aabb(
            &cone,
            Point3f::new(-1.0, -1.0, -3.0),
            Point3f::new(1.0, 1.0, -2.0),
            &range,
        );
        assert_eq!(fate, ConeAabbFate::Disjoint);
    }

    #[test]
    fn cone_tri_distance_on_axis() {
        let cone = EllipticCone::new(
            Ray::new(
                Point3f::default(),
                Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
            ),
            0.1,
            Length(0.0),
        );
        let hit = intersect_cone_tri(
            &cone,
            Point3f::new(-1.0, -1.0, 3.0),
            Point3f::new(1.0, -1.0, 3.0),
            Point3f::new(0.0, 1.5, 3.0),
            Vector3f::new(0.0, 0.0, -1.0),
            &LengthRange::positive(),
        )
        .unwrap();
        assert!((hit.dist.0 - 3.0).abs() < 1e-5);
        assert!(hit.front_face);
    }

    #[test]
    fn cone_tri_misses_outside() {
        let cone = EllipticCone::new(
            Ray::new(
                Point3f::default(),
                Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
            ),
            0.01,
            Length(0.0),
        );
        let miss = intersect_cone_tri(
            &cone,
            Point3f::new(5.0, 5.0, 3.0),
            Point3f::new(6.0, 5.0, 3.0),
            Point3f::new(5.0, 6.0, 3.0),
            Vector3f::new(0.0, 0.0, -1.0),
            &LengthRange::positive(),
        );
        assert!(miss.is_none());
    }

    #[test]
    fn edge_ellipse_clipping() {
        // horizontal segment through a 2x1 ellipse
        let r = intersect_edge_ellipse(
            Vector2f { x: -4.0, y: 0.0 },
            Vector2f { x: 4.0, y: 0.0 },
            2.0,
            1.0,
        )
        .unwrap();
        assert!((r.0 - 0.25).abs() < 1e-6 && (r.1 - 0.75).abs() < 1e-6);
        assert!(intersect_edge_ellipse(
            Vector2f { x: -4.0, y: 5.0 },
            Vector2f { x: 4.0, y: 5.0 },
            2.0,
            1.0
        )
        .is_none());
    }
}
