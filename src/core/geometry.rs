//! Points, vectors, normals, unit vectors, bounding boxes and rays.

// std
use std::ops;
// others
use serde::{Deserialize, Serialize};
// wavert
use crate::core::quantity::{gamma, Float, Length};

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector2f {
    pub x: Float,
    pub y: Float,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point2f {
    pub x: Float,
    pub y: Float,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point2i {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector3f {
    pub x: Float,
    pub y: Float,
    pub z: Float,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point3f {
    pub x: Float,
    pub y: Float,
    pub z: Float,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normal3f {
    pub x: Float,
    pub y: Float,
    pub z: Float,
}

impl Vector2f {
    pub fn new(x: Float, y: Float) -> Self {
        Vector2f { x, y }
    }
    pub fn length_squared(&self) -> Float {
        self.x * self.x + self.y * self.y
    }
    pub fn length(&self) -> Float {
        self.length_squared().sqrt()
    }
    pub fn dot(&self, o: &Vector2f) -> Float {
        self.x * o.x + self.y * o.y
    }
    pub fn normalize(&self) -> Vector2f {
        *self / self.length()
    }
}

impl Vector3f {
    pub fn new(x: Float, y: Float, z: Float) -> Self {
        Vector3f { x, y, z }
    }
    pub fn length_squared(&self) -> Float {
        self.x * self.x + self.y * self.y + self.z * self.z
    }
    pub fn length(&self) -> Float {
        self.length_squared().sqrt()
    }
    pub fn dot(&self, o: &Vector3f) -> Float {
        self.x * o.x + self.y * o.y + self.z * o.z
    }
    pub fn cross(&self, o: &Vector3f) -> Vector3f {
        Vector3f {
            x: self.y * o.z - self.z * o.y,
            y: self.z * o.x - self.x * o.z,
            z: self.x * o.y - self.y * o.x,
        }
    }
    pub fn normalize(&self) -> Vector3f {
        *self / self.length()
    }
    pub fn abs(&self) -> Vector3f {
        Vector3f {
            x: self.x.abs(),
            y: self.y.abs(),
            z: self.z.abs(),
        }
    }
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
    pub fn max_component(&self) -> Float {
        self.x.max(self.y).max(self.z)
    }
    pub fn get(&self, axis: usize) -> Float {
        match axis {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }
}

impl Point3f {
    pub fn new(x: Float, y: Float, z: Float) -> Self {
        Point3f { x, y, z }
    }
    pub fn to_vec(&self) -> Vector3f {
        Vector3f {
            x: self.x,
            y: self.y,
            z: self.z,
        }
    }
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
    pub fn get(&self, axis: usize) -> Float {
        match axis {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }
    pub fn distance(&self, o: &Point3f) -> Length {
        Length((*o - *self).length())
    }
}

impl Normal3f {
    pub fn to_vec(&self) -> Vector3f {
        Vector3f {
            x: self.x,
            y: self.y,
            z: self.z,
        }
    }
}

impl From<Vector3f> for Normal3f {
    fn from(v: Vector3f) -> Self {
        Normal3f {
            x: v.x,
            y: v.y,
            z: v.z,
        }
    }
}

impl From<Point3f> for Vector3f {
    fn from(p: Point3f) -> Self {
        p.to_vec()
    }
}

impl_op_ex!(+|a: Vector2f, b: Vector2f| -> Vector2f { Vector2f { x: a.x + b.x, y: a.y + b.y } });
impl_op_ex!(-|a: Vector2f, b: Vector2f| -> Vector2f { Vector2f { x: a.x - b.x, y: a.y - b.y } });
impl_op_ex!(-|a: Vector2f| -> Vector2f { Vector2f { x: -a.x, y: -a.y } });
impl_op_ex!(*|a: Vector2f, b: Float| -> Vector2f { Vector2f { x: a.x * b, y: a.y * b } });
impl_op_ex!(*|a: Float, b: Vector2f| -> Vector2f { Vector2f { x: a * b.x, y: a * b.y } });
impl_op_ex!(/|a: Vector2f, b: Float| -> Vector2f { Vector2f { x: a.x / b, y: a.y / b } });
impl_op_ex!(*|a: Vector2f, b: Vector2f| -> Vector2f { Vector2f { x: a.x * b.x, y: a.y * b.y } });

impl_op_ex!(+|a: Point2f, b: Vector2f| -> Point2f { Point2f { x: a.x + b.x, y: a.y + b.y } });
impl_op_ex!(-|a: Point2f, b: Point2f| -> Vector2f { Vector2f { x: a.x - b.x, y: a.y - b.y } });
impl_op_ex!(*|a: Point2f, b: Float| -> Point2f { Point2f { x: a.x * b, y: a.y * b } });

impl_op_ex!(+|a: Vector3f, b: Vector3f| -> Vector3f {
    Vector3f { x: a.x + b.x, y: a.y + b.y, z: a.z + b.z }
});
impl_op_ex!(-|a: Vector3f, b: Vector3f| -> Vector3f {
    Vector3f { x: a.x - b.x, y: a.y - b.y, z: a.z - b.z }
});
impl_op_ex!(-|a: Vector3f| -> Vector3f { Vector3f { x: -a.x, y: -a.y, z: -a.z } });
impl_op_ex!(*|a: Vector3f, b: Float| -> Vector3f { Vector3f { x: a.x * b, y: a.y * b, z: a.z * b } });
impl_op_ex!(*|a: Float, b: Vector3f| -> Vector3f { Vector3f { x: a * b.x, y: a * b.y, z: a * b.z } });
impl_op_ex!(/|a: Vector3f, b: Float| -> Vector3f { Vector3f { x: a.x / b, y: a.y / b, z: a.z / b } });
impl_op_ex!(+=|a: &mut Vector3f, b: Vector3f| { a.x += b.x; a.y += b.y; a.z += b.z; });
impl_op_ex!(*=|a: &mut Vector3f, b: Float| { a.x *= b; a.y *= b; a.z *= b; });

impl_op_ex!(+|a: Point3f, b: Vector3f| -> Point3f {
    Point3f { x: a.x + b.x, y: a.y + b.y, z: a.z + b.z }
});
impl_op_ex!(-|a: Point3f, b: Vector3f| -> Point3f {
    Point3f { x: a.x - b.x, y: a.y - b.y, z: a.z - b.z }
});
impl_op_ex!(-|a: Point3f, b: Point3f| -> Vector3f {
    Vector3f { x: a.x - b.x, y: a.y - b.y, z: a.z - b.z }
});
impl_op_ex!(*|a: Point3f, b: Float| -> Point3f { Point3f { x: a.x * b, y: a.y * b, z: a.z * b } });
impl_op_ex!(+=|a: &mut Point3f, b: Vector3f| { a.x += b.x; a.y += b.y; a.z += b.z; });

impl_op_ex!(-|a: Normal3f| -> Normal3f { Normal3f { x: -a.x, y: -a.y, z: -a.z } });

pub fn pnt3_lerp(t: Float, a: &Point3f, b: &Point3f) -> Point3f {
    Point3f {
        x: (1.0 as Float - t) * a.x + t * b.x,
        y: (1.0 as Float - t) * a.y + t * b.y,
        z: (1.0 as Float - t) * a.z + t * b.z,
    }
}

/// A vector of unit length. Constructed by normalization; arithmetic on the
/// underlying vector goes through `v()`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dir3(Vector3f);

impl Dir3 {
    pub fn new(v: Vector3f) -> Self {
        Dir3(v.normalize())
    }
    /// Wraps a vector that is already normalized.
    pub fn from_normalized(v: Vector3f) -> Self {
        debug_assert!((v.length() - 1.0).abs() < 1e-4);
        Dir3(v)
    }
    pub fn v(&self) -> Vector3f {
        self.0
    }
    pub fn x(&self) -> Float {
        self.0.x
    }
    pub fn y(&self) -> Float {
        self.0.y
    }
    pub fn z(&self) -> Float {
        self.0.z
    }
    pub fn dot(&self, o: &Vector3f) -> Float {
        self.0.dot(o)
    }
    pub fn cross(&self, o: &Dir3) -> Vector3f {
        self.0.cross(&o.0)
    }
    pub fn flip(&self) -> Dir3 {
        Dir3(-self.0)
    }
}

impl Default for Dir3 {
    fn default() -> Self {
        Dir3(Vector3f {
            x: 0.0,
            y: 0.0,
            z: 1.0,
        })
    }
}

impl ops::Deref for Dir3 {
    type Target = Vector3f;
    fn deref(&self) -> &Vector3f {
        &self.0
    }
}

impl_op_ex!(-|a: Dir3| -> Dir3 { a.flip() });
impl_op_ex!(*|a: Dir3, b: Float| -> Vector3f { a.v() * b });
impl_op_ex!(*|a: Float, b: Dir3| -> Vector3f { a * b.v() });

/// A ray with a unit direction. Distances along the ray are lengths.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ray {
    pub o: Point3f,
    pub d: Dir3,
}

impl Ray {
    pub fn new(o: Point3f, d: Dir3) -> Self {
        Ray { o, d }
    }
    pub fn propagate(&self, t: Length) -> Point3f {
        self.o + self.d.v() * t.0
    }
}

impl Default for Ray {
    fn default() -> Self {
        Ray {
            o: Point3f::default(),
            d: Dir3::default(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds3f {
    pub p_min: Point3f,
    pub p_max: Point3f,
}

impl Default for Bounds3f {
    fn default() -> Self {
        Bounds3f {
            p_min: Point3f {
                x: std::f32::INFINITY,
                y: std::f32::INFINITY,
                z: std::f32::INFINITY,
            },
            p_max: Point3f {
                x: -std::f32::INFINITY,
                y: -std::f32::INFINITY,
                z: -std::f32::INFINITY,
            },
        }
    }
}

impl Bounds3f {
    pub fn new(p1: Point3f, p2: Point3f) -> Self {
        Bounds3f {
            p_min: Point3f {
                x: p1.x.min(p2.x),
                y: p1.y.min(p2.y),
                z: p1.z.min(p2.z),
            },
            p_max: Point3f {
                x: p1.x.max(p2.x),
                y: p1.y.max(p2.y),
                z: p1.z.max(p2.z),
            },
        }
    }
    pub fn diagonal(&self) -> Vector3f {
        self.p_max - self.p_min
    }
    pub fn centroid(&self) -> Point3f {
        self.p_min * 0.5 + (self.p_max - self.p_min) * 0.5
    }
    pub fn surface_area(&self) -> Float {
        if self.p_max.x < self.p_min.x {
            return 0.0 as Float;
        }
        let d: Vector3f = self.diagonal();
        2.0 as Float * (d.x * d.y + d.x * d.z + d.y * d.z)
    }
    pub fn maximum_extent(&self) -> usize {
        let d: Vector3f = self.diagonal();
        if d.x > d.y && d.x > d.z {
            0
        } else if d.y > d.z {
            1
        } else {
            2
        }
    }
    pub fn offset(&self, p: &Point3f) -> Vector3f {
        let mut o: Vector3f = *p - self.p_min;
        if self.p_max.x > self.p_min.x {
            o.x /= self.p_max.x - self.p_min.x;
        }
        if self.p_max.y > self.p_min.y {
            o.y /= self.p_max.y - self.p_min.y;
        }
        if self.p_max.z > self.p_min.z {
            o.z /= self.p_max.z - self.p_min.z;
        }
        o
    }
    pub fn contains(&self, p: &Point3f) -> bool {
        p.x >= self.p_min.x
            && p.x <= self.p_max.x
            && p.y >= self.p_min.y
            && p.y <= self.p_max.y
            && p.z >= self.p_min.z
            && p.z <= self.p_max.z
    }
    pub fn is_valid(&self) -> bool {
        self.p_min.x <= self.p_max.x
    }
    /// Scalar slab test against a ray segment.
    pub fn intersect_p(&self, ray: &Ray, t_max: Float) -> Option<(Float, Float)> {
        let mut t0: Float = 0.0;
        let mut t1: Float = t_max;
        for axis in 0..3_usize {
            let inv_ray_dir: Float = 1.0 as Float / ray.d.v().get(axis);
            let mut t_near: Float = (self.p_min.get(axis) - ray.o.get(axis)) * inv_ray_dir;
            let mut t_far: Float = (self.p_max.get(axis) - ray.o.get(axis)) * inv_ray_dir;
            if t_near > t_far {
                std::mem::swap(&mut t_near, &mut t_far);
            }
            t_far *= 1.0 as Float + 2.0 as Float * gamma(3);
            t0 = t0.max(t_near);
            t1 = t1.min(t_far);
            if t0 > t1 {
                return None;
            }
        }
        Some((t0, t1))
    }
}

pub fn bnd3_union_bnd3f(b1: &Bounds3f, b2: &Bounds3f) -> Bounds3f {
    Bounds3f {
        p_min: Point3f {
            x: b1.p_min.x.min(b2.p_min.x),
            y: b1.p_min.y.min(b2.p_min.y),
            z: b1.p_min.z.min(b2.p_min.z),
        },
        p_max: Point3f {
            x: b1.p_max.x.max(b2.p_max.x),
            y: b1.p_max.y.max(b2.p_max.y),
            z: b1.p_max.z.max(b2.p_max.z),
        },
    }
}

pub fn bnd3_union_pnt3f(b: &Bounds3f, p: &Point3f) -> Bounds3f {
    Bounds3f {
        p_min: Point3f {
            x: b.p_min.x.min(p.x),
            y: b.p_min.y.min(p.y),
            z: b.p_min.z.min(p.z),
        },
        p_max: Point3f {
            x: b.p_max.x.max(p.x),
            y: b.p_max.y.max(p.y),
            z: b.p_max.z.max(p.z),
        },
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds2i {
    pub p_min: Point2i,
    pub p_max: Point2i,
}

impl Bounds2i {
    pub fn new(p_min: Point2i, p_max: Point2i) -> Self {
        Bounds2i { p_min, p_max }
    }
    pub fn width(&self) -> i32 {
        (self.p_max.x - self.p_min.x).max(0)
    }
    pub fn height(&self) -> i32 {
        (self.p_max.y - self.p_min.y).max(0)
    }
    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }
    pub fn contains(&self, p: Point2i) -> bool {
        p.x >= self.p_min.x && p.x < self.p_max.x && p.y >= self.p_min.y && p.y < self.p_max.y
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::quantity::Length;

    #[test]
    fn vector_basics() {
        let v = Vector3f::new(3.0, 0.0, 4.0);
        assert_eq!(v.length(), 5.0);
        let n = v.normalize();
        assert!((n.length() - 1.0).abs() < 1e-6);
        let c = Vector3f::new(1.0, 0.0, 0.0).cross(&Vector3f::new(0.0, 1.0, 0.0));
        assert_eq!(c, Vector3f::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn ray_propagate() {
        let r = Ray::new(
            Point3f::new(1.0, 0.0, 0.0),
            Dir3::from_normalized(Vector3f::new(0.0, 1.0, 0.0)),
        );
        let p = r.propagate(Length(2.0));
        assert_eq!(p, Point3f::new(1.0, 2.0, 0.0));
    }

    #[test]
    fn bounds_union_and_slab() {
        let b = bnd3_union_pnt3f(&Bounds3f::default(), &Point3f::new(1.0, 1.0, 1.0));
        let b = bnd3_union_pnt3f(&b, &Point3f::new(-1.0, -1.0, -1.0));
        assert_eq!(b.surface_area(), 24.0);
        let ray = Ray::new(
            Point3f::new(0.0, 0.0, -5.0),
            Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
        );
        let hit = b.intersect_p(&ray, std::f32::INFINITY);
        assert!(hit.is_some());
        let (t0, _t1) = hit.unwrap();
        assert!((t0 - 4.0).abs() < 1e-4);
    }
}
