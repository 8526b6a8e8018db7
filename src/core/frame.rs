//! Orthonormal tangent frames.

// wavert
use crate::core::geometry::{Dir3, Vector2f, Vector3f};
use crate::core::quantity::Float;

/// An orthonormal frame (t, b, n). Local coordinates put the normal on z.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Frame {
    pub t: Dir3,
    pub b: Dir3,
    pub n: Dir3,
}

impl Frame {
    pub fn to_local(&self, v: &Vector3f) -> Vector3f {
        Vector3f {
            x: v.dot(&self.t.v()),
            y: v.dot(&self.b.v()),
            z: v.dot(&self.n.v()),
        }
    }
    pub fn to_world(&self, v: &Vector3f) -> Vector3f {
        self.t.v() * v.x + self.b.v() * v.y + self.n.v() * v.z
    }
    pub fn to_local_dir(&self, d: &Dir3) -> Dir3 {
        Dir3::from_normalized(self.to_local(&d.v()))
    }
    pub fn to_world_dir(&self, d: &Dir3) -> Dir3 {
        Dir3::from_normalized(self.to_world(&d.v()))
    }
    /// Projection of a world vector onto the (t, b) tangent plane.
    pub fn to_local_2d(&self, v: &Vector3f) -> Vector2f {
        Vector2f {
            x: v.dot(&self.t.v()),
            y: v.dot(&self.b.v()),
        }
    }
    pub fn to_world_2d(&self, v: &Vector2f) -> Vector3f {
        self.t.v() * v.x + self.b.v() * v.y
    }

    /// +1 for right-handed frames, -1 for left-handed.
    pub fn handness(&self) -> Float {
        let h = self.n.cross(&self.t).dot(&self.b.v());
        if h > 0.0 {
            1.0
        } else {
            -1.0
        }
    }

    pub fn flip(&self) -> Frame {
        Frame {
            t: -self.t,
            b: -self.b,
            n: -self.n,
        }
    }

    /// Same frame with flipped handness (bitangent negated).
    pub fn flip_handness(&self) -> Frame {
        Frame {
            t: self.t,
            b: -self.b,
            n: self.n,
        }
    }

    pub fn canonical() -> Frame {
        Frame {
            t: Dir3::from_normalized(Vector3f::new(1.0, 0.0, 0.0)),
            b: Dir3::from_normalized(Vector3f::new(0.0, 1.0, 0.0)),
            n: Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
        }
    }

    /// An arbitrary orthonormal frame with the given normal.
    pub fn build_orthogonal(n: Dir3) -> Frame {
        let b: Vector3f = if n.x().abs() > n.y().abs() {
            let x = 1.0 as Float / (n.x() * n.x() + n.z() * n.z()).sqrt();
            Vector3f::new(x * n.z(), 0.0, -x * n.x())
        } else {
            let x = 1.0 as Float / (n.y() * n.y() + n.z() * n.z()).sqrt();
            Vector3f::new(0.0, x * n.z(), -x * n.y())
        };
        Frame {
            t: Dir3::from_normalized(b.cross(&n.v())),
            b: Dir3::from_normalized(b),
            n,
        }
    }

    /// A frame with normal `n` whose tangent aligns as closely as possible
    /// with `dpdu`. Falls back to an arbitrary frame for degenerate dpdu.
    pub fn build_shading(n: Dir3, dpdu: &Vector3f) -> Frame {
        if dpdu.length_squared() == 0.0 as Float {
            return Frame::build_orthogonal(n);
        }
        let t = (*dpdu - n.v() * n.dot(dpdu)).normalize();
        let b = n.cross(&Dir3::from_normalized(t)).normalize();
        Frame {
            t: Dir3::from_normalized(b.cross(&n.v())),
            b: Dir3::from_normalized(b),
            n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_world_to_local_roundtrip() {
        let n = Dir3::new(Vector3f::new(0.3, -0.4, 0.85));
        let f = Frame::build_orthogonal(n);
        let v = Vector3f::new(0.2, 1.7, -0.6);
        let w = f.to_world(&f.to_local(&v));
        assert!((w - v).length() < 1e-5);
        let l = f.to_local(&f.to_world(&v));
        assert!((l - v).length() < 1e-5);
    }

    #[test]
    fn orthogonal_frame_is_right_handed() {
        for n in &[
            Vector3f::new(0.0, 0.0, 1.0),
            Vector3f::new(1.0, 0.0, 0.0),
            Vector3f::new(-0.3, 0.9, 0.2),
        ] {
            let f = Frame::build_orthogonal(Dir3::new(*n));
            assert_eq!(f.handness(), 1.0);
            assert!(f.t.dot(&f.b.v()).abs() < 1e-6);
            assert!(f.t.dot(&f.n.v()).abs() < 1e-6);
        }
        let f = Frame::build_orthogonal(Dir3::new(Vector3f::new(0.1, 0.2, 0.97)));
        assert_eq!(f.flip_handness().handness(), -1.0);
    }
}
