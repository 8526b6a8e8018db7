//! Stokes vectors and Mueller operators.

// std
use std::ops;
// others
use num::complex::Complex;
use serde::{Deserialize, Serialize};
// wavert
use crate::core::frame::Frame;
use crate::core::geometry::Vector2f;
use crate::core::quantity::Float;

/// Stokes parameters (I, Q, U, V) of a partially polarized field.
/// "Intensity" is used in a generalized sense; the carried units depend on
/// context (radiant flux, importance, ...).
#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stokes {
    pub s: [Float; 4],
}

impl Stokes {
    pub fn zero() -> Stokes {
        Stokes::default()
    }
    pub fn unpolarized(i: Float) -> Stokes {
        Stokes {
            s: [i, 0.0, 0.0, 0.0],
        }
    }
    pub fn linearly_polarized(lp_angle: Float, i: Float) -> Stokes {
        Stokes {
            s: [
                i,
                i * (2.0 as Float * lp_angle).cos(),
                i * (2.0 as Float * lp_angle).sin(),
                0.0,
            ],
        }
    }
    pub fn circularly_polarized(rhc: bool, i: Float) -> Stokes {
        Stokes {
            s: [i, 0.0, 0.0, if rhc { i } else { -i }],
        }
    }

    pub fn intensity(&self) -> Float {
        self.s[0]
    }
    pub fn polarization_state(&self) -> [Float; 3] {
        [self.s[1], self.s[2], self.s[3]]
    }
    pub fn polarized_intensity(&self) -> Float {
        (self.s[1] * self.s[1] + self.s[2] * self.s[2] + self.s[3] * self.s[3]).sqrt()
    }
    pub fn unpolarized_intensity(&self) -> Float {
        (self.intensity() - self.polarized_intensity()).max(0.0)
    }
    pub fn degree_of_polarization(&self) -> Float {
        let i = self.intensity();
        if i > 0.0 {
            self.polarized_intensity() / i
        } else {
            0.0
        }
    }
    pub fn is_finite(&self) -> bool {
        self.s.iter().all(|v| v.is_finite())
    }

    /// The same state expressed in a frame of flipped handness.
    pub fn flip_handness(&self) -> Stokes {
        Stokes {
            s: [self.s[0], self.s[1], -self.s[2], -self.s[3]],
        }
    }

    /// Re-expresses the Stokes vector in a new transverse frame sharing the
    /// same propagation normal.
    pub fn reorient(&self, current: &Frame, new: &Frame) -> Stokes {
        debug_assert!((1.0 - current.n.dot(&new.n.v()).abs()) < 1e-3);

        // align tangent direction
        let tou = current.to_local_2d(&new.t.v()).normalize();
        let tov = current.to_local_2d(&new.b.v()).normalize();

        // rotate (Q, U) twice by the tangent rotation
        let (c, s) = (tou.x, tou.y);
        let rot = |v: Vector2f| Vector2f {
            x: c * v.x - s * v.y,
            y: s * v.x + c * v.y,
        };
        let qu = rot(rot(Vector2f {
            x: self.s[1],
            y: self.s[2],
        }));
        let out = Stokes {
            s: [self.s[0], qu.x, qu.y, self.s[3]],
        };

        // handness change?
        let v = rot(Vector2f { x: 0.0, y: 1.0 });
        if v.dot(&tov) < 0.0 {
            out.flip_handness()
        } else {
            out
        }
    }
}

impl_op_ex!(+|a: Stokes, b: Stokes| -> Stokes {
    Stokes { s: [a.s[0] + b.s[0], a.s[1] + b.s[1], a.s[2] + b.s[2], a.s[3] + b.s[3]] }
});
impl_op_ex!(+=|a: &mut Stokes, b: Stokes| {
    for i in 0..4 { a.s[i] += b.s[i]; }
});
impl_op_ex!(*|a: Stokes, b: Float| -> Stokes {
    Stokes { s: [a.s[0] * b, a.s[1] * b, a.s[2] * b, a.s[3] * b] }
});
impl_op_ex!(*|a: Float, b: Stokes| -> Stokes { b * a });
impl_op_ex!(/|a: Stokes, b: Float| -> Stokes { a * (1.0 as Float / b) });

/// A real 4x4 operator acting on Stokes vectors.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mueller {
    pub m: [[Float; 4]; 4],
}

impl Default for Mueller {
    fn default() -> Self {
        Mueller::identity()
    }
}

impl Mueller {
    pub fn zero() -> Mueller {
        Mueller { m: [[0.0; 4]; 4] }
    }
    pub fn identity() -> Mueller {
        let mut m = [[0.0 as Float; 4]; 4];
        for (i, row) in m.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Mueller { m }
    }
    pub fn scale(s: Float) -> Mueller {
        let mut m = Mueller::identity();
        for row in m.m.iter_mut() {
            for v in row.iter_mut() {
                *v *= s;
            }
        }
        m
    }
    /// An ideal depolarizer passing the given fraction of intensity.
    pub fn depolarizer(transmittance: Float) -> Mueller {
        let mut m = Mueller::zero();
        m.m[0][0] = transmittance;
        m
    }

    /// Frame rotation by `theta` about the propagation axis.
    pub fn rotator(theta: Float) -> Mueller {
        let c = (2.0 as Float * theta).cos();
        let s = (2.0 as Float * theta).sin();
        Mueller {
            m: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, c, s, 0.0],
                [0.0, -s, c, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }

    /// The polarimetric operator of an interaction with complex amplitude
    /// coefficients `s`, `p` in the s/p (or soft/hard) basis.
    pub fn from_sp_amplitudes(s: Complex<Float>, p: Complex<Float>) -> Mueller {
        let ss = s.norm_sqr();
        let pp = p.norm_sqr();
        let sp = s * p.conj();
        let a = 0.5 as Float * (ss + pp);
        let b = 0.5 as Float * (ss - pp);
        Mueller {
            m: [
                [a, b, 0.0, 0.0],
                [b, a, 0.0, 0.0],
                [0.0, 0.0, sp.re, sp.im],
                [0.0, 0.0, -sp.im, sp.re],
            ],
        }
    }

    pub fn is_finite(&self) -> bool {
        self.m.iter().flatten().all(|v| v.is_finite())
    }

    /// The intensity transmittance for unpolarized input.
    pub fn mean_transmittance(&self) -> Float {
        self.m[0][0]
    }
}

/// The Mueller operator that re-expresses Stokes state from the transverse
/// frame `current` into `new` (both sharing the propagation normal).
pub fn reorient_operator(current: &Frame, new: &Frame) -> Mueller {
    let tou = current.to_local_2d(&new.t.v()).normalize();
    let tov = current.to_local_2d(&new.b.v()).normalize();
    let theta = tou.y.atan2(tou.x);
    let r = Mueller::rotator(-theta);
    // handness change?
    let v = Vector2f {
        x: -theta.sin(),
        y: theta.cos(),
    };
    if v.dot(&tov) < 0.0 {
        let flip = Mueller {
            m: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, -1.0, 0.0],
                [0.0, 0.0, 0.0, -1.0],
            ],
        };
        flip * r
    } else {
        r
    }
}

impl_op_ex!(*|a: Mueller, b: Mueller| -> Mueller {
    let mut r = Mueller::zero();
    for i in 0..4 {
        for j in 0..4 {
            let mut acc: Float = 0.0;
            for (k, bk) in b.m.iter().enumerate() {
                acc += a.m[i][k] * bk[j];
            }
            r.m[i][j] = acc;
        }
    }
    r
});
impl_op_ex!(*|a: Mueller, b: Stokes| -> Stokes {
    let mut r = Stokes::zero();
    for i in 0..4 {
        let mut acc: Float = 0.0;
        for j in 0..4 {
            acc += a.m[i][j] * b.s[j];
        }
        r.s[i] = acc;
    }
    r
});
impl_op_ex!(*|a: Mueller, b: Float| -> Mueller {
    let mut r = a;
    for row in r.m.iter_mut() {
        for v in row.iter_mut() {
            *v *= b;
        }
    }
    r
});
impl_op_ex!(*|a: Float, b: Mueller| -> Mueller { b * a });

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::{Dir3, Vector3f};
    use crate::core::quantity::PI;

    #[test]
    fn reorient_roundtrip() {
        let n = Dir3::new(Vector3f::new(0.0, 0.0, 1.0));
        let a = Frame::build_orthogonal(n);
        let mut b = a;
        // rotate the transverse frame by 30 degrees
        let theta = PI / 6.0;
        b.t = Dir3::new(a.t.v() * theta.cos() + a.b.v() * theta.sin());
        b.b = Dir3::new(n.cross(&b.t));
        let s = Stokes {
            s: [2.0, 0.5, -0.3, 0.1],
        };
        let rt = s.reorient(&a, &b).reorient(&b, &a);
        for i in 0..4 {
            assert!((rt.s[i] - s.s[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn reorient_flipped_handness_negates_u_v() {
        let n = Dir3::new(Vector3f::new(0.0, 0.0, 1.0));
        let a = Frame::build_orthogonal(n);
        let b = a.flip_handness();
        let s = Stokes {
            s: [1.0, 0.25, 0.5, -0.75],
        };
        let r = s.reorient(&a, &b);
        assert!((r.s[0] - s.s[0]).abs() < 1e-6);
        assert!((r.s[1] - s.s[1]).abs() < 1e-6);
        assert!((r.s[2] + s.s[2]).abs() < 1e-6);
        assert!((r.s[3] + s.s[3]).abs() < 1e-6);
    }

    #[test]
    fn sp_operator_is_physical() {
        let m = Mueller::from_sp_amplitudes(
            Complex::new(0.8, 0.1),
            Complex::new(-0.3, 0.55),
        );
        for s in &[
            Stokes::unpolarized(1.0),
            Stokes::linearly_polarized(0.7, 2.0),
            Stokes::circularly_polarized(true, 1.5),
        ] {
            let out = m * *s;
            assert!(out.intensity() >= out.polarized_intensity() - 1e-5);
        }
    }

    #[test]
    fn rotator_preserves_intensity_and_dop() {
        let m = Mueller::rotator(0.4);
        let s = Stokes::linearly_polarized(0.2, 3.0);
        let out = m * s;
        assert!((out.intensity() - s.intensity()).abs() < 1e-5);
        assert!((out.degree_of_polarization() - s.degree_of_polarization()).abs() < 1e-5);
    }

    #[test]
    fn reorient_operator_matches_stokes_reorient() {
        let n = Dir3::new(Vector3f::new(0.0, 0.0, 1.0));
        let a = Frame::build_orthogonal(n);
        let mut b = a;
        let theta = 0.9 as Float;
        b.t = Dir3::new(a.t.v() * theta.cos() + a.b.v() * theta.sin());
        b.b = Dir3::new(n.cross(&b.t));
        let s = Stokes {
            s: [1.0, 0.4, -0.2, 0.6],
        };
        let via_op = reorient_operator(&a, &b) * s;
        let direct = s.reorient(&a, &b);
        for i in 0..4 {
            assert!((via_op.s[i] - direct.s[i]).abs() < 1e-5);
        }
        // flipped-handness target frames agree too
        let c = b.flip_handness();
        let via_op = reorient_operator(&a, &c) * s;
        let direct = s.reorient(&a, &c);
        for i in 0..4 {
            assert!((via_op.s[i] - direct.s[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn operator_products_compose() {
        let a = Mueller::rotator(0.3);
        let b = Mueller::from_sp_amplitudes(Complex::new(0.9, 0.0), Complex::new(0.2, 0.0));
        let s = Stokes::unpolarized(1.0);
        let lhs = (a * b) * s;
        let rhs = a * (b * s);
        for i in 0..4 {
            assert!((lhs.s[i] - rhs.s[i]).abs() < 1e-5);
        }
    }
}
