//! 2-D Gaussian distributions, with the singular Dirac case.

// std
use std::f32::consts::PI;
// wavert
use crate::core::geometry::Vector2f;
use crate::core::quantity::Float;
use crate::samplers::Sampler;

/// Whether a sampled value is drawn from a continuous density or a discrete
/// mass (Dirac).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Measure {
    Continuous,
    Discrete,
}

/// A 2-D Gaussian with axis-aligned-in-local-frame covariance.
///
/// `sigma = 0` in either component collapses the distribution to a Dirac.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Gaussian2d {
    mu: Vector2f,
    x: Vector2f,
    sigma: Vector2f,
    recp_sigma: Vector2f,
    norm: Float,
}

#[derive(Debug, Copy, Clone)]
pub struct Gaussian2dSample {
    pub pt: Vector2f,
    pub measure: Measure,
    pub pdf: Float,
}

impl Gaussian2d {
    /// `x` is the (unit) direction of the first sigma component.
    pub fn new(sigma: Vector2f, x: Vector2f, mu: Vector2f) -> Self {
        let recp_sigma = Vector2f {
            x: 1.0 as Float / sigma.x,
            y: 1.0 as Float / sigma.y,
        };
        Gaussian2d {
            mu,
            x,
            sigma,
            recp_sigma,
            norm: (1.0 as Float / (2.0 * PI)) * recp_sigma.x * recp_sigma.y,
        }
    }

    pub fn mean(&self) -> Vector2f {
        self.mu
    }
    pub fn std_dev(&self) -> Vector2f {
        self.sigma
    }
    pub fn is_dirac(&self) -> bool {
        self.sigma.x == 0.0 || self.sigma.y == 0.0
    }

    /// Distribution with mean and stddev scaled by a constant.
    pub fn scaled(&self, s: Float) -> Gaussian2d {
        Gaussian2d::new(self.sigma * s, self.x, self.mu * s)
    }

    fn y_axis(&self) -> Vector2f {
        Vector2f {
            x: -self.x.y,
            y: self.x.x,
        }
    }

    pub fn to_local(&self, v: Vector2f) -> Vector2f {
        Vector2f {
            x: self.x.dot(&v),
            y: self.y_axis().dot(&v),
        }
    }
    pub fn from_local(&self, v: Vector2f) -> Vector2f {
        self.x * v.x + self.y_axis() * v.y
    }

    pub fn to_canonical(&self, v: Vector2f) -> Vector2f {
        let p = self.to_local(v - self.mu);
        if !self.is_dirac() {
            Vector2f {
                x: p.x * self.recp_sigma.x,
                y: p.y * self.recp_sigma.y,
            }
        } else {
            Vector2f {
                x: if p.x == 0.0 { 0.0 } else { std::f32::INFINITY },
                y: if p.y == 0.0 { 0.0 } else { std::f32::INFINITY },
            }
        }
    }
    pub fn from_canonical(&self, v: Vector2f) -> Vector2f {
        self.from_local(Vector2f {
            x: self.sigma.x * v.x,
            y: self.sigma.y * v.y,
        }) + self.mu
    }

    /// Density at `p` (+inf at the mean of a Dirac, 0 elsewhere).
    pub fn pdf(&self, p: Vector2f) -> Float {
        if !self.is_dirac() {
            let u = self.to_local(p - self.mu);
            let u = Vector2f {
                x: u.x * self.recp_sigma.x,
                y: u.y * self.recp_sigma.y,
            };
            self.norm * (-u.length_squared() / 2.0 as Float).exp()
        } else if p == self.mu {
            std::f32::INFINITY
        } else {
            0.0
        }
    }

    pub fn sample(&self, sampler: &mut dyn Sampler) -> Gaussian2dSample {
        if self.is_dirac() {
            return Gaussian2dSample {
                pt: self.mu,
                measure: Measure::Discrete,
                pdf: 1.0,
            };
        }
        let pt = sampler.normal2d();
        Gaussian2dSample {
            pt: self.from_canonical(pt),
            measure: Measure::Continuous,
            pdf: sampler.normal2d_pdf(pt),
        }
    }

    /// Integrates this Gaussian against another Gaussian density.
    /// Diracs are evaluated through the `pdf(mu)` limit.
    pub fn integrate(&self, g: &Gaussian2d) -> Float {
        let mu = g.mean() - self.mean();
        if self.is_dirac() && g.is_dirac() {
            return if mu == Vector2f::default() {
                std::f32::INFINITY
            } else {
                0.0
            };
        }
        if self.is_dirac() {
            return g.pdf(self.mean());
        }
        if g.is_dirac() {
            return self.pdf(g.mean());
        }

        // product of two gaussians, integrated in closed form
        let (s1, s2) = (self.inv_sigma(), g.inv_sigma());
        let s = [
            [s1[0][0] + s2[0][0], s1[0][1] + s2[0][1]],
            [s1[1][0] + s2[1][0], s1[1][1] + s2[1][1]],
        ];
        let det = s[0][0] * s[1][1] - s[0][1] * s[1][0];
        if det <= 0.0 {
            return 0.0;
        }
        let recp_det = 1.0 as Float / det;
        let denom = 2.0 as Float * PI * self.norm * g.norm * recp_det.sqrt();

        let inv_s = [
            [s[1][1] * recp_det, -s[0][1] * recp_det],
            [-s[1][0] * recp_det, s[0][0] * recp_det],
        ];
        // invS = S1 * (S1+S2)^-1 * S2
        let t = mat_mul(&s1, &inv_s);
        let m = mat_mul(&t, &s2);
        let q = mu.x * (m[0][0] * mu.x + m[0][1] * mu.y) + mu.y * (m[1][0] * mu.x + m[1][1] * mu.y);
        denom * (-q / 2.0 as Float).exp()
    }

    fn inv_sigma(&self) -> [[Float; 2]; 2] {
        let r = [
            [self.x.x, -self.x.y],
            [self.x.y, self.x.x],
        ];
        let d = [
            [self.recp_sigma.x * self.recp_sigma.x, 0.0],
            [0.0, self.recp_sigma.y * self.recp_sigma.y],
        ];
        let rt = [[r[0][0], r[1][0]], [r[0][1], r[1][1]]];
        mat_mul(&mat_mul(&r, &d), &rt)
    }
}

impl Default for Gaussian2d {
    fn default() -> Self {
        Gaussian2d::new(
            Vector2f { x: 1.0, y: 1.0 },
            Vector2f { x: 1.0, y: 0.0 },
            Vector2f::default(),
        )
    }
}

fn mat_mul(a: &[[Float; 2]; 2], b: &[[Float; 2]; 2]) -> [[Float; 2]; 2] {
    let mut r = [[0.0 as Float; 2]; 2];
    for i in 0..2 {
        for j in 0..2 {
            r[i][j] = a[i][0] * b[0][j] + a[i][1] * b[1][j];
        }
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_roundtrip() {
        let g = Gaussian2d::new(
            Vector2f { x: 2.0, y: 0.5 },
            Vector2f { x: 0.6, y: 0.8 },
            Vector2f { x: 1.0, y: -3.0 },
        );
        let p = Vector2f { x: 0.7, y: 0.2 };
        let q = g.from_canonical(g.to_canonical(p));
        assert!((q - p).length() < 1e-5);
    }

    #[test]
    fn dirac_pdf() {
        let mu = Vector2f { x: 0.5, y: -0.5 };
        let g = Gaussian2d::new(Vector2f::default(), Vector2f { x: 1.0, y: 0.0 }, mu);
        assert!(g.is_dirac());
        assert_eq!(g.pdf(mu), std::f32::INFINITY);
        assert_eq!(g.pdf(Vector2f::default()), 0.0);
    }

    #[test]
    fn dirac_integration_uses_pdf_limit() {
        let mu = Vector2f { x: 0.25, y: 0.0 };
        let dirac = Gaussian2d::new(Vector2f::default(), Vector2f { x: 1.0, y: 0.0 }, mu);
        let g = Gaussian2d::default();
        let i = dirac.integrate(&g);
        assert!((i - g.pdf(mu)).abs() < 1e-6);
    }

    #[test]
    fn self_integral_matches_closed_form() {
        // integral of N(0,sigma)^2 = 1 / (4 pi sigma_x sigma_y)
        let g = Gaussian2d::new(
            Vector2f { x: 1.5, y: 0.75 },
            Vector2f { x: 1.0, y: 0.0 },
            Vector2f::default(),
        );
        let expect = 1.0 / (4.0 * PI * 1.5 * 0.75);
        assert!((g.integrate(&g) - expect).abs() / expect < 1e-4);
    }
}
