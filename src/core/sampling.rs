//! Draw random samples from a chosen probability distribution.

// std
use std::f32::consts::PI;
// others
use serde::{Deserialize, Serialize};
// wavert
use crate::core::geometry::{Point2f, Vector2f, Vector3f};
use crate::core::quantity::{clamp_t, Float, INV_2_PI, INV_4_PI, INV_PI, PI_OVER_2, PI_OVER_4};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Distribution1D {
    pub func: Vec<Float>,
    pub cdf: Vec<Float>,
    pub func_int: Float,
}

impl Distribution1D {
    pub fn new(f: Vec<Float>) -> Self {
        let n: usize = f.len();
        // compute integral of step function at $x_i$
        let mut cdf: Vec<Float> = Vec::with_capacity(n + 1);
        cdf.push(0.0 as Float);
        for i in 1..=n {
            let previous: Float = cdf[i - 1];
            cdf.push(previous + f[i - 1] / n as Float);
        }
        // transform step function integral into CDF
        let func_int: Float = cdf[n];
        if func_int == 0.0 as Float {
            for (i, item) in cdf.iter_mut().enumerate().skip(1).take(n) {
                *item = i as Float / n as Float;
            }
        } else {
            for item in cdf.iter_mut().skip(1).take(n) {
                *item /= func_int;
            }
        }
        Distribution1D {
            func: f,
            cdf,
            func_int,
        }
    }
    pub fn count(&self) -> usize {
        self.func.len()
    }
    fn find_interval(&self, u: Float) -> usize {
        let mut first: usize = 0;
        let mut len: usize = self.cdf.len();
        while len > 0_usize {
            let half: usize = len >> 1;
            let middle: usize = first + half;
            // bisect range based on value of _pred_ at _middle_
            if self.cdf[middle] <= u {
                first = middle + 1;
                len -= half + 1;
            } else {
                len = half;
            }
        }
        clamp_t(
            first as isize - 1_isize,
            0 as isize,
            self.cdf.len() as isize - 2_isize,
        ) as usize
    }
    pub fn sample_continuous(&self, u: Float, pdf: Option<&mut Float>) -> Float {
        let offset = self.find_interval(u);
        // compute offset along CDF segment
        let mut du: Float = u - self.cdf[offset];
        if (self.cdf[offset + 1] - self.cdf[offset]) > 0.0 as Float {
            du /= self.cdf[offset + 1] - self.cdf[offset];
        }
        // compute PDF for sampled offset
        if let Some(value) = pdf {
            if self.func_int > 0.0 as Float {
                *value = self.func[offset] / self.func_int;
            } else {
                *value = 0.0;
            }
        }
        (offset as Float + du) / self.count() as Float
    }
    pub fn sample_discrete(&self, u: Float, pdf: Option<&mut Float>) -> usize {
        let offset = self.find_interval(u);
        if let Some(value) = pdf {
            if self.func_int > 0.0 as Float {
                *value = self.func[offset] / (self.func_int * self.func.len() as Float);
            } else {
                *value = 0.0;
            }
        }
        offset
    }
    pub fn discrete_pdf(&self, index: usize) -> Float {
        assert!(index < self.func.len());
        self.func[index] / (self.func_int * self.func.len() as Float)
    }
}

/// A piecewise-linear density over an abscissa (used for spectra over
/// wavenumbers). Carries its reciprocal integral for importance weighting.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PiecewiseLinearDistribution {
    pub knots: Vec<Float>,
    pub values: Vec<Float>,
    cdf: Vec<Float>,
    integral: Float,
}

impl PiecewiseLinearDistribution {
    pub fn new(knots: Vec<Float>, values: Vec<Float>) -> Self {
        assert_eq!(knots.len(), values.len());
        assert!(knots.len() >= 2);
        let n = knots.len();
        let mut cdf: Vec<Float> = Vec::with_capacity(n);
        cdf.push(0.0 as Float);
        for i in 1..n {
            let w = 0.5 as Float * (values[i - 1] + values[i]) * (knots[i] - knots[i - 1]);
            let prev = cdf[i - 1];
            cdf.push(prev + w.max(0.0));
        }
        let integral = cdf[n - 1];
        if integral > 0.0 as Float {
            for item in cdf.iter_mut() {
                *item /= integral;
            }
        }
        PiecewiseLinearDistribution {
            knots,
            values,
            cdf,
            integral,
        }
    }

    pub fn integral(&self) -> Float {
        self.integral
    }
    pub fn reciprocal_integral(&self) -> Float {
        if self.integral > 0.0 {
            1.0 as Float / self.integral
        } else {
            0.0
        }
    }
    pub fn domain(&self) -> (Float, Float) {
        (self.knots[0], *self.knots.last().unwrap())
    }

    /// Linearly-interpolated value at `x`, zero outside the domain.
    pub fn value(&self, x: Float) -> Float {
        let n = self.knots.len();
        if x < self.knots[0] || x > self.knots[n - 1] {
            return 0.0;
        }
        let mut i = match self.knots.binary_search_by(|k| k.partial_cmp(&x).unwrap()) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        if i >= n - 1 {
            i = n - 2;
        }
        let t = (x - self.knots[i]) / (self.knots[i + 1] - self.knots[i]);
        (1.0 as Float - t) * self.values[i] + t * self.values[i + 1]
    }

    /// Density at `x` (value over integral).
    pub fn pdf(&self, x: Float) -> Float {
        if self.integral <= 0.0 {
            return 0.0;
        }
        self.value(x) / self.integral
    }

    /// Samples an abscissa; returns (x, pdf).
    pub fn sample(&self, u: Float) -> (Float, Float) {
        if self.integral <= 0.0 {
            let (a, b) = self.domain();
            return (a + u * (b - a), 1.0 as Float / (b - a));
        }
        // segment lookup
        let mut seg = self.cdf.len() - 2;
        for i in 0..self.cdf.len() - 1 {
            if u < self.cdf[i + 1] {
                seg = i;
                break;
            }
        }
        let c0 = self.cdf[seg];
        let c1 = self.cdf[seg + 1];
        let du = if c1 > c0 { (u - c0) / (c1 - c0) } else { 0.0 };
        let (f0, f1) = (self.values[seg], self.values[seg + 1]);
        // invert the linear density within the segment
        let t = if (f0 - f1).abs() < 1e-8 * (f0 + f1).abs() || f0 + f1 <= 0.0 {
            du
        } else {
            let denom = f0 * f0 + du * (f1 * f1 - f0 * f0);
            (f0 - denom.max(0.0).sqrt()) / (f0 - f1)
        };
        let t = clamp_t(t, 0.0, 1.0);
        let x = self.knots[seg] + t * (self.knots[seg + 1] - self.knots[seg]);
        (x, self.pdf(x))
    }

    /// Integral of the function over `[a, b]` (clipped to the domain).
    pub fn integrate_range(&self, a: Float, b: Float) -> Float {
        let n = self.knots.len();
        let mut total: Float = 0.0;
        for i in 0..n - 1 {
            let lo = self.knots[i].max(a);
            let hi = self.knots[i + 1].min(b);
            if hi <= lo {
                continue;
            }
            let span = self.knots[i + 1] - self.knots[i];
            let t0 = (lo - self.knots[i]) / span;
            let t1 = (hi - self.knots[i]) / span;
            let v0 = (1.0 as Float - t0) * self.values[i] + t0 * self.values[i + 1];
            let v1 = (1.0 as Float - t1) * self.values[i] + t1 * self.values[i + 1];
            total += 0.5 as Float * (v0 + v1) * (hi - lo);
        }
        total
    }
}

/// Pointwise product of two piecewise-linear distributions, evaluated on the
/// union of their knots over the overlapping support.
pub fn product_distribution(
    a: &PiecewiseLinearDistribution,
    b: &PiecewiseLinearDistribution,
) -> Option<PiecewiseLinearDistribution> {
    let lo = a.domain().0.max(b.domain().0);
    let hi = a.domain().1.min(b.domain().1);
    if hi <= lo {
        return None;
    }
    let mut knots: Vec<Float> = a
        .knots
        .iter()
        .chain(b.knots.iter())
        .cloned()
        .filter(|&k| k >= lo && k <= hi)
        .collect();
    knots.push(lo);
    knots.push(hi);
    knots.sort_by(|x, y| x.partial_cmp(y).unwrap());
    knots.dedup_by(|x, y| (*x - *y).abs() < 1e-9 * hi.abs().max(1.0));
    if knots.len() < 2 {
        return None;
    }
    let values: Vec<Float> = knots.iter().map(|&k| a.value(k) * b.value(k)).collect();
    Some(PiecewiseLinearDistribution::new(knots, values))
}

/// Cosine-weighted hemisphere sampling using Malley's method.
pub fn cosine_sample_hemisphere(u: &Point2f) -> Vector3f {
    let d: Point2f = concentric_sample_disk(u);
    let z: Float = (0.0 as Float)
        .max(1.0 as Float - d.x * d.x - d.y * d.y)
        .sqrt();
    Vector3f { x: d.x, y: d.y, z }
}

/// Returns a weight of cos_theta / PI.
pub fn cosine_hemisphere_pdf(cos_theta: Float) -> Float {
    cos_theta * INV_PI
}

pub fn uniform_sample_hemisphere(u: &Point2f) -> Vector3f {
    let z: Float = u.x;
    let r: Float = (0.0 as Float).max(1.0 as Float - z * z).sqrt();
    let phi: Float = 2.0 as Float * PI * u.y;
    Vector3f {
        x: r * phi.cos(),
        y: r * phi.sin(),
        z,
    }
}

pub fn uniform_hemisphere_pdf() -> Float {
    INV_2_PI
}

pub fn uniform_sample_sphere(u: Point2f) -> Vector3f {
    let z: Float = 1.0 as Float - 2.0 as Float * u.x;
    let r: Float = (0.0 as Float).max(1.0 as Float - z * z).sqrt();
    let phi: Float = 2.0 as Float * PI * u.y;
    Vector3f {
        x: r * phi.cos(),
        y: r * phi.sin(),
        z,
    }
}

pub fn uniform_sphere_pdf() -> Float {
    INV_4_PI
}

/// Uniformly distribute samples over a unit disk.
pub fn concentric_sample_disk(u: &Point2f) -> Point2f {
    // map uniform random numbers to $[-1,1]^2$
    let u_offset: Point2f = *u * 2.0 as Float + Vector2f { x: -1.0, y: -1.0 };
    // handle degeneracy at the origin
    if u_offset.x == 0.0 as Float && u_offset.y == 0.0 as Float {
        return Point2f::default();
    }
    // apply concentric mapping to point
    let theta: Float;
    let r: Float;
    if u_offset.x.abs() > u_offset.y.abs() {
        r = u_offset.x;
        theta = PI_OVER_4 * (u_offset.y / u_offset.x);
    } else {
        r = u_offset.y;
        theta = PI_OVER_2 - PI_OVER_4 * (u_offset.x / u_offset.y);
    }
    Point2f {
        x: theta.cos(),
        y: theta.sin(),
    } * r
}

pub fn uniform_cone_pdf(cos_theta_max: Float) -> Float {
    1.0 as Float / (2.0 as Float * PI * (1.0 as Float - cos_theta_max))
}

/// Samples in a cone of directions about the (0, 0, 1) axis.
pub fn uniform_sample_cone(u: Point2f, cos_theta_max: Float) -> Vector3f {
    let cos_theta: Float = (1.0 as Float - u.x) + u.x * cos_theta_max;
    let sin_theta: Float = (1.0 as Float - cos_theta * cos_theta).sqrt();
    let phi: Float = u.y * 2.0 as Float * PI;
    Vector3f {
        x: phi.cos() * sin_theta,
        y: phi.sin() * sin_theta,
        z: cos_theta,
    }
}

pub fn uniform_sample_triangle(u: Point2f) -> Point2f {
    let su0: Float = u.x.sqrt();
    Point2f {
        x: 1.0 as Float - su0,
        y: u.y * su0,
    }
}

/// Veach's balance heuristic.
pub fn balance_heuristic(nf: u8, f_pdf: Float, ng: u8, g_pdf: Float) -> Float {
    let f: Float = nf as Float * f_pdf;
    let g: Float = ng as Float * g_pdf;
    f / (f + g)
}

/// Reducing the variance according to Veach's heuristic.
pub fn power_heuristic(nf: u8, f_pdf: Float, ng: u8, g_pdf: Float) -> Float {
    let f: Float = nf as Float * f_pdf;
    let g: Float = ng as Float * g_pdf;
    (f * f) / (f * f + g * g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::Rng;

    #[test]
    fn distribution1d_discrete() {
        let d = Distribution1D::new(vec![1.0, 2.0, 1.0]);
        assert_eq!(d.count(), 3);
        let mut pdf: Float = 0.0;
        let idx = d.sample_discrete(0.5, Some(&mut pdf));
        assert_eq!(idx, 1);
        assert!((pdf - 0.5).abs() < 1e-6);
        assert!((d.discrete_pdf(0) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn piecewise_linear_sampling_is_consistent() {
        let d = PiecewiseLinearDistribution::new(vec![0.0, 1.0, 2.0], vec![0.0, 2.0, 0.0]);
        assert!((d.integral() - 2.0).abs() < 1e-6);
        let mut rng = Rng::new(5, 9);
        let mut mean: Float = 0.0;
        let n = 20_000;
        for _ in 0..n {
            let (x, pdf) = d.sample(rng.uniform_float());
            assert!(x >= 0.0 && x <= 2.0);
            assert!((pdf - d.pdf(x)).abs() < 1e-4);
            mean += x;
        }
        mean /= n as Float;
        assert!((mean - 1.0).abs() < 0.02);
    }

    #[test]
    fn integrate_range_partial() {
        let d = PiecewiseLinearDistribution::new(vec![0.0, 2.0], vec![1.0, 1.0]);
        assert!((d.integrate_range(0.5, 1.5) - 1.0).abs() < 1e-6);
        assert_eq!(d.integrate_range(3.0, 4.0), 0.0);
    }

    #[test]
    fn product_of_disjoint_supports_is_none() {
        let a = PiecewiseLinearDistribution::new(vec![0.0, 1.0], vec![1.0, 1.0]);
        let b = PiecewiseLinearDistribution::new(vec![2.0, 3.0], vec![1.0, 1.0]);
        assert!(product_distribution(&a, &b).is_none());
    }

    #[test]
    fn product_matches_pointwise() {
        let a = PiecewiseLinearDistribution::new(vec![0.0, 1.0, 2.0], vec![1.0, 2.0, 1.0]);
        let b = PiecewiseLinearDistribution::new(vec![0.5, 2.5], vec![1.0, 1.0]);
        let p = product_distribution(&a, &b).unwrap();
        assert!((p.value(1.0) - a.value(1.0) * b.value(1.0)).abs() < 1e-5);
        assert_eq!(p.value(0.25), 0.0);
    }

    #[test]
    fn heuristics() {
        assert!((power_heuristic(1, 1.0, 1, 1.0) - 0.5).abs() < 1e-6);
        assert!((balance_heuristic(1, 3.0, 1, 1.0) - 0.75).abs() < 1e-6);
    }
}
