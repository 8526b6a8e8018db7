//! Fraunhofer free-space aperture diffraction: the angular scattering
//! function of a 2-D aperture built from projected silhouette edges.

// others
use lazy_static::lazy_static;
use num::complex::Complex;
// wavert
use crate::accelerators::{Bvh8w, Idx};
use crate::beam::{Beam, GaussianWavefront};
use crate::core::frame::Frame;
use crate::core::geometry::{Dir3, Vector2f};
use crate::core::intersect::{intersect_edge_ellipse, is_point_in_ellipse};
use crate::core::quantity::{Float, Wavenumber, INV_2_PI, INV_SQRT_2, TWO_PI};
use crate::core::sampling::Distribution1D;
use crate::samplers::{sample_discrete, Sampler};

type C = Complex<Float>;

// Power contained in chi_e x |alpha1|^2
const PA1: Float = 0.004_936_107_6;
// Power contained in chi_e x |alpha2|^2
const PA2: Float = 0.218_997_9;

pub const P0_SIGMA: Float = 0.288_675_13 / 4.0; // 1/sqrt(12)/4

/// Length scale used to nondimensionalize aperture coordinates.
pub const FSD_UNIT: Float = 1.0;

fn sinc(x: Float) -> Float {
    if x.abs() < 1e-5 {
        1.0 as Float - x * x / 6.0
    } else {
        x.sin() / x
    }
}

pub fn alpha1(zeta: Vector2f) -> Float {
    let (x, y) = (zeta.x, zeta.y);
    if x == 0.0 {
        0.0
    } else {
        INV_2_PI * y / (x * (x * x + y * y)) * ((x / 2.0 as Float).cos() - sinc(x / 2.0))
    }
}

pub fn alpha2(zeta: Vector2f) -> Float {
    let (x, y) = (zeta.x, zeta.y);
    if x == 0.0 {
        0.0
    } else {
        INV_2_PI * y / (x * x + y * y) * sinc(x / 2.0)
    }
}

/// The masking function for the diffracted lobes.
pub fn chi_e(xi: Vector2f) -> Float {
    const CHI: Float = 0.830_092_7;
    let t = 1.0 as Float + CHI * xi.length_squared();
    let t2 = t * t;
    let t3 = t2 * t;
    (1.0 as Float - (3.0 as Float / t2 - 2.0 as Float / t3)).max(0.0)
}

/// The masking function for the 0-th order lobe.
pub fn chi_0(xi: Vector2f) -> Float {
    let u = xi * (1.0 as Float / P0_SIGMA);
    (-0.5 as Float * u.length_squared()).exp()
}

/// Edge parametrising the FSD angular scattering function.
#[derive(Debug, Copy, Clone)]
pub struct FsdEdge {
    /// Edge vector (aperture plane, fsd units).
    pub e: Vector2f,
    /// Mid point.
    pub v: Vector2f,
    /// Beam amplitudes.
    pub a_b: C,
    pub iab_2: C,
}

impl FsdEdge {
    /// Tangent vector.
    pub fn m(&self) -> Vector2f {
        Vector2f {
            x: self.e.y,
            y: -self.e.x,
        }
    }
    pub fn zeta(&self, xi: Vector2f) -> Vector2f {
        Vector2f {
            x: xi.dot(&self.e),
            y: xi.dot(&self.m()),
        }
    }
    /// Maps a zeta back to the aperture angular variable.
    pub fn xi_of_zeta(&self, zeta: Vector2f) -> Vector2f {
        // inverse of the row-vector product xi * (e | m)
        let m = self.m();
        let det = self.e.x * m.y - self.e.y * m.x;
        if det.abs() < 1e-16 {
            return Vector2f::default();
        }
        let inv = 1.0 as Float / det;
        Vector2f {
            x: (zeta.x * m.y - zeta.y * self.e.y) * inv,
            y: (zeta.y * self.e.x - zeta.x * m.x) * inv,
        }
    }
}

/// The psi function of one edge (excludes the 0-th order lobe).
pub fn psi(e: &FsdEdge, xi: Vector2f) -> C {
    let zeta = e.zeta(xi);
    let a1 = e.a_b * alpha1(zeta);
    let a2 = e.iab_2 * alpha2(zeta);
    let ee2 = e.e.length_squared();
    C::from_polar(ee2, -e.v.dot(&xi)) * (a1 + a2)
}

/// |psi|^2 of one edge.
pub fn psi2(e: &FsdEdge, xi: Vector2f) -> Float {
    let zeta = e.zeta(xi);
    let a1 = e.a_b * alpha1(zeta);
    let a2 = e.iab_2 * alpha2(zeta);
    let ee2 = e.e.length_squared();
    ee2 * ee2 * (a1 + a2).norm_sqr()
}

/// Power in an edge's chi_e x |alpha1|^2 lobe.
pub fn pa1(edge: &FsdEdge) -> Float {
    let ee2 = edge.e.length_squared();
    ee2 * ee2 * PA1 * edge.a_b.norm_sqr()
}
/// Power in an edge's chi_e x |alpha2|^2 lobe.
pub fn pa2(edge: &FsdEdge) -> Float {
    let ee2 = edge.e.length_squared();
    ee2 * ee2 * PA2 * edge.iab_2.norm_sqr()
}
/// Approximate scattered power contained in one edge; the interference
/// cross-term is negligible and ignored.
pub fn pj(edge: &FsdEdge) -> Float {
    pa1(edge) + pa2(edge)
}

/// An FSD aperture: edges, their selection pdfs and the 0-th order lobe.
#[derive(Debug, Default, Clone)]
pub struct FsdAperture {
    pub edges: Vec<FsdEdge>,
    pub edge_pdfs: Vec<Float>,
    pub p0: Float,
    /// PDF of selecting the 0-th order lobe.
    pub p0_pdf: Float,
    /// |integrated field amplitude|^2 over the aperture opening.
    pub psi02: Float,
    /// Reciprocal of total incident beam intensity over the opening.
    pub recp_i: Float,
    /// Total (unnormalized) power of the 0-th order and edge lobes.
    pub p_total: Float,
}

impl FsdAperture {
    pub fn single_edge(&self) -> bool {
        self.edges.len() == 1
    }
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Approximate |psi|^2 proposal density (includes the 0-th order lobe).
pub fn sampling_density(aperture: &FsdAperture, xi: Vector2f) -> Float {
    let mut diffracted: Float = 0.0;
    for e in &aperture.edges {
        diffracted += psi2(e, xi);
    }
    diffracted * chi_e(xi) + aperture.p0 * INV_2_PI / (P0_SIGMA * P0_SIGMA) * chi_0(xi)
}

/// The coherent edge sum; unstable around xi = 0.
pub fn asf_unclamped(aperture: &FsdAperture, xi: Vector2f) -> Float {
    let mut amplitude = C::new(0.0, 0.0);
    for e in &aperture.edges {
        amplitude += psi(e, xi);
    }
    amplitude.norm_sqr()
}

/// The free-space diffraction angular scattering function.
pub fn asf(aperture: &FsdAperture, xi: Vector2f) -> Float {
    asf_unclamped(aperture, xi) * chi_e(xi) + aperture.psi02 * chi_0(xi)
}

/// Power in the 0-th order lobe.
pub fn p0_power(aperture: &FsdAperture) -> Float {
    TWO_PI * P0_SIGMA * P0_SIGMA * aperture.psi02
}

/// Builds the aperture from the silhouette edges of a cone record: each
/// edge is projected to the beam cross-section, clamped to the wavefront
/// envelope ellipse and subdivided.
pub fn build_aperture(
    ads: &Bvh8w,
    frame: &Frame,
    k: Wavenumber,
    total_power: Float,
    beam: &Beam,
    edge_ids: &[Idx],
    wave_function: &GaussianWavefront,
) -> FsdAperture {
    let cross_section_ellipse = wave_function.envelope();
    let r = cross_section_ellipse.x.max(cross_section_ellipse.y);
    let max_edge_length = 0.33 as Float * r;

    let mut aperture = FsdAperture::default();
    aperture.recp_i = if total_power > 0.0 {
        1.0 as Float / total_power
    } else {
        0.0
    };
    aperture.edges.reserve(edge_ids.len() * 3);
    aperture.edge_pdfs.reserve(edge_ids.len() * 3);

    // accumulates power total (all edges AND the 0-th order lobe)
    let mut p_total: Float = 0.0;

    for &ed in edge_ids {
        let edge = ads.edge(ed);

        // only care about the projected silhouette
        if beam.dir().dot(&edge.n1.v()) * beam.dir().dot(&edge.n2.v()) >= 0.0 {
            continue;
        }

        let to_plane = |p: crate::core::geometry::Point3f| {
            let d = p - beam.origin();
            Vector2f {
                x: d.dot(&frame.t.v()),
                y: d.dot(&frame.b.v()),
            }
        };
        let u1 = to_plane(edge.a);
        let u2 = to_plane(edge.b);

        // clamp points to the cross-section ellipse
        let (mut t1, mut t2) = (0.0 as Float, 1.0 as Float);
        if !is_point_in_ellipse(u1, cross_section_ellipse)
            || !is_point_in_ellipse(u2, cross_section_ellipse)
        {
            match intersect_edge_ellipse(u1, u2, cross_section_ellipse.x, cross_section_ellipse.y)
            {
                Some((a, b)) => {
                    t1 = a.max(0.0);
                    t2 = b.min(1.0);
                }
                None => continue,
            }
        }
        if t2 <= t1 {
            continue;
        }

        let lerp2 = |t: Float| u1 + (u2 - u1) * t;

        // subdivide the edge into segments shorter than a third of the
        // envelope radius
        let len = (lerp2(t1) - lerp2(t2)).length();
        let segments = ((len / max_edge_length).round() as i32).max(1);
        let seg = 1.0 as Float / segments as Float;

        let mut v1 = lerp2(t1);
        let mut ca = C::new(wave_function.amplitude_magnitude(v1), 0.0);
        for i in 0..segments {
            let tt = t1 + (t2 - t1) * ((i + 1) as Float * seg);
            let v2 = lerp2(tt);
            let cb = C::new(wave_function.amplitude_magnitude(v2), 0.0);

            if ca.re > 0.0 || cb.re > 0.0 {
                let v = (v1 + v2) * (0.5 as Float / FSD_UNIT);
                let e = (v2 - v1) * (1.0 as Float / FSD_UNIT);
                let fsd_edge = FsdEdge {
                    e,
                    v,
                    a_b: ca - cb,
                    iab_2: C::new(0.0, 1.0) * (ca + cb) * 0.5,
                };
                let edge_pdf = pj(&fsd_edge);
                if edge_pdf > 0.0 {
                    aperture.edges.push(fsd_edge);
                    aperture.edge_pdfs.push(edge_pdf);
                    p_total += edge_pdf;
                }
            }
            v1 = v2;
            ca = cb;
        }
    }

    // power in the 0-th order lobe, estimated by averaging the edge sum at
    // eight rim points
    let psi0r = 3.0 as Float * P0_SIGMA;
    let rim = [
        Vector2f { x: -INV_SQRT_2, y: -INV_SQRT_2 },
        Vector2f { x: -1.0, y: 0.0 },
        Vector2f { x: -INV_SQRT_2, y: INV_SQRT_2 },
        Vector2f { x: 0.0, y: 1.0 },
        Vector2f { x: INV_SQRT_2, y: INV_SQRT_2 },
        Vector2f { x: 1.0, y: 0.0 },
        Vector2f { x: INV_SQRT_2, y: -INV_SQRT_2 },
        Vector2f { x: 0.0, y: -1.0 },
    ];
    aperture.psi02 = rim
        .iter()
        .map(|p| asf_unclamped(&aperture, *p * psi0r))
        .sum::<Float>()
        / 8.0 as Float;
    let ku = k.0 * FSD_UNIT;
    aperture.p0 = p0_power(&aperture) / (ku * ku);
    p_total += aperture.p0;

    aperture.p_total = p_total;
    if p_total > 0.0 {
        let recp = 1.0 as Float / p_total;
        aperture.p0_pdf = aperture.p0 * recp;
        for pdf in aperture.edge_pdfs.iter_mut() {
            *pdf *= recp;
        }
    } else {
        aperture.p0_pdf = 1.0;
        aperture.edges.clear();
        aperture.edge_pdfs.clear();
    }
    aperture
}

// Tabulated zeta distributions of the chi_e x |alpha1|^2 and
// chi_e x |alpha2|^2 lobes, used as LUT-backed proposals.
struct ZetaLut {
    marginal: Distribution1D,
    conditional: Vec<Distribution1D>,
    extent: Float,
    n: usize,
}

impl ZetaLut {
    fn build<F: Fn(Vector2f) -> Float>(f: F, extent: Float, n: usize) -> ZetaLut {
        let cell = 2.0 as Float * extent / n as Float;
        let mut conditional: Vec<Distribution1D> = Vec::with_capacity(n);
        let mut marginal_f: Vec<Float> = Vec::with_capacity(n);
        for iy in 0..n {
            let y = -extent + (iy as Float + 0.5) * cell;
            let row: Vec<Float> = (0..n)
                .map(|ix| {
                    let x = -extent + (ix as Float + 0.5) * cell;
                    f(Vector2f { x, y })
                })
                .collect();
            let dist = Distribution1D::new(row);
            marginal_f.push(dist.func_int);
            conditional.push(dist);
        }
        ZetaLut {
            marginal: Distribution1D::new(marginal_f),
            conditional,
            extent,
            n,
        }
    }

    fn sample(&self, u1: Float, u2: Float) -> Vector2f {
        let y = self.marginal.sample_continuous(u1, None);
        let row = ((y * self.n as Float) as usize).min(self.n - 1);
        let x = self.conditional[row].sample_continuous(u2, None);
        Vector2f {
            x: (x * 2.0 as Float - 1.0) * self.extent,
            y: (y * 2.0 as Float - 1.0) * self.extent,
        }
    }
}

lazy_static! {
    static ref A1_LUT: ZetaLut = ZetaLut::build(
        |z| chi_e(z) * alpha1(z) * alpha1(z),
        30.0,
        128
    );
    static ref A2_LUT: ZetaLut = ZetaLut::build(
        |z| chi_e(z) * alpha2(z) * alpha2(z),
        30.0,
        128
    );
}

#[derive(Debug, Copy, Clone)]
pub struct FraunhoferSample {
    pub xi: Vector2f,
    pub pdf: Float,
    pub weight: Float,
}

fn sample_p0(sampler: &mut dyn Sampler) -> Vector2f {
    let g = sampler.normal2d();
    g * P0_SIGMA
}

fn sample_edge(sampler: &mut dyn Sampler, e: &FsdEdge) -> Vector2f {
    // pick one of the alpha1/alpha2 lobes of the edge
    let a = e.a_b.norm_sqr();
    let b = e.iab_2.norm_sqr();
    let (_pmf, which) = sample_discrete(sampler.r(), 2, |i| if i == 0 { a } else { b });
    let zeta = if which == 0 {
        A1_LUT.sample(sampler.r(), sampler.r())
    } else {
        A2_LUT.sample(sampler.r(), sampler.r())
    };
    e.xi_of_zeta(zeta)
}

fn sample_proposal(sampler: &mut dyn Sampler, aperture: &FsdAperture) -> Vector2f {
    // select the 0-th order lobe or an edge w.r.t. contained power
    let (_pmf, s) = sample_discrete(sampler.r(), aperture.edges.len() + 1, |i| {
        if i == 0 {
            aperture.p0_pdf
        } else {
            aperture.edge_pdfs[i - 1]
        }
    });
    if s == 0 {
        sample_p0(sampler)
    } else {
        sample_edge(sampler, &aperture.edges[s - 1])
    }
}

fn sample_rejection(
    sampler: &mut dyn Sampler,
    aperture: &FsdAperture,
) -> Option<FraunhoferSample> {
    let edge_count = aperture.edges.len();
    // single edge: the LUT provides virtually exact sampling.
    // multiple edges: rejection sample the incoherent sum of the edges'
    // scattering functions (an M = edge_count upper bound).
    let rejection_sample = edge_count > 1;
    let m = edge_count.max(1);
    let max_tries = m * 1024;
    let recp_m = 1.0 as Float / m as Float;

    for _ in 0..max_tries {
        let xi = sample_proposal(sampler, aperture);
        let g = sampling_density(aperture, xi);
        let f = asf(aperture, xi);
        let done = if rejection_sample {
            sampler.r() * g < f * recp_m
        } else {
            true
        };
        if done {
            return Some(FraunhoferSample {
                xi,
                pdf: f * aperture.recp_i,
                weight: 1.0,
            });
        }
    }
    None
}

fn sample_sir(sampler: &mut dyn Sampler, aperture: &FsdAperture) -> Option<FraunhoferSample> {
    let m = 4 * aperture.edges.len().max(1);
    let mut xis: Vec<Vector2f> = Vec::with_capacity(m);
    let mut ws: Vec<Float> = Vec::with_capacity(m);
    let mut fs: Vec<Float> = Vec::with_capacity(m);
    let mut total_w: Float = 0.0;
    for _ in 0..m {
        let xi = sample_proposal(sampler, aperture);
        let g = sampling_density(aperture, xi);
        let f = asf(aperture, xi);
        let w = if g != 0.0 { f / g } else { 0.0 };
        xis.push(xi);
        ws.push(w);
        fs.push(f);
        total_w += w;
    }
    if total_w <= 0.0 {
        return None;
    }
    // resample
    let (_pmf, i) = sample_discrete(sampler.r(), m, |j| ws[j] / total_w);
    Some(FraunhoferSample {
        xi: xis[i],
        pdf: fs[i] * aperture.recp_i,
        weight: 1.0,
    })
}

/// Samples the aperture's angular scattering function; rejection sampling
/// with a sampling-importance-resampling fallback.
pub fn sample_aperture(
    sampler: &mut dyn Sampler,
    aperture: &FsdAperture,
) -> Option<FraunhoferSample> {
    sample_rejection(sampler, aperture).or_else(|| sample_sir(sampler, aperture))
}

/// World direction for an aperture angular variable xi.
pub fn direction_for_xi(frame: &Frame, xi: Vector2f, k: Wavenumber) -> Dir3 {
    let ku = k.0 * FSD_UNIT;
    Dir3::new(frame.n.v() + frame.t.v() * (xi.x / ku) + frame.b.v() * (xi.y / ku))
}

/// Aperture angular variable of a world direction.
pub fn xi_for_direction(frame: &Frame, wo: &Dir3, k: Wavenumber) -> Vector2f {
    let ku = k.0 * FSD_UNIT;
    let local = frame.to_local(&wo.v());
    if local.z <= 0.0 {
        return Vector2f {
            x: std::f32::MAX,
            y: std::f32::MAX,
        };
    }
    Vector2f {
        x: local.x / local.z * ku,
        y: local.y / local.z * ku,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samplers::UniformSampler;

    fn straight_edge_aperture() -> FsdAperture {
        // a single straight silhouette edge through the beam cross-section
        let e = FsdEdge {
            e: Vector2f { x: 2.0, y: 0.0 },
            v: Vector2f::default(),
            a_b: C::new(0.0, 0.0),
            iab_2: C::new(0.0, 1.0),
        };
        let p1 = pj(&e);
        let mut ap = FsdAperture {
            edges: vec![e],
            edge_pdfs: vec![p1],
            p0: 0.0,
            p0_pdf: 0.0,
            psi02: 0.0,
            recp_i: 1.0,
            p_total: 0.0,
        };
        // rim estimator for the 0-th order lobe
        let psi0r = 3.0 as Float * P0_SIGMA;
        ap.psi02 = asf_unclamped(&ap, Vector2f { x: psi0r, y: 0.0 });
        ap.p0 = p0_power(&ap);
        let total = p1 + ap.p0;
        ap.p_total = total;
        ap.p0_pdf = ap.p0 / total;
        ap.edge_pdfs[0] = p1 / total;
        ap
    }

    #[test]
    fn lobe_selection_probabilities_normalize() {
        let ap = straight_edge_aperture();
        let total: Float = ap.p0_pdf + ap.edge_pdfs.iter().sum::<Float>();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn asf_is_nonnegative_and_finite() {
        let ap = straight_edge_aperture();
        for i in -8..=8 {
            for j in -8..=8 {
                let xi = Vector2f {
                    x: i as Float * 1.3,
                    y: j as Float * 1.3,
                };
                let v = asf(&ap, xi);
                assert!(v.is_finite() && v >= 0.0);
            }
        }
    }

    #[test]
    fn sampling_returns_positive_density_samples() {
        let ap = straight_edge_aperture();
        let mut sampler = UniformSampler::new(3);
        let mut got = 0;
        for _ in 0..32 {
            if let Some(s) = sample_aperture(&mut sampler, &ap) {
                assert!(s.pdf >= 0.0 && s.pdf.is_finite());
                assert!(s.xi.x.is_finite() && s.xi.y.is_finite());
                got += 1;
            }
        }
        assert!(got > 0);
    }

    #[test]
    fn direction_mapping_roundtrip() {
        let frame = Frame::canonical();
        let k = Wavenumber(1.0e7);
        let xi = Vector2f { x: 4.0, y: -2.5 };
        let wo = direction_for_xi(&frame, xi, k);
        let back = xi_for_direction(&frame, &wo, k);
        assert!((back - xi).length() < 1e-2);
    }

    #[test]
    fn masking_functions_behave() {
        assert!((chi_0(Vector2f::default()) - 1.0).abs() < 1e-6);
        assert!(chi_e(Vector2f::default()) == 0.0);
        assert!(chi_e(Vector2f { x: 10.0, y: 0.0 }) > 0.9);
    }
}
