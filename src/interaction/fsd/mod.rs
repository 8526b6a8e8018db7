//! Free-space diffraction (FSD): UTD wedge diffraction of geometrical
//! edges, and Fraunhofer aperture diffraction.

pub mod fraunhofer;
pub mod utd;

// others
use smallvec::SmallVec;
// wavert
use crate::accelerators::{Bvh8w, Idx, INVALID_IDX};
use crate::core::frame::Frame;
use crate::core::geometry::{Dir3, Point3f, Vector3f};
use crate::core::intersect::intersect_edge_ellipse;
use crate::core::quantity::{Float, Length, Wavenumber, INV_SQRT_2_PI, PI, TWO_PI};
use crate::interaction::intersection::IntersectionEdge;
use crate::samplers::Sampler;
use utd::{UtdCoefficients, WedgeEdge, UTD_MIN_SIN_BETA};

/// Keller-cone importance-sampling spread scale: the angular standard
/// deviation is sqrt(45 / (k r)).
const UTD_IS_SIGMA_SCALE: Float = 45.0;

#[derive(Debug, Clone)]
pub struct FsdSample {
    pub diffraction_wp: Point3f,
    pub wo: Dir3,
    pub intersection: Option<IntersectionEdge>,
    pub is_direct: bool,
    /// Angular sampling density (discrete mass for the direct term).
    pub pdf: Float,
    pub weight: Float,
}

#[derive(Debug, Copy, Clone)]
pub struct DiffractingEdge {
    pub utd: UtdCoefficients,
    pub edge_idx: Idx,
    pub p: Point3f,
    pub wi: Dir3,
    pub wo: Dir3,
    pub ri: Length,
    pub ro: Length,
}

/// Wraps the silhouette edges of a cone-query record as UTD wedges and
/// provides edge-diffraction sampling and evaluation.
#[derive(Debug, Clone)]
pub struct FreeSpaceDiffraction {
    interaction_wp: Point3f,
    edges: SmallVec<[WedgeEdge; 8]>,
    k: Wavenumber,
}

impl FreeSpaceDiffraction {
    /// Builds the diffraction aperture from the edge set of an intersection
    /// record, clamped to the interaction region.
    pub fn new(
        ads: &Bvh8w,
        interaction_wp: Point3f,
        interaction_region_frame: &Frame,
        interaction_region_size: Vector3f,
        wi: &Dir3,
        k: Wavenumber,
        edge_ids: &[Idx],
    ) -> FreeSpaceDiffraction {
        let mut edges: SmallVec<[WedgeEdge; 8]> = SmallVec::new();
        for &ed in edge_ids {
            let edge = ads.edge(ed);

            let f1_is_front = wi.dot(&edge.n1.v()) > 0.0;
            let (nff, tff, nbf) = if f1_is_front {
                (edge.n1, edge.t1, edge.n2)
            } else {
                (edge.n2, edge.t2, edge.n1)
            };
            // light incident from inside the wedge?
            if wi.dot(&nff.v()) <= 0.0 {
                continue;
            }

            // clamp the edge to the interaction region
            let (mut v1, mut v2) = (edge.a, edge.b);
            if interaction_region_size.is_finite() {
                let to_plane = |p: Point3f| {
                    let d = p - interaction_wp;
                    crate::core::geometry::Vector2f {
                        x: d.dot(&interaction_region_frame.t.v()),
                        y: d.dot(&interaction_region_frame.b.v()),
                    }
                };
                let (u1, u2) = (to_plane(edge.a), to_plane(edge.b));
                if let Some((t1, t2)) = intersect_edge_ellipse(
                    u1,
                    u2,
                    interaction_region_size.x.max(1e-9),
                    interaction_region_size.y.max(1e-9),
                ) {
                    let t1 = t1.max(0.0).min(1.0);
                    let t2 = t2.max(0.0).min(1.0);
                    v1 = crate::core::geometry::pnt3_lerp(t1, &edge.a, &edge.b);
                    v2 = crate::core::geometry::pnt3_lerp(t2, &edge.a, &edge.b);
                } else {
                    continue;
                }
            }
            if v1 == v2 {
                continue;
            }

            let v = crate::core::geometry::pnt3_lerp(0.5, &v1, &v2);
            let l = Length((v2 - v1).length());
            edges.push(WedgeEdge {
                v,
                l,
                nff,
                tff,
                nbf,
                alpha: edge.alpha,
                eta: 0.0,
                ads_edge_idx: ed,
            });
        }
        FreeSpaceDiffraction {
            interaction_wp,
            edges,
            k,
        }
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
    pub fn k(&self) -> Wavenumber {
        self.k
    }

    /// Samples a diffracted direction: picks an edge (or the direct term)
    /// uniformly, a point on the edge, then a direction on the Keller cone
    /// with a Gaussian in the face angle.
    pub fn sample(
        &self,
        ads: &Bvh8w,
        src: &Point3f,
        sampler: &mut dyn Sampler,
    ) -> Option<FsdSample> {
        let eidx = sampler.uniform_int(self.edges.len() + 1);

        if eidx == self.edges.len() {
            // sampled the direct term
            let wi = Dir3::new(*src - self.interaction_wp);
            return Some(FsdSample {
                diffraction_wp: self.interaction_wp,
                wo: -wi,
                intersection: None,
                is_direct: true,
                pdf: 1.0 as Float / (self.edges.len() + 1) as Float,
                weight: (self.edges.len() + 1) as Float,
            });
        }

        let edge = &self.edges[eidx];
        let e = edge.e();

        let p = edge.v + e.v() * ((sampler.r() - 0.5 as Float) * edge.l.0);
        let ui = *src - p;
        if ui.dot(&edge.nff.v()) <= 0.0 && ui.dot(&edge.nbf.v()) <= 0.0 {
            return None;
        }

        let ri = ui.length();
        let wi = Dir3::from_normalized(ui / ri);
        let phii = edge.nff.dot(&wi.v()).atan2(edge.tff.dot(&wi.v()));

        let sigma = (UTD_IS_SIGMA_SCALE / (self.k * Length(ri))).sqrt();
        let gauss = sigma * sampler.normal2d().x;

        let mean_phi1 = PI + phii;
        let mean_phi2 = PI - phii;
        let phio = if sampler.r() < 0.5 { mean_phi1 } else { mean_phi2 } + gauss;

        let cos_beta = wi.dot(&e.v());
        let sin_beta = (1.0 as Float - cos_beta * cos_beta).max(0.0).sqrt();
        let wo = Dir3::new(
            (edge.tff.v() * phio.cos() + edge.nff.v() * phio.sin()) * sin_beta
                - e.v() * cos_beta,
        );

        if wo.dot(&edge.nff.v()) <= 0.0 && wo.dot(&edge.nbf.v()) <= 0.0 {
            return None;
        }
        // avoid grazing angles
        if sin_beta < UTD_MIN_SIN_BETA {
            return None;
        }

        let ads_edge = ads.edge(edge.ads_edge_idx);
        let pdf = self.pdf(src, &wo);
        if pdf <= 0.0 {
            return None;
        }
        Some(FsdSample {
            diffraction_wp: p,
            wo,
            intersection: Some(IntersectionEdge {
                edge_idx: edge.ads_edge_idx,
                e: ads_edge.e,
                wp: p,
            }),
            is_direct: false,
            pdf,
            weight: 1.0 as Float / pdf,
        })
    }

    /// Angular density of `sample` for a given outgoing direction.
    pub fn pdf(&self, src: &Point3f, wo: &Dir3) -> Float {
        if self.edges.is_empty() {
            return 0.0;
        }
        let mut ret: Float = 0.0;
        for edge in &self.edges {
            let p = match edge.diffraction_point_dir(src, wo) {
                Some(p) => p,
                None => continue,
            };
            let ui = *src - p;
            if (wo.dot(&edge.nff.v()) <= 0.0 && wo.dot(&edge.nbf.v()) <= 0.0)
                || (ui.dot(&edge.nff.v()) <= 0.0 && ui.dot(&edge.nbf.v()) <= 0.0)
            {
                continue;
            }

            let ri = ui.length();
            let wi = Dir3::from_normalized(ui / ri);
            let phii = edge.nff.dot(&wi.v()).atan2(edge.tff.dot(&wi.v()));
            let phio = edge.nff.dot(&wo.v()).atan2(edge.tff.dot(&wo.v()));
            let sigma = (UTD_IS_SIGMA_SCALE / (self.k * Length(ri))).sqrt();

            let wrap = |x: Float| {
                let x = x.rem_euclid(TWO_PI);
                if x > PI {
                    x - TWO_PI
                } else {
                    x
                }
            };
            let x1 = wrap(phio - (PI + phii));
            let x2 = wrap(phio - (PI - phii));

            // angle density along the Keller cone
            let apd = INV_SQRT_2_PI / sigma
                * ((-0.5 as Float * (x1 / sigma).powi(2)).exp()
                    + (-0.5 as Float * (x2 / sigma).powi(2)).exp())
                / 2.0 as Float;
            ret += apd;
        }
        ret / (self.edges.len() + 1) as Float
    }

    /// Evaluates the UTD diffracted field for a deterministic src-dst
    /// connection: one term per edge with a valid Fermat point.
    pub fn eval(&self, src: &Point3f, dst: &Point3f) -> SmallVec<[DiffractingEdge; 8]> {
        let mut ret: SmallVec<[DiffractingEdge; 8]> = SmallVec::new();
        for e in &self.edges {
            let p = match e.diffraction_point(src, dst) {
                Some(p) => p,
                None => continue,
            };
            let ui = *src - p;
            let uo = *dst - p;
            // ignore into-wedge rays
            if (uo.dot(&e.nff.v()) <= 0.0 && uo.dot(&e.nbf.v()) <= 0.0)
                || (ui.dot(&e.nff.v()) <= 0.0 && ui.dot(&e.nbf.v()) <= 0.0)
            {
                continue;
            }

            let ri = ui.length();
            let ro = uo.length();
            let wi = Dir3::from_normalized(ui / ri);
            let wo = Dir3::from_normalized(uo / ro);
            let f = e.utd(self.k, &wi, &wo, Length(ro));
            if f.ds.norm_sqr() == 0.0 && f.dh.norm_sqr() == 0.0 {
                continue;
            }

            ret.push(DiffractingEdge {
                utd: f,
                edge_idx: e.ads_edge_idx,
                p,
                wi,
                wo,
                ri: Length(ri),
                ro: Length(ro),
            });
        }
        ret
    }
}

/// True when an intersection record's edge list warrants an FSD aperture.
pub fn wants_fsd(edge_ids: &[Idx]) -> bool {
    !edge_ids.is_empty() && edge_ids.iter().all(|&e| e != INVALID_IDX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerators::bvh::make_triangle;
    use crate::accelerators::bvh8w::BuildOpts;
    use crate::accelerators::{IntersectOpts, IntersectionRecord, QueryScratch};
    use crate::core::elliptic_cone::EllipticCone;
    use crate::core::geometry::Ray;
    use crate::core::quantity::LengthRange;
    use crate::samplers::UniformSampler;

    fn plate_ads() -> Bvh8w {
        // a small plate at z = 5 made of two coplanar triangles
        let tris = vec![
            make_triangle(
                Point3f::new(-0.5, -0.5, 5.0),
                Point3f::new(0.5, -0.5, 5.0),
                Point3f::new(0.5, 0.5, 5.0),
                0,
                0,
            ),
            make_triangle(
                Point3f::new(-0.5, -0.5, 5.0),
                Point3f::new(0.5, 0.5, 5.0),
                Point3f::new(-0.5, 0.5, 5.0),
                0,
                1,
            ),
        ];
        Bvh8w::build(tris, &BuildOpts::default(), None).unwrap()
    }

    fn aperture(ads: &Bvh8w) -> FreeSpaceDiffraction {
        let cone = EllipticCone::new(
            Ray::new(
                Point3f::default(),
                Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
            ),
            0.3,
            Length(0.05),
        );
        let mut scratch = QueryScratch::new();
        let rec = ads.intersect_cone(
            &cone,
            &LengthRange::positive(),
            &IntersectOpts::default(),
            &mut scratch,
        );
        let edges: Vec<Idx> = match rec {
            IntersectionRecord::Cone(c) => c.edges.to_vec(),
            _ => panic!("expected cone hit"),
        };
        assert!(wants_fsd(&edges));
        let frame = Frame::build_orthogonal(Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)));
        FreeSpaceDiffraction::new(
            ads,
            Point3f::new(0.0, 0.0, 5.0),
            &frame,
            Vector3f::new(2.0, 2.0, 2.0),
            &Dir3::from_normalized(Vector3f::new(0.0, 0.0, -1.0)),
            Wavenumber::from_wavelength(Length(500e-9)),
            &edges,
        )
    }

    #[test]
    fn aperture_takes_silhouette_edges_only() {
        let ads = plate_ads();
        let fsd = aperture(&ads);
        // boundary edges face the beam; the interior diagonal edge (flat,
        // alpha = pi) is kept as a wedge too but the shared-face edges with
        // light from inside are skipped
        assert!(fsd.edge_count() > 0);
    }

    #[test]
    fn sampled_directions_have_positive_pdf() {
        let ads = plate_ads();
        let fsd = aperture(&ads);
        let src = Point3f::new(0.0, 0.0, 0.0);
        let mut sampler = UniformSampler::new(9);
        let mut any = 0;
        for _ in 0..64 {
            if let Some(s) = fsd.sample(&ads, &src, &mut sampler) {
                assert!(s.pdf > 0.0);
                if !s.is_direct {
                    any += 1;
                    // pdf of the sampled direction agrees with pdf()
                    let p = fsd.pdf(&src, &s.wo);
                    assert!((p - s.pdf).abs() <= 1e-3 * p.max(1.0));
                }
            }
        }
        assert!(any > 0);
    }

    #[test]
    fn eval_produces_fermat_terms_for_straight_connections() {
        let ads = plate_ads();
        let fsd = aperture(&ads);
        // a connection grazing past the plate boundary
        let src = Point3f::new(0.0, 2.0, 0.0);
        let dst = Point3f::new(0.0, -2.0, 10.0);
        let terms = fsd.eval(&src, &dst);
        for t in terms.iter() {
            assert!(t.ri > Length::ZERO && t.ro > Length::ZERO);
            assert!(t.utd.ds.norm().is_finite() && t.utd.dh.norm().is_finite());
        }
    }
}
