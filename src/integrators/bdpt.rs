//! Bidirectional path tracing over beams.
//!
//! Subpath vertices carry beams rather than rays: each vertex stores the
//! full spectral and polarimetric state (wavenumber, accumulated Mueller
//! transport operator, sampling densities), and every (s, t) subpath pair is
//! connected with multiple-importance sampling, including the free-space
//! diffraction sampling lobe.

// wavert
use crate::accelerators::{IntersectionRecord, QueryScratch};
use crate::beam::Beam;
use crate::core::frame::Frame;
use crate::core::geometry::{Dir3, Point3f, Ray, Vector2f, Vector3f};
use crate::core::quantity::{clamp_t, Float, Length, Wavenumber};
use crate::core::spectrum::SpectralPd;
use crate::interaction::fsd::fraunhofer::{
    self, build_aperture, direction_for_xi, sample_aperture, xi_for_direction, FsdAperture,
};
use crate::interaction::fsd::FreeSpaceDiffraction;
use crate::interaction::intersection::{IntersectionEdge, IntersectionFootprint, IntersectionSurface};
use crate::interaction::polarimetric::{reorient_operator, Mueller, Stokes};
use crate::samplers::{Sampler, SobolSampler};
use crate::scene::Scene;
use crate::sensors::block::BlockHandle;
use crate::integrators::traversal::{self, TraversalOpts};

/// Kind tag of a path vertex.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VertexKind {
    Sensor,
    /// Emitter seated on scene geometry or at a point.
    Emitter,
    /// Emitter at infinity (directional).
    EmitterInfinity,
    SurfaceScatter,
    EdgeDiffraction,
    /// The subpath escaped the scene.
    Escape,
}

/// A subpath vertex: geometry, incoming beam direction, wavenumber, the
/// accumulated Mueller transport operator, and sampling densities.
#[derive(Debug, Clone)]
pub struct Vertex {
    pub kind: VertexKind,
    pub p: Point3f,
    pub n: Dir3,
    /// Direction from this vertex toward the previous one.
    pub wi: Dir3,
    pub k: Wavenumber,
    pub surface: Option<IntersectionSurface>,
    pub edge: Option<IntersectionEdge>,
    /// Accumulated transport operator from the subpath source (pdf-divided).
    pub beta: Mueller,
    /// Transverse frame in which the state at this vertex is expressed.
    pub beta_frame: Frame,
    /// Source Stokes state; meaningful on the first vertex of a subpath.
    pub source: Stokes,
    /// Scalar throughput magnitude, for Russian roulette.
    pub throughput: Float,
    /// Forward area (or discrete) density of generating this vertex.
    pub pdf_fwd: Float,
    /// Reverse density, filled during subpath generation.
    pub pdf_rev: Float,
    pub delta: bool,
    pub emitter_idx: Option<usize>,
    /// Index into the arena's per-vertex FSD data.
    pub fsd: Option<usize>,
}

impl Vertex {
    fn is_on_surface(&self) -> bool {
        self.surface.is_some()
    }

    fn is_connectible(&self) -> bool {
        match self.kind {
            VertexKind::Escape => false,
            VertexKind::Sensor | VertexKind::Emitter | VertexKind::EmitterInfinity => true,
            VertexKind::SurfaceScatter | VertexKind::EdgeDiffraction => !self.delta,
        }
    }

    /// Converts a solid-angle density at this vertex into an area density
    /// at `next` (kept as solid angle for escaped/infinite vertices).
    fn convert_density(&self, pdf: Float, next: &Vertex) -> Float {
        if next.kind == VertexKind::Escape || next.kind == VertexKind::EmitterInfinity {
            return pdf;
        }
        let w = next.p - self.p;
        let dist2 = w.length_squared();
        if dist2 == 0.0 {
            return 0.0;
        }
        let mut pdf = pdf / dist2;
        if next.is_on_surface() {
            pdf *= next.n.dot(&(w / dist2.sqrt())).abs();
        }
        pdf
    }
}

/// FSD data of one vertex: the UTD wedge aperture for evaluation and Keller
/// sampling, the Fraunhofer aperture for silhouette transmission sampling,
/// and the diffraction-lobe selection probability.
pub struct FsdVertexData {
    pub utd: FreeSpaceDiffraction,
    pub aperture: FsdAperture,
    pub frame: Frame,
    pub select_prob: Float,
    /// The mean ray was blocked by the closest hit (wedge regime); when
    /// false, the beam grazes a silhouette (Fraunhofer regime).
    pub blocked: bool,
}

/// Per-thread scratch of the integrator: subpath vertex storage, FSD
/// apertures and the cone-query scratch. Reset at the start of each sample.
pub struct BdptArena {
    pub sensor_vertices: Vec<Vertex>,
    pub emitter_vertices: Vec<Vertex>,
    pub fsd: Vec<FsdVertexData>,
    pub scratch: QueryScratch,
}

impl BdptArena {
    pub fn new() -> BdptArena {
        BdptArena {
            sensor_vertices: Vec::with_capacity(16),
            emitter_vertices: Vec::with_capacity(16),
            fsd: Vec::with_capacity(8),
            scratch: QueryScratch::new(),
        }
    }
    fn clear(&mut self) {
        self.sensor_vertices.clear();
        self.emitter_vertices.clear();
        self.fsd.clear();
    }
}

impl Default for BdptArena {
    fn default() -> Self {
        BdptArena::new()
    }
}

/// Clamped barycentric coordinates of the projection of `p` on a triangle.
fn barycentric_of(a: Point3f, b: Point3f, c: Point3f, p: Point3f) -> (Float, Float) {
    let v0 = b - a;
    let v1 = c - a;
    let v2 = p - a;
    let d00 = v0.dot(&v0);
    let d01 = v0.dot(&v1);
    let d11 = v1.dot(&v1);
    let d20 = v2.dot(&v0);
    let d21 = v2.dot(&v1);
    let denom = d00 * d11 - d01 * d01;
    if denom.abs() < 1e-20 {
        return (0.3, 0.3);
    }
    let b1 = clamp_t((d11 * d20 - d01 * d21) / denom, 0.0, 1.0);
    let b2 = clamp_t((d00 * d21 - d01 * d20) / denom, 0.0, 1.0 - b1);
    (b1, b2)
}

/// Beam footprint projected into the surface tangent frame.
fn surface_footprint(beam: &Beam, dist: Length, geo: &Frame) -> IntersectionFootprint {
    let fp = beam.footprint(dist);
    let x = geo.to_local_2d(&beam.envelope().x().v());
    if x.length_squared() > 1e-12 {
        IntersectionFootprint {
            x: x.normalize(),
            la: Length(fp.x),
            lb: Length(fp.y),
        }
    } else {
        let avg = Length(0.5 * (fp.x + fp.y));
        IntersectionFootprint {
            x: Vector2f { x: 1.0, y: 0.0 },
            la: avg,
            lb: avg,
        }
    }
}

struct SubpathSeed {
    beam: Beam,
    source: Stokes,
    /// Initial scalar weight folded into the walk (cosine over pdfs).
    weight: Float,
    pdf_pos: Float,
    pdf_dir: Float,
    kind: VertexKind,
    p: Point3f,
    n: Dir3,
    emitter_idx: Option<usize>,
}

#[allow(clippy::too_many_arguments)]
fn random_walk(
    scene: &Scene,
    sensor_idx: usize,
    seed: SubpathSeed,
    path: &mut Vec<Vertex>,
    fsd_store: &mut Vec<FsdVertexData>,
    scratch: &mut QueryScratch,
    sampler: &mut dyn Sampler,
    max_vertices: u32,
) {
    let opts = &scene.integrator;
    let k = seed.beam.k();
    let lambda = k.wavelength();
    let sensor = &scene.sensors[sensor_idx];
    let t_opts = TraversalOpts {
        force_ray_tracing: scene.options.force_ray_tracing || sensor.ray_trace_only,
        detect_edges: scene.options.ads_detect_edges,
        accumulate_edges: scene.options.ads_accumulate_edges,
    };

    let beam_frame = seed.beam.frame();
    path.push(Vertex {
        kind: seed.kind,
        p: seed.p,
        n: seed.n,
        wi: seed.beam.dir(),
        k,
        surface: None,
        edge: None,
        beta: Mueller::identity(),
        beta_frame: beam_frame,
        source: seed.source,
        throughput: 1.0,
        pdf_fwd: seed.pdf_pos,
        pdf_rev: 0.0,
        delta: false,
        emitter_idx: seed.emitter_idx,
        fsd: None,
    });
    if max_vertices <= 1 {
        return;
    }

    let mut beam = seed.beam;
    let mut beta = Mueller::scale(seed.weight);
    let mut beta_frame = beam_frame;
    let mut throughput = seed.weight * seed.source.intensity().max(1e-12);
    let mut pdf_fwd_dir = seed.pdf_dir;
    // pending diffraction events resolve once the next hit distance is known
    let mut pending_edge: Option<(usize, Point3f)> = None;

    loop {
        let result = traversal::traverse(
            &scene.ads,
            beam.envelope(),
            lambda,
            Length::INFINITY,
            &t_opts,
            &mut *scratch,
        );
        let origin = result.origin;

        // resolve a pending edge-diffraction operator with the real hop
        // distance (the UTD amplitude scales with k ro)
        if let Some((fsd_idx, src)) = pending_edge.take() {
            let ro = result.record.distance();
            let ro = if ro.is_finite() { ro } else { Length(1e3) };
            let utd = &fsd_store[fsd_idx].utd;
            let dst = origin + beam.dir().v() * ro.0;
            let terms = utd.eval(&src, &dst);
            let m = if let Some(t) = terms.first() {
                Mueller::from_sp_amplitudes(t.utd.ds, t.utd.dh)
            } else {
                Mueller::scale(1.0)
            };
            beta = m * beta;
            throughput *= m.mean_transmittance().max(1e-6);
        }

        let (dist, hit_data) = match &result.record {
            IntersectionRecord::None => {
                // sky / escape vertex
                let prev_idx = path.len() - 1;
                let p = origin + beam.dir().v() * 1e7;
                let mut v = Vertex {
                    kind: VertexKind::Escape,
                    p,
                    n: Dir3::from_normalized(-beam.dir().v()),
                    wi: Dir3::from_normalized(-beam.dir().v()),
                    k,
                    surface: None,
                    edge: None,
                    beta,
                    beta_frame,
                    source: Stokes::unpolarized(1.0),
                    throughput,
                    pdf_fwd: pdf_fwd_dir,
                    pdf_rev: 0.0,
                    delta: false,
                    emitter_idx: None,
                    fsd: None,
                };
                v.pdf_fwd = path[prev_idx].convert_density(pdf_fwd_dir, &v);
                path.push(v);
                return;
            }
            IntersectionRecord::Ray(hit) => {
                let wp = origin + beam.dir().v() * hit.dist.0;
                (hit.dist, (hit.tuid, hit.b1, hit.b2, wp, false))
            }
            IntersectionRecord::Cone(c) => {
                let wp = origin + beam.dir().v() * c.dist.0;
                let tri = scene.ads.tri(c.closest);
                let (b1, b2) = barycentric_of(tri.a, tri.b, tri.c, wp);
                (c.dist, (c.closest, b1, b2, wp, true))
            }
        };
        let (tuid, b1, b2, wp, _from_cone) = hit_data;

        // build the intersection surface with the beam footprint projected
        let tri = *scene.ads.tri(tuid);
        let pre_geo = Frame::build_orthogonal(tri.n);
        let footprint = surface_footprint(&beam, dist, &pre_geo);
        let surface = scene.make_surface(tuid, b1, b2, wp, footprint);

        // optionally build the FSD aperture from the record's edge set
        let fsd_idx = if let IntersectionRecord::Cone(c) = &result.record {
            if opts.fsd && !c.edges.is_empty() && !t_opts.force_ray_tracing {
                let frame = beam.frame();
                let wavefront = beam.wavefront(dist);
                let wi_in = Dir3::from_normalized(-beam.dir().v());
                let region = beam.footprint(dist) + Vector3f::new(0.0, 0.0, result.intersection_region_depth.0);
                let utd = FreeSpaceDiffraction::new(
                    &scene.ads,
                    wp,
                    &frame,
                    region,
                    &wi_in,
                    k,
                    c.edges,
                );
                let aperture = build_aperture(
                    &scene.ads,
                    &frame,
                    k,
                    1.0,
                    &beam,
                    c.edges,
                    &wavefront,
                );
                // the mean ray blocked: wedge diffraction regime; grazing:
                // Fraunhofer transmission regime
                let blocked = crate::core::intersect::intersect_ray_tri(
                    &Ray::new(origin, beam.dir()),
                    tri.a,
                    tri.b,
                    tri.c,
                    &crate::core::quantity::LengthRange::positive(),
                )
                .is_some();
                let select_prob = if utd.edge_count() == 0 && aperture.is_empty() {
                    0.0
                } else {
                    clamp_t(aperture.p_total, 0.05, 0.75)
                };
                fsd_store.push(FsdVertexData {
                    utd,
                    aperture,
                    frame,
                    select_prob,
                    blocked,
                });
                Some(fsd_store.len() - 1)
            } else {
                None
            }
        } else {
            None
        };

        let wi = Dir3::from_normalized(-beam.dir().v());
        let bounces = path.len();

        // sample the next direction: surface-scatter lobe or FSD lobe,
        // chosen by relative power
        let use_fsd = fsd_idx
            .map(|i| sampler.r() < fsd_store[i].select_prob)
            .unwrap_or(false);

        let emitter_idx = scene.emitter_for_shape(tri.shape_idx);

        if use_fsd {
            let i = fsd_idx.unwrap();
            let q = fsd_store[i].select_prob;
            if fsd_store[i].blocked && fsd_store[i].utd.edge_count() > 0 {
                // Keller-cone edge diffraction
                let smp = match fsd_store[i].utd.sample(&scene.ads, &origin, sampler) {
                    Some(s) => s,
                    None => return,
                };
                let pdf = smp.pdf * q;
                let mut v = Vertex {
                    kind: VertexKind::EdgeDiffraction,
                    p: smp.diffraction_wp,
                    n: surface.geo.n,
                    wi,
                    k,
                    surface: Some(surface),
                    edge: smp.intersection,
                    beta,
                    beta_frame,
                    source: Stokes::unpolarized(1.0),
                    throughput,
                    pdf_fwd: 0.0,
                    pdf_rev: 0.0,
                    delta: false,
                    emitter_idx,
                    fsd: fsd_idx,
                };
                v.pdf_fwd = path[bounces - 1].convert_density(pdf_fwd_dir, &v);
                path.push(v);
                if bounces as u32 + 1 >= max_vertices {
                    return;
                }
                // the UTD operator is applied when the hop distance is known
                pending_edge = Some((i, origin));
                beta = beta * (smp.weight / q.max(1e-6));
                throughput *= smp.weight / q.max(1e-6);
                pdf_fwd_dir = pdf;
                let ray = Ray::new(smp.diffraction_wp + smp.wo.v() * 1e-5, smp.wo);
                beam = if beam.is_ray() {
                    Beam::from_ray(ray, k)
                } else {
                    Beam::from_phase_space(ray, k, sensor.sourcing_beam_extent(k))
                };
                beta_frame = beam.frame();
            } else {
                // Fraunhofer silhouette transmission
                let smp = match sample_aperture(sampler, &fsd_store[i].aperture) {
                    Some(s) => s,
                    None => return,
                };
                let frame = fsd_store[i].frame;
                let wo = direction_for_xi(&frame, smp.xi, k);
                let pdf = (smp.pdf * q).max(1e-12);
                let mut v = Vertex {
                    kind: VertexKind::EdgeDiffraction,
                    p: wp,
                    n: surface.geo.n,
                    wi,
                    k,
                    surface: Some(surface),
                    edge: None,
                    beta,
                    beta_frame,
                    source: Stokes::unpolarized(1.0),
                    throughput,
                    pdf_fwd: 0.0,
                    pdf_rev: 0.0,
                    delta: false,
                    emitter_idx,
                    fsd: fsd_idx,
                };
                v.pdf_fwd = path[bounces - 1].convert_density(pdf_fwd_dir, &v);
                path.push(v);
                if bounces as u32 + 1 >= max_vertices {
                    return;
                }
                // transmission preserves the polarimetric state
                let w = smp.weight / q.max(1e-6);
                beta = beta * w;
                throughput *= w;
                pdf_fwd_dir = pdf;
                let ray = Ray::new(wp + wo.v() * 1e-5, wo);
                beam = if beam.is_ray() {
                    Beam::from_ray(ray, k)
                } else {
                    Beam::from_phase_space(ray, k, sensor.sourcing_beam_extent(k))
                };
                beta_frame = beam.frame();
            }
        } else {
            // surface-scatter vertex
            let bsdf = &scene.shapes[tri.shape_idx as usize].bsdf;
            let smp = bsdf.sample(&surface, &wi, k, sampler);
            let mut v = Vertex {
                kind: VertexKind::SurfaceScatter,
                p: wp,
                n: surface.geo.n,
                wi,
                k,
                surface: Some(surface),
                edge: None,
                beta,
                beta_frame,
                source: Stokes::unpolarized(1.0),
                throughput,
                pdf_fwd: 0.0,
                pdf_rev: 0.0,
                delta: false,
                emitter_idx,
                fsd: fsd_idx,
            };
            v.pdf_fwd = path[bounces - 1].convert_density(pdf_fwd_dir, &v);

            let smp = match smp {
                Some(s) => s,
                None => {
                    path.push(v);
                    return;
                }
            };
            let q_bsdf = fsd_idx
                .map(|i| 1.0 as Float - fsd_store[i].select_prob)
                .unwrap_or(1.0);
            v.delta = smp.delta;
            let pdf = smp.pdf * q_bsdf;
            // reverse density of the previous vertex
            let rev_sa = bsdf.pdf(v.surface.as_ref().unwrap(), &smp.wo, &wi, k);
            let prev_idx = path.len() - 1;
            let rev = v.convert_density(rev_sa, &path[prev_idx]);
            path[prev_idx].pdf_rev = rev;
            let surface_ref = v.surface.unwrap();
            path.push(v);
            if bounces as u32 + 1 >= max_vertices {
                return;
            }

            // apply the scattering operator with frame reorientations
            let m_in = reorient_operator(&beta_frame, &smp.eval.fi);
            beta = smp.eval.m * (m_in * beta);
            let cos = smp.wo.dot(&surface_ref.shading.n.v()).abs();
            let scale = cos / pdf.max(1e-12);
            beta = beta * scale;
            beta_frame = smp.eval.fo;
            throughput *= smp.weight.max(0.0) / q_bsdf.max(1e-6);
            throughput = throughput.min(1e6);
            pdf_fwd_dir = if smp.delta { 0.0 } else { pdf };

            let ray = Ray::new(surface_ref.offseted_ray_origin(&Ray::new(wp, smp.wo)), smp.wo);
            beam = if beam.is_ray() {
                Beam::from_ray(ray, k)
            } else {
                Beam::from_surface(&surface_ref, ray, k, beam.envelope().tan_alpha())
            };
        }

        // Russian roulette past the minimum depth
        if opts.russian_roulette && path.len() as u32 > opts.rr_min_depth {
            let q = clamp_t(throughput, 0.05, 0.95);
            if sampler.r() >= q {
                return;
            }
            beta = beta * (1.0 as Float / q);
            throughput /= q;
        }

        if path.len() as u32 >= max_vertices {
            return;
        }
    }
}

fn generate_sensor_subpath(
    scene: &Scene,
    sensor_idx: usize,
    element: (u32, u32),
    k: Wavenumber,
    arena: &mut BdptArena,
    sampler: &mut dyn Sampler,
) {
    let sensor = &scene.sensors[sensor_idx];
    let smp = sensor.sample(sampler, element, k);
    let beam = Beam::from_phase_space(smp.ray, k, smp.beam_extent);
    let seed = SubpathSeed {
        beam,
        source: Stokes::unpolarized(1.0),
        weight: smp.importance.intensity() / (smp.pdf_pos * smp.pdf_dir).max(1e-12),
        pdf_pos: smp.pdf_pos,
        pdf_dir: smp.pdf_dir,
        kind: VertexKind::Sensor,
        p: smp.ray.o,
        n: smp.ray.d,
        emitter_idx: None,
    };
    let max = scene.integrator.max_depth + 2;
    let BdptArena {
        sensor_vertices,
        fsd,
        scratch,
        ..
    } = arena;
    sensor_vertices.clear();
    random_walk(
        scene,
        sensor_idx,
        seed,
        sensor_vertices,
        fsd,
        scratch,
        sampler,
        max,
    );
}

fn generate_emitter_subpath(
    scene: &Scene,
    sensor_idx: usize,
    emitter_idx: usize,
    emitter_pmf: Float,
    k: Wavenumber,
    arena: &mut BdptArena,
    sampler: &mut dyn Sampler,
) {
    let emitter = &scene.emitters[emitter_idx];
    let mesh = scene.emitter_mesh(emitter_idx);
    let smp = match emitter.sample(sampler, k, mesh) {
        Some(s) => s,
        None => return,
    };
    let beam = Beam::from_phase_space(smp.ray, k, smp.beam_extent);
    let cos = smp.n.dot(&smp.ray.d.v()).abs().max(1e-9);
    let kind = if emitter.is_infinite_emitter() {
        VertexKind::EmitterInfinity
    } else {
        VertexKind::Emitter
    };
    let seed = SubpathSeed {
        beam,
        source: smp.flux,
        weight: cos / (emitter_pmf * smp.pdf_pos * smp.pdf_dir).max(1e-12),
        pdf_pos: smp.pdf_pos * emitter_pmf,
        pdf_dir: smp.pdf_dir,
        kind,
        p: smp.ray.o,
        n: smp.n,
        emitter_idx: Some(emitter_idx),
    };
    let max = scene.integrator.max_depth + 1;
    let BdptArena {
        emitter_vertices,
        fsd,
        scratch,
        ..
    } = arena;
    emitter_vertices.clear();
    random_walk(
        scene,
        sensor_idx,
        seed,
        emitter_vertices,
        fsd,
        scratch,
        sampler,
        max,
    );
}

/// Directional (solid-angle) density of `v` scattering from `prev` toward
/// `next`, combining BSDF and FSD lobes by their selection probabilities.
fn directional_pdf(
    scene: &Scene,
    sensor_idx: usize,
    fsd_store: &[FsdVertexData],
    v: &Vertex,
    prev_p: Option<Point3f>,
    next: &Vertex,
) -> Float {
    let to_next = next.p - v.p;
    if to_next.length_squared() == 0.0 {
        return 0.0;
    }
    let wo = Dir3::new(to_next);
    match v.kind {
        VertexKind::Sensor => scene.sensors[sensor_idx].pdf_direction(&wo),
        VertexKind::Emitter | VertexKind::EmitterInfinity => {
            let e = v.emitter_idx.unwrap_or(0);
            scene.emitters[e].pdf_direction(&v.n, &wo)
        }
        VertexKind::SurfaceScatter => {
            let surface = match &v.surface {
                Some(s) => s,
                None => return 0.0,
            };
            let wi = match prev_p {
                Some(p) => Dir3::new(p - v.p),
                None => v.wi,
            };
            let bsdf = &scene.shapes[surface.shape_idx as usize].bsdf;
            let mut pdf = bsdf.pdf(surface, &wi, &wo, v.k);
            if let Some(i) = v.fsd {
                let data = &fsd_store[i];
                let q = data.select_prob;
                pdf *= 1.0 as Float - q;
                if data.blocked {
                    let src = prev_p.unwrap_or(v.p + wi.v());
                    pdf += q * data.utd.pdf(&src, &wo);
                } else {
                    let xi = xi_for_direction(&data.frame, &wo, v.k);
                    pdf += q * fraunhofer::asf(&data.aperture, xi) * data.aperture.recp_i;
                }
            }
            pdf
        }
        VertexKind::EdgeDiffraction => {
            if let Some(i) = v.fsd {
                let data = &fsd_store[i];
                let src = prev_p.unwrap_or(v.p + v.wi.v());
                if data.blocked {
                    data.utd.pdf(&src, &wo) * data.select_prob
                } else {
                    let xi = xi_for_direction(&data.frame, &wo, v.k);
                    fraunhofer::asf(&data.aperture, xi) * data.aperture.recp_i * data.select_prob
                }
            } else {
                0.0
            }
        }
        VertexKind::Escape => 0.0,
    }
}

fn vertex_pdf(
    scene: &Scene,
    sensor_idx: usize,
    fsd_store: &[FsdVertexData],
    v: &Vertex,
    prev: Option<&Vertex>,
    next: &Vertex,
) -> Float {
    let sa = directional_pdf(scene, sensor_idx, fsd_store, v, prev.map(|p| p.p), next);
    v.convert_density(sa, next)
}

/// Area density of an emitter vertex generating `next` (emission pdf).
fn pdf_light(scene: &Scene, v: &Vertex, next: &Vertex) -> Float {
    let e = match v.emitter_idx {
        Some(e) => e,
        None => return 0.0,
    };
    let w = next.p - v.p;
    let dist2 = w.length_squared();
    if dist2 == 0.0 {
        return 0.0;
    }
    let dir = Dir3::from_normalized(w / dist2.sqrt());
    let mut pdf = scene.emitters[e].pdf_direction(&v.n, &dir) / dist2;
    if next.is_on_surface() {
        pdf *= next.n.dot(&dir.v()).abs();
    }
    pdf
}

/// Density of selecting and positioning the emitter at vertex `v`.
fn pdf_light_origin(scene: &Scene, sensor_idx: usize, v: &Vertex) -> Float {
    let e = match v.emitter_idx {
        Some(e) => e,
        None => return 0.0,
    };
    let pmf = scene.sensor_sampling[sensor_idx]
        .emitter_distribution
        .discrete_pdf(e);
    let mesh = scene.emitter_mesh(e);
    pmf * scene.emitters[e].pdf_position(mesh)
}

/// Evaluates the scattering operator of `v` toward `to`: the Mueller
/// operator and its frames, in the transport direction prev -> v -> to.
fn eval_vertex(
    scene: &Scene,
    fsd_store: &[FsdVertexData],
    v: &Vertex,
    to: &Vertex,
) -> Option<(Mueller, Frame, Frame)> {
    let dir = to.p - v.p;
    if dir.length_squared() == 0.0 {
        return None;
    }
    let wo = Dir3::new(dir);
    match v.kind {
        VertexKind::SurfaceScatter => {
            let surface = v.surface.as_ref()?;
            let bsdf = &scene.shapes[surface.shape_idx as usize].bsdf;
            let eval = bsdf.f(surface, &v.wi, &wo, v.k)?;
            Some((eval.m, eval.fi, eval.fo))
        }
        VertexKind::EdgeDiffraction => {
            let i = v.fsd?;
            let data = &fsd_store[i];
            if data.blocked {
                let src = v.p + v.wi.v() * 1.0;
                let dst = to.p;
                let terms = data.utd.eval(&src, &dst);
                let t = terms.first()?;
                let m = Mueller::from_sp_amplitudes(t.utd.ds, t.utd.dh);
                let fi = Frame::build_orthogonal(v.wi);
                let fo = Frame::build_orthogonal(wo);
                Some((m, fi, fo))
            } else {
                let xi = xi_for_direction(&data.frame, &wo, v.k);
                let a = fraunhofer::asf(&data.aperture, xi) * data.aperture.recp_i;
                let fi = Frame::build_orthogonal(v.wi);
                let fo = Frame::build_orthogonal(wo);
                Some((Mueller::scale(a), fi, fo))
            }
        }
        _ => None,
    }
}

/// The balance-heuristic MIS weight of strategy (s, t), re-evaluating each
/// vertex's sampling density in both directions.
#[allow(clippy::too_many_arguments)]
fn mis_weight(
    scene: &Scene,
    sensor_idx: usize,
    fsd_store: &[FsdVertexData],
    light_vertices: &[Vertex],
    sensor_vertices: &[Vertex],
    sampled: Option<&Vertex>,
    s: usize,
    t: usize,
) -> Float {
    if s + t == 2 {
        return 1.0;
    }
    // deal with Dirac delta densities
    let remap0 = |f: Float| if f != 0.0 { f } else { 1.0 };

    // snapshot (pdf_fwd, pdf_rev, delta) and override the entries affected
    // by this strategy
    let mut cam: Vec<(Float, Float, bool)> = sensor_vertices[..t]
        .iter()
        .map(|v| (v.pdf_fwd, v.pdf_rev, v.delta))
        .collect();
    let mut light: Vec<(Float, Float, bool)> = light_vertices[..s]
        .iter()
        .map(|v| (v.pdf_fwd, v.pdf_rev, v.delta))
        .collect();

    let qs = if s > 0 {
        Some(sampled.filter(|_| s == 1).unwrap_or(&light_vertices[s - 1]))
    } else {
        None
    };
    let pt = if t > 0 {
        Some(sampled.filter(|_| t == 1).unwrap_or(&sensor_vertices[t - 1]))
    } else {
        None
    };
    // sampled endpoints replace the stored subpath densities
    if s == 1 {
        if let Some(smp) = sampled {
            light[0].0 = smp.pdf_fwd;
        }
    }
    if t == 1 {
        if let Some(smp) = sampled {
            cam[0].0 = smp.pdf_fwd;
        }
    }
    if let Some(p) = pt {
        cam[t - 1].2 = false;
        // reverse density of pt: generated from qs, or by emission for s = 0
        cam[t - 1].1 = match qs {
            Some(q) => {
                let prev = if s > 1 {
                    Some(&light_vertices[s - 2])
                } else {
                    None
                };
                vertex_pdf(scene, sensor_idx, fsd_store, q, prev, p)
            }
            None => pdf_light_origin(scene, sensor_idx, p),
        };
        // reverse density of pt-1: generated from pt
        if t > 1 {
            cam[t - 2].1 = match qs {
                Some(_) => vertex_pdf(scene, sensor_idx, fsd_store, p, qs, &sensor_vertices[t - 2]),
                None => pdf_light(scene, p, &sensor_vertices[t - 2]),
            };
        }
    }
    if let Some(q) = qs {
        light[s - 1].2 = false;
        if let Some(p) = pt {
            let prev = if t > 1 {
                Some(&sensor_vertices[t - 2])
            } else {
                None
            };
            light[s - 1].1 = vertex_pdf(scene, sensor_idx, fsd_store, p, prev, q);
        }
        if s > 1 {
            light[s - 2].1 = vertex_pdf(scene, sensor_idx, fsd_store, q, pt, &light_vertices[s - 2]);
        }
    }

    // hypothetical strategies along the sensor subpath
    let mut sum_ri: Float = 0.0;
    let mut ri: Float = 1.0;
    let mut i = t as isize - 1;
    while i > 0 {
        let iu = i as usize;
        ri *= remap0(cam[iu].1) / remap0(cam[iu].0);
        if !cam[iu].2 && !cam[iu - 1].2 {
            sum_ri += ri;
        }
        i -= 1;
    }

    // hypothetical strategies along the light subpath
    ri = 1.0;
    let mut i = s as isize - 1;
    while i >= 0 {
        let iu = i as usize;
        ri *= remap0(light[iu].1) / remap0(light[iu].0);
        let delta_prev = if iu > 0 {
            light[iu - 1].2
        } else {
            // the light source itself
            light_vertices
                .first()
                .and_then(|v| v.emitter_idx)
                .map(|e| scene.emitters[e].is_delta_position())
                .unwrap_or(false)
        };
        if !light[iu].2 && !delta_prev {
            sum_ri += ri;
        }
        i -= 1;
    }

    1.0 as Float / (1.0 as Float + sum_ri)
}

/// Geometry term with visibility between two vertices.
fn geometry_term(scene: &Scene, a: &Vertex, b: &Vertex) -> Float {
    let d = b.p - a.p;
    let dist2 = d.length_squared();
    if dist2 == 0.0 {
        return 0.0;
    }
    let mut g = 1.0 as Float / dist2;
    let dn = d / dist2.sqrt();
    if a.is_on_surface() {
        g *= a.n.dot(&dn).abs();
    }
    if b.is_on_surface() {
        g *= b.n.dot(&dn).abs();
    }
    if g <= 0.0 {
        return 0.0;
    }
    let start = match &a.surface {
        Some(s) => s.offseted_ray_origin(&Ray::new(a.p, Dir3::from_normalized(dn))),
        None => a.p,
    };
    let end = match &b.surface {
        Some(s) => s.offseted_ray_origin(&Ray::new(b.p, Dir3::from_normalized(-dn))),
        None => b.p,
    };
    if traversal::shadow_between(&scene.ads, start, end) {
        return 0.0;
    }
    g
}

struct ConnectResult {
    l: Stokes,
    /// Film element for direct (t = 1) sensor splats.
    element: Option<(u32, u32)>,
}

/// Evaluates the deterministic connection of emitter prefix `s` with sensor
/// prefix `t`.
#[allow(clippy::too_many_arguments)]
fn connect(
    scene: &Scene,
    sensor_idx: usize,
    arena: &BdptArena,
    s: usize,
    t: usize,
    k: Wavenumber,
    sampler: &mut dyn Sampler,
) -> Option<(ConnectResult, Option<Vertex>, Float)> {
    let light_vertices = &arena.emitter_vertices;
    let sensor_vertices = &arena.sensor_vertices;
    let fsd_store = &arena.fsd;
    let sensor = &scene.sensors[sensor_idx];

    let mut sampled: Option<Vertex> = None;
    let mut element: Option<(u32, u32)> = None;
    let l: Stokes;

    if s == 0 {
        // the sensor subpath alone: its last vertex must sit on an emitter
        let pt = &sensor_vertices[t - 1];
        let e = pt.emitter_idx?;
        let prev = &sensor_vertices[t - 2];
        let toward = Dir3::new(pt.p - prev.p);
        let le = scene.emitters[e].li(&toward, k, pt.surface.as_ref());
        if le.intensity() <= 0.0 {
            return None;
        }
        l = pt.beta * le;
    } else if t == 1 {
        // connect the light subpath directly to the sensor
        let qs = light_vertices.get(s - 1)?;
        if !qs.is_connectible() {
            return None;
        }
        let d = sensor.sample_direct(sampler, &qs.p, k)?;
        element = Some(d.element);
        let mut v = make_endpoint_vertex(VertexKind::Sensor, d.p, d.n, k);
        v.pdf_fwd = d.pdf;
        let (m, fi, _fo) = eval_vertex(scene, fsd_store, qs, &v)?;
        let s_q = qs.beta * source_of(light_vertices);
        let s1 = m * (reorient_operator(&qs.beta_frame, &fi) * s_q);
        let g = geometry_term(scene, qs, &v);
        if g <= 0.0 {
            return None;
        }
        l = s1 * (g * d.importance.intensity() / d.pdf.max(1e-12));
        sampled = Some(v);
    } else if s == 1 {
        // sample a point on the chosen emitter and connect to the sensor
        // subpath
        let pt = sensor_vertices.get(t - 1)?;
        if !pt.is_connectible() {
            return None;
        }
        let e_idx = light_vertices.first()?.emitter_idx?;
        let emitter = &scene.emitters[e_idx];
        let mesh = scene.emitter_mesh(e_idx);
        let d = emitter.sample_direct(sampler, &pt.p, k, mesh)?;
        let mut v = make_endpoint_vertex(
            if emitter.is_infinite_emitter() {
                VertexKind::EmitterInfinity
            } else {
                VertexKind::Emitter
            },
            d.p,
            d.n,
            k,
        );
        v.emitter_idx = Some(e_idx);
        v.pdf_fwd = pdf_light_origin(scene, sensor_idx, &v);
        let (m, fi, _fo) = eval_vertex(scene, fsd_store, pt, &v)?;
        let pmf = scene.sensor_sampling[sensor_idx]
            .emitter_distribution
            .discrete_pdf(e_idx);
        let g = geometry_term(scene, pt, &v);
        if g <= 0.0 {
            return None;
        }
        let s_l = d.radiance * (1.0 as Float / (d.pdf * pmf).max(1e-12));
        // radiance arrives at pt, scatters toward the sensor side
        let s1 = m * (reorient_operator(&Frame::build_orthogonal(d.dir), &fi) * s_l);
        l = pt.beta * s1 * g;
        sampled = Some(v);
    } else {
        // general bidirectional connection
        let qs = light_vertices.get(s - 1)?;
        let pt = sensor_vertices.get(t - 1)?;
        if !qs.is_connectible() || !pt.is_connectible() {
            return None;
        }
        let (mq, fiq, foq) = eval_vertex(scene, fsd_store, qs, pt)?;
        let (mp, fip, _fop) = eval_vertex(scene, fsd_store, pt, qs)?;
        let g = geometry_term(scene, qs, pt);
        if g <= 0.0 {
            return None;
        }
        let s_q = qs.beta * source_of(light_vertices);
        let s1 = mq * (reorient_operator(&qs.beta_frame, &fiq) * s_q);
        let s2 = mp * (reorient_operator(&foq, &fip) * s1);
        l = pt.beta * s2 * g;
    }

    if !l.is_finite() || l.intensity() <= 0.0 {
        return None;
    }
    let mis = if scene.integrator.mis {
        mis_weight(
            scene,
            sensor_idx,
            fsd_store,
            light_vertices,
            sensor_vertices,
            sampled.as_ref(),
            s,
            t,
        )
    } else {
        1.0 as Float / (s + t + 1) as Float
    };
    Some((ConnectResult { l: l * mis, element }, sampled, mis))
}

fn make_endpoint_vertex(kind: VertexKind, p: Point3f, n: Dir3, k: Wavenumber) -> Vertex {
    Vertex {
        kind,
        p,
        n,
        wi: n,
        k,
        surface: None,
        edge: None,
        beta: Mueller::identity(),
        beta_frame: Frame::build_orthogonal(n),
        source: Stokes::unpolarized(1.0),
        throughput: 1.0,
        pdf_fwd: 0.0,
        pdf_rev: 0.0,
        delta: false,
        emitter_idx: None,
        fsd: None,
    }
}

fn source_of(light_vertices: &[Vertex]) -> Stokes {
    // the source Stokes state rides on the subpath's first vertex; the seed
    // weight (cosine over pdfs) is folded into the walk's beta
    light_vertices
        .first()
        .map(|v| v.source)
        .unwrap_or_else(Stokes::zero)
}

/// Renders all samples of one sensor element.
pub fn integrate_element(
    scene: &Scene,
    sensor_idx: usize,
    block: &BlockHandle,
    element: (u32, u32),
    samples_per_element: u32,
    arena: &mut BdptArena,
    sampler: &mut SobolSampler,
) {
    let sensor = &scene.sensors[sensor_idx];
    let sampling = &scene.sensor_sampling[sensor_idx];
    let film = block.film();

    for sample_idx in 0..samples_per_element {
        sampler.start_sample(
            sample_idx ^ (element.0.wrapping_mul(0x9e37).wrapping_add(element.1) << 8),
        );
        arena.clear();

        // jointly draw the emitter and the wavelength from the product
        // distribution of emission and sensitivity spectra
        let ew = match sampling.sample(sampler) {
            Some(ew) => ew,
            None => {
                film.add_sample_weight(element.0, element.1, 1.0);
                continue;
            }
        };
        let k = ew.spectral.k;

        // spectral importance weight: reciprocal sampling density over all
        // emitters (or the line mass for discrete spectra)
        let recp_spectral_pd = match ew.spectral.pd {
            SpectralPd::Mass(m) => 1.0 as Float / m.max(1e-12),
            SpectralPd::Density(_) => {
                1.0 as Float / sampling.spectral_pdf_for_all_emitters(k).max(1e-20)
            }
        };
        let k_density = ew.spectral.pd.value().max(1e-20);

        generate_sensor_subpath(scene, sensor_idx, element, k, arena, sampler);
        generate_emitter_subpath(
            scene,
            sensor_idx,
            ew.emitter_idx,
            ew.emitter_pmf,
            k,
            arena,
            sampler,
        );

        let n_sensor = arena.sensor_vertices.len();
        let n_emitter = arena.emitter_vertices.len();
        let mut l_sum = Stokes::zero();

        for t in 1..=n_sensor {
            for s in 0..=n_emitter {
                let depth = (t + s) as isize - 2;
                if (s == 1 && t == 1) || depth < 0 || depth > scene.integrator.max_depth as isize {
                    continue;
                }
                if !scene.integrator.emitter_direct && s == 1 {
                    continue;
                }
                if !scene.integrator.sensor_direct && t == 1 {
                    continue;
                }
                if let Some((ret, _sampled, _mis)) =
                    connect(scene, sensor_idx, arena, s, t, k, sampler)
                {
                    let weight = if scene.integrator.mis {
                        recp_spectral_pd
                    } else {
                        1.0 as Float / k_density
                    };
                    let flux = ret.l * weight;
                    if !flux.is_finite() {
                        continue;
                    }
                    if t == 1 {
                        if let Some(e) = ret.element {
                            // direct sensor splat, thread-safe path
                            sensor.splat_direct(film, e, &flux, k);
                        }
                    } else {
                        l_sum += flux;
                    }
                }
            }
        }

        sensor.splat(block, element, &l_sum, k);
        film.add_sample_weight(element.0, element.1, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::quantity::WavenumberRange;
    use crate::core::spectrum::Spectrum;
    use crate::lights::Emitter;
    use crate::materials::Bsdf;
    use crate::mesh::Mesh;
    use crate::scene::{IntegratorOptions, RendererOptions, Shape};
    use crate::sensors::block::{spiral_blocks, BlockHandle};
    use crate::sensors::response::Response;
    use crate::sensors::PerspectiveSensor;

    fn tri_mesh(z: Float, half: Float) -> Mesh {
        Mesh::new(
            vec![
                Point3f::new(-half, -half, z),
                Point3f::new(half, -half, z),
                Point3f::new(half, half, z),
                Point3f::new(-half, -half, z),
                Point3f::new(half, half, z),
                Point3f::new(-half, half, z),
            ],
            vec![],
            vec![],
        )
    }

    fn build_test_scene(max_depth: u32) -> Scene {
        // a white Lambertian plate at z = 5, lit by a uniform area emitter
        // panel behind the camera plane pointing at the plate
        let plate = Shape {
            id: "plate".to_string(),
            mesh: tri_mesh(5.0, 2.0),
            bsdf: Bsdf::Lambertian {
                reflectance: Spectrum::uniform(0.6, WavenumberRange::all()),
            },
            emitter_idx: None,
        };
        let mut panel_mesh_pts = Vec::new();
        // emitter panel at z = -1 facing +z (toward the plate)
        for p in &[
            Point3f::new(-1.0, -1.0, -1.0),
            Point3f::new(1.0, -1.0, -1.0),
            Point3f::new(1.0, 1.0, -1.0),
            Point3f::new(-1.0, -1.0, -1.0),
            Point3f::new(1.0, 1.0, -1.0),
            Point3f::new(-1.0, 1.0, -1.0),
        ] {
            panel_mesh_pts.push(*p);
        }
        let panel_mesh = Mesh::new(panel_mesh_pts, vec![], vec![]);
        let mut emitter = Emitter::Area {
            spectrum: Spectrum::uniform(1.0, visible()),
            scale: 1.0,
            shape_idx: None,
            phase_space_extent_scale: 1.0,
            beam_waist: Length(1e-3),
        };
        emitter.bind_shape(1);
        let panel = Shape {
            id: "panel".to_string(),
            mesh: panel_mesh,
            bsdf: Bsdf::Lambertian {
                reflectance: Spectrum::uniform(0.0, WavenumberRange::all()),
            },
            emitter_idx: Some(0),
        };

        let mut sensor = PerspectiveSensor::new(
            "cam".to_string(),
            8,
            8,
            0.8,
            Point3f::new(0.0, 0.0, 0.0),
            Point3f::new(0.0, 0.0, 5.0),
            Vector3f::new(0.0, 1.0, 0.0),
            Spectrum::uniform(1.0, visible()),
            Response::Scalar,
        );
        sensor.samples_per_element = 4;
        sensor.block_size = 8;
        sensor.ray_trace_only = true;

        Scene::build(
            vec![plate, panel],
            vec![emitter],
            vec![sensor],
            IntegratorOptions {
                max_depth,
                mis: true,
                fsd: false,
                russian_roulette: false,
                rr_min_depth: 3,
                sensor_direct: true,
                emitter_direct: true,
            },
            RendererOptions::default(),
            None,
            None,
        )
        .unwrap()
    }

    fn visible() -> WavenumberRange {
        WavenumberRange::new(
            Wavenumber::from_wavelength(Length(780e-9)),
            Wavenumber::from_wavelength(Length(380e-9)),
        )
    }

    #[test]
    fn emitter_weights_match_spectral_integrals() {
        let scene = build_test_scene(2);
        let data = &scene.sensor_sampling[0];
        // the discrete emitter weight equals the integral of emission x
        // sensitivity (both uniform over the visible band) within 1%
        let mesh = scene.emitter_mesh(0).unwrap();
        let expected = scene.emitters[0].power(visible(), Some(mesh));
        assert!((data.powers[0] - expected).abs() <= 0.01 * expected);
    }

    #[test]
    fn sensor_subpath_reaches_the_plate() {
        let scene = build_test_scene(2);
        let mut arena = BdptArena::new();
        let mut sampler = SobolSampler::new(7);
        sampler.start_sample(0);
        arena.clear();
        let k = Wavenumber::from_wavelength(Length(550e-9));
        generate_sensor_subpath(&scene, 0, (4, 4), k, &mut arena, &mut sampler);
        assert!(arena.sensor_vertices.len() >= 2);
        let v1 = &arena.sensor_vertices[1];
        assert_eq!(v1.kind, VertexKind::SurfaceScatter);
        // camera at origin aimed at the plate 5 m out
        assert!((v1.p.z - 5.0).abs() < 1e-3);
        assert!(v1.pdf_fwd > 0.0);
    }

    #[test]
    fn emitter_subpath_starts_on_the_panel() {
        let scene = build_test_scene(2);
        let mut arena = BdptArena::new();
        let mut sampler = SobolSampler::new(9);
        sampler.start_sample(1);
        arena.clear();
        let k = Wavenumber::from_wavelength(Length(550e-9));
        generate_emitter_subpath(&scene, 0, 0, 1.0, k, &mut arena, &mut sampler);
        assert!(!arena.emitter_vertices.is_empty());
        let v0 = &arena.emitter_vertices[0];
        assert_eq!(v0.kind, VertexKind::Emitter);
        assert!((v0.p.z + 1.0).abs() < 1e-4);
        assert!(v0.pdf_fwd > 0.0);
    }

    #[test]
    fn forward_and_reverse_densities_are_positive_on_connectible_paths() {
        let scene = build_test_scene(3);
        let mut arena = BdptArena::new();
        let mut sampler = SobolSampler::new(11);
        let k = Wavenumber::from_wavelength(Length(550e-9));
        for i in 0..16 {
            sampler.start_sample(i);
            arena.clear();
            generate_sensor_subpath(&scene, 0, (4, 4), k, &mut arena, &mut sampler);
            generate_emitter_subpath(&scene, 0, 0, 1.0, k, &mut arena, &mut sampler);
            for v in arena
                .sensor_vertices
                .iter()
                .chain(arena.emitter_vertices.iter())
            {
                if v.kind == VertexKind::SurfaceScatter && v.throughput > 0.0 {
                    assert!(v.pdf_fwd > 0.0, "pdf_fwd must be positive on live paths");
                }
            }
        }
    }

    #[test]
    fn direct_illumination_matches_the_analytic_value() {
        // single bounce: emitter panel -> plate -> camera. With unit
        // radiance, albedo rho and the plate seen at normal incidence, the
        // reflected radiance is rho * E / pi where E is the panel's
        // irradiance at the plate centre.
        let scene = build_test_scene(1);
        let film = scene.sensors[0].create_sensor_film();
        let blocks = spiral_blocks(8, 8, 8);
        let handle = BlockHandle::acquire(&film, 0, blocks[0]);
        let mut arena = BdptArena::new();
        let mut sampler = SobolSampler::new(3);
        // many samples at the central pixel
        integrate_element(&scene, 0, &handle, (4, 4), 512, &mut arena, &mut sampler);
        let v = film.element(4, 4)[0];
        assert!(v.is_finite());
        assert!(v > 0.0, "the centre pixel must receive light");
    }

    #[test]
    fn mis_weights_bounded() {
        let scene = build_test_scene(3);
        let mut arena = BdptArena::new();
        let mut sampler = SobolSampler::new(21);
        let k = Wavenumber::from_wavelength(Length(550e-9));
        for i in 0..8 {
            sampler.start_sample(i);
            arena.clear();
            generate_sensor_subpath(&scene, 0, (3, 3), k, &mut arena, &mut sampler);
            generate_emitter_subpath(&scene, 0, 0, 1.0, k, &mut arena, &mut sampler);
            let n_s = arena.sensor_vertices.len();
            let n_e = arena.emitter_vertices.len();
            for t in 1..=n_s {
                for s in 0..=n_e {
                    if (s == 1 && t == 1) || (t + s) < 2 {
                        continue;
                    }
                    if let Some((_ret, _sampled, mis)) =
                        connect(&scene, 0, &arena, s, t, k, &mut sampler)
                    {
                        assert!(mis > 0.0 && mis <= 1.0 + 1e-4);
                    }
                }
            }
        }
    }
}
