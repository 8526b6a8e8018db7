//! Scene aggregation: shapes, emitters, sensors, the ADS and per-sensor
//! spectral sampling data.

pub mod expr;
pub mod loader;

// std
use std::sync::Arc;
// others
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
// wavert
use crate::accelerators::bvh::make_triangle;
use crate::accelerators::bvh8w::{BuildOpts, ProgressCallback};
use crate::accelerators::{AdsBuildError, Bvh8w, Idx, Triangle};
use crate::core::frame::Frame;
use crate::core::geometry::{Point3f, Vector2f};
use crate::core::quantity::{Float, Length, Wavenumber, WavenumberRange};
use crate::core::sampling::{product_distribution, Distribution1D, PiecewiseLinearDistribution};
use crate::core::spectrum::{SpectralPd, SpectralSample, Spectrum};
use crate::interaction::intersection::{IntersectionFootprint, IntersectionSurface};
use crate::lights::Emitter;
use crate::materials::Bsdf;
use crate::mesh::Mesh;
use crate::samplers::Sampler;
use crate::sensors::PerspectiveSensor;
use crate::stats::StatsSink;

#[derive(Debug, Error)]
pub enum SceneBuildError {
    #[error("ADS construction failed: {0}")]
    Ads(#[from] AdsBuildError),
    #[error("scene defines no emitters")]
    NoEmitters,
    #[error("scene defines no sensors")]
    NoSensors,
    #[error("mesh import failed: {what}")]
    MeshImport { what: String },
    #[error("scene loader: {msg} (line {line})")]
    Loader { msg: String, line: usize },
    #[error("sensor <{sensor}>: no overlap between emitter spectra and sensitivity spectrum")]
    NoSpectralOverlap { sensor: String },
}

/// A scene shape: a mesh with a BSDF and an optional bound area emitter.
pub struct Shape {
    pub id: String,
    pub mesh: Mesh,
    pub bsdf: Bsdf,
    pub emitter_idx: Option<u32>,
}

/// Renderer options recognized by the core.
#[derive(Debug, Clone, Serialize)]
pub struct RendererOptions {
    pub block_size: u32,
    pub force_ray_tracing: bool,
    pub default_scale_for_imported_mesh_positions: Float,
    pub additional_ads_stats: bool,
    pub ads_detect_edges: bool,
    pub ads_accumulate_edges: bool,
    pub ads_accumulate_triangles: bool,
    pub ads_z_search_range_scale: Float,
}

impl Default for RendererOptions {
    fn default() -> Self {
        RendererOptions {
            block_size: 32,
            force_ray_tracing: false,
            default_scale_for_imported_mesh_positions: 1.0,
            additional_ads_stats: false,
            ads_detect_edges: true,
            ads_accumulate_edges: false,
            ads_accumulate_triangles: false,
            ads_z_search_range_scale: 1.0,
        }
    }
}

/// Options of the bidirectional integrator.
#[derive(Debug, Clone, Serialize)]
pub struct IntegratorOptions {
    pub max_depth: u32,
    pub mis: bool,
    pub fsd: bool,
    pub russian_roulette: bool,
    pub rr_min_depth: u32,
    pub sensor_direct: bool,
    pub emitter_direct: bool,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        IntegratorOptions {
            max_depth: 6,
            mis: true,
            fsd: true,
            russian_roulette: true,
            rr_min_depth: 3,
            sensor_direct: true,
            emitter_direct: true,
        }
    }
}

/// The per-emitter product of emission and sensitivity spectra.
pub enum ProductSpectrum {
    Continuous(PiecewiseLinearDistribution),
    Lines { ks: Vec<Float>, masses: Vec<Float> },
    Empty,
}

/// Per-sensor emitter/wavelength joint sampling data, precomputed at scene
/// build.
pub struct EmitterSamplingData {
    pub products: Vec<ProductSpectrum>,
    pub powers: Vec<Float>,
    pub emitter_distribution: Distribution1D,
    pub total_power: Float,
}

pub struct EmitterWavenumberSample {
    pub emitter_idx: usize,
    pub emitter_pmf: Float,
    pub spectral: SpectralSample,
}

impl EmitterSamplingData {
    fn build(
        sensor: &PerspectiveSensor,
        emitters: &[Emitter],
        shapes: &[Shape],
    ) -> Result<EmitterSamplingData, SceneBuildError> {
        let sensitivity = sensor.sensitivity_spectrum();
        let mut sensitivity_range = sensitivity.wavenumber_range();
        if sensitivity_range.length().0 == 0.0 {
            // slightly enlarge a discrete sensitivity range, only used for
            // integrating emission spectra
            let eps = sensitivity_range.centre() * 1e-6;
            sensitivity_range =
                WavenumberRange::new(sensitivity_range.min - eps, sensitivity_range.max + eps);
        }

        let mut products: Vec<ProductSpectrum> = Vec::with_capacity(emitters.len());
        let mut powers: Vec<Float> = Vec::with_capacity(emitters.len());
        for e in emitters {
            let mesh = e
                .shape_idx()
                .map(|s| &shapes[s as usize].mesh);
            let emitter_power = e.power(WavenumberRange::all(), mesh);
            if !emitter_power.is_finite() || emitter_power == 0.0 {
                warn!("emitter with 0 or non-finite emission power");
                products.push(ProductSpectrum::Empty);
                powers.push(0.0);
                continue;
            }

            match e.emission_spectrum() {
                Spectrum::Lines { ks, masses } => {
                    // discrete lines weighted by the sensitivity values
                    let masses: Vec<Float> = ks
                        .iter()
                        .zip(masses.iter())
                        .map(|(k, m)| m * sensitivity.value(Wavenumber(*k)))
                        .collect();
                    let power: Float =
                        masses.iter().sum::<Float>() * e.power(WavenumberRange::all(), mesh)
                            / e.emission_spectrum().total_power().max(1e-20);
                    powers.push(power.max(0.0));
                    products.push(ProductSpectrum::Lines {
                        ks: ks.clone(),
                        masses,
                    });
                }
                emission => {
                    let edist = emission.distribution(sensitivity_range);
                    let sdist = sensitivity.distribution(sensitivity_range);
                    match (edist, sdist) {
                        (Some(ed), Some(sd)) => match product_distribution(&sd, &ed) {
                            Some(prod) => {
                                // the scalar emitter weight is the integral
                                // of emission x sensitivity, scaled to power
                                let scale = e.power(WavenumberRange::all(), mesh)
                                    / emission.total_power().max(1e-20);
                                powers.push(prod.integral() * scale);
                                products.push(ProductSpectrum::Continuous(prod));
                            }
                            None => {
                                products.push(ProductSpectrum::Empty);
                                powers.push(0.0);
                            }
                        },
                        _ => {
                            products.push(ProductSpectrum::Empty);
                            powers.push(0.0);
                        }
                    }
                }
            }
        }

        let total_power: Float = powers.iter().sum();
        if total_power <= 0.0 {
            return Err(SceneBuildError::NoSpectralOverlap {
                sensor: sensor.id.clone(),
            });
        }
        Ok(EmitterSamplingData {
            emitter_distribution: Distribution1D::new(powers.clone()),
            products,
            powers,
            total_power,
        })
    }

    /// Jointly samples an emitter and a wavenumber from the product
    /// distribution of emission and sensitivity spectra.
    pub fn sample(&self, sampler: &mut dyn Sampler) -> Option<EmitterWavenumberSample> {
        let mut pmf: Float = 0.0;
        let idx = self
            .emitter_distribution
            .sample_discrete(sampler.r(), Some(&mut pmf));
        if pmf <= 0.0 {
            return None;
        }
        let spectral = match &self.products[idx] {
            ProductSpectrum::Continuous(d) => {
                let (k, pdf) = d.sample(sampler.r());
                SpectralSample {
                    k: Wavenumber(k),
                    pd: SpectralPd::Density(pdf),
                }
            }
            ProductSpectrum::Lines { ks, masses } => {
                let total: Float = masses.iter().sum();
                if total <= 0.0 {
                    return None;
                }
                let (pmass, i) =
                    crate::samplers::sample_discrete(sampler.r(), ks.len(), |i| masses[i]);
                SpectralSample {
                    k: Wavenumber(ks[i]),
                    pd: SpectralPd::Mass(pmass),
                }
            }
            ProductSpectrum::Empty => return None,
        };
        Some(EmitterWavenumberSample {
            emitter_idx: idx,
            emitter_pmf: pmf,
            spectral,
        })
    }

    /// Sum over all emitters of the probability density of drawing `k`,
    /// weighted by emitter selection probability.
    pub fn spectral_pdf_for_all_emitters(&self, k: Wavenumber) -> Float {
        let mut pdf: Float = 0.0;
        for (i, prod) in self.products.iter().enumerate() {
            let pmf = self.emitter_distribution.discrete_pdf(i);
            if pmf <= 0.0 {
                continue;
            }
            if let ProductSpectrum::Continuous(d) = prod {
                pdf += pmf * d.pdf(k.0);
            }
        }
        pdf
    }
}

/// An immutable scene: shapes, emitters, sensors, the ADS, and the
/// integrator/renderer options. Integrators borrow it read-only.
pub struct Scene {
    pub shapes: Vec<Shape>,
    pub emitters: Vec<Emitter>,
    pub sensors: Vec<PerspectiveSensor>,
    pub ads: Bvh8w,
    pub integrator: IntegratorOptions,
    pub options: RendererOptions,
    pub sensor_sampling: Vec<EmitterSamplingData>,
    pub world_centre: Point3f,
    pub world_radius: Length,
}

impl Scene {
    /// Builds the scene: flattens shape triangles, constructs the ADS,
    /// binds world-dependent emitters and precomputes per-sensor emitter
    /// sampling data.
    pub fn build(
        shapes: Vec<Shape>,
        mut emitters: Vec<Emitter>,
        sensors: Vec<PerspectiveSensor>,
        integrator: IntegratorOptions,
        options: RendererOptions,
        stats: Option<Arc<dyn StatsSink>>,
        progress: Option<ProgressCallback>,
    ) -> Result<Scene, SceneBuildError> {
        if emitters.is_empty() {
            return Err(SceneBuildError::NoEmitters);
        }
        if sensors.is_empty() {
            return Err(SceneBuildError::NoSensors);
        }

        // flatten all shape triangles with stable back-references
        let mut all_tris: Vec<Triangle> = Vec::new();
        for (shape_idx, shape) in shapes.iter().enumerate() {
            for tri in 0..shape.mesh.triangle_count() {
                let (a, b, c) = shape.mesh.tri_positions(tri);
                all_tris.push(make_triangle(a, b, c, shape_idx as u32, tri as u32));
            }
        }

        let mut ads = Bvh8w::build(all_tris, &BuildOpts::default(), progress)?;
        if let Some(sink) = stats {
            ads.set_stats_sink(sink, options.additional_ads_stats);
        }

        // bind the scene bounding sphere into directional emitters
        let world = *ads.world();
        let world_centre = world.centroid();
        let world_radius = Length(0.5 * world.diagonal().length());
        for e in emitters.iter_mut() {
            e.bind_world(world_centre, world_radius.max(Length(1.0)));
        }

        let sensor_sampling = sensors
            .iter()
            .map(|s| EmitterSamplingData::build(s, &emitters, &shapes))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Scene {
            shapes,
            emitters,
            sensors,
            ads,
            integrator,
            options,
            sensor_sampling,
            world_centre,
            world_radius,
        })
    }

    /// The ADS intersect options configured for this scene.
    pub fn ads_intersect_opts(&self) -> crate::accelerators::IntersectOpts {
        crate::accelerators::IntersectOpts {
            detect_edges: self.options.ads_detect_edges,
            accumulate_edges: self.options.ads_accumulate_edges,
            accumulate_triangles: self.options.ads_accumulate_triangles,
            z_search_range_scale: self.options.ads_z_search_range_scale,
        }
    }

    pub fn emitter_mesh(&self, emitter_idx: usize) -> Option<&Mesh> {
        self.emitters[emitter_idx]
            .shape_idx()
            .map(|s| &self.shapes[s as usize].mesh)
    }

    /// The area emitter bound to a shape, if any.
    pub fn emitter_for_shape(&self, shape_idx: u32) -> Option<usize> {
        self.shapes[shape_idx as usize].emitter_idx.map(|e| e as usize)
    }

    /// Builds the surface intersection record for an ADS triangle hit.
    pub fn make_surface(
        &self,
        tuid: Idx,
        b1: Float,
        b2: Float,
        wp: Point3f,
        footprint: IntersectionFootprint,
    ) -> IntersectionSurface {
        let tri = self.ads.tri(tuid);
        let shape = &self.shapes[tri.shape_idx as usize];
        let mesh_tri = tri.shape_tri_idx as usize;
        let geo_n = shape.mesh.frames[mesh_tri].geo_n;
        let dpdu = shape.mesh.frames[mesh_tri].dpdu;
        let shading_n = shape.mesh.shading_normal(mesh_tri, b1, b2);
        IntersectionSurface {
            wp,
            uv: shape.mesh.uv(mesh_tri, b1, b2),
            b1,
            b2,
            footprint,
            shape_idx: tri.shape_idx,
            mesh_tri_idx: tri.shape_tri_idx,
            geo: Frame::build_orthogonal(geo_n),
            shading: Frame::build_shading(shading_n, &dpdu),
        }
    }

    /// Scene description for introspection.
    pub fn description(&self) -> serde_json::Value {
        serde_json::json!({
            "shapes": self.shapes.iter().map(|s| serde_json::json!({
                "id": s.id,
                "triangles": s.mesh.triangle_count(),
                "area": s.mesh.area().0,
                "emitter": s.emitter_idx,
            })).collect::<Vec<_>>(),
            "emitters": self.emitters.len(),
            "sensors": self.sensors.iter().map(|s| serde_json::json!({
                "id": s.id,
                "resolution": [s.resolution().0, s.resolution().1],
                "spe": s.samples_per_element,
            })).collect::<Vec<_>>(),
            "ads": {
                "triangles": self.ads.triangles_count(),
                "nodes": self.ads.nodes_count(),
                "edges": self.ads.edges_count(),
                "sah_cost": self.ads.sah_cost(),
                "occupancy": self.ads.occupancy(),
                "max_depth": self.ads.max_depth(),
            },
            "integrator": &self.integrator,
            "options": &self.options,
        })
    }
}

/// Default footprint for a ray-tracing hit: degenerate (zero-size).
pub fn degenerate_footprint() -> IntersectionFootprint {
    IntersectionFootprint {
        x: Vector2f { x: 1.0, y: 0.0 },
        la: Length::ZERO,
        lb: Length::ZERO,
    }
}
