//! Scene file loading: a compact block DSL with `-D key=value` defines.

// std
use std::path::{Path, PathBuf};
// others
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser as PestParser;
use tracing::warn;
// wavert
use crate::core::geometry::Point3f;
use crate::core::quantity::{Float, Length, WavenumberRange, Wavenumber, PI};
use crate::core::spectrum::Spectrum;
use crate::interaction::surface_profile::SurfaceProfile;
use crate::lights::Emitter;
use crate::materials::Bsdf;
use crate::mesh::{obj, ply};
use crate::scene::expr::{Expr, Func};
use crate::scene::{IntegratorOptions, RendererOptions, SceneBuildError, Shape};
use crate::sensors::response::Response;
use crate::sensors::tonemap::{Colourmap, Tonemap, TonemapMode, TonemapOperator};
use crate::sensors::PerspectiveSensor;

#[derive(PestParser)]
#[grammar = "scene/scene.pest"]
struct SceneParser;

#[derive(Debug, Clone)]
pub enum Value {
    Str(String),
    Num(Float),
    Vec(Vec<Float>),
    Ident(String),
}

impl Value {
    fn as_num(&self) -> Option<Float> {
        match self {
            Value::Num(v) => Some(*v),
            _ => None,
        }
    }
    fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Ident(s) => Some(s),
            _ => None,
        }
    }
    fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Ident(s) => match s.as_str() {
                "true" | "on" => Some(true),
                "false" | "off" => Some(false),
                _ => None,
            },
            Value::Num(v) => Some(*v != 0.0),
            _ => None,
        }
    }
    fn as_vec(&self) -> Option<&[Float]> {
        match self {
            Value::Vec(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SceneNode {
    pub name: String,
    pub label: Option<String>,
    pub attributes: Vec<(String, Value, usize)>,
    pub children: Vec<SceneNode>,
    pub line: usize,
}

impl SceneNode {
    fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, v, _)| v)
    }
    fn num(&self, name: &str, default: Float) -> Float {
        self.attr(name).and_then(|v| v.as_num()).unwrap_or(default)
    }
    fn boolean(&self, name: &str, default: bool) -> bool {
        self.attr(name).and_then(|v| v.as_bool()).unwrap_or(default)
    }
    fn point(&self, name: &str, default: Point3f) -> Point3f {
        match self.attr(name).and_then(|v| v.as_vec()) {
            Some(v) if v.len() >= 3 => Point3f::new(v[0], v[1], v[2]),
            _ => default,
        }
    }
    fn child(&self, name: &str) -> Option<&SceneNode> {
        self.children.iter().find(|c| c.name == name)
    }
}

/// Substitutes `$key` defines into the raw scene text; returns the
/// substituted text and the list of unused defines.
pub fn apply_defines(text: &str, defines: &[(String, String)]) -> (String, Vec<String>) {
    let mut out = text.to_string();
    let mut unused = Vec::new();
    for (key, value) in defines {
        let pat = format!("${}", key);
        if out.contains(&pat) {
            out = out.replace(&pat, value);
        } else {
            unused.push(key.clone());
        }
    }
    (out, unused)
}

fn line_of(pair: &Pair<Rule>) -> usize {
    pair.as_span().start_pos().line_col().0
}

fn build_value(pair: Pair<Rule>) -> Value {
    let inner = pair.into_inner().next().unwrap();
    match inner.as_rule() {
        Rule::string => {
            let s = inner.as_str();
            Value::Str(s[1..s.len() - 1].to_string())
        }
        Rule::number => Value::Num(inner.as_str().parse().unwrap_or(0.0)),
        Rule::vector => Value::Vec(
            inner
                .into_inner()
                .map(|n| n.as_str().parse().unwrap_or(0.0))
                .collect(),
        ),
        Rule::ident => Value::Ident(inner.as_str().to_string()),
        _ => Value::Num(0.0),
    }
}

fn build_node(pair: Pair<Rule>) -> SceneNode {
    let line = line_of(&pair);
    let mut node = SceneNode {
        line,
        ..SceneNode::default()
    };
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::ident => node.name = p.as_str().to_string(),
            Rule::string => {
                let s = p.as_str();
                node.label = Some(s[1..s.len() - 1].to_string());
            }
            Rule::item => {
                let inner = p.into_inner().next().unwrap();
                match inner.as_rule() {
                    Rule::attribute => {
                        let aline = line_of(&inner);
                        let mut it = inner.into_inner();
                        let name = it.next().unwrap().as_str().to_string();
                        let value = build_value(it.next().unwrap());
                        node.attributes.push((name, value, aline));
                    }
                    Rule::node => node.children.push(build_node(inner)),
                    _ => {}
                }
            }
            _ => {}
        }
    }
    node
}

/// Parses the scene DSL into its node tree.
pub fn parse_nodes(text: &str) -> Result<Vec<SceneNode>, SceneBuildError> {
    let mut pairs = SceneParser::parse(Rule::scene_file, text).map_err(|e| {
        let line = match e.line_col {
            pest::error::LineColLocation::Pos((l, _)) => l,
            pest::error::LineColLocation::Span((l, _), _) => l,
        };
        SceneBuildError::Loader {
            msg: "syntax error".to_string(),
            line,
        }
    })?;
    let file = pairs.next().unwrap();
    Ok(file
        .into_inner()
        .filter(|p| p.as_rule() == Rule::node)
        .map(build_node)
        .collect())
}

fn build_expr(pair: Pair<Rule>) -> Expr {
    match pair.as_rule() {
        Rule::expr => {
            let mut it = pair.into_inner();
            let mut e = build_expr(it.next().unwrap());
            while let Some(op) = it.next() {
                let rhs = build_expr(it.next().unwrap());
                e = match op.as_str() {
                    "+" => Expr::Add(Box::new(e), Box::new(rhs)),
                    _ => Expr::Sub(Box::new(e), Box::new(rhs)),
                };
            }
            e
        }
        Rule::term => {
            let mut it = pair.into_inner();
            let mut e = build_expr(it.next().unwrap());
            while let Some(op) = it.next() {
                let rhs = build_expr(it.next().unwrap());
                e = match op.as_str() {
                    "*" => Expr::Mul(Box::new(e), Box::new(rhs)),
                    _ => Expr::Div(Box::new(e), Box::new(rhs)),
                };
            }
            e
        }
        Rule::pow_factor => {
            let mut it = pair.into_inner();
            let base = build_expr(it.next().unwrap());
            match it.next() {
                Some(exp) => Expr::Pow(Box::new(base), Box::new(build_expr(exp))),
                None => base,
            }
        }
        Rule::factor | Rule::paren => build_expr(pair.into_inner().next().unwrap()),
        Rule::neg => Expr::Neg(Box::new(build_expr(pair.into_inner().next().unwrap()))),
        Rule::var => Expr::Var,
        Rule::number => Expr::Num(pair.as_str().parse().unwrap_or(0.0)),
        Rule::func => {
            let mut it = pair.into_inner();
            let name = it.next().unwrap().as_str();
            let arg = build_expr(it.next().unwrap());
            let f = match name {
                "log" => Func::Log,
                "log10" => Func::Log10,
                "exp" => Func::Exp,
                "abs" => Func::Abs,
                _ => Func::Sqrt,
            };
            Expr::Call(f, Box::new(arg))
        }
        _ => Expr::Num(0.0),
    }
}

/// Parses a tonemap `function(expr)` expression over `x`.
pub fn parse_expr(text: &str) -> Result<Expr, SceneBuildError> {
    let mut pairs =
        SceneParser::parse(Rule::expr_input, text).map_err(|_| SceneBuildError::Loader {
            msg: format!("bad expression '{}'", text),
            line: 0,
        })?;
    let input = pairs.next().unwrap();
    let expr = input
        .into_inner()
        .find(|p| p.as_rule() == Rule::expr)
        .unwrap();
    Ok(build_expr(expr))
}

/// Parses a tonemap specification such as `linear`, `gamma(2.2)`,
/// `db(-60..0)` or `function(sqrt(x))`, with an optional mode.
pub fn parse_tonemap(spec: &str, channels: usize) -> Result<Tonemap, SceneBuildError> {
    let spec = spec.trim();
    let mut tm = Tonemap::default_for_channels(channels);
    let operator = if spec == "linear" {
        TonemapOperator::Linear
    } else if spec == "srgb" {
        TonemapOperator::Srgb
    } else if let Some(arg) = spec.strip_prefix("gamma(").and_then(|s| s.strip_suffix(')')) {
        TonemapOperator::Gamma(arg.parse().map_err(|_| SceneBuildError::Loader {
            msg: format!("bad gamma '{}'", arg),
            line: 0,
        })?)
    } else if let Some(arg) = spec.strip_prefix("db(").and_then(|s| s.strip_suffix(')')) {
        let mut it = arg.split("..");
        let min = it.next().and_then(|s| s.parse().ok());
        let max = it.next().and_then(|s| s.parse().ok());
        match (min, max) {
            (Some(min), Some(max)) => TonemapOperator::Db { min, max },
            _ => {
                return Err(SceneBuildError::Loader {
                    msg: format!("bad dB range '{}'", arg),
                    line: 0,
                })
            }
        }
    } else if let Some(arg) = spec
        .strip_prefix("function(")
        .and_then(|s| s.strip_suffix(')'))
    {
        TonemapOperator::Function(parse_expr(arg)?)
    } else {
        return Err(SceneBuildError::Loader {
            msg: format!("unknown tonemap '{}'", spec),
            line: 0,
        });
    };
    tm.operator = operator;
    Ok(tm)
}

/// Parses a tonemap mode: `select:N`, `normal` or `colourmap:NAME`.
pub fn parse_tonemap_mode(spec: &str) -> Result<TonemapMode, SceneBuildError> {
    if spec == "normal" {
        return Ok(TonemapMode::Normal);
    }
    if let Some(c) = spec.strip_prefix("select:") {
        return Ok(TonemapMode::Select(c.parse().unwrap_or(0)));
    }
    if let Some(name) = spec.strip_prefix("colourmap:") {
        return name
            .parse::<Colourmap>()
            .map(TonemapMode::Colourmap)
            .map_err(|_| SceneBuildError::Loader {
                msg: format!("unknown colourmap '{}'", name),
                line: 0,
            });
    }
    Err(SceneBuildError::Loader {
        msg: format!("unknown tonemap mode '{}'", spec),
        line: 0,
    })
}

fn visible_range() -> WavenumberRange {
    WavenumberRange::new(
        Wavenumber::from_wavelength(Length(780e-9)),
        Wavenumber::from_wavelength(Length(380e-9)),
    )
}

fn read_spectrum(node: &SceneNode) -> Spectrum {
    if let Some(v) = node.attr("spectrum_uniform").and_then(|v| v.as_vec()) {
        if v.len() >= 3 {
            // [min_nm max_nm value]
            return Spectrum::uniform(
                v[2],
                WavenumberRange::new(
                    Wavenumber::from_wavelength(Length(v[1] * 1e-9)),
                    Wavenumber::from_wavelength(Length(v[0] * 1e-9)),
                ),
            );
        }
    }
    if let Some(v) = node.attr("spectrum_line").and_then(|v| v.as_vec()) {
        if v.len() >= 2 {
            return Spectrum::line(Length(v[0] * 1e-9), v[1]);
        }
    }
    if let Some(v) = node.attr("spectrum_linear").and_then(|v| v.as_vec()) {
        if v.len() >= 4 && v.len() % 2 == 0 {
            let pairs = v
                .chunks(2)
                .map(|c| (Length(c[0] * 1e-9), c[1]))
                .collect();
            return Spectrum::from_wavelength_knots(pairs);
        }
    }
    Spectrum::uniform(1.0, visible_range())
}

fn read_bsdf(node: Option<&SceneNode>) -> Bsdf {
    let node = match node {
        Some(n) => n,
        None => {
            return Bsdf::Lambertian {
                reflectance: Spectrum::uniform(0.5, visible_range()),
            }
        }
    };
    let ty = node
        .attr("type")
        .and_then(|v| v.as_str())
        .unwrap_or("lambertian")
        .to_string();
    match ty.as_str() {
        "surface_spm" => {
            let sigma_h = node.num("roughness_rms", 0.0);
            let profile = if sigma_h > 0.0 {
                SurfaceProfile::Gaussian {
                    sigma_h: Length(sigma_h),
                    sigma_f: node.num("psd_width", 5e6),
                }
            } else {
                SurfaceProfile::Dirac
            };
            Bsdf::SurfaceSpm {
                n: node.num("ior", 1.5),
                kappa: node.num("kappa", 0.0),
                profile,
            }
        }
        "lambertian" => Bsdf::Lambertian {
            reflectance: Spectrum::uniform(node.num("reflectance", 0.5), visible_range()),
        },
        other => {
            warn!(line = node.line, "unknown BSDF type '{}', using lambertian", other);
            Bsdf::Lambertian {
                reflectance: Spectrum::uniform(0.5, visible_range()),
            }
        }
    }
}

fn read_emitter(node: &SceneNode) -> Emitter {
    let ty = node
        .attr("type")
        .and_then(|v| v.as_str())
        .unwrap_or("area")
        .to_string();
    let spectrum = read_spectrum(node);
    let scale = node.num("scale", 1.0);
    let ps_scale = node.num("phase_space_extent_scale", 1.0);
    let waist = Length(node.num("beam_waist", 1e-3));
    match ty.as_str() {
        "point" => Emitter::Point {
            spectrum,
            scale,
            position: node.point("position", Point3f::default()),
            phase_space_extent_scale: ps_scale,
            beam_waist: waist,
        },
        "directional" => {
            let d = node.point("direction", Point3f::new(0.0, 0.0, 1.0));
            Emitter::Directional {
                spectrum,
                scale,
                direction: crate::core::geometry::Dir3::new(d.to_vec()),
                phase_space_extent_scale: ps_scale,
                beam_waist: waist,
                world_centre: Point3f::default(),
                world_radius: Length(1.0),
            }
        }
        _ => Emitter::Area {
            spectrum,
            scale,
            shape_idx: None,
            phase_space_extent_scale: ps_scale,
            beam_waist: waist,
        },
    }
}

fn read_sensor(node: &SceneNode) -> PerspectiveSensor {
    let (w, h) = match node.attr("resolution").and_then(|v| v.as_vec()) {
        Some(v) if v.len() >= 2 => (v[0] as u32, v[1] as u32),
        _ => (128, 128),
    };
    let response = match node.attr("response").and_then(|v| v.as_str()) {
        Some("rgb") => Response::Rgb,
        _ => Response::Scalar,
    };
    let mut sensor = PerspectiveSensor::new(
        node.label.clone().unwrap_or_else(|| "sensor".to_string()),
        w,
        h,
        node.num("fov", 40.0) * PI / 180.0,
        node.point("position", Point3f::new(0.0, 0.0, -5.0)),
        node.point("target", Point3f::default()),
        node.point("up", Point3f::new(0.0, 1.0, 0.0)).to_vec(),
        read_spectrum(node),
        response,
    );
    sensor.samples_per_element = node.num("spe", 16.0) as u32;
    sensor.polarimetric = node.boolean("polarimetric", false);
    sensor.phase_space_extent_scale = node.num("phase_space_extent_scale", 1.0);
    sensor.beam_waist = Length(node.num("beam_waist", 1e-3));
    sensor.ray_trace_only = node.boolean("ray_trace", false);
    sensor
}

fn known_attributes(node_name: &str) -> &'static [&'static str] {
    match node_name {
        "renderer" => &[
            "block_size",
            "force_ray_tracing",
            "default_scale_for_imported_mesh_positions",
            "additional_ads_stats",
            "detect_edges",
            "accumulate_edges",
            "accumulate_triangles",
            "z_search_range_scale",
        ],
        "integrator" => &[
            "max_depth",
            "mis",
            "fsd",
            "russian_roulette",
            "rr_min_depth",
            "sensor_direct_sampling",
            "emitter_direct_sampling",
        ],
        _ => &[],
    }
}

/// The aggregate output of scene loading, before `Scene::build`.
pub struct LoadedScene {
    pub shapes: Vec<Shape>,
    pub emitters: Vec<Emitter>,
    pub sensors: Vec<PerspectiveSensor>,
    pub integrator: IntegratorOptions,
    pub options: RendererOptions,
}

/// Loads a scene description from text. `base_dir` anchors relative mesh
/// paths; defines are `$key` substitutions.
pub fn load_scene_text(
    text: &str,
    base_dir: &Path,
    defines: &[(String, String)],
) -> Result<LoadedScene, SceneBuildError> {
    let (text, unused) = apply_defines(text, defines);
    for key in unused {
        warn!("unused define '{}'", key);
    }
    let nodes = parse_nodes(&text)?;

    let mut options = RendererOptions::default();
    let mut integrator = IntegratorOptions::default();
    let mut shapes: Vec<Shape> = Vec::new();
    let mut emitters: Vec<Emitter> = Vec::new();
    let mut sensors: Vec<PerspectiveSensor> = Vec::new();

    for node in &nodes {
        // warn on unknown attributes in option blocks
        let known = known_attributes(&node.name);
        if !known.is_empty() {
            for (name, _, line) in &node.attributes {
                if !known.contains(&name.as_str()) {
                    warn!(line = *line, "unknown attribute '{}' in '{}'", name, node.name);
                }
            }
        }
        match node.name.as_str() {
            "renderer" => {
                options.block_size = node.num("block_size", 32.0) as u32;
                options.force_ray_tracing = node.boolean("force_ray_tracing", false);
                options.default_scale_for_imported_mesh_positions =
                    node.num("default_scale_for_imported_mesh_positions", 1.0);
                options.additional_ads_stats = node.boolean("additional_ads_stats", false);
                options.ads_detect_edges = node.boolean("detect_edges", true);
                options.ads_accumulate_edges = node.boolean("accumulate_edges", false);
                options.ads_accumulate_triangles = node.boolean("accumulate_triangles", false);
                options.ads_z_search_range_scale = node.num("z_search_range_scale", 1.0);
            }
            "integrator" => {
                integrator.max_depth = node.num("max_depth", 6.0) as u32;
                integrator.mis = node.boolean("mis", true);
                integrator.fsd = node.boolean("fsd", true);
                integrator.russian_roulette = node.boolean("russian_roulette", true);
                integrator.rr_min_depth = node.num("rr_min_depth", 3.0) as u32;
                integrator.sensor_direct = node.boolean("sensor_direct_sampling", true);
                integrator.emitter_direct = node.boolean("emitter_direct_sampling", true);
            }
            "sensor" => sensors.push(read_sensor(node)),
            "emitter" => emitters.push(read_emitter(node)),
            "shape" => {
                let scale = node.num(
                    "scale",
                    options.default_scale_for_imported_mesh_positions,
                );
                let mesh = if let Some(path) = node.attr("obj").and_then(|v| v.as_str()) {
                    obj::load_obj(&resolve(base_dir, path), scale)?
                } else if let Some(path) = node.attr("ply").and_then(|v| v.as_str()) {
                    ply::load_ply(&resolve(base_dir, path), scale)?
                } else if let Some(v) = node.attr("triangles").and_then(|v| v.as_vec()) {
                    // inline triangle soup: 9 numbers per triangle
                    if v.len() % 9 != 0 || v.is_empty() {
                        return Err(SceneBuildError::Loader {
                            msg: "inline 'triangles' must hold 9 numbers per triangle".into(),
                            line: node.line,
                        });
                    }
                    let soup: Vec<Point3f> = v
                        .chunks(3)
                        .map(|c| Point3f::new(c[0] * scale, c[1] * scale, c[2] * scale))
                        .collect();
                    crate::mesh::Mesh::new(soup, vec![], vec![])
                } else {
                    return Err(SceneBuildError::Loader {
                        msg: format!("shape '{}' has no mesh source", node.name),
                        line: node.line,
                    });
                };
                let bsdf = read_bsdf(node.child("bsdf"));
                let mut emitter_idx = None;
                if let Some(en) = node.child("emitter") {
                    // construct the area emitter first, then bind it to the
                    // shape
                    let mut e = read_emitter(en);
                    e.bind_shape(shapes.len() as u32);
                    emitter_idx = Some(emitters.len() as u32);
                    emitters.push(e);
                }
                shapes.push(Shape {
                    id: node
                        .label
                        .clone()
                        .unwrap_or_else(|| format!("shape_{}", shapes.len())),
                    mesh,
                    bsdf,
                    emitter_idx,
                });
            }
            other => {
                warn!(line = node.line, "unknown scene node '{}'", other);
            }
        }
    }

    Ok(LoadedScene {
        shapes,
        emitters,
        sensors,
        integrator,
        options,
    })
}

fn resolve(base: &Path, p: &str) -> PathBuf {
    let path = Path::new(p);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENE: &str = r#"
        # a minimal scene
        renderer {
            block_size = 16
            force_ray_tracing = false
        }
        integrator "bdpt" {
            max_depth = 4
            mis = true
        }
        sensor "cam" {
            resolution = [32 24]
            position = [0 0 -5]
            target = [0 0 0]
            fov = 45
            spe = $spe
        }
        emitter "lamp" {
            type = point
            position = [0 2 0]
            scale = 10
        }
        shape "tri" {
            triangles = [-1 -1 0  1 -1 0  0 1 0]
            bsdf { type = lambertian reflectance = 0.7 }
        }
    "#;

    #[test]
    fn parses_and_interprets_a_scene() {
        let defines = vec![("spe".to_string(), "8".to_string())];
        let loaded = load_scene_text(SCENE, Path::new("."), &defines).unwrap();
        assert_eq!(loaded.sensors.len(), 1);
        assert_eq!(loaded.emitters.len(), 1);
        assert_eq!(loaded.shapes.len(), 1);
        assert_eq!(loaded.options.block_size, 16);
        assert_eq!(loaded.integrator.max_depth, 4);
        assert_eq!(loaded.sensors[0].samples_per_element, 8);
        assert_eq!(loaded.sensors[0].resolution(), (32, 24));
        assert_eq!(loaded.shapes[0].mesh.triangle_count(), 1);
    }

    #[test]
    fn area_emitter_child_binds_to_its_shape() {
        let text = r#"
            shape "panel" {
                triangles = [0 0 0  1 0 0  0 1 0]
                emitter { scale = 5 }
            }
            sensor "c" { resolution = [8 8] }
            "#;
        let loaded = load_scene_text(text, Path::new("."), &[]).unwrap();
        assert_eq!(loaded.emitters.len(), 1);
        assert_eq!(loaded.emitters[0].shape_idx(), Some(0));
        assert_eq!(loaded.shapes[0].emitter_idx, Some(0));
    }

    #[test]
    fn syntax_errors_carry_line_numbers() {
        let bad = "renderer {\n  block_size = = 3\n}\n";
        match load_scene_text(bad, Path::new("."), &[]) {
            Err(SceneBuildError::Loader { line, .. }) => assert!(line >= 1),
            other => panic!("expected loader error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn expression_parser_handles_precedence() {
        let e = parse_expr("1 + 2 * x").unwrap();
        assert!((e.eval(3.0) - 7.0).abs() < 1e-6);
        let e = parse_expr("sqrt(x) ^ 2").unwrap();
        assert!((e.eval(9.0) - 9.0).abs() < 1e-4);
        let e = parse_expr("-x / 2").unwrap();
        assert!((e.eval(4.0) + 2.0).abs() < 1e-6);
    }

    #[test]
    fn tonemap_specs_parse() {
        assert!(matches!(
            parse_tonemap("gamma(2.2)", 1).unwrap().operator,
            TonemapOperator::Gamma(_)
        ));
        assert!(matches!(
            parse_tonemap("db(-60..0)", 1).unwrap().operator,
            TonemapOperator::Db { .. }
        ));
        let t = parse_tonemap("function(log10(x) / 3)", 1).unwrap();
        match t.operator {
            TonemapOperator::Function(e) => {
                assert!((e.eval(1000.0) - 1.0).abs() < 1e-5);
            }
            _ => panic!("expected function operator"),
        }
        assert!(parse_tonemap("bogus", 1).is_err());
        assert_eq!(
            parse_tonemap_mode("colourmap:viridis").unwrap(),
            TonemapMode::Colourmap(Colourmap::Viridis)
        );
    }
}
