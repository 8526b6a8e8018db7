//! Wavefront OBJ import.

// std
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
// others
use tracing::warn;
// wavert
use crate::core::geometry::{Point2f, Point3f, Vector3f};
use crate::core::quantity::Float;
use crate::mesh::Mesh;
use crate::scene::SceneBuildError;

struct FaceVertex {
    p: usize,
    t: Option<usize>,
    n: Option<usize>,
}

fn parse_face_vertex(token: &str, line_no: usize) -> Result<FaceVertex, SceneBuildError> {
    let mut it = token.split('/');
    let perr = |what: &str| SceneBuildError::MeshImport {
        what: format!("line {}: bad {} index '{}'", line_no, what, token),
    };
    let p = it
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| perr("position"))?;
    let t = match it.next() {
        None | Some("") => None,
        Some(s) => Some(s.parse::<i64>().map_err(|_| perr("texcoord"))?),
    };
    let n = match it.next() {
        None | Some("") => None,
        Some(s) => Some(s.parse::<i64>().map_err(|_| perr("normal"))?),
    };
    // OBJ indices are 1-based; negative indices are not supported here
    let fix = |i: i64| (i - 1).max(0) as usize;
    Ok(FaceVertex {
        p: fix(p),
        t: t.map(fix),
        n: n.map(fix),
    })
}

/// Loads an OBJ file, triangulating polygonal faces as a fan and applying
/// the import position scale.
pub fn load_obj(path: &Path, scale: Float) -> Result<Mesh, SceneBuildError> {
    let file = File::open(path).map_err(|e| SceneBuildError::MeshImport {
        what: format!("{}: {}", path.display(), e),
    })?;
    let reader = BufReader::new(file);

    let mut positions: Vec<Point3f> = Vec::new();
    let mut normals: Vec<Vector3f> = Vec::new();
    let mut uvs: Vec<Point2f> = Vec::new();

    let mut soup_p: Vec<Point3f> = Vec::new();
    let mut soup_n: Vec<Vector3f> = Vec::new();
    let mut soup_t: Vec<Point2f> = Vec::new();
    let mut any_missing_n = false;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| SceneBuildError::MeshImport {
            what: format!("{}: {}", path.display(), e),
        })?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let tag = tokens.next().unwrap();
        let floats = |tokens: std::str::SplitWhitespace, n: usize| -> Option<Vec<Float>> {
            let v: Vec<Float> = tokens.filter_map(|t| t.parse::<Float>().ok()).collect();
            if v.len() >= n {
                Some(v)
            } else {
                None
            }
        };
        match tag {
            "v" => {
                if let Some(v) = floats(tokens, 3) {
                    positions.push(Point3f::new(v[0] * scale, v[1] * scale, v[2] * scale));
                }
            }
            "vn" => {
                if let Some(v) = floats(tokens, 3) {
                    normals.push(Vector3f::new(v[0], v[1], v[2]));
                }
            }
            "vt" => {
                if let Some(v) = floats(tokens, 2) {
                    uvs.push(Point2f { x: v[0], y: v[1] });
                }
            }
            "f" => {
                let verts: Vec<FaceVertex> = tokens
                    .map(|t| parse_face_vertex(t, line_no + 1))
                    .collect::<Result<_, _>>()?;
                if verts.len() < 3 {
                    warn!("{}: line {}: face with <3 vertices", path.display(), line_no + 1);
                    continue;
                }
                for i in 1..verts.len() - 1 {
                    for fv in &[&verts[0], &verts[i], &verts[i + 1]] {
                        if fv.p >= positions.len() {
                            return Err(SceneBuildError::MeshImport {
                                what: format!(
                                    "{}: line {}: position index out of range",
                                    path.display(),
                                    line_no + 1
                                ),
                            });
                        }
                        soup_p.push(positions[fv.p]);
                        match fv.n {
                            Some(ni) if ni < normals.len() => soup_n.push(normals[ni]),
                            _ => {
                                any_missing_n = true;
                                soup_n.push(Vector3f::default());
                            }
                        }
                        match fv.t {
                            Some(ti) if ti < uvs.len() => soup_t.push(uvs[ti]),
                            _ => soup_t.push(Point2f::default()),
                        }
                    }
                }
            }
            // groups, materials and smoothing groups are ignored
            "g" | "o" | "s" | "usemtl" | "mtllib" => {}
            other => {
                warn!(
                    "{}: line {}: unknown OBJ tag '{}'",
                    path.display(),
                    line_no + 1,
                    other
                );
            }
        }
    }

    if soup_p.is_empty() {
        return Err(SceneBuildError::MeshImport {
            what: format!("{}: no faces", path.display()),
        });
    }

    let n = if any_missing_n { vec![] } else { soup_n };
    let t = if uvs.is_empty() { vec![] } else { soup_t };
    Ok(Mesh::new(soup_p, n, t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_a_quad() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quad.obj");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "# quad").unwrap();
        writeln!(f, "v 0 0 0").unwrap();
        writeln!(f, "v 1 0 0").unwrap();
        writeln!(f, "v 1 1 0").unwrap();
        writeln!(f, "v 0 1 0").unwrap();
        writeln!(f, "f 1 2 3 4").unwrap();
        drop(f);

        let mesh = load_obj(&path, 1.0).unwrap();
        assert_eq!(mesh.triangle_count(), 2);
        assert!((mesh.area().0 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn applies_import_scale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tri.obj");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3").unwrap();
        drop(f);

        let mesh = load_obj(&path, 2.0).unwrap();
        assert!((mesh.area().0 - 2.0).abs() < 1e-6);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_obj(Path::new("/nonexistent/x.obj"), 1.0).is_err());
    }
}
