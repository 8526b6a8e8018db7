//! PLY mesh import.

// std
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
// others
use ply_rs::parser::Parser;
use ply_rs::ply::{DefaultElement, Property};
// wavert
use crate::core::geometry::{Point3f, Vector3f};
use crate::core::quantity::Float;
use crate::mesh::Mesh;
use crate::scene::SceneBuildError;

fn prop_float(el: &DefaultElement, name: &str) -> Option<Float> {
    match el.get(name) {
        Some(Property::Float(v)) => Some(*v),
        Some(Property::Double(v)) => Some(*v as Float),
        _ => None,
    }
}

fn prop_index_list(el: &DefaultElement, name: &str) -> Option<Vec<usize>> {
    match el.get(name) {
        Some(Property::ListInt(v)) => Some(v.iter().map(|i| *i as usize).collect()),
        Some(Property::ListUInt(v)) => Some(v.iter().map(|i| *i as usize).collect()),
        Some(Property::ListUChar(v)) => Some(v.iter().map(|i| *i as usize).collect()),
        Some(Property::ListUShort(v)) => Some(v.iter().map(|i| *i as usize).collect()),
        _ => None,
    }
}

/// Loads a PLY file, triangulating polygonal faces as a fan and applying
/// the import position scale.
pub fn load_ply(path: &Path, scale: Float) -> Result<Mesh, SceneBuildError> {
    let err = |what: String| SceneBuildError::MeshImport { what };
    let file = File::open(path).map_err(|e| err(format!("{}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let parser = Parser::<DefaultElement>::new();
    let ply = parser
        .read_ply(&mut reader)
        .map_err(|e| err(format!("{}: {}", path.display(), e)))?;

    let vertices = ply
        .payload
        .get("vertex")
        .ok_or_else(|| err(format!("{}: no vertex element", path.display())))?;
    let faces = ply
        .payload
        .get("face")
        .ok_or_else(|| err(format!("{}: no face element", path.display())))?;

    let mut positions: Vec<Point3f> = Vec::with_capacity(vertices.len());
    let mut normals: Vec<Vector3f> = Vec::with_capacity(vertices.len());
    let mut has_normals = true;
    for v in vertices {
        let p = match (prop_float(v, "x"), prop_float(v, "y"), prop_float(v, "z")) {
            (Some(x), Some(y), Some(z)) => Point3f::new(x * scale, y * scale, z * scale),
            _ => return Err(err(format!("{}: vertex missing x/y/z", path.display()))),
        };
        positions.push(p);
        match (prop_float(v, "nx"), prop_float(v, "ny"), prop_float(v, "nz")) {
            (Some(x), Some(y), Some(z)) => normals.push(Vector3f::new(x, y, z)),
            _ => has_normals = false,
        }
    }

    let mut indices: Vec<[u32; 3]> = Vec::with_capacity(faces.len());
    for f in faces {
        let list = prop_index_list(f, "vertex_indices")
            .or_else(|| prop_index_list(f, "vertex_index"))
            .ok_or_else(|| err(format!("{}: face without indices", path.display())))?;
        if list.len() < 3 {
            continue;
        }
        for i in 1..list.len() - 1 {
            let tri = [list[0], list[i], list[i + 1]];
            if tri.iter().any(|&v| v >= positions.len()) {
                return Err(err(format!("{}: face index out of range", path.display())));
            }
            indices.push([tri[0] as u32, tri[1] as u32, tri[2] as u32]);
        }
    }
    if indices.is_empty() {
        return Err(err(format!("{}: no faces", path.display())));
    }

    let normals = if has_normals { normals } else { vec![] };
    Ok(Mesh::from_indexed(positions, normals, vec![], indices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_ascii_ply_triangle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tri.ply");
        let mut f = File::create(&path).unwrap();
        write!(
            f,
            "ply\nformat ascii 1.0\nelement vertex 3\n\
             property float x\nproperty float y\nproperty float z\n\
             element face 1\nproperty list uchar int vertex_indices\n\
             end_header\n0 0 0\n1 0 0\n0 1 0\n3 0 1 2\n"
        )
        .unwrap();
        drop(f);

        let mesh = load_ply(&path, 1.0).unwrap();
        assert_eq!(mesh.triangle_count(), 1);
        assert!((mesh.area().0 - 0.5).abs() < 1e-6);
    }
}
