//! Triangle mesh storage.

pub mod obj;
pub mod ply;

// std
use std::collections::HashMap;
// wavert
use crate::core::geometry::{Dir3, Point2f, Point3f, Vector3f};
use crate::core::quantity::{Area, Float};
use crate::core::sampling::{uniform_sample_triangle, Distribution1D};

/// Per-triangle geometric frame data.
#[derive(Debug, Copy, Clone)]
pub struct TriangleFrame {
    pub geo_n: Dir3,
    pub dpdu: Vector3f,
}

/// An indexed triangle mesh with deduplicated vertices.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub positions: Vec<Point3f>,
    /// Per-vertex shading normals; empty when the mesh is faceted.
    pub normals: Vec<Vector3f>,
    /// Per-vertex texture coordinates; empty when absent.
    pub uvs: Vec<Point2f>,
    pub indices: Vec<[u32; 3]>,
    pub frames: Vec<TriangleFrame>,
    area_distribution: Distribution1D,
    total_area: Area,
}

fn key_of(p: &Point3f) -> (u32, u32, u32) {
    (p.x.to_bits(), p.y.to_bits(), p.z.to_bits())
}

impl Mesh {
    /// Builds a mesh from per-face vertex data, deduplicating identical
    /// positions. `normals`/`uvs` are per input vertex and may be empty.
    pub fn new(
        soup_positions: Vec<Point3f>,
        soup_normals: Vec<Vector3f>,
        soup_uvs: Vec<Point2f>,
    ) -> Mesh {
        assert_eq!(soup_positions.len() % 3, 0);
        let has_normals = soup_normals.len() == soup_positions.len();
        let has_uvs = soup_uvs.len() == soup_positions.len();

        let mut remap: HashMap<(u32, u32, u32), u32> = HashMap::new();
        let mut positions: Vec<Point3f> = Vec::new();
        let mut normals: Vec<Vector3f> = Vec::new();
        let mut uvs: Vec<Point2f> = Vec::new();
        let mut indices: Vec<[u32; 3]> = Vec::with_capacity(soup_positions.len() / 3);

        for tri in 0..soup_positions.len() / 3 {
            let mut idx = [0_u32; 3];
            for v in 0..3 {
                let i = tri * 3 + v;
                let p = soup_positions[i];
                let entry = remap.entry(key_of(&p)).or_insert_with(|| {
                    positions.push(p);
                    if has_normals {
                        normals.push(soup_normals[i]);
                    }
                    if has_uvs {
                        uvs.push(soup_uvs[i]);
                    }
                    (positions.len() - 1) as u32
                });
                idx[v] = *entry;
            }
            indices.push(idx);
        }

        Mesh::from_indexed(positions, normals, uvs, indices)
    }

    pub fn from_indexed(
        positions: Vec<Point3f>,
        normals: Vec<Vector3f>,
        uvs: Vec<Point2f>,
        indices: Vec<[u32; 3]>,
    ) -> Mesh {
        let mut frames: Vec<TriangleFrame> = Vec::with_capacity(indices.len());
        let mut areas: Vec<Float> = Vec::with_capacity(indices.len());
        let mut total = 0.0 as Float;
        for idx in &indices {
            let a = positions[idx[0] as usize];
            let b = positions[idx[1] as usize];
            let c = positions[idx[2] as usize];
            let e1 = b - a;
            let e2 = c - a;
            let cr = e1.cross(&e2);
            let len = cr.length();
            // degenerate triangles keep a placeholder frame and zero area
            let geo_n = if len > 0.0 {
                Dir3::from_normalized(cr / len)
            } else {
                Dir3::default()
            };
            let dpdu = if uvs.is_empty() {
                e1
            } else {
                let uv0 = uvs[idx[0] as usize];
                let uv1 = uvs[idx[1] as usize];
                let uv2 = uvs[idx[2] as usize];
                let duv1 = uv1 - uv0;
                let duv2 = uv2 - uv0;
                let det = duv1.x * duv2.y - duv1.y * duv2.x;
                if det.abs() > 1e-12 {
                    (e1 * duv2.y - e2 * duv1.y) * (1.0 as Float / det)
                } else {
                    e1
                }
            };
            frames.push(TriangleFrame { geo_n, dpdu });
            let area = 0.5 as Float * len;
            areas.push(area);
            total += area;
        }

        Mesh {
            positions,
            normals,
            uvs,
            indices,
            frames,
            area_distribution: Distribution1D::new(areas),
            total_area: Area(total),
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    pub fn tri_positions(&self, tri: usize) -> (Point3f, Point3f, Point3f) {
        let idx = self.indices[tri];
        (
            self.positions[idx[0] as usize],
            self.positions[idx[1] as usize],
            self.positions[idx[2] as usize],
        )
    }

    pub fn area(&self) -> Area {
        self.total_area
    }

    pub fn tri_area(&self, tri: usize) -> Area {
        Area(self.area_distribution.func[tri])
    }

    /// Interpolated shading normal; the geometric normal for faceted meshes.
    pub fn shading_normal(&self, tri: usize, b1: Float, b2: Float) -> Dir3 {
        if self.normals.is_empty() {
            return self.frames[tri].geo_n;
        }
        let idx = self.indices[tri];
        let n = self.normals[idx[0] as usize] * (1.0 as Float - b1 - b2)
            + self.normals[idx[1] as usize] * b1
            + self.normals[idx[2] as usize] * b2;
        if n.length_squared() > 0.0 {
            Dir3::new(n)
        } else {
            self.frames[tri].geo_n
        }
    }

    pub fn uv(&self, tri: usize, b1: Float, b2: Float) -> Point2f {
        if self.uvs.is_empty() {
            return Point2f { x: b1, y: b2 };
        }
        let idx = self.indices[tri];
        let uv0 = self.uvs[idx[0] as usize];
        let uv1 = self.uvs[idx[1] as usize];
        let uv2 = self.uvs[idx[2] as usize];
        Point2f {
            x: (1.0 as Float - b1 - b2) * uv0.x + b1 * uv1.x + b2 * uv2.x,
            y: (1.0 as Float - b1 - b2) * uv0.y + b1 * uv1.y + b2 * uv2.y,
        }
    }

    /// Area-uniform position sample; returns (triangle, b1, b2, pdf-per-area).
    pub fn sample_position(&self, u_tri: Float, u: Point2f) -> (usize, Float, Float, Float) {
        let mut pmf = 0.0 as Float;
        let tri = self.area_distribution.sample_discrete(u_tri, Some(&mut pmf));
        let bary = uniform_sample_triangle(u);
        let area = self.tri_area(tri).0;
        let pdf_area = if area > 0.0 && self.total_area.0 > 0.0 {
            1.0 as Float / self.total_area.0
        } else {
            0.0
        };
        (tri, bary.x, bary.y, pdf_area)
    }

    /// Uniform position density over the shape's surface.
    pub fn pdf_position(&self) -> Float {
        if self.total_area.0 > 0.0 {
            1.0 as Float / self.total_area.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> Mesh {
        // two triangles sharing an edge; 6 soup vertices dedup to 4
        let p = vec![
            Point3f::new(0.0, 0.0, 0.0),
            Point3f::new(1.0, 0.0, 0.0),
            Point3f::new(1.0, 1.0, 0.0),
            Point3f::new(0.0, 0.0, 0.0),
            Point3f::new(1.0, 1.0, 0.0),
            Point3f::new(0.0, 1.0, 0.0),
        ];
        Mesh::new(p, vec![], vec![])
    }

    #[test]
    fn dedup_and_area() {
        let m = quad();
        assert_eq!(m.positions.len(), 4);
        assert_eq!(m.triangle_count(), 2);
        assert!((m.area().0 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn area_distribution_sums_to_surface_area() {
        let m = quad();
        let total: Float = (0..m.triangle_count()).map(|i| m.tri_area(i).0).sum();
        assert!((total - m.area().0).abs() < 1e-6);
    }

    #[test]
    fn sampled_positions_lie_on_mesh() {
        let m = quad();
        let (tri, b1, b2, pdf) = m.sample_position(0.3, Point2f { x: 0.5, y: 0.5 });
        assert!(tri < 2);
        assert!(b1 >= 0.0 && b2 >= 0.0 && b1 + b2 <= 1.0);
        assert!((pdf - 1.0).abs() < 1e-6);
    }

    #[test]
    fn degenerate_triangle_has_zero_sampling_weight() {
        let p = vec![
            Point3f::new(0.0, 0.0, 0.0),
            Point3f::new(1.0, 0.0, 0.0),
            Point3f::new(0.0, 1.0, 0.0),
            // colinear
            Point3f::new(0.0, 0.0, 1.0),
            Point3f::new(0.0, 0.0, 2.0),
            Point3f::new(0.0, 0.0, 3.0),
        ];
        let m = Mesh::new(p, vec![], vec![]);
        assert_eq!(m.triangle_count(), 2);
        assert_eq!(m.tri_area(1).0, 0.0);
        assert!((m.area().0 - 0.5).abs() < 1e-6);
    }
}
