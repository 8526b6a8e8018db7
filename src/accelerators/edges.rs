//! Silhouette-edge extraction: pairs triangles over shared edges and
//! computes wedge geometry.

// std
use std::collections::HashMap;
// others
use rayon::prelude::*;
use smallvec::SmallVec;
use tracing::warn;
// wavert
use crate::accelerators::{Edge, Idx, Triangle, INVALID_IDX};
use crate::core::geometry::{Dir3, Point3f};
use crate::core::quantity::{clamp_t, Float, PI};

type VertexKey = (u32, u32, u32);

fn key_of(p: &Point3f) -> VertexKey {
    (p.x.to_bits(), p.y.to_bits(), p.z.to_bits())
}

#[derive(Debug, Copy, Clone)]
struct EdgeUse {
    tri: Idx,
    slot: u8,
}

fn edge_endpoints(tri: &Triangle, slot: u8) -> (Point3f, Point3f, Point3f) {
    // returns (edge start, edge end, opposite vertex)
    match slot {
        0 => (tri.a, tri.b, tri.c),
        1 => (tri.b, tri.c, tri.a),
        _ => (tri.c, tri.a, tri.b),
    }
}

/// In-plane tangent of the face at this edge, pointing into the triangle.
fn in_plane_tangent(n: Dir3, e: Dir3, a: Point3f, opposite: Point3f) -> Dir3 {
    let t = n.cross(&e);
    let t = if t.length_squared() > 0.0 {
        t.normalize()
    } else {
        n.v()
    };
    if t.dot(&(opposite - a)) < 0.0 {
        Dir3::from_normalized(-t)
    } else {
        Dir3::from_normalized(t)
    }
}

/// Wedge opening angle (the material dihedral) in [0, 2 pi).
fn wedge_angle(t1: Dir3, n2: Dir3, t2: Dir3) -> Float {
    let base = clamp_t(t1.dot(&t2.v()), -1.0, 1.0).acos();
    if t1.dot(&n2.v()) > 1e-6 {
        // concave wedge
        2.0 as Float * PI - base
    } else {
        base
    }
}

/// Finds all triangle edges, pairs adjacent triangles, computes wedge data
/// and registers the edge ids in the triangles' edge fields.
pub fn find_edges(tris: &mut [Triangle]) -> Vec<Edge> {
    let mut uses: HashMap<(VertexKey, VertexKey), SmallVec<[EdgeUse; 2]>> =
        HashMap::with_capacity(tris.len() * 2);
    for (t, tri) in tris.iter().enumerate() {
        for slot in 0..3_u8 {
            let (p, q, _) = edge_endpoints(tri, slot);
            let (kp, kq) = (key_of(&p), key_of(&q));
            if kp == kq {
                continue; // degenerate edge
            }
            let key = if kp < kq { (kp, kq) } else { (kq, kp) };
            uses.entry(key)
                .or_insert_with(SmallVec::new)
                .push(EdgeUse { tri: t as Idx, slot });
        }
    }

    let entries: Vec<SmallVec<[EdgeUse; 2]>> = uses.into_iter().map(|(_, v)| v).collect();

    // wedge geometry in parallel, over the read-only triangle array
    let computed: Vec<Option<(Edge, SmallVec<[EdgeUse; 2]>)>> = entries
        .into_par_iter()
        .map(|entry| {
            if entry.len() > 2 {
                warn!(
                    shared_by = entry.len(),
                    "non-manifold edge; only the first two triangles are paired"
                );
            }
            let u1 = entry[0];
            let tri1 = &tris[u1.tri as usize];
            let (a, b, opp1) = edge_endpoints(tri1, u1.slot);
            let ev = b - a;
            if ev.length_squared() <= 0.0 {
                return None;
            }
            let e = Dir3::new(ev);
            let n1 = tri1.n;
            let t1 = in_plane_tangent(n1, e, a, opp1);

            let (n2, t2, alpha, tri2_idx) = if entry.len() >= 2 {
                let u2 = entry[1];
                let tri2 = &tris[u2.tri as usize];
                let (a2, _b2, opp2) = edge_endpoints(tri2, u2.slot);
                let n2 = tri2.n;
                let t2 = in_plane_tangent(n2, e, a2, opp2);
                (n2, t2, wedge_angle(t1, n2, t2), u2.tri)
            } else {
                // boundary edge: the limit of a knife edge
                (
                    Dir3::from_normalized(-n1.v()),
                    t1,
                    0.0 as Float,
                    INVALID_IDX,
                )
            };

            Some((
                Edge {
                    a,
                    b,
                    e,
                    n1,
                    t1,
                    n2,
                    t2,
                    alpha,
                    eta: 0.0,
                    tri1: u1.tri,
                    tri2: tri2_idx,
                },
                entry,
            ))
        })
        .collect();

    // register edge ids in both triangles' edge fields
    let mut edges: Vec<Edge> = Vec::with_capacity(computed.len());
    for item in computed.into_iter().flatten() {
        let (edge, entry) = item;
        let id = edges.len() as Idx;
        edges.push(edge);
        for u in entry.iter().take(2) {
            let tri = &mut tris[u.tri as usize];
            match u.slot {
                0 => tri.edge_ab = id,
                1 => tri.edge_bc = id,
                _ => tri.edge_ca = id,
            }
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerators::bvh::make_triangle;

    fn folded_pair(dihedral: Float) -> Vec<Triangle> {
        // two triangles sharing the edge (0,0,0)-(1,0,0); the second folded
        // by `dihedral` about that edge (0 = coplanar)
        let t1 = make_triangle(
            Point3f::new(0.0, 0.0, 0.0),
            Point3f::new(1.0, 0.0, 0.0),
            Point3f::new(0.5, 1.0, 0.0),
            0,
            0,
        );
        let c2 = Point3f::new(0.5, -dihedral.cos(), dihedral.sin());
        let t2 = make_triangle(
            Point3f::new(1.0, 0.0, 0.0),
            Point3f::new(0.0, 0.0, 0.0),
            c2,
            0,
            1,
        );
        vec![t1, t2]
    }

    #[test]
    fn flat_pair_has_pi_wedge() {
        let mut tris = folded_pair(0.0);
        let edges = find_edges(&mut tris);
        // 5 distinct edges; one shared
        assert_eq!(edges.len(), 5);
        let shared: Vec<&Edge> = edges.iter().filter(|e| e.tri2 != INVALID_IDX).collect();
        assert_eq!(shared.len(), 1);
        assert!((shared[0].alpha - PI).abs() < 1e-4);
        // tangents orthogonal to edge tangent
        assert!(shared[0].e.dot(&shared[0].t1.v()).abs() < 1e-5);
        assert!(shared[0].e.dot(&shared[0].t2.v()).abs() < 1e-5);
    }

    #[test]
    fn edge_backrefs_registered_both_ways() {
        let mut tris = folded_pair(0.5);
        let edges = find_edges(&mut tris);
        let shared_id = edges
            .iter()
            .enumerate()
            .find(|(_, e)| e.tri2 != INVALID_IDX)
            .map(|(i, _)| i as Idx)
            .unwrap();
        let count = tris
            .iter()
            .flat_map(|t| t.edge_refs().to_vec())
            .filter(|&r| r == shared_id)
            .count();
        assert_eq!(count, 2);
    }

    #[test]
    fn boundary_edges_have_no_second_triangle() {
        let mut tris = vec![make_triangle(
            Point3f::new(0.0, 0.0, 0.0),
            Point3f::new(1.0, 0.0, 0.0),
            Point3f::new(0.0, 1.0, 0.0),
            0,
            0,
        )];
        let edges = find_edges(&mut tris);
        assert_eq!(edges.len(), 3);
        assert!(edges.iter().all(|e| e.tri2 == INVALID_IDX));
        assert!(edges.iter().all(|e| e.alpha == 0.0));
    }
}
