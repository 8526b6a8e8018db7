//! Binary SAH BVH construction.
//!
//! The binary tree is only an intermediate: it is optimized with
//! tree-rotation passes and then re-encoded as the 8-wide BVH.

// std
use std::sync::Arc;
// others
use typed_arena::Arena;
// wavert
use crate::accelerators::{AdsBuildError, Triangle, INVALID_IDX};
use crate::core::geometry::{bnd3_union_bnd3f, bnd3_union_pnt3f, Bounds3f, Point3f};
use crate::core::quantity::Float;

// SAH parameters for costs of traversal / intersection.
// For cone tracing, build deep trees: subtrees contained in a cone get
// traversed as a leaf.
pub const SAH_C_INT: Float = 100.0;
pub const SAH_C_TRAV: Float = 1.0;

const N_BUCKETS: usize = 12;

#[derive(Debug, Default, Copy, Clone)]
struct PrimitiveInfo {
    primitive_number: usize,
    bounds: Bounds3f,
    centroid: Point3f,
}

impl PrimitiveInfo {
    fn new(primitive_number: usize, bounds: Bounds3f) -> Self {
        PrimitiveInfo {
            primitive_number,
            bounds,
            centroid: bounds.centroid(),
        }
    }
}

#[derive(Debug)]
struct BuildNode<'a> {
    bounds: Bounds3f,
    child1: Option<&'a BuildNode<'a>>,
    child2: Option<&'a BuildNode<'a>>,
    first_prim_offset: usize,
    n_primitives: usize,
}

impl<'a> Default for BuildNode<'a> {
    fn default() -> Self {
        BuildNode {
            bounds: Bounds3f::default(),
            child1: None,
            child2: None,
            first_prim_offset: 0_usize,
            n_primitives: 0_usize,
        }
    }
}

/// A node of the flattened binary tree. Interior nodes carry the contiguous
/// triangle range covered by their whole subtree.
#[derive(Debug, Copy, Clone)]
pub struct BinNode {
    pub aabb: Bounds3f,
    pub left: u32,
    pub right: u32,
    pub is_leaf: bool,
    pub tris_offset: u32,
    pub tri_count: u32,
}

impl Default for BinNode {
    fn default() -> Self {
        BinNode {
            aabb: Bounds3f::default(),
            left: INVALID_IDX,
            right: INVALID_IDX,
            is_leaf: false,
            tris_offset: 0,
            tri_count: 0,
        }
    }
}

pub struct BinaryBvh {
    pub nodes: Vec<BinNode>,
    /// Triangles re-ordered so every subtree covers a contiguous range.
    pub tris: Vec<Triangle>,
    pub sah_cost: Float,
}

#[derive(Debug, Copy, Clone, Default)]
struct BucketInfo {
    count: usize,
    bounds: Bounds3f,
}

fn recursive_build<'a>(
    arena: &'a Arena<BuildNode<'a>>,
    primitive_info: &mut Vec<PrimitiveInfo>,
    start: usize,
    end: usize,
    max_prims_in_node: usize,
    total_nodes: &mut usize,
    ordered: &mut Vec<usize>,
) -> &'a BuildNode<'a> {
    assert_ne!(start, end);
    let node: &mut BuildNode<'a> = arena.alloc(BuildNode::default());
    *total_nodes += 1_usize;
    // compute bounds of all primitives in BVH node
    let mut bounds: Bounds3f = Bounds3f::default();
    for item in primitive_info.iter().take(end).skip(start) {
        bounds = bnd3_union_bnd3f(&bounds, &item.bounds);
    }
    let n_primitives: usize = end - start;
    let make_leaf =
        |node: &mut BuildNode<'a>, ordered: &mut Vec<usize>, info: &[PrimitiveInfo]| {
            let first_prim_offset: usize = ordered.len();
            for item in info.iter().take(end).skip(start) {
                ordered.push(item.primitive_number);
            }
            node.first_prim_offset = first_prim_offset;
            node.n_primitives = n_primitives;
            node.bounds = bounds;
        };
    if n_primitives == 1 {
        make_leaf(&mut *node, ordered, primitive_info);
        return node;
    }
    // compute bound of primitive centroids, choose split dimension _dim_
    let mut centroid_bounds: Bounds3f = Bounds3f::default();
    for item in primitive_info.iter().take(end).skip(start) {
        centroid_bounds = bnd3_union_pnt3f(&centroid_bounds, &item.centroid);
    }
    let dim = centroid_bounds.maximum_extent();
    let mut mid: usize = (start + end) / 2_usize;
    if centroid_bounds.p_max.get(dim) == centroid_bounds.p_min.get(dim) {
        make_leaf(&mut *node, ordered, primitive_info);
        return node;
    }
    if n_primitives <= 2 {
        if start != end - 1
            && primitive_info[end - 1].centroid.get(dim) < primitive_info[start].centroid.get(dim)
        {
            primitive_info.swap(start, end - 1);
        }
    } else {
        // initialize _BucketInfo_ for SAH partition buckets
        let mut buckets: [BucketInfo; N_BUCKETS] = [BucketInfo::default(); N_BUCKETS];
        let bucket_of = |centroid: &Point3f| -> usize {
            let b = (N_BUCKETS as Float * centroid_bounds.offset(centroid).get(dim)) as usize;
            b.min(N_BUCKETS - 1)
        };
        for item in primitive_info.iter().take(end).skip(start) {
            let b = bucket_of(&item.centroid);
            buckets[b].count += 1;
            buckets[b].bounds = bnd3_union_bnd3f(&buckets[b].bounds, &item.bounds);
        }
        // compute costs for splitting after each bucket
        let mut cost: [Float; N_BUCKETS - 1] = [0.0; N_BUCKETS - 1];
        for (i, cost_item) in cost.iter_mut().enumerate() {
            let mut b0: Bounds3f = Bounds3f::default();
            let mut b1: Bounds3f = Bounds3f::default();
            let mut count0: usize = 0;
            let mut count1: usize = 0;
            for item in buckets.iter().take(i + 1) {
                b0 = bnd3_union_bnd3f(&b0, &item.bounds);
                count0 += item.count;
            }
            for item in buckets.iter().take(N_BUCKETS).skip(i + 1) {
                b1 = bnd3_union_bnd3f(&b1, &item.bounds);
                count1 += item.count;
            }
            *cost_item = 1.0 as Float
                + (count0 as Float * b0.surface_area() + count1 as Float * b1.surface_area())
                    / bounds.surface_area();
        }
        // find bucket to split at that minimizes SAH metric
        let mut min_cost: Float = cost[0];
        let mut min_cost_split_bucket: usize = 0;
        for (i, item) in cost.iter().enumerate() {
            if *item < min_cost {
                min_cost = *item;
                min_cost_split_bucket = i;
            }
        }
        // either create leaf or split primitives at selected SAH bucket
        let leaf_cost: Float = n_primitives as Float;
        if n_primitives > max_prims_in_node || min_cost < leaf_cost {
            let (mut left, mut right): (Vec<PrimitiveInfo>, Vec<PrimitiveInfo>) = primitive_info
                [start..end]
                .iter()
                .partition(|pi| bucket_of(&pi.centroid) <= min_cost_split_bucket);
            mid = start + left.len();
            if left.is_empty() || right.is_empty() {
                // all primitives in one bucket; split equally instead
                mid = (start + end) / 2;
            } else {
                left.append(&mut right);
                primitive_info.splice(start..end, left.into_iter());
            }
        } else {
            make_leaf(&mut *node, ordered, primitive_info);
            return node;
        }
    }
    let c0 = recursive_build(
        arena,
        primitive_info,
        start,
        mid,
        max_prims_in_node,
        total_nodes,
        ordered,
    );
    let c1 = recursive_build(
        arena,
        primitive_info,
        mid,
        end,
        max_prims_in_node,
        total_nodes,
        ordered,
    );
    node.bounds = bnd3_union_bnd3f(&c0.bounds, &c1.bounds);
    node.child1 = Some(c0);
    node.child2 = Some(c1);
    node
}

fn flatten<'a>(node: &BuildNode<'a>, nodes: &mut Vec<BinNode>) -> u32 {
    let my_offset = nodes.len() as u32;
    nodes.push(BinNode::default());
    if node.n_primitives > 0 {
        nodes[my_offset as usize] = BinNode {
            aabb: node.bounds,
            left: INVALID_IDX,
            right: INVALID_IDX,
            is_leaf: true,
            tris_offset: node.first_prim_offset as u32,
            tri_count: node.n_primitives as u32,
        };
    } else {
        let left = flatten(node.child1.unwrap(), nodes);
        let right = flatten(node.child2.unwrap(), nodes);
        nodes[my_offset as usize] = BinNode {
            aabb: node.bounds,
            left,
            right,
            is_leaf: false,
            tris_offset: 0,
            tri_count: 0,
        };
    }
    my_offset
}

/// One greedy tree-rotation pass; returns the number of improving rotations.
fn rotate_pass(nodes: &mut Vec<BinNode>) -> usize {
    let mut improved = 0;
    for n in 0..nodes.len() {
        if nodes[n].is_leaf {
            continue;
        }
        let (l, r) = (nodes[n].left as usize, nodes[n].right as usize);
        // candidates: (grandchild-owner, swapped-sibling, grandchild slot)
        let mut best_gain = 0.0 as Float;
        let mut best: Option<(usize, usize, bool)> = None;
        for &(owner, sibling) in &[(r, l), (l, r)] {
            if nodes[owner].is_leaf {
                continue;
            }
            let (gl, gr) = (nodes[owner].left as usize, nodes[owner].right as usize);
            let old_sa = nodes[owner].aabb.surface_area();
            // swap sibling with the left grandchild
            let sa_a = bnd3_union_bnd3f(&nodes[sibling].aabb, &nodes[gr].aabb).surface_area();
            if old_sa - sa_a > best_gain {
                best_gain = old_sa - sa_a;
                best = Some((owner, sibling, true));
            }
            // swap sibling with the right grandchild
            let sa_b = bnd3_union_bnd3f(&nodes[sibling].aabb, &nodes[gl].aabb).surface_area();
            if old_sa - sa_b > best_gain {
                best_gain = old_sa - sa_b;
                best = Some((owner, sibling, false));
            }
        }
        if let Some((owner, sibling, swap_left)) = best {
            let grandchild = if swap_left {
                nodes[owner].left
            } else {
                nodes[owner].right
            } as usize;
            // swap the sibling with the grandchild
            if swap_left {
                nodes[owner].left = sibling as u32;
            } else {
                nodes[owner].right = sibling as u32;
            }
            if nodes[n].left == sibling as u32 {
                nodes[n].left = grandchild as u32;
            } else {
                nodes[n].right = grandchild as u32;
            }
            let (ol, or) = (nodes[owner].left as usize, nodes[owner].right as usize);
            nodes[owner].aabb = bnd3_union_bnd3f(&nodes[ol].aabb, &nodes[or].aabb);
            improved += 1;
        }
    }
    improved
}

/// Re-emits the ordered triangle array in DFS order and rewrites all node
/// triangle ranges (interior ranges cover the whole subtree contiguously).
fn rewrite_triangle_ranges(
    nodes: &mut Vec<BinNode>,
    node: usize,
    old_tris: &[Triangle],
    new_tris: &mut Vec<Triangle>,
) -> (u32, u32) {
    if nodes[node].is_leaf {
        let offset = new_tris.len() as u32;
        let start = nodes[node].tris_offset as usize;
        let count = nodes[node].tri_count as usize;
        new_tris.extend_from_slice(&old_tris[start..start + count]);
        nodes[node].tris_offset = offset;
        (offset, count as u32)
    } else {
        let (l, r) = (nodes[node].left as usize, nodes[node].right as usize);
        let (lo, lc) = rewrite_triangle_ranges(nodes, l, old_tris, new_tris);
        let (_ro, rc) = rewrite_triangle_ranges(nodes, r, old_tris, new_tris);
        nodes[node].tris_offset = lo;
        nodes[node].tri_count = lc + rc;
        (lo, lc + rc)
    }
}

fn sah_cost(nodes: &[BinNode]) -> Float {
    let root_sa = nodes[0].aabb.surface_area();
    if root_sa <= 0.0 {
        return SAH_C_INT;
    }
    let mut cost = 0.0 as Float;
    for n in nodes {
        let sa = n.aabb.surface_area() / root_sa;
        if n.is_leaf {
            cost += SAH_C_INT * sa * n.tri_count as Float;
        } else {
            cost += SAH_C_TRAV * sa;
        }
    }
    cost
}

/// Builds the optimized binary BVH over the given triangles.
pub fn build(
    tris: Vec<Triangle>,
    max_prims_in_node: usize,
    optimize_passes: usize,
) -> Result<BinaryBvh, AdsBuildError> {
    if tris.is_empty() {
        return Err(AdsBuildError::NoTriangles);
    }
    let num_prims = tris.len();
    let mut primitive_info = vec![PrimitiveInfo::default(); num_prims];
    for (i, item) in primitive_info.iter_mut().enumerate().take(num_prims) {
        let mut b = bnd3_union_pnt3f(&Bounds3f::default(), &tris[i].a);
        b = bnd3_union_pnt3f(&b, &tris[i].b);
        b = bnd3_union_pnt3f(&b, &tris[i].c);
        *item = PrimitiveInfo::new(i, b);
    }

    let arena: Arena<BuildNode> = Arena::with_capacity(1024 * 1024);
    let mut total_nodes: usize = 0;
    let mut ordered: Vec<usize> = Vec::with_capacity(num_prims);
    let root = recursive_build(
        &arena,
        &mut primitive_info,
        0,
        num_prims,
        max_prims_in_node,
        &mut total_nodes,
        &mut ordered,
    );
    assert_eq!(ordered.len(), num_prims);

    let mut nodes: Vec<BinNode> = Vec::with_capacity(total_nodes);
    flatten(root, &mut nodes);
    assert_eq!(nodes.len(), total_nodes);

    let ordered_tris: Vec<Triangle> = ordered.iter().map(|&i| tris[i]).collect();

    // tree-rotation optimization passes
    for _ in 0..optimize_passes {
        if rotate_pass(&mut nodes) == 0 {
            break;
        }
    }

    // rotations shuffle subtrees; re-emit triangles in DFS order so that
    // every subtree covers a contiguous range
    let mut new_tris: Vec<Triangle> = Vec::with_capacity(num_prims);
    rewrite_triangle_ranges(&mut nodes, 0, &ordered_tris, &mut new_tris);
    assert_eq!(new_tris.len(), num_prims);

    let sah_cost = sah_cost(&nodes);
    Ok(BinaryBvh {
        nodes,
        tris: new_tris,
        sah_cost,
    })
}

pub fn make_triangle(a: Point3f, b: Point3f, c: Point3f, shape_idx: u32, shape_tri_idx: u32) -> Triangle {
    let cr = (b - a).cross(&(c - a));
    let n = if cr.length_squared() > 0.0 {
        crate::core::geometry::Dir3::new(cr)
    } else {
        crate::core::geometry::Dir3::default()
    };
    Triangle {
        a,
        b,
        c,
        n,
        shape_idx,
        shape_tri_idx,
        edge_ab: INVALID_IDX,
        edge_bc: INVALID_IDX,
        edge_ca: INVALID_IDX,
    }
}

/// Shared read-only view of the binary tree used during 8-wide encoding.
pub type BinaryBvhRef = Arc<BinaryBvh>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::Rng;

    fn random_tris(n: usize, rng: &mut Rng) -> Vec<Triangle> {
        (0..n)
            .map(|i| {
                let p = Point3f::new(
                    rng.uniform_float(),
                    rng.uniform_float(),
                    rng.uniform_float(),
                );
                let e = 0.02;
                make_triangle(
                    p,
                    Point3f::new(p.x + e * rng.uniform_float(), p.y, p.z),
                    Point3f::new(p.x, p.y + e * rng.uniform_float(), p.z + e),
                    0,
                    i as u32,
                )
            })
            .collect()
    }

    fn check_subtree(bvh: &BinaryBvh, node: usize) -> (u32, u32) {
        let n = &bvh.nodes[node];
        if n.is_leaf {
            for t in n.tris_offset..n.tris_offset + n.tri_count {
                let tri = &bvh.tris[t as usize];
                for p in &[tri.a, tri.b, tri.c] {
                    assert!(n.aabb.contains(p), "triangle escapes its leaf bounds");
                }
            }
            (n.tris_offset, n.tri_count)
        } else {
            let (lo, lc) = check_subtree(bvh, n.left as usize);
            let (ro, rc) = check_subtree(bvh, n.right as usize);
            assert_eq!(lo + lc, ro, "subtree ranges must be contiguous");
            assert_eq!(n.tris_offset, lo);
            assert_eq!(n.tri_count, lc + rc);
            (lo, lc + rc)
        }
    }

    #[test]
    fn subtree_ranges_are_contiguous_after_rotation() {
        let mut rng = Rng::new(42, 0);
        let tris = random_tris(300, &mut rng);
        let bvh = build(tris, 4, 8).unwrap();
        let (o, c) = check_subtree(&bvh, 0);
        assert_eq!(o, 0);
        assert_eq!(c as usize, bvh.tris.len());
    }

    #[test]
    fn empty_input_fails() {
        assert!(matches!(
            build(vec![], 4, 0),
            Err(AdsBuildError::NoTriangles)
        ));
    }

    #[test]
    fn sah_cost_is_finite_and_sane_for_100k_random_triangles() {
        let mut rng = Rng::new(7, 3);
        let tris = random_tris(100_000, &mut rng);
        let bvh = build(tris, 4, 2).unwrap();
        assert!(bvh.sah_cost.is_finite());
        assert!(bvh.sah_cost < 20.0 * SAH_C_INT + 200.0 * SAH_C_TRAV);
    }
}
