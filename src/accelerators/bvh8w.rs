//! The 8-wide BVH: node layout and construction.

// std
use std::sync::Arc;
// others
use smallvec::SmallVec;
use tracing::info;
// wavert
use crate::accelerators::bvh::{self, BinaryBvh};
use crate::accelerators::edges::find_edges;
use crate::accelerators::stats::AdsStats;
use crate::accelerators::{AdsBuildError, Edge, Idx, Triangle};
use crate::core::geometry::Bounds3f;
use crate::core::quantity::Float;
use crate::core::simd::{Float8, Vec3x8};
use crate::stats::StatsSink;

pub const AABBS_PER_NODE: usize = 8;

/// 8 child AABBs and 8 31-bit pointers + 1-bit leaf flag.
///
/// Child pointer convention: `0` empty, `> 0` interior child index + 1,
/// `< 0` leaf node index negated - 1.
#[derive(Debug, Clone)]
pub struct Node {
    pub min: Vec3x8,
    pub max: Vec3x8,
    pub child_ptrs: [i32; AABBS_PER_NODE],
    /// Contiguous triangle range covered by the whole subtree, used for
    /// subtree-level leaf harvesting during diffusive cone traversal.
    pub tris_start: u32,
    pub tris_count: u32,
}

#[derive(Debug, Copy, Clone)]
pub struct LeafNode {
    pub tris_ptr: u32,
    pub count: u32,
}

pub fn is_ptr_empty(ptr: i32) -> bool {
    ptr == 0
}
pub fn is_ptr_leaf(ptr: i32) -> bool {
    ptr < 0
}
pub fn is_ptr_child(ptr: i32) -> bool {
    ptr > 0
}
pub fn leaf_node_ptr(ptr: i32) -> usize {
    (-ptr) as usize - 1
}
pub fn child_node_ptr(ptr: i32) -> usize {
    ptr as usize - 1
}

/// SIMD-ready triangle vertex/normal arrays, padded so any valid index can
/// be loaded as an 8-wide register.
#[derive(Debug, Default, Clone)]
pub struct VectorizedTris {
    pub ax: Vec<Float>,
    pub ay: Vec<Float>,
    pub az: Vec<Float>,
    pub bx: Vec<Float>,
    pub by: Vec<Float>,
    pub bz: Vec<Float>,
    pub cx: Vec<Float>,
    pub cy: Vec<Float>,
    pub cz: Vec<Float>,
    pub nx: Vec<Float>,
    pub ny: Vec<Float>,
    pub nz: Vec<Float>,
}

impl VectorizedTris {
    fn create(tris: &[Triangle]) -> VectorizedTris {
        let ds = tris.len() + 7;
        let mut d = VectorizedTris {
            ax: vec![0.0; ds],
            ay: vec![0.0; ds],
            az: vec![0.0; ds],
            bx: vec![0.0; ds],
            by: vec![0.0; ds],
            bz: vec![0.0; ds],
            cx: vec![0.0; ds],
            cy: vec![0.0; ds],
            cz: vec![0.0; ds],
            nx: vec![0.0; ds],
            ny: vec![0.0; ds],
            nz: vec![0.0; ds],
        };
        for (t, tri) in tris.iter().enumerate() {
            d.ax[t] = tri.a.x;
            d.ay[t] = tri.a.y;
            d.az[t] = tri.a.z;
            d.bx[t] = tri.b.x;
            d.by[t] = tri.b.y;
            d.bz[t] = tri.b.z;
            d.cx[t] = tri.c.x;
            d.cy[t] = tri.c.y;
            d.cz[t] = tri.c.z;
            d.nx[t] = tri.n.x();
            d.ny[t] = tri.n.y();
            d.nz[t] = tri.n.z();
        }
        d
    }

    /// Loads triangles `[start, start + 8)` as wide registers.
    pub fn load8(&self, start: usize) -> (Vec3x8, Vec3x8, Vec3x8) {
        let f = |v: &Vec<Float>| Float8::from_fn(|i| v[start + i]);
        (
            Vec3x8 {
                x: f(&self.ax),
                y: f(&self.ay),
                z: f(&self.az),
            },
            Vec3x8 {
                x: f(&self.bx),
                y: f(&self.by),
                z: f(&self.bz),
            },
            Vec3x8 {
                x: f(&self.cx),
                y: f(&self.cy),
                z: f(&self.cz),
            },
        )
    }
}

#[derive(Debug, Clone)]
pub struct BuildOpts {
    pub max_prims_in_node: usize,
    pub optimize_passes: usize,
}

impl Default for BuildOpts {
    fn default() -> Self {
        BuildOpts {
            max_prims_in_node: 4,
            optimize_passes: 32,
        }
    }
}

pub type ProgressCallback<'a> = &'a (dyn Fn(Float, &str) + Sync);

/// The 8-wide BVH over all scene triangles. Immutable after build.
pub struct Bvh8w {
    nodes: Vec<Node>,
    leaf_nodes: Vec<LeafNode>,
    vectorized: VectorizedTris,
    tris: Vec<Triangle>,
    edges: Vec<Edge>,
    world: Bounds3f,
    sah_cost: Float,
    occupancy: Float,
    max_depth: usize,
    pub(crate) stats: AdsStats,
}

fn extract_bvh_nodes(bin: &BinaryBvh, idx: u32, depth: u32, out: &mut SmallVec<[u32; 8]>) {
    let n = &bin.nodes[idx as usize];
    if n.is_leaf || depth == 0 {
        out.push(idx);
        return;
    }
    extract_bvh_nodes(bin, n.left, depth - 1, out);
    extract_bvh_nodes(bin, n.right, depth - 1, out);
}

fn calculate_occupancy(
    nodes: &[Node],
    n: usize,
    filled: &mut usize,
    potential: &mut usize,
    max_depth: &mut usize,
    depth: usize,
) {
    *potential += AABBS_PER_NODE;
    *max_depth = (*max_depth).max(depth);
    for &ptr in &nodes[n].child_ptrs {
        if !is_ptr_empty(ptr) {
            *filled += 1;
            if is_ptr_child(ptr) {
                calculate_occupancy(nodes, child_node_ptr(ptr), filled, potential, max_depth, depth + 1);
            }
        }
    }
}

impl Bvh8w {
    /// Builds the ADS over the flattened scene triangles: binary SAH build,
    /// tree rotations, 8-wide re-encoding, vectorized arrays and the edge
    /// database.
    pub fn build(
        all_tris: Vec<Triangle>,
        opts: &BuildOpts,
        progress: Option<ProgressCallback>,
    ) -> Result<Bvh8w, AdsBuildError> {
        let report = |p: Float, status: &str| {
            if let Some(cb) = progress {
                cb(p, status);
            }
        };

        report(0.0, "building BVH");
        let bin = bvh::build(all_tris, opts.max_prims_in_node, opts.optimize_passes)?;
        let bin = Arc::new(bin);

        report(0.7, "encoding 8-wide BVH");
        let bin_encode = bin.clone();
        let bin_vec = bin.clone();
        let (encoded, vectorized) = rayon::join(
            move || Self::encode(&bin_encode),
            move || VectorizedTris::create(&bin_vec.tris),
        );
        let (nodes, leaf_nodes) = encoded?;

        // occupancy statistics
        let mut filled = 0_usize;
        let mut potential = 0_usize;
        let mut max_depth = 0_usize;
        calculate_occupancy(&nodes, 0, &mut filled, &mut potential, &mut max_depth, 0);
        let occupancy = filled as Float / potential.max(1) as Float;

        let world = bin.nodes[0].aabb;
        let sah_cost = bin.sah_cost;
        let mut tris = match Arc::try_unwrap(bin) {
            Ok(b) => b.tris,
            Err(shared) => shared.tris.clone(),
        };

        report(0.9, "finding edges");
        let edges = find_edges(&mut tris);

        info!(
            tris = tris.len(),
            nodes = nodes.len(),
            leaves = leaf_nodes.len(),
            edges = edges.len(),
            sah_cost,
            occupancy,
            max_depth,
            "ADS built"
        );
        report(1.0, "");

        Ok(Bvh8w {
            nodes,
            leaf_nodes,
            vectorized,
            tris,
            edges,
            world,
            sah_cost,
            occupancy,
            max_depth,
            stats: AdsStats::default(),
        })
    }

    fn encode(bin: &BinaryBvh) -> Result<(Vec<Node>, Vec<LeafNode>), AdsBuildError> {
        let mut nodes: Vec<Node> = Vec::with_capacity(bin.nodes.len() / 4 + 1);
        let mut leaf_nodes: Vec<LeafNode> = Vec::new();
        let empty_node = Node {
            min: Vec3x8::default(),
            max: Vec3x8::default(),
            child_ptrs: [0; AABBS_PER_NODE],
            tris_start: 0,
            tris_count: 0,
        };

        nodes.push(empty_node.clone()); // create root
        let mut queue: Vec<(usize, u32)> = vec![(0, 0)];
        while let Some((w8_idx, bin_idx)) = queue.pop() {
            // extract up to 3 levels of binary descendants
            let mut children: SmallVec<[u32; 8]> = SmallVec::new();
            extract_bvh_nodes(bin, bin_idx, 3, &mut children);

            let bn = &bin.nodes[bin_idx as usize];
            let mut node = empty_node.clone();
            node.tris_start = bn.tris_offset;
            node.tris_count = bn.tri_count;

            // pad empty slots with the first child's box; they are masked
            // out through the zero pointer
            let pad = bin.nodes[children[0] as usize].aabb;
            let aabb_of = |slot: usize| -> Bounds3f {
                if slot < children.len() {
                    bin.nodes[children[slot] as usize].aabb
                } else {
                    pad
                }
            };
            node.min = Vec3x8 {
                x: Float8::from_fn(|i| aabb_of(i).p_min.x),
                y: Float8::from_fn(|i| aabb_of(i).p_min.y),
                z: Float8::from_fn(|i| aabb_of(i).p_min.z),
            };
            node.max = Vec3x8 {
                x: Float8::from_fn(|i| aabb_of(i).p_max.x),
                y: Float8::from_fn(|i| aabb_of(i).p_max.y),
                z: Float8::from_fn(|i| aabb_of(i).p_max.z),
            };

            for (c, &child_bin) in children.iter().enumerate() {
                let cn = &bin.nodes[child_bin as usize];
                if cn.is_leaf {
                    leaf_nodes.push(LeafNode {
                        tris_ptr: cn.tris_offset,
                        count: cn.tri_count,
                    });
                    if leaf_nodes.len() > std::i32::MAX as usize {
                        return Err(AdsBuildError::TooManyNodes);
                    }
                    // leaf ptrs have set signs
                    node.child_ptrs[c] = -(leaf_nodes.len() as i32);
                } else {
                    let cidx = nodes.len();
                    if cidx + 1 > std::i32::MAX as usize {
                        return Err(AdsBuildError::TooManyNodes);
                    }
                    nodes.push(empty_node.clone());
                    node.child_ptrs[c] = cidx as i32 + 1;
                    queue.push((cidx, child_bin));
                }
            }
            nodes[w8_idx] = node;
        }

        Ok((nodes, leaf_nodes))
    }

    /// Installs a statistics sink; `additional` enables the verbose set.
    pub fn set_stats_sink(&mut self, sink: Arc<dyn StatsSink>, additional: bool) {
        self.stats = AdsStats::new(Some(sink), additional);
    }

    pub fn root_ptr(&self) -> i32 {
        1
    }
    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }
    pub fn leaf_node(&self, idx: usize) -> &LeafNode {
        &self.leaf_nodes[idx]
    }
    pub fn nodes_count(&self) -> usize {
        self.nodes.len()
    }
    pub fn tri(&self, tuid: Idx) -> &Triangle {
        &self.tris[tuid as usize]
    }
    pub fn edge(&self, euid: Idx) -> &Edge {
        &self.edges[euid as usize]
    }
    pub fn triangles_count(&self) -> usize {
        self.tris.len()
    }
    pub fn edges_count(&self) -> usize {
        self.edges.len()
    }
    pub fn vectorized_tri_data(&self) -> &VectorizedTris {
        &self.vectorized
    }
    /// World bounds.
    pub fn world(&self) -> &Bounds3f {
        &self.world
    }
    pub fn sah_cost(&self) -> Float {
        self.sah_cost
    }
    pub fn occupancy(&self) -> Float {
        self.occupancy
    }
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerators::bvh::make_triangle;
    use crate::core::geometry::Point3f;
    use crate::core::rng::Rng;

    pub fn grid_tris(n: usize) -> Vec<Triangle> {
        let mut rng = Rng::new(1, 2);
        (0..n)
            .map(|i| {
                let p = Point3f::new(
                    rng.uniform_float() * 4.0,
                    rng.uniform_float() * 4.0,
                    rng.uniform_float() * 4.0,
                );
                make_triangle(
                    p,
                    Point3f::new(p.x + 0.05, p.y, p.z),
                    Point3f::new(p.x, p.y + 0.05, p.z),
                    0,
                    i as u32,
                )
            })
            .collect()
    }

    #[test]
    fn builds_and_reports_occupancy() {
        let ads = Bvh8w::build(grid_tris(500), &BuildOpts::default(), None).unwrap();
        assert!(ads.nodes_count() >= 1);
        assert!(ads.occupancy() > 0.0 && ads.occupancy() <= 1.0);
        assert!(ads.sah_cost().is_finite());
        assert_eq!(ads.triangles_count(), 500);
        assert_eq!(ads.root_ptr(), 1);
    }

    #[test]
    fn child_pointer_encoding_is_consistent() {
        let ads = Bvh8w::build(grid_tris(200), &BuildOpts::default(), None).unwrap();
        let mut seen_leaves = 0;
        for n in 0..ads.nodes_count() {
            for &ptr in &ads.node(n).child_ptrs {
                if is_ptr_leaf(ptr) {
                    let leaf = ads.leaf_node(leaf_node_ptr(ptr));
                    assert!(leaf.tris_ptr as usize + leaf.count as usize <= ads.triangles_count());
                    assert!(leaf.count > 0);
                    seen_leaves += 1;
                } else if is_ptr_child(ptr) {
                    assert!(child_node_ptr(ptr) < ads.nodes_count());
                }
            }
        }
        assert!(seen_leaves > 0);
        // every triangle is reachable through exactly the leaf spans
        let mut covered = vec![false; ads.triangles_count()];
        for n in 0..ads.nodes_count() {
            for &ptr in &ads.node(n).child_ptrs {
                if is_ptr_leaf(ptr) {
                    let leaf = ads.leaf_node(leaf_node_ptr(ptr));
                    for t in leaf.tris_ptr..leaf.tris_ptr + leaf.count {
                        covered[t as usize] = true;
                    }
                }
            }
        }
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn vectorized_arrays_are_padded() {
        let ads = Bvh8w::build(grid_tris(33), &BuildOpts::default(), None).unwrap();
        let v = ads.vectorized_tri_data();
        assert!(v.ax.len() >= ads.triangles_count() + 7);
        // any valid start index can load 8 wide
        let (a, _b, _c) = v.load8(ads.triangles_count() - 1);
        assert!(a.x.get(0).is_finite());
    }
}
