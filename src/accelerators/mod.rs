//! The accelerating data structure (ADS): an 8-wide BVH over scene
//! triangles, with ray, cone and ball queries.

pub mod bvh;
pub mod bvh8w;
pub mod edges;
pub mod stats;
pub mod traverse;

// others
use smallvec::SmallVec;
use thiserror::Error;
// wavert
use crate::core::geometry::{Dir3, Point3f};
use crate::core::quantity::{Float, Length};

pub use bvh8w::{Bvh8w, LeafNode, Node};

pub type Idx = u32;
pub const INVALID_IDX: Idx = std::u32::MAX;

#[derive(Debug, Error)]
pub enum AdsBuildError {
    #[error("no triangles found")]
    NoTriangles,
    #[error("too many nodes for 31-bit child pointers")]
    TooManyNodes,
}

/// Triangle data, flattened over all scene shapes.
#[derive(Debug, Copy, Clone)]
pub struct Triangle {
    pub a: Point3f,
    pub b: Point3f,
    pub c: Point3f,
    pub n: Dir3,
    pub shape_idx: u32,
    pub shape_tri_idx: u32,
    /// Per-edge back-references into the edge arena (`INVALID_IDX` = none).
    pub edge_ab: Idx,
    pub edge_bc: Idx,
    pub edge_ca: Idx,
}

impl Triangle {
    pub fn edge_refs(&self) -> [Idx; 3] {
        [self.edge_ab, self.edge_bc, self.edge_ca]
    }
    pub fn centroid(&self) -> Point3f {
        Point3f::new(
            (self.a.x + self.b.x + self.c.x) / 3.0,
            (self.a.y + self.b.y + self.c.y) / 3.0,
            (self.a.z + self.b.z + self.c.z) / 3.0,
        )
    }
}

/// Geometric edge of a triangle, possibly shared by two triangles.
///
/// The in-plane tangents point into their triangle, so the wedge opening
/// angle `alpha` in (0, 2 pi) is well-defined.
#[derive(Debug, Copy, Clone)]
pub struct Edge {
    pub a: Point3f,
    pub b: Point3f,
    /// Unit edge tangent.
    pub e: Dir3,
    pub n1: Dir3,
    pub t1: Dir3,
    pub n2: Dir3,
    pub t2: Dir3,
    /// Wedge opening angle (the material dihedral), radians.
    pub alpha: Float,
    /// Refractive-index placeholder.
    pub eta: Float,
    /// Global triangle indices; `tri2 == INVALID_IDX` marks a boundary edge.
    pub tri1: Idx,
    pub tri2: Idx,
}

/// Options of cone/ball intersection queries.
#[derive(Debug, Copy, Clone)]
pub struct IntersectOpts {
    pub detect_edges: bool,
    pub accumulate_edges: bool,
    pub accumulate_triangles: bool,
    pub z_search_range_scale: Float,
}

impl Default for IntersectOpts {
    fn default() -> Self {
        IntersectOpts {
            detect_edges: true,
            accumulate_edges: false,
            accumulate_triangles: false,
            z_search_range_scale: 1.0,
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct WorkTri {
    tuid: Idx,
    dist: Length,
}

/// Per-thread scratch storage for intersection queries.
///
/// Cone and ball records borrow their triangle/edge lists from this scratch;
/// a record must be consumed before the next query reuses the scratch.
#[derive(Debug, Default)]
pub struct QueryScratch {
    pub triangles: Vec<Idx>,
    pub edges: Vec<Idx>,
    work: Vec<WorkTri>,
    stack: SmallVec<[i32; 128]>,
}

impl QueryScratch {
    pub fn new() -> Self {
        QueryScratch::default()
    }
}

/// A single-triangle ray-tracing hit.
#[derive(Debug, Copy, Clone)]
pub struct RayHit {
    pub dist: Length,
    pub b1: Float,
    pub b2: Float,
    pub front_face: bool,
    pub tuid: Idx,
}

/// A multi-triangle cone/ball hit; the lists borrow per-thread scratch.
#[derive(Debug, Copy, Clone)]
pub struct ConeHit<'a> {
    pub dist: Length,
    pub front_face: bool,
    /// Triangle owning the closest intersection.
    pub closest: Idx,
    pub triangles: &'a [Idx],
    pub edges: &'a [Idx],
}

/// The result of an ADS intersection query. Queries are total: failures
/// surface as `None` records, never as errors.
#[derive(Debug, Copy, Clone)]
pub enum IntersectionRecord<'a> {
    None,
    Ray(RayHit),
    Cone(ConeHit<'a>),
}

impl<'a> IntersectionRecord<'a> {
    pub fn is_empty(&self) -> bool {
        match self {
            IntersectionRecord::None => true,
            IntersectionRecord::Ray(_) => false,
            IntersectionRecord::Cone(c) => c.triangles.is_empty(),
        }
    }
    /// Distance to the first intersection; infinite when empty.
    pub fn distance(&self) -> Length {
        match self {
            IntersectionRecord::None => Length::INFINITY,
            IntersectionRecord::Ray(r) => r.dist,
            IntersectionRecord::Cone(c) => {
                if c.triangles.is_empty() {
                    Length::INFINITY
                } else {
                    c.dist
                }
            }
        }
    }
    pub fn is_front_face(&self) -> bool {
        match self {
            IntersectionRecord::None => false,
            IntersectionRecord::Ray(r) => r.front_face,
            IntersectionRecord::Cone(c) => c.front_face,
        }
    }
    pub fn ray_hit(&self) -> Option<&RayHit> {
        match self {
            IntersectionRecord::Ray(r) => Some(r),
            _ => None,
        }
    }
}
