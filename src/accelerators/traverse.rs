//! BVH traversal: ray closest-hit, ray shadow, cone, cone shadow and ball
//! queries.

// others
use smallvec::SmallVec;
// wavert
use crate::accelerators::bvh8w::{child_node_ptr, is_ptr_child, is_ptr_empty, is_ptr_leaf, leaf_node_ptr, Bvh8w};
use crate::accelerators::stats::QueryCounters;
use crate::accelerators::{
    ConeHit, Idx, IntersectOpts, IntersectionRecord, QueryScratch, RayHit, WorkTri, INVALID_IDX,
};
use crate::core::elliptic_cone::EllipticCone;
use crate::core::geometry::{Dir3, Point3f, Ray, Vector3f};
use crate::core::intersect::{
    classify_cone_aabb, intersect_cone_tri, intersect_ray_aabb8, intersect_ray_tri8, ConeAabbFate,
};
use crate::core::quantity::{Float, Length, LengthRange};
use crate::core::simd::{Mask8, Vec3x8, WIDTH};

#[derive(Debug, Copy, Clone)]
struct Candidate {
    entry: Float,
    ptr: i32,
}

/// Sorts up to 8 candidates near-to-far (small insertion network).
fn sort_candidates(cands: &mut SmallVec<[Candidate; 8]>) {
    for i in 1..cands.len() {
        let mut j = i;
        while j > 0 && cands[j - 1].entry > cands[j].entry {
            cands.swap(j - 1, j);
            j -= 1;
        }
    }
}

impl Bvh8w {
    /// Closest-hit ray query over the given distance range.
    pub fn intersect_ray(&self, ray: &Ray, range: &LengthRange) -> IntersectionRecord<'static> {
        let mut counters = QueryCounters::default();
        let hit = self.ray_traverse(ray, range, &mut counters);
        self.stats.on_ray_cast(hit.is_some(), &counters);
        match hit {
            Some(h) => IntersectionRecord::Ray(h),
            None => IntersectionRecord::None,
        }
    }

    /// Returns true as soon as any triangle blocks the ray segment.
    pub fn shadow_ray(&self, ray: &Ray, range: &LengthRange) -> bool {
        let mut counters = QueryCounters::default();
        let hit = self.ray_shadow_traverse(ray, range, &mut counters);
        self.stats.on_shadow_ray_cast(hit, &counters);
        hit
    }

    /// Cone query: collects every triangle whose intersection falls within
    /// the z-search window behind the frontmost hit. The returned record
    /// borrows the per-thread scratch.
    pub fn intersect_cone<'a>(
        &self,
        cone: &EllipticCone,
        range: &LengthRange,
        opts: &IntersectOpts,
        scratch: &'a mut QueryScratch,
    ) -> IntersectionRecord<'a> {
        let mut counters = QueryCounters::default();
        let record = self.cone_traverse(cone, range, opts, false, scratch, &mut counters);
        let tris = match &record {
            IntersectionRecord::Cone(c) => c.triangles.len(),
            _ => 0,
        };
        self.stats.on_cone_cast(tris, &counters);
        record
    }

    /// Ball query: the zero-opening case of the cone query. Returns all
    /// triangles overlapping the ball, with no z-search window applied.
    pub fn intersect_ball<'a>(
        &self,
        centre: Point3f,
        radius: Length,
        opts: &IntersectOpts,
        scratch: &'a mut QueryScratch,
    ) -> IntersectionRecord<'a> {
        let d = Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0));
        let o = centre + d.v() * (-radius.0);
        let cone = EllipticCone::new(Ray::new(o, d), 0.0, radius);
        let range = LengthRange::new(Length::ZERO, radius * 2.0);
        let mut counters = QueryCounters::default();
        let record = self.cone_traverse(&cone, &range, opts, true, scratch, &mut counters);
        let tris = match &record {
            IntersectionRecord::Cone(c) => c.triangles.len(),
            _ => 0,
        };
        self.stats.on_cone_cast(tris, &counters);
        record
    }

    /// Returns true as soon as any triangle intersects the cone in range.
    pub fn shadow_cone(&self, cone: &EllipticCone, range: &LengthRange) -> bool {
        let mut counters = QueryCounters::default();
        let hit = self.cone_shadow_traverse(cone, range, &mut counters);
        self.stats.on_shadow_cone_cast(hit, &counters);
        hit
    }

    fn ray_traverse(
        &self,
        ray: &Ray,
        range: &LengthRange,
        counters: &mut QueryCounters,
    ) -> Option<RayHit> {
        if self.nodes_count() == 0 {
            return None;
        }
        let o8 = Vec3x8::splat_point(ray.o);
        let d8 = Vec3x8::splat(ray.d.v());
        let inv8 = Vec3x8::splat(Vector3f::new(
            1.0 as Float / ray.d.x(),
            1.0 as Float / ray.d.y(),
            1.0 as Float / ray.d.z(),
        ));

        let mut best: Option<RayHit> = None;
        let mut best_t: Float = range.max.0;

        let mut stack: SmallVec<[i32; 128]> = SmallVec::new();
        stack.push(self.root_ptr());
        while let Some(ptr) = stack.pop() {
            let node = self.node(child_node_ptr(ptr));
            counters.internal_nodes += 1;
            counters.ray_box8_tests += 1;
            let hit8 = intersect_ray_aabb8(&node.min, &node.max, &o8, &inv8, range.min.0, best_t);

            let mut cands: SmallVec<[Candidate; 8]> = SmallVec::new();
            for lane in 0..WIDTH {
                let p = node.child_ptrs[lane];
                if !is_ptr_empty(p) && hit8.mask.get(lane) {
                    cands.push(Candidate {
                        entry: hit8.entry.get(lane),
                        ptr: p,
                    });
                }
            }
            sort_candidates(&mut cands);

            // test leaves inline near-to-far; push interior children
            // far-to-near so the nearest is processed first
            let mut interior: SmallVec<[i32; 8]> = SmallVec::new();
            for cand in &cands {
                if cand.entry > best_t {
                    break;
                }
                if is_ptr_leaf(cand.ptr) {
                    counters.leaf_nodes += 1;
                    let leaf = self.leaf_node(leaf_node_ptr(cand.ptr));
                    self.ray_test_leaf(
                        leaf.tris_ptr,
                        leaf.count,
                        &o8,
                        &d8,
                        range.min.0,
                        &mut best_t,
                        &mut best,
                        counters,
                    );
                } else {
                    interior.push(cand.ptr);
                }
            }
            for p in interior.iter().rev() {
                stack.push(*p);
            }
        }
        best
    }

    #[allow(clippy::too_many_arguments)]
    fn ray_test_leaf(
        &self,
        tris_ptr: u32,
        count: u32,
        o8: &Vec3x8,
        d8: &Vec3x8,
        t_min: Float,
        best_t: &mut Float,
        best: &mut Option<RayHit>,
        counters: &mut QueryCounters,
    ) {
        let v = self.vectorized_tri_data();
        let end = (tris_ptr + count) as usize;
        let mut t = tris_ptr as usize;
        // group 8 triangles at a time from the vectorized arrays
        while t < end {
            counters.ray_tri8_tests += 1;
            let (a, b, c) = v.load8(t);
            let r = intersect_ray_tri8(o8, d8, &a, &b, &c, t_min, *best_t);
            let lane_valid = Mask8::from_fn(|i| t + i < end);
            let mask = r.mask.and(lane_valid);
            if mask.any() {
                for lane in 0..WIDTH {
                    if mask.get(lane) && r.t.get(lane) < *best_t {
                        *best_t = r.t.get(lane);
                        *best = Some(RayHit {
                            dist: Length(r.t.get(lane)),
                            b1: r.b1.get(lane),
                            b2: r.b2.get(lane),
                            front_face: r.front.get(lane),
                            tuid: (t + lane) as Idx,
                        });
                    }
                }
            }
            t += WIDTH;
        }
    }

    fn ray_shadow_traverse(
        &self,
        ray: &Ray,
        range: &LengthRange,
        counters: &mut QueryCounters,
    ) -> bool {
        if self.nodes_count() == 0 {
            return false;
        }
        let o8 = Vec3x8::splat_point(ray.o);
        let d8 = Vec3x8::splat(ray.d.v());
        let inv8 = Vec3x8::splat(Vector3f::new(
            1.0 as Float / ray.d.x(),
            1.0 as Float / ray.d.y(),
            1.0 as Float / ray.d.z(),
        ));

        let mut stack: SmallVec<[i32; 128]> = SmallVec::new();
        stack.push(self.root_ptr());
        while let Some(ptr) = stack.pop() {
            let node = self.node(child_node_ptr(ptr));
            counters.internal_nodes += 1;
            counters.ray_box8_tests += 1;
            let hit8 =
                intersect_ray_aabb8(&node.min, &node.max, &o8, &inv8, range.min.0, range.max.0);
            for lane in 0..WIDTH {
                let p = node.child_ptrs[lane];
                if is_ptr_empty(p) || !hit8.mask.get(lane) {
                    continue;
                }
                if is_ptr_leaf(p) {
                    counters.leaf_nodes += 1;
                    let leaf = self.leaf_node(leaf_node_ptr(p));
                    let v = self.vectorized_tri_data();
                    let end = (leaf.tris_ptr + leaf.count) as usize;
                    let mut t = leaf.tris_ptr as usize;
                    while t < end {
                        counters.shadow_ray_tri_tests += 1;
                        let (a, b, c) = v.load8(t);
                        let r = intersect_ray_tri8(&o8, &d8, &a, &b, &c, range.min.0, range.max.0);
                        let lane_valid = Mask8::from_fn(|i| t + i < end);
                        if r.mask.and(lane_valid).any() {
                            return true;
                        }
                        t += WIDTH;
                    }
                } else {
                    stack.push(p);
                }
            }
        }
        false
    }

    #[allow(clippy::too_many_arguments)]
    fn cone_test_span(
        &self,
        cone: &EllipticCone,
        range: &LengthRange,
        start: u32,
        count: u32,
        work: &mut Vec<WorkTri>,
        intr_dist: &mut Length,
        front_face: &mut bool,
        closest: &mut Idx,
        counters: &mut QueryCounters,
    ) {
        for tuid in start..start + count {
            counters.cone_tri_tests += 1;
            let tri = self.tri(tuid);
            if let Some(h) = intersect_cone_tri(cone, tri.a, tri.b, tri.c, tri.n.v(), range) {
                if h.dist < *intr_dist {
                    *intr_dist = h.dist;
                    *front_face = h.front_face;
                    *closest = tuid;
                }
                work.push(WorkTri { tuid, dist: h.dist });
            }
        }
    }

    fn cone_traverse<'a>(
        &self,
        cone: &EllipticCone,
        range: &LengthRange,
        opts: &IntersectOpts,
        is_ball: bool,
        scratch: &'a mut QueryScratch,
        counters: &mut QueryCounters,
    ) -> IntersectionRecord<'a> {
        let QueryScratch {
            triangles,
            edges,
            work,
            stack,
        } = scratch;
        work.clear();
        stack.clear();

        let mut intr_dist = Length::INFINITY;
        let mut front_face = false;
        let mut closest: Idx = 0;

        if self.nodes_count() > 0 {
            stack.push(self.root_ptr());
        }
        while let Some(ptr) = stack.pop() {
            let node = self.node(child_node_ptr(ptr));
            counters.internal_nodes += 1;
            for lane in 0..WIDTH {
                let p = node.child_ptrs[lane];
                if is_ptr_empty(p) {
                    continue;
                }
                counters.cone_box_tests += 1;
                let p_min = Point3f::new(
                    node.min.x.get(lane),
                    node.min.y.get(lane),
                    node.min.z.get(lane),
                );
                let p_max = Point3f::new(
                    node.max.x.get(lane),
                    node.max.y.get(lane),
                    node.max.z.get(lane),
                );
                match classify_cone_aabb(cone, p_min, p_max, range) {
                    ConeAabbFate::Disjoint => {}
                    ConeAabbFate::Contained => {
                        // harvest the whole subtree as one unit
                        if is_ptr_leaf(p) {
                            counters.leaf_nodes += 1;
                            let leaf = self.leaf_node(leaf_node_ptr(p));
                            self.cone_test_span(
                                cone,
                                range,
                                leaf.tris_ptr,
                                leaf.count,
                                work,
                                &mut intr_dist,
                                &mut front_face,
                                &mut closest,
                                counters,
                            );
                        } else {
                            counters.subtrees += 1;
                            let child = self.node(child_node_ptr(p));
                            self.cone_test_span(
                                cone,
                                range,
                                child.tris_start,
                                child.tris_count,
                                work,
                                &mut intr_dist,
                                &mut front_face,
                                &mut closest,
                                counters,
                            );
                        }
                    }
                    ConeAabbFate::Partial => {
                        if is_ptr_leaf(p) {
                            counters.leaf_nodes += 1;
                            let leaf = self.leaf_node(leaf_node_ptr(p));
                            self.cone_test_span(
                                cone,
                                range,
                                leaf.tris_ptr,
                                leaf.count,
                                work,
                                &mut intr_dist,
                                &mut front_face,
                                &mut closest,
                                counters,
                            );
                        } else {
                            stack.push(p);
                        }
                    }
                }
            }
        }

        // clear the thread-local output lists unless accumulating
        if !opts.accumulate_triangles {
            triangles.clear();
        }
        if !opts.accumulate_edges {
            edges.clear();
        }

        // accept triangles within the z-search window behind the closest hit
        let w_max = if is_ball {
            range.max
        } else {
            let d_min = range.min.max(intr_dist);
            let z_dist = cone.axes(d_min).x * opts.z_search_range_scale;
            range.max.min(d_min + z_dist)
        };
        for wt in work.iter() {
            if wt.dist > w_max {
                continue;
            }
            triangles.push(wt.tuid);
            if opts.detect_edges {
                for e in self.tri(wt.tuid).edge_refs().iter() {
                    if *e != INVALID_IDX {
                        edges.push(*e);
                    }
                }
            }
        }
        edges.sort_unstable();
        edges.dedup();

        if triangles.is_empty() {
            IntersectionRecord::None
        } else {
            IntersectionRecord::Cone(ConeHit {
                dist: if is_ball { Length::ZERO } else { intr_dist },
                front_face,
                closest,
                triangles,
                edges,
            })
        }
    }

    fn cone_shadow_traverse(
        &self,
        cone: &EllipticCone,
        range: &LengthRange,
        counters: &mut QueryCounters,
    ) -> bool {
        if self.nodes_count() == 0 {
            return false;
        }
        let mut stack: SmallVec<[i32; 128]> = SmallVec::new();
        stack.push(self.root_ptr());
        while let Some(ptr) = stack.pop() {
            let node = self.node(child_node_ptr(ptr));
            counters.internal_nodes += 1;
            for lane in 0..WIDTH {
                let p = node.child_ptrs[lane];
                if is_ptr_empty(p) {
                    continue;
                }
                counters.cone_box_tests += 1;
                let p_min = Point3f::new(
                    node.min.x.get(lane),
                    node.min.y.get(lane),
                    node.min.z.get(lane),
                );
                let p_max = Point3f::new(
                    node.max.x.get(lane),
                    node.max.y.get(lane),
                    node.max.z.get(lane),
                );
                let fate = classify_cone_aabb(cone, p_min, p_max, range);
                if fate == ConeAabbFate::Disjoint {
                    continue;
                }
                let span = if is_ptr_leaf(p) {
                    counters.leaf_nodes += 1;
                    let leaf = self.leaf_node(leaf_node_ptr(p));
                    Some((leaf.tris_ptr, leaf.count))
                } else if fate == ConeAabbFate::Contained {
                    counters.subtrees += 1;
                    let child = self.node(child_node_ptr(p));
                    Some((child.tris_start, child.tris_count))
                } else {
                    stack.push(p);
                    None
                };
                if let Some((start, count)) = span {
                    for tuid in start..start + count {
                        counters.shadow_cone_tri_tests += 1;
                        let tri = self.tri(tuid);
                        if crate::core::intersect::test_cone_tri(
                            cone,
                            tri.a,
                            tri.b,
                            tri.c,
                            tri.n.v(),
                            range,
                        ) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerators::bvh::make_triangle;
    use crate::accelerators::bvh8w::BuildOpts;
    use crate::accelerators::Triangle;
    use crate::core::rng::Rng;

    fn small_tri_at(x: Float, y: Float, z: Float, id: u32) -> Triangle {
        make_triangle(
            Point3f::new(x - 0.5, y - 0.5, z),
            Point3f::new(x + 0.5, y - 0.5, z),
            Point3f::new(x, y + 0.5, z),
            0,
            id,
        )
    }

    fn build(tris: Vec<Triangle>) -> Bvh8w {
        Bvh8w::build(tris, &BuildOpts::default(), None).unwrap()
    }

    #[test]
    fn closest_hit_picks_nearest_of_stacked_triangles() {
        let ads = build(vec![
            small_tri_at(0.0, 0.0, 5.0, 0),
            small_tri_at(0.0, 0.0, 2.0, 1),
            small_tri_at(0.0, 0.0, 9.0, 2),
        ]);
        let ray = Ray::new(
            Point3f::default(),
            Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
        );
        let rec = ads.intersect_ray(&ray, &LengthRange::positive());
        let hit = rec.ray_hit().unwrap();
        assert!((hit.dist.0 - 2.0).abs() < 1e-5);
        assert_eq!(ads.tri(hit.tuid).shape_tri_idx, 1);
        // restricting the range skips the nearest
        let rec = ads.intersect_ray(&ray, &LengthRange::new(Length(3.0), Length(6.0)));
        assert!((rec.distance().0 - 5.0).abs() < 1e-5);
    }

    #[test]
    fn every_triangle_centroid_is_its_own_closest_hit() {
        let mut rng = Rng::new(11, 4);
        let tris: Vec<Triangle> = (0..256)
            .map(|i| {
                small_tri_at(
                    rng.uniform_float() * 20.0,
                    rng.uniform_float() * 20.0,
                    rng.uniform_float() * 20.0,
                    i,
                )
            })
            .collect();
        let ads = build(tris);
        for tuid in 0..ads.triangles_count() as Idx {
            let tri = *ads.tri(tuid);
            let centroid = tri.centroid();
            let o = centroid + tri.n.v() * 0.25;
            let ray = Ray::new(o, Dir3::from_normalized(-tri.n.v()));
            let rec = ads.intersect_ray(&ray, &LengthRange::positive());
            let hit = rec.ray_hit().expect("centroid ray must hit");
            // another triangle may coincidentally sit closer along this ray;
            // the reported hit must then be strictly closer
            assert!(hit.dist.0 <= 0.25 + 1e-4);
        }
    }

    #[test]
    fn shadow_matches_intersect() {
        let ads = build(vec![small_tri_at(0.0, 0.0, 5.0, 0)]);
        let ray = Ray::new(
            Point3f::default(),
            Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
        );
        assert!(ads.shadow_ray(&ray, &LengthRange::positive()));
        assert!(!ads.shadow_ray(&ray, &LengthRange::new(Length::ZERO, Length(4.0))));
        let miss = Ray::new(
            Point3f::new(50.0, 0.0, 0.0),
            Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
        );
        assert!(!ads.shadow_ray(&miss, &LengthRange::positive()));
    }

    #[test]
    fn ball_query_returns_exactly_the_contained_triangles() {
        // triangles at 0 m, 10 m and 100 m on the x axis
        let ads = build(vec![
            small_tri_at(0.0, 0.0, 0.0, 0),
            small_tri_at(10.0, 0.0, 0.0, 1),
            small_tri_at(100.0, 0.0, 0.0, 2),
        ]);
        let mut scratch = QueryScratch::new();
        let rec = ads.intersect_ball(
            Point3f::default(),
            Length(15.0),
            &IntersectOpts::default(),
            &mut scratch,
        );
        match rec {
            IntersectionRecord::Cone(c) => {
                let mut ids: Vec<u32> =
                    c.triangles.iter().map(|&t| ads.tri(t).shape_tri_idx).collect();
                ids.sort_unstable();
                assert_eq!(ids, vec![0, 1]);
            }
            _ => panic!("expected a multi-triangle record"),
        }
    }

    #[test]
    fn cone_query_zero_search_window_returns_only_the_closest() {
        let ads = build(vec![
            small_tri_at(0.0, 0.0, 2.0, 0),
            small_tri_at(0.0, 0.0, 2.6, 1),
            small_tri_at(0.0, 0.0, 9.0, 2),
        ]);
        let cone = EllipticCone::new(
            Ray::new(
                Point3f::default(),
                Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
            ),
            0.05,
            Length(0.01),
        );
        let mut scratch = QueryScratch::new();
        let opts = IntersectOpts {
            z_search_range_scale: 0.0,
            ..IntersectOpts::default()
        };
        let rec = ads.intersect_cone(&cone, &LengthRange::positive(), &opts, &mut scratch);
        match rec {
            IntersectionRecord::Cone(c) => {
                assert_eq!(c.triangles.len(), 1);
                assert_eq!(ads.tri(c.triangles[0]).shape_tri_idx, 0);
                assert!((c.dist.0 - 2.0).abs() < 1e-4);
            }
            _ => panic!("expected cone record"),
        }
        // with a wide window the second triangle joins the record
        let opts = IntersectOpts {
            z_search_range_scale: 8.0,
            ..IntersectOpts::default()
        };
        let rec = ads.intersect_cone(&cone, &LengthRange::positive(), &opts, &mut scratch);
        match rec {
            IntersectionRecord::Cone(c) => {
                assert_eq!(c.triangles.len(), 2);
            }
            _ => panic!("expected cone record"),
        }
    }

    #[test]
    fn cone_query_collects_edges_of_hit_triangles() {
        let ads = build(vec![
            small_tri_at(0.0, 0.0, 3.0, 0),
            small_tri_at(0.2, 0.0, 3.0, 1),
        ]);
        let cone = EllipticCone::new(
            Ray::new(
                Point3f::default(),
                Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
            ),
            0.2,
            Length(0.1),
        );
        let mut scratch = QueryScratch::new();
        let rec = ads.intersect_cone(
            &cone,
            &LengthRange::positive(),
            &IntersectOpts::default(),
            &mut scratch,
        );
        match rec {
            IntersectionRecord::Cone(c) => {
                assert!(!c.triangles.is_empty());
                assert!(!c.edges.is_empty());
                // edge list is deduplicated and sorted
                for w in c.edges.windows(2) {
                    assert!(w[0] < w[1]);
                }
            }
            _ => panic!("expected cone record"),
        }
    }

    #[test]
    fn cone_shadow_true_only_when_blocked() {
        let ads = build(vec![small_tri_at(0.0, 0.0, 5.0, 0)]);
        let hit_cone = EllipticCone::new(
            Ray::new(
                Point3f::default(),
                Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
            ),
            0.05,
            Length(0.01),
        );
        assert!(ads.shadow_cone(&hit_cone, &LengthRange::positive()));
        let miss_cone = EllipticCone::new(
            Ray::new(
                Point3f::default(),
                Dir3::from_normalized(Vector3f::new(0.0, 0.0, -1.0)),
            ),
            0.05,
            Length(0.01),
        );
        assert!(!ads.shadow_cone(&miss_cone, &LengthRange::positive()));
    }

    #[test]
    fn accumulate_option_keeps_previous_results() {
        let ads = build(vec![
            small_tri_at(0.0, 0.0, 2.0, 0),
            small_tri_at(30.0, 0.0, 2.0, 1),
        ]);
        let mut scratch = QueryScratch::new();
        let mk_cone = |x: Float| {
            EllipticCone::new(
                Ray::new(
                    Point3f::new(x, 0.0, 0.0),
                    Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
                ),
                0.05,
                Length(0.01),
            )
        };
        let opts = IntersectOpts {
            accumulate_triangles: true,
            accumulate_edges: true,
            ..IntersectOpts::default()
        };
        let _ = ads.intersect_cone(&mk_cone(0.0), &LengthRange::positive(), &opts, &mut scratch);
        let rec = ads.intersect_cone(&mk_cone(30.0), &LengthRange::positive(), &opts, &mut scratch);
        match rec {
            IntersectionRecord::Cone(c) => assert_eq!(c.triangles.len(), 2),
            _ => panic!("expected cone record"),
        }
    }
}
