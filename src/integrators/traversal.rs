//! Hybrid ballistic-diffusive beam traversal.
//!
//! Beams near their origin are nearly coherent and act as rays; far from
//! the origin the envelope widens enough that a cone query is meaningful.
//! The driver alternates short ballistic (ray) segments with attempts to
//! restart diffusive (cone) propagation.

// wavert
use crate::accelerators::{Bvh8w, ConeHit, IntersectOpts, IntersectionRecord, QueryScratch};
use crate::beam;
use crate::core::elliptic_cone::EllipticCone;
use crate::core::geometry::{Point3f, Ray, Vector2f, Vector3f};
use crate::core::quantity::{Float, Length, LengthRange};

/// For numerical reasons: scale ballistic propagation distance by a little,
/// so the ballistic and diffusive segments are guaranteed to overlap.
pub const BALLISTIC_SCALE: Float = 1.001;

const MAX_BALLISTIC_SEGMENTS: u32 = 16;
const BALLISTIC_SEGMENT_LAMBDAS: u64 = 8;
const MAX_BALLISTIC_SEGMENT_LAMBDAS: u64 = 1 << 16;

// minimal distance is the self-intersection distance, scaled a little
const SCALE_SELF_INTRS_DIST: Float = 1.05;

/// The distance past the real ray origin over which the envelope does not
/// yet contain the mean ray; computed in closed form from the
/// eccentricity-adjusted local coordinates of the ray origin.
pub fn calculate_min_ballistic_distance(envelope: &EllipticCone, ray: &Ray) -> Length {
    if ray.o != envelope.o() {
        let l = envelope.frame().to_local(&(ray.o - envelope.o()));
        let rl = Vector3f::new(l.x, l.y * envelope.e(), l.z);
        let radial = Vector2f { x: rl.x, y: rl.y }.length();
        let dist_to_ray_inclusion =
            (radial - envelope.x0().0) / envelope.tan_alpha() - rl.z;
        return Length(0.0_f32.max(-rl.z).max(dist_to_ray_inclusion));
    }
    Length::ZERO
}

/// Ballistic-distance budget of segment `seg`: a few powers-of-four
/// wavelengths, clamped, past the minimum ballistic distance.
pub fn max_ballistic_distance(lambda: Length, segment: u32, min_ballistic_distance: Length) -> Length {
    let min_dist = min_ballistic_distance * SCALE_SELF_INTRS_DIST;
    let b = MAX_BALLISTIC_SEGMENT_LAMBDAS
        .min(BALLISTIC_SEGMENT_LAMBDAS << (2 * segment as u64 + 1));
    if segment >= MAX_BALLISTIC_SEGMENTS {
        Length::INFINITY
    } else {
        min_dist + lambda * b as Float
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TraversalOpts {
    pub force_ray_tracing: bool,
    pub detect_edges: bool,
    pub accumulate_edges: bool,
}

impl Default for TraversalOpts {
    fn default() -> Self {
        TraversalOpts {
            force_ray_tracing: false,
            detect_edges: true,
            accumulate_edges: false,
        }
    }
}

/// Result of a beam traversal.
#[derive(Debug)]
pub struct TraversalResult<'a> {
    /// Origin of beam traversal; the real origin, possibly shifted for
    /// self-intersection avoidance.
    pub origin: Point3f,
    pub record: IntersectionRecord<'a>,
    /// z distance (starting from the record distance) over which triangles
    /// are considered for intersection.
    pub intersection_region_depth: Length,
    /// Was traversal ballistic?
    pub ballistic: bool,
}

#[derive(Debug, Copy, Clone)]
pub struct ShadowResult {
    pub shadow: bool,
    pub ballistic: bool,
}

enum DiffusiveDecision {
    /// Cone query accepted; scratch holds the result.
    Accept {
        dist: Length,
        front_face: bool,
        closest: u32,
        empty: bool,
    },
    /// Too close to the frontier; continue ballistically.
    Continue,
}

/// Traverses the ADS with a beam envelope: short coherent ray segments near
/// the origin, diffusive cone queries once the envelope contains the mean
/// ray with margin.
pub fn traverse<'a>(
    ads: &Bvh8w,
    envelope: &EllipticCone,
    lambda: Length,
    distance: Length,
    opts: &TraversalOpts,
    scratch: &'a mut QueryScratch,
) -> TraversalResult<'a> {
    let ray = *envelope.ray();

    let ray_trace = opts.force_ray_tracing || envelope.is_ray();
    if ray_trace {
        // pure ray tracing mode
        return TraversalResult {
            origin: ray.o,
            record: ads.intersect_ray(&ray, &LengthRange::new(Length::ZERO, distance)),
            intersection_region_depth: Length::ZERO,
            ballistic: true,
        };
    }

    // start with ballistic propagation and try to resume diffusive
    // propagation after short distances
    let min_ballistic_distance = calculate_min_ballistic_distance(envelope, &ray);
    let z_search_range = beam::major_axis_to_z_scale();

    let mut dist = Length::ZERO;
    let mut seg: u32 = 0;
    let accepted: Option<(Length, DiffusiveDecision)> = loop {
        let ballistic_dist = max_ballistic_distance(lambda, seg, min_ballistic_distance);
        let bl_range = LengthRange::new(
            dist,
            distance.min(dist + ballistic_dist * BALLISTIC_SCALE),
        );
        if let IntersectionRecord::Ray(hit) = ads.intersect_ray(&ray, &bl_range) {
            return TraversalResult {
                origin: ray.o,
                record: IntersectionRecord::Ray(hit),
                intersection_region_depth: Length::ZERO,
                ballistic: true,
            };
        }

        // no intersection found; propagate the beam
        dist += ballistic_dist;
        // maximum ballistic attempts reached?
        if !ballistic_dist.is_finite() || dist >= distance {
            return TraversalResult {
                origin: ray.o,
                record: IntersectionRecord::None,
                intersection_region_depth: Length::ZERO,
                ballistic: true,
            };
        }

        debug_assert!(envelope.contains(ray.propagate(dist), &LengthRange::positive()));

        // attempt diffusive propagation
        let min_df_prog = envelope.axes(dist).x / 2.0;
        let decision = {
            let cone_opts = IntersectOpts {
                detect_edges: opts.detect_edges,
                accumulate_edges: opts.accumulate_edges,
                accumulate_triangles: false,
                z_search_range_scale: z_search_range,
            };
            let record = ads.intersect_cone(
                envelope,
                &LengthRange::new(dist, distance),
                &cone_opts,
                &mut *scratch,
            );
            match record {
                IntersectionRecord::Cone(c) => {
                    // successful diffusive propagation only if the closest
                    // hit is comfortably ahead of the frontier
                    if c.dist - dist >= min_df_prog {
                        DiffusiveDecision::Accept {
                            dist: c.dist,
                            front_face: c.front_face,
                            closest: c.closest,
                            empty: false,
                        }
                    } else {
                        DiffusiveDecision::Continue
                    }
                }
                _ => DiffusiveDecision::Accept {
                    dist: Length::INFINITY,
                    front_face: false,
                    closest: 0,
                    empty: true,
                },
            }
        };
        if matches!(decision, DiffusiveDecision::Accept { .. }) {
            break Some((dist, decision));
        }
        // ... too short: continue the ballistic path
        seg += 1;
    };

    match accepted {
        Some((
            _frontier,
            DiffusiveDecision::Accept {
                dist,
                front_face,
                closest,
                empty,
            },
        )) => {
            if empty {
                TraversalResult {
                    origin: envelope.o(),
                    record: IntersectionRecord::None,
                    intersection_region_depth: Length::ZERO,
                    ballistic: false,
                }
            } else {
                let depth = envelope.axes(dist).x * z_search_range;
                TraversalResult {
                    origin: envelope.o(),
                    record: IntersectionRecord::Cone(ConeHit {
                        dist,
                        front_face,
                        closest,
                        triangles: &scratch.triangles,
                        edges: &scratch.edges,
                    }),
                    intersection_region_depth: depth,
                    ballistic: false,
                }
            }
        }
        _ => unreachable!(),
    }
}

/// Shadow query of the same shape: ballistic ray-shadow segments
/// interleaved with cone-shadow queries.
pub fn traverse_shadow(
    ads: &Bvh8w,
    envelope: &EllipticCone,
    lambda: Length,
    distance: Length,
    opts: &TraversalOpts,
) -> ShadowResult {
    let ray = *envelope.ray();

    let ray_trace = opts.force_ray_tracing || envelope.is_ray();
    if ray_trace {
        return ShadowResult {
            shadow: ads.shadow_ray(&ray, &LengthRange::new(Length::ZERO, distance)),
            ballistic: true,
        };
    }

    let min_ballistic_distance = calculate_min_ballistic_distance(envelope, &ray);

    let mut dist = Length::ZERO;
    let mut seg: u32 = 0;
    loop {
        let ballistic_dist = max_ballistic_distance(lambda, seg, min_ballistic_distance);
        let range = LengthRange::new(dist, (dist + ballistic_dist) * BALLISTIC_SCALE);
        if ads.shadow_ray(&ray, &range) {
            return ShadowResult {
                shadow: true,
                ballistic: true,
            };
        }

        // no intersection found; propagate the beam
        dist += ballistic_dist;
        if !dist.is_finite() || dist >= distance {
            return ShadowResult {
                shadow: false,
                ballistic: true,
            };
        }

        // attempt diffusive propagation
        let min_df_prog = envelope.axes(dist).x;
        let df_shadow = ads.shadow_cone(
            envelope,
            &LengthRange::new(dist, distance.min(dist + min_df_prog)),
        );
        if !df_shadow && dist + min_df_prog >= distance {
            return ShadowResult {
                shadow: false,
                ballistic: false,
            };
        } else if !df_shadow {
            // do a proper cone shadow query over the remaining range
            return ShadowResult {
                shadow: ads.shadow_cone(envelope, &LengthRange::new(dist, distance)),
                ballistic: false,
            };
        }

        // ... too close to the frontier: continue the ballistic path
        seg += 1;
    }
}

/// Ray shadow query between two world positions with self-intersection
/// offsets applied at both ends.
pub fn shadow_between(ads: &Bvh8w, start: Point3f, end: Point3f) -> bool {
    let d = end - start;
    let len = d.length();
    if len <= 0.0 {
        return false;
    }
    let dir = crate::core::geometry::Dir3::from_normalized(d / len);
    let eps = 1e-4 as Float * len.max(1.0);
    ads.shadow_ray(
        &Ray::new(start, dir),
        &LengthRange::new(Length(eps), Length(len - eps)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerators::bvh::make_triangle;
    use crate::accelerators::bvh8w::BuildOpts;
    use crate::core::geometry::Dir3;
    use crate::core::quantity::Wavenumber;

    fn single_plate() -> Bvh8w {
        let tris = vec![
            make_triangle(
                Point3f::new(-2.0, -2.0, 10.0),
                Point3f::new(2.0, -2.0, 10.0),
                Point3f::new(2.0, 2.0, 10.0),
                0,
                0,
            ),
            make_triangle(
                Point3f::new(-2.0, -2.0, 10.0),
                Point3f::new(2.0, 2.0, 10.0),
                Point3f::new(-2.0, 2.0, 10.0),
                0,
                1,
            ),
        ];
        Bvh8w::build(tris, &BuildOpts::default(), None).unwrap()
    }

    fn z_cone(tan_alpha: Float, x0: Length) -> EllipticCone {
        EllipticCone::new(
            Ray::new(
                Point3f::default(),
                Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
            ),
            tan_alpha,
            x0,
        )
    }

    #[test]
    fn ballistic_schedule_grows_and_caps() {
        let lambda = Length(500e-9);
        let b0 = max_ballistic_distance(lambda, 0, Length::ZERO);
        let b1 = max_ballistic_distance(lambda, 1, Length::ZERO);
        assert!((b0.0 - 16.0 * 500e-9).abs() < 1e-10);
        assert!(b1 > b0);
        // the per-segment budget saturates at 2^16 wavelengths
        let b7 = max_ballistic_distance(lambda, 7, Length::ZERO);
        let b8 = max_ballistic_distance(lambda, 8, Length::ZERO);
        assert_eq!(b7, b8);
        assert!((b8.0 - 65536.0 * 500e-9).abs() < 1e-6);
        // the 17th attempt gives up
        assert!(!max_ballistic_distance(lambda, 16, Length::ZERO).is_finite());
    }

    #[test]
    fn min_ballistic_distance_for_offset_origin() {
        let cone = z_cone(0.1, Length(0.0));
        // ray origin displaced sideways from the envelope origin
        let ray = Ray::new(
            Point3f::new(0.05, 0.0, 0.0),
            Dir3::from_normalized(Vector3f::new(0.0, 0.0, 1.0)),
        );
        let d = calculate_min_ballistic_distance(&cone, &ray);
        // inclusion when 0.05 <= tan_alpha * z: z = 0.5
        assert!((d.0 - 0.5).abs() < 1e-5);
        // on-axis rays need no ballistic lead
        assert_eq!(
            calculate_min_ballistic_distance(&cone, cone.ray()),
            Length::ZERO
        );
    }

    #[test]
    fn degenerate_ray_beam_always_takes_the_ballistic_branch() {
        let ads = single_plate();
        let cone = z_cone(0.0, Length::ZERO);
        let mut scratch = QueryScratch::new();
        let res = traverse(
            &ads,
            &cone,
            Length(500e-9),
            Length::INFINITY,
            &TraversalOpts::default(),
            &mut scratch,
        );
        assert!(res.ballistic);
        assert!((res.record.distance().0 - 10.0).abs() < 1e-4);
        assert_eq!(res.intersection_region_depth, Length::ZERO);
    }

    #[test]
    fn wide_beam_restarts_diffusive_propagation() {
        let ads = single_plate();
        let k = Wavenumber::from_wavelength(Length(500e-9));
        let cone = z_cone(0.05, Length(1e-4));
        let mut scratch = QueryScratch::new();
        let res = traverse(
            &ads,
            &cone,
            k.wavelength(),
            Length::INFINITY,
            &TraversalOpts::default(),
            &mut scratch,
        );
        // the plate sits 10 m out; all ballistic segments are far shorter
        assert!(!res.ballistic);
        match res.record {
            IntersectionRecord::Cone(c) => {
                assert!((c.dist.0 - 10.0).abs() < 1e-3);
                assert!(!c.triangles.is_empty());
                assert!(res.intersection_region_depth > Length::ZERO);
            }
            _ => panic!("expected a diffusive record"),
        }
    }

    #[test]
    fn force_ray_tracing_short_circuits_the_driver() {
        let ads = single_plate();
        let cone = z_cone(0.05, Length(1e-4));
        let mut scratch = QueryScratch::new();
        let opts = TraversalOpts {
            force_ray_tracing: true,
            ..TraversalOpts::default()
        };
        let res = traverse(
            &ads,
            &cone,
            Length(500e-9),
            Length::INFINITY,
            &opts,
            &mut scratch,
        );
        assert!(res.ballistic);
        assert!(matches!(res.record, IntersectionRecord::Ray(_)));
    }

    #[test]
    fn empty_halfspace_escapes_within_sixteen_attempts() {
        let ads = single_plate();
        // 1 degree half-angle cone pointed away from all geometry
        let cone = EllipticCone::new(
            Ray::new(
                Point3f::default(),
                Dir3::from_normalized(Vector3f::new(0.0, 0.0, -1.0)),
            ),
            (1.0_f32.to_radians()).tan(),
            Length(1e-5),
        );
        let res = traverse_shadow(
            &ads,
            &cone,
            Length(500e-9),
            Length::INFINITY,
            &TraversalOpts::default(),
        );
        assert!(!res.shadow);
    }

    #[test]
    fn shadow_driver_detects_the_plate() {
        let ads = single_plate();
        let cone = z_cone(0.05, Length(1e-4));
        let res = traverse_shadow(
            &ads,
            &cone,
            Length(500e-9),
            Length(50.0),
            &TraversalOpts::default(),
        );
        assert!(res.shadow);
        assert!(shadow_between(
            &ads,
            Point3f::default(),
            Point3f::new(0.0, 0.0, 20.0)
        ));
        assert!(!shadow_between(
            &ads,
            Point3f::default(),
            Point3f::new(0.0, 0.0, 5.0)
        ));
    }
}
