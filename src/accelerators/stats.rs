//! ADS statistics reporting: per-query counters flushed to an optional
//! stats sink.

// std
use std::sync::Arc;
// wavert
use crate::stats::StatsSink;

static RAY_CAST_LABELS: [&str; 3] = ["hit", "miss", "esc"];
static CONE_CAST_LABELS: [&str; 4] = ["1 hit", ">1 hit", "miss", "esc"];
// six categories; the last two slots are reserved
static INTERSECTION_TEST_LABELS: [&str; 6] =
    ["8x ray-tri", "8x ray-box", "cone-box", "cone-tri", "", ""];
static SHADOW_TEST_LABELS: [&str; 2] = ["ray-tri", "cone-tri"];
static CONE_NODE_TYPE_LABELS: [&str; 3] = ["internal", "leaf", "subtree"];

/// Counters gathered over a single traversal query.
#[derive(Debug, Default, Copy, Clone)]
pub struct QueryCounters {
    pub internal_nodes: u32,
    pub leaf_nodes: u32,
    pub subtrees: u32,
    pub ray_tri8_tests: u32,
    pub ray_box8_tests: u32,
    pub cone_box_tests: u32,
    pub cone_tri_tests: u32,
    pub shadow_ray_tri_tests: u32,
    pub shadow_cone_tri_tests: u32,
}

impl QueryCounters {
    pub fn nodes_visited(&self) -> u32 {
        self.internal_nodes + self.leaf_nodes + self.subtrees
    }
}

/// Stats configuration of one ADS: an optional sink, and a flag for the
/// verbose counters (test counts, node histograms, node-type split).
#[derive(Default, Clone)]
pub struct AdsStats {
    sink: Option<Arc<dyn StatsSink>>,
    pub additional: bool,
}

impl AdsStats {
    pub fn new(sink: Option<Arc<dyn StatsSink>>, additional: bool) -> Self {
        AdsStats { sink, additional }
    }

    pub fn enabled(&self) -> bool {
        self.sink.is_some()
    }

    fn flush_tests(&self, sink: &dyn StatsSink, c: &QueryCounters) {
        sink.event(
            "(ADS) tests intersection",
            &INTERSECTION_TEST_LABELS,
            0,
            c.ray_tri8_tests as u64,
        );
        sink.event(
            "(ADS) tests intersection",
            &INTERSECTION_TEST_LABELS,
            1,
            c.ray_box8_tests as u64,
        );
        sink.event(
            "(ADS) tests intersection",
            &INTERSECTION_TEST_LABELS,
            2,
            c.cone_box_tests as u64,
        );
        sink.event(
            "(ADS) tests intersection",
            &INTERSECTION_TEST_LABELS,
            3,
            c.cone_tri_tests as u64,
        );
        sink.event(
            "(ADS) tests shadow",
            &SHADOW_TEST_LABELS,
            0,
            c.shadow_ray_tri_tests as u64,
        );
        sink.event(
            "(ADS) tests shadow",
            &SHADOW_TEST_LABELS,
            1,
            c.shadow_cone_tri_tests as u64,
        );
    }

    fn flush_cone_nodes(&self, sink: &dyn StatsSink, c: &QueryCounters) {
        sink.histogram("(ADS) nodes visited (cone)", c.nodes_visited() as u64);
        sink.event(
            "(ADS) node types (cone)",
            &CONE_NODE_TYPE_LABELS,
            0,
            c.internal_nodes as u64,
        );
        sink.event(
            "(ADS) node types (cone)",
            &CONE_NODE_TYPE_LABELS,
            1,
            c.leaf_nodes as u64,
        );
        sink.event(
            "(ADS) node types (cone)",
            &CONE_NODE_TYPE_LABELS,
            2,
            c.subtrees as u64,
        );
    }

    pub fn on_ray_cast(&self, hit: bool, c: &QueryCounters) {
        if let Some(sink) = &self.sink {
            sink.event(
                "(ADS) casts ray",
                &RAY_CAST_LABELS,
                if hit { 0 } else { 1 },
                1,
            );
            if self.additional {
                sink.histogram("(ADS) nodes visited (ray)", c.nodes_visited() as u64);
                self.flush_tests(sink.as_ref(), c);
            }
        }
    }

    pub fn on_cone_cast(&self, tris_returned: usize, c: &QueryCounters) {
        if let Some(sink) = &self.sink {
            let category = match tris_returned {
                0 => 2,
                1 => 0,
                _ => 1,
            };
            sink.event("(ADS) casts cone", &CONE_CAST_LABELS, category, 1);
            if tris_returned > 0 {
                sink.histogram("(ADS) tris per cone", tris_returned as u64);
            }
            if self.additional {
                self.flush_cone_nodes(sink.as_ref(), c);
                self.flush_tests(sink.as_ref(), c);
            }
        }
    }

    pub fn on_shadow_ray_cast(&self, hit: bool, c: &QueryCounters) {
        self.on_ray_cast(hit, c);
    }

    pub fn on_shadow_cone_cast(&self, hit: bool, c: &QueryCounters) {
        if let Some(sink) = &self.sink {
            sink.event(
                "(ADS) casts cone",
                &CONE_CAST_LABELS,
                if hit { 0 } else { 2 },
                1,
            );
            if self.additional {
                self.flush_cone_nodes(sink.as_ref(), c);
                self.flush_tests(sink.as_ref(), c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Registry;

    #[test]
    fn flushes_to_sink() {
        let registry = Arc::new(Registry::default());
        let stats = AdsStats::new(Some(registry.clone()), true);
        let mut c = QueryCounters::default();
        c.internal_nodes = 3;
        c.leaf_nodes = 2;
        c.subtrees = 1;
        c.cone_tri_tests = 7;
        stats.on_cone_cast(4, &c);
        assert_eq!(registry.event_total("(ADS) casts cone"), 1);
        assert_eq!(registry.event_total("(ADS) node types (cone)"), 6);
    }

    #[test]
    fn disabled_sink_is_a_noop() {
        let stats = AdsStats::default();
        assert!(!stats.enabled());
        stats.on_ray_cast(true, &QueryCounters::default());
    }
}
