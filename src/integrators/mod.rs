//! Integrators: the hybrid traversal driver and the bidirectional path
//! tracer over beams, plus the parallel render loop.

pub mod bdpt;
pub mod traversal;

// std
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
// others
use rayon::prelude::*;
use tracing::info;
// wavert
use crate::integrators::bdpt::BdptArena;
use crate::samplers::SobolSampler;
use crate::scene::Scene;
use crate::sensors::block::{BlockHandle, BlockQueue};
use crate::sensors::film::Film;

/// Cooperative cancellation and progress shared with the render workers.
pub struct RenderControl {
    pub terminate: AtomicBool,
    pub samples_done: AtomicU64,
    pub samples_total: AtomicU64,
}

impl Default for RenderControl {
    fn default() -> Self {
        RenderControl {
            terminate: AtomicBool::new(false),
            samples_done: AtomicU64::new(0),
            samples_total: AtomicU64::new(0),
        }
    }
}

impl RenderControl {
    pub fn fraction_complete(&self) -> f64 {
        let total = self.samples_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.samples_done.load(Ordering::Relaxed) as f64 / total as f64
    }
}

/// Renders one sensor into its film: workers drain spiral-ordered blocks,
/// each owned by exactly one worker while it renders.
pub fn render_sensor(scene: &Scene, sensor_idx: usize, film: &Film, control: &RenderControl) {
    let sensor = &scene.sensors[sensor_idx];
    let spe = sensor.samples_per_element;
    let blocks = sensor.sensor_blocks();
    let (w, h) = sensor.resolution();
    control.samples_total.store(
        w as u64 * h as u64 * spe as u64,
        Ordering::Relaxed,
    );
    control.samples_done.store(0, Ordering::Relaxed);
    let queue = BlockQueue::new(blocks);

    info!(
        sensor = sensor.id.as_str(),
        blocks = queue.len(),
        spe,
        "rendering"
    );

    let workers = rayon::current_num_threads().max(1);
    (0..workers).into_par_iter().for_each(|worker| {
        let mut arena = BdptArena::new();
        let mut sampler = SobolSampler::new(0x9e37 ^ (worker as u64) << 17 ^ sensor_idx as u64);
        while let Some((block_id, bounds)) = queue.next() {
            if control.terminate.load(Ordering::Relaxed) {
                break;
            }
            // the handle releases into the film storage on every exit path
            let handle = BlockHandle::acquire(film, block_id, bounds);
            for y in bounds.p_min.y..bounds.p_max.y {
                for x in bounds.p_min.x..bounds.p_max.x {
                    if control.terminate.load(Ordering::Relaxed) {
                        // drain: publish what this element has so far
                        break;
                    }
                    bdpt::integrate_element(
                        scene,
                        sensor_idx,
                        &handle,
                        (x as u32, y as u32),
                        spe,
                        &mut arena,
                        &mut sampler,
                    );
                    control
                        .samples_done
                        .fetch_add(spe as u64, Ordering::Relaxed);
                }
            }
        }
    });
}
